//! Shared pieces of the demo applications. Each binary in `src/bin` implements `app_init`,
//! `app_process` and `app_deinit`, and hands them to `run()`.

#![no_std]

use defmt_rtt as _;
use panic_probe as _;

use hal::{
    gpio::Pin,
    mx,
    parts::led::Led,
    tick,
    transfer::{AppStatus, ExchangeOutcome},
};

/// Run `app_process` until it reports an error, then release the application and signal the
/// failure on the status LED.
pub fn run<A>(
    app: Option<A>,
    mut app_process: impl FnMut(&mut A) -> AppStatus,
    app_deinit: impl FnOnce(A) -> AppStatus,
) -> ! {
    let Some(mut app) = app else {
        defmt::error!("Application init failed");
        error_loop();
    };
    defmt::info!("Application initialized");

    while app_process(&mut app) != AppStatus::Error {}

    defmt::error!("Application stopped on error");
    if app_deinit(app) != AppStatus::Ok {
        defmt::warn!("Application deinit failed");
    }
    error_loop();
}

/// Blink the status LED, 50 ms on and 2 s off, forever.
pub fn error_loop() -> ! {
    let mut led: Led<Pin> = mx::mx_status_led();
    loop {
        led.on();
        tick::delay(50);
        led.off();
        tick::delay(2_000);
    }
}

/// Log the result of a two-board exchange, and map it to the application status.
pub fn report(outcome: &ExchangeOutcome) -> AppStatus {
    match outcome.status {
        AppStatus::Ok => defmt::info!("Exchange OK after {=u32} attempt(s)", outcome.attempts),
        _ => defmt::error!(
            "Exchange failed after {=u32} attempts; last error {=u32:#x}",
            outcome.attempts,
            outcome.last_error
        ),
    }
    outcome.status
}

/// The two messages exchanged alternately by the two-board demos.
pub const MESSAGE_A: &[u8] = b" ****Message A: sent by the controller, echoed by the responder**** ";
pub const MESSAGE_B: &[u8] = b" ****Message B: sent by the controller, echoed by the responder**** ";
pub const MESSAGE_LEN: usize = MESSAGE_A.len();

/// Pause between two exchanges, so the responder is listening again before the next one starts.
pub const EXCHANGE_PERIOD_MS: u32 = 1_000;

// same panicking *behavior* as `panic-probe` but doesn't print a panic message
// this prevents the panic message being printed *twice* when `defmt::panic` is invoked
#[defmt::panic_handler]
fn panic() -> ! {
    cortex_m::asm::udf()
}
