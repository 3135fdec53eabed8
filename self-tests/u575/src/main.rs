//! Blinks the green LED. The on-target tests are under `tests/`; run them with `cargo test`,
//! with the board connected through its ST-LINK.

#![deny(warnings)]
#![no_std]
#![no_main]

use cortex_m_rt::{entry, exception};

use hal::{mx, pac, tick};

// Import the panic handler
use panic_probe as _;

#[entry]
fn main() -> ! {
    rtt_target::rtt_init_defmt!();
    let mut cp = cortex_m::Peripherals::take().unwrap();
    let _dp = pac::Peripherals::take().unwrap();

    mx::mx_system_init(&mut cp.SYST).unwrap();

    defmt::println!("Hello, world!");

    let mut led = mx::mx_status_led();

    loop {
        led.toggle();
        defmt::debug!("LED on: {}", led.is_on());
        tick::delay(1_000);
    }
}

#[exception]
fn SysTick() {
    tick::inc_tick();
}

// same panicking *behavior* as `panic-probe` but doesn't print a panic message
// this prevents the panic message being printed *twice* when `defmt::panic` is invoked
#[defmt::panic_handler]
fn panic() -> ! {
    cortex_m::asm::udf()
}
