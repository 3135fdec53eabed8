//! Start the LSI oscillator and output it on the MCO pin, PA8, where it can be measured. The
//! green LED toggles each second while the LSI reports ready.

#![no_std]
#![no_main]

use cortex_m_rt::{entry, exception};
use hal::{
    clocks::{self, McoPrescaler, McoSrc},
    gpio::{Pin, PinMode},
    mx, pac,
    parts::led::Led,
    tick,
    transfer::AppStatus,
};

struct App {
    led: Led<Pin>,
    mco: Pin,
}

fn app_init() -> Option<App> {
    clocks::enable_lsi().ok()?;

    let mco = mx::mx_mco_pin();
    clocks::mco_config(McoSrc::Lsi, McoPrescaler::Div1);

    Some(App {
        led: mx::mx_status_led(),
        mco,
    })
}

fn app_process(app: &mut App) -> AppStatus {
    if !clocks::lsi_is_ready() {
        defmt::error!("LSI stopped");
        return AppStatus::Error;
    }
    app.led.toggle();
    tick::delay(1_000);
    AppStatus::Ok
}

fn app_deinit(app: App) -> AppStatus {
    clocks::mco_config(McoSrc::Disabled, McoPrescaler::Div1);
    let mut mco = app.mco;
    mco.mode(PinMode::Analog);
    app.led.free();

    match clocks::disable_lsi() {
        Ok(()) => AppStatus::Ok,
        Err(_) => AppStatus::Error,
    }
}

#[entry]
fn main() -> ! {
    let mut cp = cortex_m::Peripherals::take().unwrap();
    let _dp = pac::Peripherals::take().unwrap();

    mx::mx_system_init(&mut cp.SYST).unwrap();

    stm32u5_demos::run(app_init(), app_process, app_deinit)
}

#[exception]
fn SysTick() {
    tick::inc_tick();
}
