//! Toggle the green LED every 500 ms, with a tick-based delay.

#![no_std]
#![no_main]

use cortex_m_rt::{entry, exception};
use hal::{gpio::Pin, mx, pac, parts::led::Led, tick, transfer::AppStatus};

const TOGGLE_PERIOD_MS: u32 = 500;

fn app_init() -> Option<Led<Pin>> {
    Some(mx::mx_status_led())
}

fn app_process(led: &mut Led<Pin>) -> AppStatus {
    led.toggle();
    tick::delay(TOGGLE_PERIOD_MS);
    AppStatus::Ok
}

fn app_deinit(led: Led<Pin>) -> AppStatus {
    let mut pin = led.free();
    pin.mode(hal::gpio::PinMode::Analog);
    AppStatus::Ok
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
