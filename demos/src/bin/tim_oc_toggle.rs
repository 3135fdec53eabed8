//! Blink the green LED in hardware: TIM3 channel 2, in output compare toggle mode, flips PC7
//! on each compare match, with no interrupt or CPU involvement.

#![no_std]
#![no_main]

use cortex_m::asm;
use cortex_m_rt::{entry, exception};
use hal::{
    clocks::Clocks,
    gpio::{Pin, PinMode},
    mx, pac,
    pac::TIM3,
    tick,
    timer::{OutputCompare, Timer},
    transfer::AppStatus,
};

/// Counter periods per second. The output toggles once per period.
const PERIOD_FREQ: f32 = 4.;

struct App {
    timer: Timer<TIM3>,
    pin: Pin,
}

fn app_init(tim: TIM3, clock_cfg: &Clocks) -> Option<App> {
    let pin = mx::mx_tim3_ch2_pin();
    let mut timer = mx::mx_tim3_init(tim, PERIOD_FREQ, clock_cfg).ok()?;

    let ch = mx::LED_GREEN_TIM_CHANNEL;
    timer.set_output_compare(ch, OutputCompare::Toggle);
    let half = timer.get_max_duty() / 2;
    timer.set_duty(ch, half);
    timer.enable_capture_compare(ch);
    timer.enable();

    Some(App { timer, pin })
}

fn app_process(_: &mut App) -> AppStatus {
    asm::wfi();
    AppStatus::Ok
}

fn app_deinit(app: App) -> AppStatus {
    app.timer.deinit();
    let mut pin = app.pin;
    pin.mode(PinMode::Analog);
    AppStatus::Ok
}

#[entry]
fn main() -> ! {
    let mut cp = cortex_m::Peripherals::take().unwrap();
    let dp = pac::Peripherals::take().unwrap();

    let clock_cfg = mx::mx_system_init(&mut cp.SYST).unwrap();

    stm32u5_demos::run(app_init(dp.TIM3, &clock_cfg), app_process, app_deinit)
}

#[exception]
fn SysTick() {
    tick::inc_tick();
}
