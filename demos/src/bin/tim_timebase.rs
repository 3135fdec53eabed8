//! Toggle the green LED from the TIM3 update interrupt, once every 500 ms. The main loop
//! only sleeps.

#![no_std]
#![no_main]

use cortex_m::asm;
use cortex_m_rt::{entry, exception};
use hal::{
    access_global,
    clocks::Clocks,
    cortex,
    gpio::Pin,
    init_globals, make_globals, mx,
    pac::{self, TIM3, interrupt},
    parts::led::Led,
    tick,
    timer::{Timer, TimerInterrupt},
    transfer::AppStatus,
};

/// Update events per second: two toggles make one blink.
const UPDATE_FREQ: f32 = 2.;

make_globals!((TIMER, Timer<TIM3>), (LED, Led<Pin>));

fn app_init(tim: TIM3, clock_cfg: &Clocks) -> Option<()> {
    let mut timer = mx::mx_tim3_init(tim, UPDATE_FREQ, clock_cfg).ok()?;
    timer.enable_interrupt(TimerInterrupt::Update);
    timer.enable();

    init_globals!((TIMER, timer), (LED, mx::mx_status_led()));
    cortex::enable_irq(pac::Interrupt::TIM3);

    Some(())
}

fn app_process(_: &mut ()) -> AppStatus {
    asm::wfi();
    AppStatus::Ok
}

fn app_deinit(_: ()) -> AppStatus {
    cortex::disable_irq(pac::Interrupt::TIM3);
    critical_section::with(|cs| {
        if let Some(timer) = TIMER.borrow(cs).take() {
            timer.deinit();
        }
        LED.borrow(cs).take();
    });
    AppStatus::Ok
}

#[entry]
fn main() -> ! {
    let mut cp = cortex_m::Peripherals::take().unwrap();
    let dp = pac::Peripherals::take().unwrap();

    let clock_cfg = mx::mx_system_init(&mut cp.SYST).unwrap();

    stm32u5_demos::run(app_init(dp.TIM3, &clock_cfg), app_process, app_deinit)
}

#[interrupt]
fn TIM3() {
    critical_section::with(|cs| {
        access_global!(TIMER, timer, cs);
        timer.clear_interrupt(TimerInterrupt::Update);

        access_global!(LED, led, cs);
        led.toggle();
    });
}

#[exception]
fn SysTick() {
    tick::inc_tick();
}
