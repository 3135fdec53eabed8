//! Drive the green LED from TIM3 channel 2 in PWM mode, cycling through the PWM LED modes
//! every few seconds: fade, blink, a fixed brightness, on and off. Patterns step from the
//! TIM3 update interrupt.

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
    parts::led_pwm::{LedPwm, LedSpeed, PATTERN_MAX_VALUE, TimerPwm},
    tick,
    timer::TimerInterrupt,
    transfer::AppStatus,
};

/// PWM periods per second at `LedSpeed::Fast`. A pattern is 128 periods long.
const PWM_FREQ: u32 = 256;
const STEP_PERIOD_MS: u32 = 4_000;

make_globals!((LED, LedPwm<TimerPwm<TIM3>>));

struct App {
    _pin: Pin,
    step: u8,
    last_step: u32,
}

fn app_init(tim: TIM3, clock_cfg: &Clocks) -> Option<App> {
    let pin = mx::mx_tim3_ch2_pin();
    let mut timer = mx::mx_tim3_init(tim, PWM_FREQ as f32, clock_cfg).ok()?;

    // Count `PATTERN_MAX_VALUE` ticks per PWM period.
    let psc = timer.clock_speed / (PWM_FREQ * PATTERN_MAX_VALUE as u32) - 1;
    timer.set_prescaler(psc as u16);

    let led = LedPwm::new(TimerPwm::new(timer, mx::LED_GREEN_TIM_CHANNEL), 0).ok()?;
    init_globals!((LED, led));
    cortex::enable_irq(pac::Interrupt::TIM3);

    Some(App {
        _pin: pin,
        step: 0,
        last_step: tick::get_tick().wrapping_sub(STEP_PERIOD_MS),
    })
}

fn app_process(app: &mut App) -> AppStatus {
    if tick::get_tick().wrapping_sub(app.last_step) < STEP_PERIOD_MS {
        asm::wfi();
        return AppStatus::Ok;
    }
    app.last_step = tick::get_tick();

    critical_section::with(|cs| {
        let mut led = LED.borrow(cs).borrow_mut();
        let Some(led) = led.as_mut() else {
            return;
        };
        match app.step {
            0 => led.fade(LedSpeed::Slow),
            1 => led.blink(LedSpeed::Fast),
            2 => led.set_brightness(32),
            3 => led.on(),
            _ => led.off(),
        }
    });
    defmt::debug!("PWM LED step {=u8}", app.step);

    app.step = (app.step + 1) % 5;
    AppStatus::Ok
}

fn app_deinit(_app: App) -> AppStatus {
    cortex::disable_irq(pac::Interrupt::TIM3);
    critical_section::with(|cs| {
        if let Some(led) = LED.borrow(cs).take() {
            led.free().timer.deinit();
        }
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
        access_global!(LED, led, cs);
        led.ch.timer.clear_interrupt(TimerInterrupt::Update);
        led.on_update();
    });
}

#[exception]
fn SysTick() {
    tick::inc_tick();
}
