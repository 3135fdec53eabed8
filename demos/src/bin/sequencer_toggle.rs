//! Toggle the green LED from a sequencer task, made pending every 500 ms by the tick
//! interrupt. Pressing the user button pauses or resumes the toggling, through a second,
//! higher priority task. The sequencer waits for an interrupt when no task is pending.

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m_rt::{entry, exception};
use hal::{
    access_global, cortex,
    gpio::Pin,
    init_globals, make_globals, mx,
    pac::{self, interrupt},
    parts::{
        button::{Button, ButtonConfig, ButtonEvent, ButtonState},
        led::Led,
    },
    sequencer::{ALL_TASKS, Sequencer, WfiHooks},
    tick,
    transfer::AppStatus,
};

const TASK_TOGGLE: u32 = 1 << 0;
const TASK_BUTTON: u32 = 1 << 1;

const PRIO_HIGH: usize = 0;
const PRIO_LOW: usize = 1;

const TOGGLE_PERIOD_MS: u32 = 500;

static SEQ: Sequencer<WfiHooks, 2, 2> = Sequencer::new(WfiHooks);

make_globals!((LED, Led<Pin>), (BUTTON, Button<Pin>));

static TOGGLE_COUNTDOWN: AtomicU32 = AtomicU32::new(TOGGLE_PERIOD_MS);

fn toggle_task() {
    critical_section::with(|cs| {
        access_global!(LED, led, cs);
        led.toggle();
    });
}

fn button_task() {
    if SEQ.is_pause_task(TASK_TOGGLE) {
        SEQ.resume_task(TASK_TOGGLE);
        defmt::info!("Toggling resumed");
    } else {
        SEQ.pause_task(TASK_TOGGLE);
        defmt::info!("Toggling paused");
    }
}

fn on_press(_id: u32, _state: ButtonState, _arg: usize) {
    SEQ.set_task(TASK_BUTTON, PRIO_HIGH);
}

fn app_init() -> Option<()> {
    SEQ.init();
    SEQ.reg_task(TASK_TOGGLE, toggle_task);
    SEQ.reg_task(TASK_BUTTON, button_task);

    let mut button = mx::mx_user_button(ButtonConfig::default());
    button.register_callback(ButtonEvent::Pressed, on_press, 0);
    button.enable_it();

    init_globals!((LED, mx::mx_status_led()), (BUTTON, button));
    cortex::enable_irq(pac::Interrupt::EXTI13);

    Some(())
}

fn app_process(_: &mut ()) -> AppStatus {
    SEQ.run(ALL_TASKS);
    AppStatus::Ok
}

fn app_deinit(_: ()) -> AppStatus {
    cortex::disable_irq(pac::Interrupt::EXTI13);
    critical_section::with(|cs| {
        if let Some(button) = BUTTON.borrow(cs).take() {
            button.deinit();
        }
        LED.borrow(cs).take();
    });
    SEQ.init();
    AppStatus::Ok
}

#[entry]
fn main() -> ! {
    let mut cp = cortex_m::Peripherals::take().unwrap();
    let _dp = pac::Peripherals::take().unwrap();

    mx::mx_system_init(&mut cp.SYST).unwrap();

    stm32u5_demos::run(app_init(), app_process, app_deinit)
}

#[interrupt]
fn EXTI13() {
    critical_section::with(|cs| {
        access_global!(BUTTON, button, cs);
        button.on_interrupt(tick::get_tick());
    });
}

#[exception]
fn SysTick() {
    tick::inc_tick();

    if TOGGLE_COUNTDOWN.fetch_sub(1, Ordering::Relaxed) == 1 {
        TOGGLE_COUNTDOWN.store(TOGGLE_PERIOD_MS, Ordering::Relaxed);
        SEQ.set_task(TASK_TOGGLE, PRIO_LOW);
    }
}
