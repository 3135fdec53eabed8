//! Toggle the green LED each time the user button is pressed. The button's EXTI line
//! interrupt debounces the edge and runs a callback; the main loop sleeps in between.

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicBool, Ordering};

use cortex_m::asm;
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
    tick,
    transfer::AppStatus,
};

make_globals!((BUTTON, Button<Pin>));

static PRESSED: AtomicBool = AtomicBool::new(false);

fn on_press(_id: u32, _state: ButtonState, _arg: usize) {
    PRESSED.store(true, Ordering::Release);
}

fn app_init() -> Option<Led<Pin>> {
    let mut button = mx::mx_user_button(ButtonConfig::default());
    button.register_callback(ButtonEvent::Pressed, on_press, 0);
    button.enable_it();
    init_globals!((BUTTON, button));

    cortex::enable_irq(pac::Interrupt::EXTI13);

    Some(mx::mx_status_led())
}

fn app_process(led: &mut Led<Pin>) -> AppStatus {
    if PRESSED.swap(false, Ordering::AcqRel) {
        led.toggle();
        defmt::debug!("Button pressed; LED on: {}", led.is_on());
    } else {
        asm::wfi();
    }
    AppStatus::Ok
}

fn app_deinit(led: Led<Pin>) -> AppStatus {
    cortex::disable_irq(pac::Interrupt::EXTI13);
    critical_section::with(|cs| {
        if let Some(button) = BUTTON.borrow(cs).take() {
            button.deinit();
        }
    });
    led.free();
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
}
