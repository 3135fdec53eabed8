//! Board initialization for the NUCLEO-U575ZI-Q: clock tree and tick, then pin muxing and
//! peripheral setup for the instances the demos use. Each `mx_*` function configures the pins
//! of one peripheral before handing its register block to the driver.
//!
//! Pinout:
//! - LEDs: green PC7 (also TIM3_CH2), blue PB7, red PG2. Active high.
//! - User button: PC13, high when pressed. The board has an external pull-down.
//! - I2C1: SCL PB8, SDA PB9, AF4. Arduino D15/D14.
//! - USART1: TX PA9, RX PA10, CK PA8, AF7. TX/RX also reach the ST-LINK VCP.
//! - SPI1: SCK PA5, MISO PA6, MOSI PA7, AF5. Arduino D13/D12/D11.
//! - MCO: PA8, AF0.

use cortex_m::peripheral::SYST;

use crate::{
    clocks::Clocks,
    error::Result,
    gpio::{OutputSpeed, OutputType, Pin, PinMode, PinState, Port, Pull},
    i2c::{I2c, I2cConfig},
    pac::{I2C1, SPI1, TIM3, USART1},
    parts::{
        button::{Button, ButtonConfig},
        led::Led,
    },
    spi::{Spi, SpiConfig},
    tick::{self, TickFreq},
    timer::{TimChannel, Timer, TimerConfig},
    usart::{SyncMode, Usart, UsartConfig},
};

pub const LED_GREEN: (Port, u8) = (Port::C, 7);
pub const LED_BLUE: (Port, u8) = (Port::B, 7);
pub const LED_RED: (Port, u8) = (Port::G, 2);
pub const USER_BUTTON: (Port, u8) = (Port::C, 13);

/// The timer channel wired to the green LED.
pub const LED_GREEN_TIM_CHANNEL: TimChannel = TimChannel::C2;

/// Set up the clock tree (160 MHz from MSIS through PLL1), and start a 1 kHz tick.
pub fn mx_system_init(syst: &mut SYST) -> Result<Clocks> {
    let clock_cfg = Clocks::default();
    clock_cfg.setup()?;
    tick::init(syst, &clock_cfg, TickFreq::KHz1)?;

    debug!("System clock: {=u32} Hz", clock_cfg.sysclk());
    Ok(clock_cfg)
}

/// An LED on a push-pull output, initially off.
pub fn mx_led(pin: (Port, u8)) -> Led<Pin> {
    let mut io = Pin::new(pin.0, pin.1, PinMode::Output);
    io.output_type(OutputType::PushPull);
    io.output_speed(OutputSpeed::Low);
    Led::new(io, PinState::High)
}

/// The LED the demos use to report status: green.
pub fn mx_status_led() -> Led<Pin> {
    mx_led(LED_GREEN)
}

/// The user button, with its EXTI line configured but not yet enabled.
pub fn mx_user_button(cfg: ButtonConfig) -> Button<Pin> {
    let mut io = Pin::new(USER_BUTTON.0, USER_BUTTON.1, PinMode::Input);
    io.pull(Pull::Floating);
    Button::new(io, 0, cfg)
}

fn af_pin(port: Port, pin: u8, af: u8, otype: OutputType, pull: Pull) -> Pin {
    let mut p = Pin::new(port, pin, PinMode::Alt(af));
    p.output_type(otype);
    p.output_speed(OutputSpeed::High);
    p.pull(pull);
    p
}

/// I2C1 on PB8 (SCL) and PB9 (SDA), open-drain with the internal pull-ups. Boards on a shared
/// bus should have external pull-ups as well, for speeds above 100 kHz.
pub fn mx_i2c1_init(regs: I2C1, cfg: I2cConfig, clock_cfg: &Clocks) -> Result<I2c<I2C1>> {
    af_pin(Port::B, 8, 4, OutputType::OpenDrain, Pull::Up);
    af_pin(Port::B, 9, 4, OutputType::OpenDrain, Pull::Up);

    I2c::new(regs, cfg, clock_cfg)
}

/// USART1 on PA9 (TX) and PA10 (RX). When `cfg` selects synchronous mode, PA8 carries the
/// clock.
pub fn mx_usart1_init(
    regs: USART1,
    baud: u32,
    cfg: UsartConfig,
    clock_cfg: &Clocks,
) -> Result<Usart<USART1>> {
    af_pin(Port::A, 9, 7, OutputType::PushPull, Pull::Floating);
    af_pin(Port::A, 10, 7, OutputType::PushPull, Pull::Up);
    if cfg.sync != SyncMode::Disabled {
        af_pin(Port::A, 8, 7, OutputType::PushPull, Pull::Floating);
    }

    Usart::new(regs, baud, cfg, clock_cfg)
}

/// SPI1 on PA5 (SCK), PA6 (MISO) and PA7 (MOSI), clocked at up to `max_hz`.
pub fn mx_spi1_init(
    regs: SPI1,
    cfg: SpiConfig,
    max_hz: u32,
    clock_cfg: &Clocks,
) -> Result<Spi<SPI1>> {
    af_pin(Port::A, 5, 5, OutputType::PushPull, Pull::Floating);
    af_pin(Port::A, 6, 5, OutputType::PushPull, Pull::Floating);
    af_pin(Port::A, 7, 5, OutputType::PushPull, Pull::Floating);

    Spi::new_with_freq(regs, cfg, max_hz, clock_cfg)
}

/// TIM3 with an update frequency of `freq` Hz. The counter is left stopped.
pub fn mx_tim3_init(regs: TIM3, freq: f32, clock_cfg: &Clocks) -> Result<Timer<TIM3>> {
    Timer::new_tim3(regs, freq, TimerConfig::default(), clock_cfg)
}

/// Route TIM3_CH2 to the green LED pin, PC7.
pub fn mx_tim3_ch2_pin() -> Pin {
    af_pin(Port::C, 7, 2, OutputType::PushPull, Pull::Floating)
}

/// Route the MCO output to PA8.
pub fn mx_mco_pin() -> Pin {
    af_pin(Port::A, 8, 0, OutputType::PushPull, Pull::Floating)
}
