//! This library provides high-level access to STM32U5 peripherals, plus the pieces that
//! applications built on those peripherals share: a millisecond tick, a bare-metal
//! semaphore and mutex, a cooperative task sequencer, an interrupt-driven transfer retry
//! engine, and drivers for parts commonly found on U5 boards (buttons, LEDs, and the
//! TCPP01 USB Type-C port protection chip).
//!
//! ## Features
//! Select your MCU with one of the device features: `u545`, `u575`, or `u585`. If the
//! program runs directly on the MCU, also enable `u5rt`, which pulls in the vector table.
//! `embedded_hal` implements the `embedded-hal` 1.0 and `embedded-io` traits.
//!
//! Without a device feature, only the hardware-independent modules are built: `tick`,
//! `os`, `sequencer`, `transfer`, `fdcan_timing`, `i2c_timing`, `state`, the part drivers,
//! and the configuration and timing calculations of `clocks`, `timer`, `iwdg`, `wwdg`,
//! `dlyb`, `i2c`, `spi` and `usart`. These are
//! what the host test suite exercises.
//!
//! ## Example
//! ```rust,ignore
//! use stm32u5_hal::{clocks::Clocks, gpio::{Pin, PinMode, Port}, tick};
//!
//! let clock_cfg = Clocks::default();
//! clock_cfg.setup().unwrap();
//! tick::init(&mut cp.SYST, &clock_cfg, tick::TickFreq::KHz1);
//!
//! let mut led = Pin::new(Port::C, 7, PinMode::Output);
//! loop {
//!     led.toggle();
//!     tick::delay(500);
//! }
//! ```

#![cfg_attr(not(test), no_std)]
#![allow(unused_macros)]

#[cfg(feature = "u545")]
pub use stm32u5::stm32u545 as pac;
#[cfg(feature = "u575")]
pub use stm32u5::stm32u575 as pac;
#[cfg(feature = "u585")]
pub use stm32u5::stm32u585 as pac;

#[macro_use]
mod macros;

pub mod clocks;
pub mod cortex;
pub mod dlyb;
pub mod error;
pub mod fdcan_timing;
pub mod gpio;
pub mod i2c;
pub mod i2c_timing;
pub mod iwdg;
pub mod os;
pub mod parts;
pub mod sequencer;
pub mod spi;
pub mod state;
pub mod tick;
pub mod timer;
pub mod transfer;
pub mod usart;
pub mod wwdg;

#[cfg(feature = "u5")]
pub mod adc;
#[cfg(feature = "u5")]
pub mod delay;
#[cfg(feature = "u5")]
pub mod mx;
#[cfg(feature = "u5")]
mod util;

// Reexports, so the user doesn't need to import them separately.
#[cfg(feature = "u5")]
pub use delay::{delay_ms, delay_us};
pub use error::{Error, HalStatus, Result};

/// Used in `bounded_loop!`, to prevent infinite loops on register waits.
pub const MAX_ITERS: u32 = 400_000;
