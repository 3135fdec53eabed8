//! System window watchdog. Clocked from PCLK1, its 7-bit down-counter resets the MCU when it
//! passes from 0x40 to 0x3F, or when refreshed while above the window value.
//!
//! The early wakeup interrupt fires when the counter reaches 0x40, one step before reset.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WwdgError {
    /// Counter values must be in 0x40..=0x7F.
    Counter,
    /// The window must be in 0x40..=0x7F.
    Window,
    /// The requested time is zero, or longer than 64 steps at the largest prescaler.
    MaxTime,
    /// The minimum time is longer than the maximum time.
    MinTime,
}

/// The counter resets the MCU when it goes below this.
pub const COUNTER_MIN: u8 = 0x40;
pub const COUNTER_MAX: u8 = 0x7f;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
/// Counter clock: (PCLK1 / 4096) / this. CFR WDGTB field.
pub enum WwdgPrescaler {
    Div1 = 0,
    Div2 = 1,
    Div4 = 2,
    Div8 = 3,
    Div16 = 4,
    Div32 = 5,
    Div64 = 6,
    Div128 = 7,
}

impl WwdgPrescaler {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b111 {
            0 => Self::Div1,
            1 => Self::Div2,
            2 => Self::Div4,
            3 => Self::Div8,
            4 => Self::Div16,
            5 => Self::Div32,
            6 => Self::Div64,
            _ => Self::Div128,
        }
    }

    /// PCLK1 cycles per counter step.
    pub fn cycles_per_step(&self) -> u64 {
        4_096 << (*self as u8)
    }
}

/// Time, in µs, until reset after a refresh with `counter`.
pub fn timeout_us(pclk1_hz: u32, prescaler: WwdgPrescaler, counter: u8) -> u32 {
    let steps = counter.saturating_sub(COUNTER_MIN - 1) as u64;
    steps_to_us(pclk1_hz, prescaler, steps)
}

/// Time, in ms and rounded to nearest, until reset after a refresh with `counter`.
pub fn timeout_ms(pclk1_hz: u32, prescaler: WwdgPrescaler, counter: u8) -> u32 {
    (timeout_us(pclk1_hz, prescaler, counter) + 500) / 1_000
}

fn steps_to_us(pclk1_hz: u32, prescaler: WwdgPrescaler, steps: u64) -> u32 {
    let dividend = steps * prescaler.cycles_per_step() * 1_000_000;
    ((dividend + pclk1_hz as u64 / 2) / pclk1_hz as u64) as u32
}

/// Number of counter steps closest to `ms`.
fn ms_to_steps(pclk1_hz: u32, prescaler: WwdgPrescaler, ms: u32) -> u64 {
    let per_step = prescaler.cycles_per_step() * 1_000;
    (ms as u64 * pclk1_hz as u64 + per_step / 2) / per_step
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Register-level configuration.
pub struct WwdgConfig {
    pub prescaler: WwdgPrescaler,
    /// Loaded into the counter on start and on each refresh.
    pub counter: u8,
    /// Refreshing while the counter is above this resets the MCU. `COUNTER_MAX` disables the
    /// window.
    pub window: u8,
    pub early_wakeup: bool,
}

impl Default for WwdgConfig {
    fn default() -> Self {
        Self {
            prescaler: WwdgPrescaler::Div128,
            counter: COUNTER_MAX,
            window: COUNTER_MAX,
            early_wakeup: false,
        }
    }
}

impl WwdgConfig {
    /// Pick the smallest prescaler that reaches `max_ms` in 64 steps, and the counter and
    /// window closest to the times requested. `min_ms` of 0 disables the window.
    pub fn from_times(
        pclk1_hz: u32,
        min_ms: u32,
        max_ms: u32,
        early_wakeup: bool,
    ) -> Result<Self, WwdgError> {
        if max_ms == 0 || pclk1_hz == 0 {
            return Err(WwdgError::MaxTime);
        }
        if min_ms > max_ms {
            return Err(WwdgError::MinTime);
        }

        let range = (COUNTER_MAX - COUNTER_MIN + 1) as u64;

        for bits in 0..=7 {
            let prescaler = WwdgPrescaler::from_bits(bits);
            let steps = ms_to_steps(pclk1_hz, prescaler, max_ms);
            if steps > range {
                continue;
            }

            let counter = COUNTER_MIN - 1 + steps.max(1) as u8;
            let window = if min_ms == 0 {
                COUNTER_MAX
            } else {
                let min_steps = ms_to_steps(pclk1_hz, prescaler, min_ms) as u8;
                counter.saturating_sub(min_steps).max(COUNTER_MIN)
            };

            return Ok(Self {
                prescaler,
                counter,
                window,
                early_wakeup,
            });
        }

        Err(WwdgError::MaxTime)
    }

    pub fn validate(&self) -> Result<(), WwdgError> {
        if !(COUNTER_MIN..=COUNTER_MAX).contains(&self.counter) {
            return Err(WwdgError::Counter);
        }
        if !(COUNTER_MIN..=COUNTER_MAX).contains(&self.window) {
            return Err(WwdgError::Window);
        }
        Ok(())
    }

    /// Time until reset after a refresh, in µs.
    pub fn max_time_us(&self, pclk1_hz: u32) -> u32 {
        timeout_us(pclk1_hz, self.prescaler, self.counter)
    }

    /// Time after a refresh before the next refresh is allowed, in µs. 0 without a window.
    pub fn min_time_us(&self, pclk1_hz: u32) -> u32 {
        let steps = self.counter.saturating_sub(self.window) as u64;
        steps_to_us(pclk1_hz, self.prescaler, steps)
    }

    /// Counter period, in µs.
    pub fn step_us(&self, pclk1_hz: u32) -> u32 {
        steps_to_us(pclk1_hz, self.prescaler, 1)
    }
}

#[cfg(feature = "u5")]
mod hw {
    use super::*;
    use crate::{
        clocks::Clocks,
        error::Result,
        pac::{RCC, WWDG},
        util::rcc_en,
    };

    /// Represents the window watchdog. Once started, it can't be stopped except by a reset.
    pub struct Wwdg {
        regs: WWDG,
        pub cfg: WwdgConfig,
        pclk1_hz: u32,
    }

    impl Wwdg {
        /// Enable the WWDG clock, configure the prescaler and window, and start the counter.
        pub fn start(regs: WWDG, cfg: WwdgConfig, clocks: &Clocks) -> Result<Self> {
            cfg.validate()?;

            let rcc = unsafe { &(*RCC::ptr()) };
            rcc_en!(apb1_1, wwdg, rcc);

            regs.cfr().write(|w| unsafe {
                w.wdgtb().bits(cfg.prescaler as u8);
                w.ewi().bit(cfg.early_wakeup);
                w.w().bits(cfg.window)
            });
            regs.cr().write(|w| unsafe {
                w.wdga().set_bit();
                w.t().bits(cfg.counter)
            });

            debug!(
                "WWDG started. Counter: {=u8}, window: {=u8}",
                cfg.counter,
                cfg.window
            );

            Ok(Self {
                regs,
                cfg,
                pclk1_hz: clocks.apb1(),
            })
        }

        /// Reload the counter. Call after the min time, and before the max time.
        pub fn refresh(&mut self) {
            // Writing T with WDGA clear leaves the watchdog enabled; WDGA can only be set.
            self.regs.cr().write(|w| unsafe { w.t().bits(self.cfg.counter) });
        }

        pub fn get_max_time_us(&self) -> u32 {
            self.cfg.max_time_us(self.pclk1_hz)
        }

        pub fn get_step_us(&self) -> u32 {
            self.cfg.step_us(self.pclk1_hz)
        }

        /// Change the window. `COUNTER_MAX` disables it.
        pub fn set_window(&mut self, window: u8) -> Result<()> {
            if !(COUNTER_MIN..=COUNTER_MAX).contains(&window) {
                return Err(WwdgError::Window.into());
            }
            self.regs.cfr().modify(|_, w| unsafe { w.w().bits(window) });
            self.cfg.window = window;
            Ok(())
        }

        pub fn get_min_time_us(&self) -> u32 {
            self.cfg.min_time_us(self.pclk1_hz)
        }

        /// Run this in the WWDG interrupt handler. Returns true if the early wakeup fired,
        /// and clears it. Refresh here to keep running.
        pub fn on_interrupt(&mut self) -> bool {
            if self.regs.sr().read().ewif().bit_is_set() {
                // EWIF is rc_w0.
                self.regs.sr().write(|w| w.ewif().clear_bit());
                return true;
            }
            false
        }
    }
}

#[cfg(feature = "u5")]
pub use hw::Wwdg;

#[cfg(test)]
mod tests {
    use super::*;

    const PCLK: u32 = 160_000_000;

    #[test]
    fn timeouts() {
        // 64 steps of 4096 * 128 cycles at 160 MHz: 209.7152 ms.
        assert_eq!(timeout_us(PCLK, WwdgPrescaler::Div128, 0x7f), 209_715);
        assert_eq!(timeout_ms(PCLK, WwdgPrescaler::Div128, 0x7f), 210);
        // One step: 25.6 µs.
        assert_eq!(timeout_us(PCLK, WwdgPrescaler::Div1, 0x40), 26);
        assert_eq!(timeout_us(PCLK, WwdgPrescaler::Div1, 0x3f), 0);
    }

    #[test]
    fn from_times_picks_smallest_prescaler() {
        let cfg = WwdgConfig::from_times(PCLK, 50, 100, true).unwrap();
        assert_eq!(cfg.prescaler, WwdgPrescaler::Div64);
        assert_eq!(cfg.counter, 0x7c);
        assert_eq!(cfg.window, 0x5d);
        assert!(cfg.early_wakeup);
        assert!(cfg.validate().is_ok());

        assert_eq!(cfg.max_time_us(PCLK), 99_942);
        assert_eq!(cfg.min_time_us(PCLK), 50_790);
        assert_eq!(cfg.step_us(PCLK), 1_638);
    }

    #[test]
    fn no_window() {
        let cfg = WwdgConfig::from_times(PCLK, 0, 1, false).unwrap();
        assert_eq!(cfg.prescaler, WwdgPrescaler::Div1);
        assert_eq!(cfg.counter, 0x3f + 39);
        assert_eq!(cfg.window, COUNTER_MAX);
        assert_eq!(cfg.min_time_us(PCLK), 0);
    }

    #[test]
    fn rejects_out_of_range() {
        assert_eq!(WwdgConfig::from_times(PCLK, 0, 0, false), Err(WwdgError::MaxTime));
        assert_eq!(WwdgConfig::from_times(PCLK, 0, 500, false), Err(WwdgError::MaxTime));
        assert_eq!(WwdgConfig::from_times(PCLK, 80, 50, false), Err(WwdgError::MinTime));

        let cfg = WwdgConfig {
            counter: 0x3f,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(WwdgError::Counter));

        let cfg = WwdgConfig {
            window: 0x20,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(WwdgError::Window));
    }
}
