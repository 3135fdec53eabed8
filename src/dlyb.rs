//! Delay block: generates an output clock phase-shifted from its input clock, used to sample
//! receive data on SDMMC and OCTOSPI at high speed. The delay of each cell varies with
//! voltage and temperature, so the line is re-tuned at runtime:
//!
//! 1. `enable()` the block.
//! 2. `configure_unit_delay()` sizes the delay cells so the line spans one input clock period.
//! 3. `calculate_max_output_clock_phase()` reads how many taps fit in that period.
//! 4. `set_output_clock_phase()` picks a tap, up to that maximum.

use crate::{error::Result, tick::Timeout};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DlybError {
    /// The line length measurement didn't complete in time.
    Timeout,
    /// An output clock phase above the number of taps.
    Phase,
}

/// Length measurement bits 10:0 and 11:10 of CFGR LNG.
const LNG_10_0: u16 = 0x07ff;
const LNG_11_10: u16 = 0x0c00;

/// Number of UNIT values to try.
const MAX_UNIT_DELAY_CELL: u8 = 128;
/// The tap used while measuring the line length.
pub const MAX_TUNING_OUTPUT_CLK_PHASE: u8 = 12;
/// The highest tap the phase search considers.
const MAX_USED_OUTPUT_CLK_PHASE: u8 = 10;

/// Default time for `configure_unit_delay`, in ms.
pub const DLYB_TIMEOUT_MS: u32 = 255;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The tuning state kept in CFGR, saved and restored across low power modes.
pub struct DlybConfig {
    /// Delay of one cell, in steps of about 25 ps. 0..=127.
    pub unit: u8,
    /// Output clock phase: the tap the output is taken from. 0..=12.
    pub sel: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// The delay line length measurement: CFGR LNG and LNGF.
pub struct DlybLength {
    /// One bit per tap; set where the sampled clock reads high.
    pub lng: u16,
    /// The measurement completed.
    pub valid: bool,
}

/// Access to one delay block's CR and CFGR fields.
pub trait DlybRegs {
    /// CR DEN.
    fn is_enabled(&self) -> bool;
    fn set_enabled(&mut self, enabled: bool);
    /// CR SEN. CFGR is only writable with the sampler on.
    fn set_sampler(&mut self, enabled: bool);
    /// CFGR UNIT and SEL.
    fn config(&self) -> DlybConfig;
    fn write_config(&mut self, cfg: DlybConfig);
    fn length(&self) -> DlybLength;
}

/// Represents a delay block.
pub struct Dlyb<R> {
    pub regs: R,
}

impl<R: DlybRegs> Dlyb<R> {
    pub fn new(regs: R) -> Self {
        Self { regs }
    }

    pub fn enable(&mut self) {
        self.regs.set_enabled(true);
    }

    pub fn disable(&mut self) {
        self.regs.set_enabled(false);
    }

    pub fn is_enabled(&self) -> bool {
        self.regs.is_enabled()
    }

    /// Run `f` with the length sampling enabled.
    fn with_sampler<T>(&mut self, f: impl FnOnce(&mut R) -> T) -> T {
        self.regs.set_sampler(true);
        let result = f(&mut self.regs);
        self.regs.set_sampler(false);
        result
    }

    /// Increase the cell delay until the line spans one input clock period: the first UNIT
    /// value where the sampled length is non-zero, and its top two taps aren't both high.
    pub fn configure_unit_delay(&mut self, timeout_ms: u32) -> Result<()> {
        let timeout = Timeout::new(timeout_ms);

        let result = self.with_sampler(|regs| {
            for unit in 0..MAX_UNIT_DELAY_CELL {
                regs.write_config(DlybConfig {
                    unit,
                    sel: MAX_TUNING_OUTPUT_CLK_PHASE,
                });

                while !regs.length().valid {
                    if timeout.is_expired() && !regs.length().valid {
                        return Err(DlybError::Timeout);
                    }
                }

                let lng = regs.length().lng;
                if lng & LNG_10_0 != 0 && lng & LNG_11_10 != LNG_11_10 {
                    trace!("DLYB unit delay: {=u8}", unit);
                    break;
                }
            }
            Ok(())
        });

        result.map_err(Into::into)
    }

    /// The highest tap, at most 10, whose delay still falls within one input clock period.
    /// Run after `configure_unit_delay()`.
    pub fn calculate_max_output_clock_phase(&mut self) -> u8 {
        let len = self.regs.length().lng;
        self.with_sampler(|_| {
            let mut max = MAX_USED_OUTPUT_CLK_PHASE;
            while max > 0 && (len >> max) == 0 {
                max -= 1;
            }
            max
        })
    }

    pub fn set_output_clock_phase(&mut self, phase: u8) -> Result<()> {
        if phase > MAX_TUNING_OUTPUT_CLK_PHASE {
            return Err(DlybError::Phase.into());
        }
        self.with_sampler(|regs| {
            let cfg = regs.config();
            regs.write_config(DlybConfig { sel: phase, ..cfg })
        });
        Ok(())
    }

    pub fn get_output_clock_phase(&self) -> u8 {
        self.regs.config().sel
    }

    /// Restore a tuning saved with `get_config()`.
    pub fn set_config(&mut self, cfg: DlybConfig) {
        self.with_sampler(|regs| regs.write_config(cfg));
    }

    pub fn get_config(&self) -> DlybConfig {
        self.regs.config()
    }

    pub fn free(self) -> R {
        self.regs
    }
}

#[cfg(feature = "u5")]
mod hw {
    use super::*;
    use crate::{
        pac::{self, RCC},
        util::rcc_en,
    };

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// The peripheral a delay block serves. Each shares its host peripheral's clock.
    pub enum DlybInstance {
        Sdmmc1,
        #[cfg(dlyb2)]
        Sdmmc2,
        Octospi1,
        #[cfg(dlyb2)]
        Octospi2,
    }

    impl DlybInstance {
        fn regs(&self) -> *const pac::dlybos1::RegisterBlock {
            match self {
                Self::Sdmmc1 => pac::DLYBSD1::ptr() as _,
                #[cfg(dlyb2)]
                Self::Sdmmc2 => pac::DLYBSD2::ptr() as _,
                Self::Octospi1 => pac::DLYBOS1::ptr(),
                #[cfg(dlyb2)]
                Self::Octospi2 => pac::DLYBOS2::ptr() as _,
            }
        }

        /// Enable the host peripheral's clock, which the delay block needs for register
        /// access.
        pub fn enable_clock(&self) {
            let rcc = unsafe { &(*RCC::ptr()) };
            match self {
                Self::Sdmmc1 => rcc_en!(ahb2_1, sdmmc1, rcc),
                #[cfg(dlyb2)]
                Self::Sdmmc2 => rcc_en!(ahb2_1, sdmmc2, rcc),
                Self::Octospi1 => rcc_en!(ahb2_2, octospi1, rcc),
                #[cfg(dlyb2)]
                Self::Octospi2 => rcc_en!(ahb2_2, octospi2, rcc),
            }
        }
    }

    /// A hardware delay block's registers.
    pub struct DlybPeriph {
        regs: &'static pac::dlybos1::RegisterBlock,
    }

    impl DlybPeriph {
        pub fn new(instance: DlybInstance) -> Self {
            instance.enable_clock();
            Self {
                regs: unsafe { &(*instance.regs()) },
            }
        }
    }

    impl DlybRegs for DlybPeriph {
        fn is_enabled(&self) -> bool {
            self.regs.cr().read().den().bit_is_set()
        }

        fn set_enabled(&mut self, enabled: bool) {
            self.regs.cr().modify(|_, w| w.den().bit(enabled));
        }

        fn set_sampler(&mut self, enabled: bool) {
            self.regs.cr().modify(|_, w| w.sen().bit(enabled));
        }

        fn config(&self) -> DlybConfig {
            let cfgr = self.regs.cfgr().read();
            DlybConfig {
                unit: cfgr.unit().bits(),
                sel: cfgr.sel().bits(),
            }
        }

        fn write_config(&mut self, cfg: DlybConfig) {
            self.regs.cfgr().modify(|_, w| unsafe {
                w.unit().bits(cfg.unit);
                w.sel().bits(cfg.sel)
            });
        }

        fn length(&self) -> DlybLength {
            let cfgr = self.regs.cfgr().read();
            DlybLength {
                lng: cfgr.lng().bits(),
                valid: cfgr.lngf().bit_is_set(),
            }
        }
    }
}

#[cfg(feature = "u5")]
pub use hw::{DlybInstance, DlybPeriph};
