//! Writes a `Clocks` configuration to RCC, PWR and FLASH, and controls the LSI and MCO output.

use super::{Clocks, InputSrc, McoPrescaler, McoSrc, PllSrc, RccError, VoltageRange};
use crate::{
    error::{Error, Result},
    pac::{FLASH, PWR, RCC},
    util::{rcc_en, rcc_en_reset},
};

const HW_ERR: Error = Error::RccError(RccError::Hardware);

impl Clocks {
    /// Setup common and return `Ok` if the config is valid. Return an error,
    /// and don't setup if not.
    /// Use the STM32CubeIDE Clock Configuration tab to help.
    pub fn setup(&self) -> Result<()> {
        self.validate_speeds()?;

        let rcc = unsafe { &(*RCC::ptr()) };
        let pwr = unsafe { &(*PWR::ptr()) };
        let flash = unsafe { &(*FLASH::ptr()) };

        // PWR is needed for the voltage range; don't reset it, or we'd lose the backup domain
        // access setting.
        rcc_en!(ahb3, pwr, rcc);

        let boost = matches!(self.input_src, InputSrc::Pll(_))
            && matches!(self.voltage_range, VoltageRange::Range1 | VoltageRange::Range2);

        // The EPOD booster takes its clock from the PLL1 source, divided by MBOOST. This must
        // be set before enabling the booster.
        rcc.pll1cfgr()
            .modify(|_, w| unsafe { w.pll1mboost().bits(self.boost_div_bits()) });

        // Raise the core voltage before raising the clock speed.
        pwr.vosr()
            .modify(|_, w| unsafe { w.vos().bits(self.voltage_range.bits()) });
        bounded_loop!(pwr.vosr().read().vosrdy().bit_is_clear(), HW_ERR);

        if boost {
            pwr.vosr().modify(|_, w| w.boosten().set_bit());
            bounded_loop!(pwr.vosr().read().boostrdy().bit_is_clear(), HW_ERR);
        }

        // Adjust flash wait states according to the HCLK frequency.
        // We need to do this before enabling PLL, or it won't enable.
        let wait_states = self.flash_wait_states();
        flash.acr().modify(|_, w| unsafe { w.latency().bits(wait_states) });
        bounded_loop!(
            flash.acr().read().latency().bits() != wait_states,
            Error::RegisterUnchanged
        );

        // Enable oscillators, and wait until ready.
        match self.input_src {
            InputSrc::Msis(range) | InputSrc::Pll(PllSrc::Msis(range)) => {
                self.enable_msis(range)?;
            }
            InputSrc::Hse(_) | InputSrc::Pll(PllSrc::Hse(_)) => {
                if self.hse_bypass {
                    rcc.cr().modify(|_, w| w.hsebyp().set_bit());
                }
                rcc.cr().modify(|_, w| w.hseon().set_bit());
                bounded_loop!(rcc.cr().read().hserdy().bit_is_clear(), HW_ERR);
            }
            InputSrc::Hsi | InputSrc::Pll(PllSrc::Hsi) => {
                rcc.cr().modify(|_, w| w.hsion().set_bit());
                bounded_loop!(rcc.cr().read().hsirdy().bit_is_clear(), HW_ERR);
            }
            InputSrc::Pll(PllSrc::None) => (),
        }

        if let InputSrc::Pll(pll_src) = self.input_src {
            // If we're currently running from the PLL, move to MSIS while it's reconfigured.
            if rcc.cfgr1().read().sws().bits() == InputSrc::Pll(pll_src).bits() {
                rcc.cfgr1().modify(|_, w| unsafe { w.sw().bits(0) });
                bounded_loop!(rcc.cfgr1().read().sws().bits() != 0, HW_ERR);
            }

            // Turn off the PLL: Required for modifying some of the settings below.
            rcc.cr().modify(|_, w| w.pll1on().clear_bit());
            // Wait for the PLL to no longer be ready before executing certain writes.
            bounded_loop!(rcc.cr().read().pll1rdy().bit_is_set(), HW_ERR);

            rcc.pll1cfgr().modify(|_, w| unsafe {
                w.pll1src().bits(pll_src.bits());
                w.pll1rge().bits(self.pll_rge_bits());
                w.pll1m().bits(self.pll_m - 1)
            });

            // Keep the P and Q dividers; set N and R.
            rcc.pll1divr().modify(|_, w| unsafe {
                w.pll1n().bits(self.pll_n - 1);
                w.pll1r().bits(self.pll_r - 1)
            });

            rcc.pll1cfgr().modify(|_, w| w.pll1ren().set_bit());

            // Now turn PLL back on, once we're configured things that can only be set with it off.
            rcc.cr().modify(|_, w| w.pll1on().set_bit());
            bounded_loop!(rcc.cr().read().pll1rdy().bit_is_clear(), HW_ERR);
        }

        rcc.cfgr2().modify(|_, w| unsafe {
            w.hpre().bits(self.hclk_prescaler as u8);
            w.ppre1().bits(self.apb1_prescaler as u8);
            w.ppre2().bits(self.apb2_prescaler as u8)
        });
        rcc.cfgr3()
            .modify(|_, w| unsafe { w.ppre3().bits(self.apb3_prescaler as u8) });

        let sw = self.input_src.bits();
        rcc.cfgr1().modify(|_, w| unsafe { w.sw().bits(sw) });
        bounded_loop!(rcc.cfgr1().read().sws().bits() != sw, HW_ERR);

        // Enable the HSI48 as required, which is used for USB, RNG, etc.
        if self.hsi48_on {
            rcc.cr().modify(|_, w| w.hsi48on().set_bit());
            bounded_loop!(rcc.cr().read().hsi48rdy().bit_is_clear(), HW_ERR);
        }

        // Enable and reset System Configuration Controller, ie for interrupts.
        rcc_en_reset!(apb3, syscfg, rcc);

        debug!(
            "Clocks set up. SYSCLK: {=u32} Hz; flash wait states: {=u8}",
            self.sysclk(),
            wait_states
        );

        Ok(())
    }

    /// Set the MSIS range and wait for it to be ready. The range can be changed while MSIS
    /// runs, as long as it's ready.
    fn enable_msis(&self, range: super::MsisRange) -> Result<()> {
        let rcc = unsafe { &(*RCC::ptr()) };

        rcc.cr().modify(|_, w| w.msison().set_bit());
        bounded_loop!(rcc.cr().read().msisrdy().bit_is_clear(), HW_ERR);

        rcc.icscr1().modify(|_, w| unsafe {
            w.msisrange().bits(range as u8);
            w.msirgsel().set_bit()
        });
        bounded_loop!(rcc.cr().read().msisrdy().bit_is_clear(), HW_ERR);

        Ok(())
    }

    /// Re-select input source; used after Stop and Standby modes, where the system reverts
    /// to MSIS or HSI16 after wake.
    pub fn reselect_input(&self) -> Result<()> {
        let rcc = unsafe { &(*RCC::ptr()) };

        match self.input_src {
            InputSrc::Hse(_) | InputSrc::Pll(PllSrc::Hse(_)) => {
                rcc.cr().modify(|_, w| w.hseon().set_bit());
                bounded_loop!(rcc.cr().read().hserdy().bit_is_clear(), HW_ERR);
            }
            InputSrc::Hsi | InputSrc::Pll(PllSrc::Hsi) => {
                rcc.cr().modify(|_, w| w.hsion().set_bit());
                bounded_loop!(rcc.cr().read().hsirdy().bit_is_clear(), HW_ERR);
            }
            InputSrc::Msis(range) | InputSrc::Pll(PllSrc::Msis(range)) => {
                self.enable_msis(range)?;
            }
            InputSrc::Pll(PllSrc::None) => (),
        }

        if let InputSrc::Pll(_) = self.input_src {
            rcc.cr().modify(|_, w| w.pll1on().set_bit());
            bounded_loop!(rcc.cr().read().pll1rdy().bit_is_clear(), HW_ERR);
        }

        let sw = self.input_src.bits();
        rcc.cfgr1().modify(|_, w| unsafe { w.sw().bits(sw) });
        bounded_loop!(rcc.cfgr1().read().sws().bits() != sw, HW_ERR);

        Ok(())
    }

    /// Check if the PLL is enabled. This is useful if checking whether to re-enable the PLL
    /// after exiting Stop or Standby modes, eg so you don't re-enable if it was already
    /// re-enabled in a different context.
    pub fn pll_is_enabled(&self) -> bool {
        let rcc = unsafe { &(*RCC::ptr()) };
        rcc.cr().read().pll1on().bit_is_set()
    }
}

/// Allow writes to the backup domain, where the LSI and LSE controls live.
fn enable_backup_access() {
    let rcc = unsafe { &(*RCC::ptr()) };
    let pwr = unsafe { &(*PWR::ptr()) };

    rcc_en!(ahb3, pwr, rcc);
    pwr.dbpr().modify(|_, w| w.dbp().set_bit());
}

/// Enable the 32 kHz low-speed internal oscillator, and wait until it's ready.
pub fn enable_lsi() -> Result<()> {
    let rcc = unsafe { &(*RCC::ptr()) };

    enable_backup_access();
    rcc.bdcr().modify(|_, w| w.lsion().set_bit());
    bounded_loop!(rcc.bdcr().read().lsirdy().bit_is_clear(), HW_ERR);

    Ok(())
}

/// Stop the LSI, and wait until it's stopped.
pub fn disable_lsi() -> Result<()> {
    let rcc = unsafe { &(*RCC::ptr()) };

    enable_backup_access();
    rcc.bdcr().modify(|_, w| w.lsion().clear_bit());
    bounded_loop!(rcc.bdcr().read().lsirdy().bit_is_set(), HW_ERR);

    Ok(())
}

pub fn lsi_is_ready() -> bool {
    let rcc = unsafe { &(*RCC::ptr()) };
    rcc.bdcr().read().lsirdy().bit_is_set()
}

/// Output a clock on the MCO pin. The pin must be set to its MCO alternate function
/// separately, eg PA8 AF0.
pub fn mco_config(src: McoSrc, prescaler: McoPrescaler) {
    let rcc = unsafe { &(*RCC::ptr()) };

    rcc.cfgr1().modify(|_, w| unsafe {
        w.mcosel().bits(src as u8);
        w.mcopre().bits(prescaler as u8)
    });
}
