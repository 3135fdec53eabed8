//! Independent watchdog. Clocked by the LSI, it resets the MCU unless refreshed before its
//! down-counter reaches zero. Optionally, refreshes that arrive too early also reset (window
//! mode), and an early wakeup interrupt fires some time before the reset.
//!
//! Times are in milliseconds. The prescaler is picked from the maximum time when started,
//! and the window and early wakeup times are rounded to the nearest counter step.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IwdgError {
    /// The maximum time is zero, or longer than the counter can reach at this LSI frequency.
    MaxTime,
    /// The minimum (window) time is longer than the maximum time.
    MinTime,
    /// The early wakeup time isn't strictly between the minimum and maximum times.
    EarlyWakeupTime,
    /// The watchdog's registers didn't finish updating in time.
    UpdateTimeout,
}

/// Nominal LSI frequency.
pub const LSI_FREQ: u32 = 32_000;

const MAX_STEP_NR: u32 = 4_096;
const MAX_RELOAD: u16 = 4_095;
const MAX_PRESCALER: u32 = 1_024;
/// Writing this to WINR disables the window.
pub const WINDOW_DISABLE: u16 = 0xfff;

/// Prescaler and reload, as computed from a maximum time, and the LSI frequency they were
/// computed with. Converts times to and from counter values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IwdgTiming {
    pub lsi_hz: u32,
    /// PR field: the counter clock is LSI / (4 * 2^prescaler).
    pub prescaler: u8,
    pub reload: u16,
}

/// The longest maximum time the watchdog supports at `lsi_hz`, in ms.
pub fn allowed_max_time(lsi_hz: u32) -> u32 {
    ((MAX_PRESCALER as u64 * MAX_STEP_NR as u64 * 1_000) / lsi_hz as u64) as u32
}

impl IwdgTiming {
    /// Pick the smallest prescaler whose range covers `max_ms`, and the reload that gives
    /// the closest time.
    pub fn from_max_time(lsi_hz: u32, max_ms: u32) -> Result<Self, IwdgError> {
        if max_ms == 0 || lsi_hz == 0 || max_ms > allowed_max_time(lsi_hz) {
            return Err(IwdgError::MaxTime);
        }

        let max_period = (max_ms as u64 * lsi_hz as u64 / 1_000) / (4 * MAX_STEP_NR as u64);
        let prescaler = (32 - (max_period as u32).leading_zeros()) as u8;

        let reload = ((max_ms as u64 * lsi_hz as u64 / (1_000 * 2 * (1u64 << prescaler)) + 1) >> 1)
            .saturating_sub(1);

        Ok(Self {
            lsi_hz,
            prescaler,
            reload: reload.min(MAX_RELOAD as u64) as u16,
        })
    }

    /// The counter value at which `time_ms` has elapsed since a refresh; the value written to
    /// WINR or EWCR.
    pub fn param(&self, time_ms: u32) -> u16 {
        let ticks = ((time_ms as u64 * self.lsi_hz as u64) / (1_000 * 2 * (1u64 << self.prescaler)) + 1) >> 1;
        (self.reload as u64).saturating_sub(ticks) as u16
    }

    /// The time, in ms and rounded to nearest, a WINR or EWCR value stands for.
    /// `WINDOW_DISABLE` reads as 0.
    pub fn time(&self, param: u16) -> u32 {
        if param == MAX_RELOAD {
            return 0;
        }
        let reload_value = self.reload.saturating_sub(param) as u64;
        self.ticks_to_ms(reload_value)
    }

    /// The time from a refresh until reset, in ms.
    pub fn max_time(&self) -> u32 {
        self.ticks_to_ms(self.reload as u64 + 1)
    }

    /// Counter period, in µs, rounded to nearest.
    pub fn step_us(&self) -> u32 {
        let dividend = 1_000_000 * 4 * (1u64 << self.prescaler);
        ((dividend + self.lsi_hz as u64 / 2) / self.lsi_hz as u64) as u32
    }

    fn ticks_to_ms(&self, ticks: u64) -> u32 {
        let dividend = ticks * 1_000 * 4 * (1u64 << self.prescaler);
        let divisor = self.lsi_hz as u64;
        let mut time = dividend / divisor;
        if (dividend % divisor) * 2 >= divisor {
            time += 1;
        }
        time as u32
    }
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IwdgConfig {
    /// Time from a refresh until reset.
    pub max_time_ms: u32,
    /// Refreshing before this has elapsed resets the MCU. 0 disables the window.
    pub min_time_ms: u32,
    /// Fire the early wakeup interrupt once this has elapsed since the last refresh. 0
    /// disables it.
    pub early_wakeup_ms: u32,
    /// The LSI frequency; measure it (eg with TIM16 input capture) for accurate times.
    pub lsi_hz: u32,
}

impl Default for IwdgConfig {
    fn default() -> Self {
        Self {
            max_time_ms: 1_000,
            min_time_ms: 0,
            early_wakeup_ms: 0,
            lsi_hz: LSI_FREQ,
        }
    }
}

impl IwdgConfig {
    /// Check the times against each other, and compute the timing.
    pub fn timing(&self) -> Result<IwdgTiming, IwdgError> {
        let timing = IwdgTiming::from_max_time(self.lsi_hz, self.max_time_ms)?;

        if self.min_time_ms > self.max_time_ms {
            return Err(IwdgError::MinTime);
        }
        if self.early_wakeup_ms != 0
            && !(self.min_time_ms < self.early_wakeup_ms && self.early_wakeup_ms < self.max_time_ms)
        {
            return Err(IwdgError::EarlyWakeupTime);
        }

        Ok(timing)
    }
}

#[cfg(feature = "u5")]
mod hw {
    use super::*;
    use crate::{
        error::Result,
        pac::{IWDG, iwdg::sr},
        tick::Timeout,
    };

    const KEY_ENABLE: u16 = 0xcccc;
    const KEY_WRITE_ACCESS: u16 = 0x5555;
    const KEY_REFRESH: u16 = 0xaaaa;
    /// Any other key write-protects the registers again.
    const KEY_LOCK: u16 = 0x0000;

    /// Register updates cross into the LSI domain; the slowest takes a few counter periods
    /// at the largest prescaler and the slowest LSI.
    const UPDATE_TIMEOUT_MS: u32 = 4_100;

    /// Represents the independent watchdog. Once started, it can't be stopped except by a
    /// reset.
    pub struct Iwdg {
        regs: IWDG,
        timing: IwdgTiming,
    }

    impl Iwdg {
        /// Start the watchdog, and configure its times. The LSI is forced on by hardware.
        pub fn start(regs: IWDG, cfg: &IwdgConfig) -> Result<Self> {
            let timing = cfg.timing()?;

            // 1. Enable the IWDG by writing 0x0000 CCCC in the IWDG key register (IWDG_KR).
            regs.kr().write(|w| unsafe { w.key().bits(KEY_ENABLE) });
            // 2. Enable register access by writing 0x0000 5555 in the IWDG key register.
            regs.kr().write(|w| unsafe { w.key().bits(KEY_WRITE_ACCESS) });
            // 3. Write the prescaler and reload.
            regs.pr().write(|w| unsafe { w.pr().bits(timing.prescaler) });
            regs.rlr().write(|w| unsafe { w.rl().bits(timing.reload) });

            let result = Self { regs, timing };
            result.write_early_wakeup(cfg.early_wakeup_ms);
            result.write_min_time(cfg.min_time_ms);

            // 4. Wait for the registers to be updated.
            let r = result.wait_update(|sr| {
                sr.pvu().bit_is_set()
                    || sr.rvu().bit_is_set()
                    || sr.wvu().bit_is_set()
                    || sr.ewu().bit_is_set()
            });
            result.lock();
            r?;

            debug!(
                "IWDG started. Prescaler: {=u8}, reload: {=u16}",
                timing.prescaler,
                timing.reload
            );

            Ok(result)
        }

        /// Run this at an interval shorter than the max time, and longer than the min time, to
        /// prevent a reset.
        pub fn refresh(&mut self) {
            self.regs.kr().write(|w| unsafe { w.key().bits(KEY_REFRESH) });
        }

        pub fn timing(&self) -> IwdgTiming {
            self.timing
        }

        pub fn get_max_time(&self) -> u32 {
            self.timing.max_time()
        }

        /// The counter period, in µs.
        pub fn get_step(&self) -> u32 {
            self.timing.step_us()
        }

        /// Change the window. The prescaler stays as chosen from the max time. 0 disables the
        /// window.
        pub fn set_min_time(&mut self, time_ms: u32) -> Result<()> {
            if time_ms > self.get_max_time() {
                return Err(IwdgError::MinTime.into());
            }

            self.unlock();
            self.write_min_time(time_ms);
            let r = self.wait_update(|sr| sr.wvu().bit_is_set());
            self.lock();
            r
        }

        pub fn get_min_time(&self) -> u32 {
            self.timing.time(self.regs.winr().read().win().bits())
        }

        /// Change when the early wakeup interrupt fires. 0 disables it.
        pub fn set_early_wakeup_time(&mut self, time_ms: u32) -> Result<()> {
            let min = self.get_min_time();
            if time_ms != 0 && !(min < time_ms && time_ms < self.get_max_time()) {
                return Err(IwdgError::EarlyWakeupTime.into());
            }

            self.unlock();
            self.write_early_wakeup(time_ms);
            let r = self.wait_update(|sr| sr.ewu().bit_is_set());
            self.lock();
            r
        }

        /// 0 when the early wakeup interrupt is off.
        pub fn get_early_wakeup_time(&self) -> u32 {
            let ewcr = self.regs.ewcr().read();
            if ewcr.ewie().bit_is_clear() {
                return 0;
            }
            self.timing.time(ewcr.ewit().bits())
        }

        pub fn early_wakeup_pending(&self) -> bool {
            self.regs.sr().read().ewif().bit_is_set()
        }

        pub fn clear_early_wakeup_flag(&mut self) {
            self.regs.ewcr().modify(|_, w| w.ewic().set_bit());
        }

        /// Run this in the IWDG interrupt handler. Returns true if the early wakeup fired,
        /// and clears it.
        pub fn on_interrupt(&mut self) -> bool {
            if self.early_wakeup_pending() {
                self.clear_early_wakeup_flag();
                return true;
            }
            false
        }

        fn unlock(&self) {
            self.regs.kr().write(|w| unsafe { w.key().bits(KEY_WRITE_ACCESS) });
        }

        fn lock(&self) {
            self.regs.kr().write(|w| unsafe { w.key().bits(KEY_LOCK) });
        }

        fn write_min_time(&self, time_ms: u32) {
            if time_ms == 0 {
                self.regs.winr().write(|w| unsafe { w.win().bits(WINDOW_DISABLE) });
                return;
            }

            let window = self.timing.param(time_ms);
            if self.regs.winr().read().win().bits() != window {
                self.regs.winr().write(|w| unsafe { w.win().bits(window) });
            } else {
                // Writing WINR reloads the counter; do it explicitly when the value is unchanged.
                self.regs.kr().write(|w| unsafe { w.key().bits(KEY_REFRESH) });
            }
        }

        fn write_early_wakeup(&self, time_ms: u32) {
            if time_ms == 0 {
                self.regs.ewcr().modify(|_, w| w.ewie().clear_bit());
            } else {
                let param = self.timing.param(time_ms);
                self.regs.ewcr().write(|w| unsafe {
                    w.ewit().bits(param);
                    w.ewic().set_bit();
                    w.ewie().set_bit()
                });
            }
        }

        /// Wait until the SR update flags `pending` checks have cleared.
        fn wait_update(&self, pending: impl Fn(&sr::R) -> bool) -> Result<()> {
            let timeout = Timeout::new(UPDATE_TIMEOUT_MS);
            while pending(&self.regs.sr().read()) {
                if timeout.is_expired() && pending(&self.regs.sr().read()) {
                    return Err(IwdgError::UpdateTimeout.into());
                }
            }
            Ok(())
        }
    }
}

#[cfg(feature = "u5")]
pub use hw::Iwdg;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prescaler_follows_range() {
        // Up to 512 ms fits the /4 prescaler at 32 kHz.
        let t = IwdgTiming::from_max_time(LSI_FREQ, 500).unwrap();
        assert_eq!((t.prescaler, t.reload), (0, 3_999));
        assert_eq!(t.max_time(), 500);

        let t = IwdgTiming::from_max_time(LSI_FREQ, 1_000).unwrap();
        assert_eq!((t.prescaler, t.reload), (1, 3_999));
        assert_eq!(t.max_time(), 1_000);
        assert_eq!(t.step_us(), 250);

        let t = IwdgTiming::from_max_time(LSI_FREQ, 4_096).unwrap();
        assert_eq!((t.prescaler, t.reload), (4, 2_047));
        assert_eq!(t.max_time(), 4_096);
    }

    #[test]
    fn window_and_early_wakeup_params() {
        let t = IwdgTiming::from_max_time(LSI_FREQ, 1_000).unwrap();

        let window = t.param(250);
        assert_eq!(window, 2_999);
        assert_eq!(t.time(window), 250);

        let ewi = t.param(900);
        assert_eq!(ewi, 399);
        assert_eq!(t.time(ewi), 900);

        assert_eq!(t.time(WINDOW_DISABLE), 0);
    }

    #[test]
    fn slow_lsi() {
        // LSI / 128: 250 Hz. 60 s still fits /4, 200 s needs /16.
        let t = IwdgTiming::from_max_time(250, 60_000).unwrap();
        assert_eq!((t.prescaler, t.reload), (0, 3_749));
        assert_eq!(t.max_time(), 60_000);

        let t = IwdgTiming::from_max_time(250, 200_000).unwrap();
        assert_eq!((t.prescaler, t.reload), (2, 3_124));
        assert_eq!(t.max_time(), 200_000);
        assert_eq!(allowed_max_time(250), 16_777_216);
    }

    #[test]
    fn rejects_bad_times() {
        assert_eq!(IwdgTiming::from_max_time(LSI_FREQ, 0), Err(IwdgError::MaxTime));
        assert_eq!(
            IwdgTiming::from_max_time(LSI_FREQ, allowed_max_time(LSI_FREQ) + 1),
            Err(IwdgError::MaxTime)
        );

        let cfg = IwdgConfig {
            max_time_ms: 100,
            min_time_ms: 200,
            ..Default::default()
        };
        assert_eq!(cfg.timing(), Err(IwdgError::MinTime));

        let cfg = IwdgConfig {
            max_time_ms: 1_000,
            min_time_ms: 200,
            early_wakeup_ms: 100,
            ..Default::default()
        };
        assert_eq!(cfg.timing(), Err(IwdgError::EarlyWakeupTime));

        let cfg = IwdgConfig {
            max_time_ms: 1_000,
            min_time_ms: 200,
            early_wakeup_ms: 900,
            ..Default::default()
        };
        assert!(cfg.timing().is_ok());
    }
}
