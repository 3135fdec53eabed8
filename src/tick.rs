//! A millisecond time base, incremented from the SysTick interrupt. Blocking drivers measure
//! their timeouts against it, and `delay()` busy-waits on it.
//!
//! Call `inc_tick()` from your `SysTick` exception handler:
//! ```rust,ignore
//! #[exception]
//! fn SysTick() {
//!     tick::inc_tick();
//! }
//! ```

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[cfg(feature = "u5")]
use cortex_m::peripheral::SYST;

#[cfg(feature = "u5")]
use crate::{clocks::Clocks, cortex, error::Result};

/// Pass as a timeout to wait without limit.
pub const MAX_DELAY: u32 = 0xFFFF_FFFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
/// How often the tick counter is incremented. The value is the number of milliseconds added
/// per increment.
pub enum TickFreq {
    Hz10 = 100,
    Hz100 = 10,
    KHz1 = 1,
}

impl TickFreq {
    /// Interrupt rate, in Hz.
    pub fn hz(&self) -> u32 {
        1_000 / *self as u32
    }

    fn from_ms(ms: u32) -> Self {
        match ms {
            100 => Self::Hz10,
            10 => Self::Hz100,
            _ => Self::KHz1,
        }
    }
}

/// A free-running millisecond counter. Wraps after about 49 days; all comparisons use
/// wrapping arithmetic.
pub struct TickCounter {
    ticks: AtomicU32,
    /// Milliseconds per increment.
    step_ms: AtomicU32,
    suspended: AtomicBool,
}

impl TickCounter {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU32::new(0),
            step_ms: AtomicU32::new(TickFreq::KHz1 as u32),
            suspended: AtomicBool::new(false),
        }
    }

    /// Advance the counter by one period. Does nothing while suspended.
    pub fn inc(&self) {
        if !self.suspended.load(Ordering::Relaxed) {
            let step = self.step_ms.load(Ordering::Relaxed);
            self.ticks.fetch_add(step, Ordering::Relaxed);
        }
    }

    pub fn get(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn freq(&self) -> TickFreq {
        TickFreq::from_ms(self.step_ms.load(Ordering::Relaxed))
    }

    pub fn set_freq(&self, freq: TickFreq) {
        self.step_ms.store(freq as u32, Ordering::Relaxed);
    }

    /// Switch to `freq`, then run `apply` to reprogram the tick source. If `apply` fails, the
    /// previous frequency is handed to `restore` and set again, and the error is returned.
    pub fn try_set_freq<E>(
        &self,
        freq: TickFreq,
        mut apply: impl FnMut(TickFreq) -> core::result::Result<(), E>,
    ) -> core::result::Result<(), E> {
        let prev = self.freq();
        if prev == freq {
            return Ok(());
        }

        self.set_freq(freq);
        if let Err(e) = apply(freq) {
            // The previous source setting was valid when it was applied.
            let _ = apply(prev);
            self.set_freq(prev);
            return Err(e);
        }
        Ok(())
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Relaxed);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Relaxed)
    }

    /// Milliseconds elapsed since `start`.
    pub fn elapsed_since(&self, start: u32) -> u32 {
        self.get().wrapping_sub(start)
    }

    /// Block for at least `ms` milliseconds. One tick period is added to the wait, since the
    /// first period may already be partly over when this is called.
    pub fn delay(&self, ms: u32) {
        let start = self.get();
        let step = self.step_ms.load(Ordering::Relaxed);

        let mut wait = ms;
        if wait < MAX_DELAY - step {
            wait += step;
        }

        while self.elapsed_since(start) < wait {
            core::hint::spin_loop();
        }
    }
}

impl Default for TickCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// The counter incremented by `inc_tick()`.
pub static TICK: TickCounter = TickCounter::new();

/// Increment the global tick. Call this from the SysTick handler.
pub fn inc_tick() {
    TICK.inc();
}

/// The current value of the global tick, in milliseconds.
pub fn get_tick() -> u32 {
    TICK.get()
}

pub fn get_tick_freq() -> TickFreq {
    TICK.freq()
}

/// Block for at least `ms` milliseconds, measured against the global tick.
pub fn delay(ms: u32) {
    TICK.delay(ms);
}

/// Stop the tick from advancing; eg before entering a low power mode. On the MCU, this also
/// masks the SysTick interrupt.
pub fn suspend_tick() {
    TICK.suspend();
    #[cfg(feature = "u5")]
    cortex::systick_disable_interrupt();
}

pub fn resume_tick() {
    #[cfg(feature = "u5")]
    cortex::systick_enable_interrupt();
    TICK.resume();
}

/// A deadline measured against a tick counter. A duration of `MAX_DELAY` never expires.
#[derive(Clone, Copy, Debug)]
pub struct Timeout {
    start: u32,
    ms: u32,
}

impl Timeout {
    /// Start a timeout against the global tick.
    pub fn new(ms: u32) -> Self {
        Self::starting_at(get_tick(), ms)
    }

    pub fn starting_at(start: u32, ms: u32) -> Self {
        Self { start, ms }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(get_tick())
    }

    /// A zero timeout expires immediately; other values once strictly more than `ms` have
    /// elapsed.
    pub fn is_expired_at(&self, now: u32) -> bool {
        if self.ms == MAX_DELAY {
            return false;
        }
        self.ms == 0 || now.wrapping_sub(self.start) > self.ms
    }
}

#[cfg(feature = "u5")]
/// Configure SysTick to interrupt at `freq`, from the HCLK-derived SysTick clock, and set
/// the global tick's increment to match.
pub fn init(syst: &mut SYST, clocks: &Clocks, freq: TickFreq) -> Result<()> {
    cortex::systick_config(syst, clocks.systick() / freq.hz())?;
    TICK.set_freq(freq);
    Ok(())
}

#[cfg(feature = "u5")]
/// Change the tick frequency at runtime. SysTick is reprogrammed from the current clock
/// tree. On failure, the previous frequency and SysTick setting are kept.
pub fn set_tick_freq(freq: TickFreq, syst: &mut SYST, clocks: &Clocks) -> Result<()> {
    let systick = clocks.systick();
    TICK.try_set_freq(freq, |f| cortex::systick_config(syst, systick / f.hz()))
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn increments_by_frequency() {
        let t = TickCounter::new();
        t.inc();
        assert_eq!(t.get(), 1);

        t.set_freq(TickFreq::Hz10);
        t.inc();
        assert_eq!(t.get(), 101);
        assert_eq!(t.freq(), TickFreq::Hz10);
        assert_eq!(TickFreq::Hz100.hz(), 100);
    }

    #[test]
    fn suspended_counter_holds() {
        let t = TickCounter::new();
        t.inc();
        t.suspend();
        t.inc();
        t.inc();
        assert_eq!(t.get(), 1);
        t.resume();
        t.inc();
        assert_eq!(t.get(), 2);
    }

    #[test]
    fn elapsed_wraps() {
        let t = TickCounter::new();
        t.ticks.store(5, Ordering::Relaxed);
        assert_eq!(t.elapsed_since(u32::MAX - 4), 10);
    }

    #[test]
    fn delay_waits_one_extra_period() {
        let t = Arc::new(TickCounter::new());
        let ticker = {
            let t = t.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    t.inc();
                    thread::sleep(Duration::from_micros(200));
                }
            })
        };

        let start = t.get();
        t.delay(10);
        assert!(t.elapsed_since(start) >= 11);
        ticker.join().unwrap();
    }

    #[test]
    fn set_freq_applies_new_rate() {
        let t = TickCounter::new();
        let mut applied = std::vec::Vec::new();

        let res: core::result::Result<(), ()> = t.try_set_freq(TickFreq::Hz100, |f| {
            applied.push(f);
            Ok(())
        });
        assert!(res.is_ok());
        assert_eq!(t.freq(), TickFreq::Hz100);
        assert_eq!(applied, [TickFreq::Hz100]);

        // Same frequency: nothing to reprogram.
        let res: core::result::Result<(), ()> = t.try_set_freq(TickFreq::Hz100, |f| {
            applied.push(f);
            Ok(())
        });
        assert!(res.is_ok());
        assert_eq!(applied.len(), 1);
    }

    #[test]
    fn failed_set_freq_restores_previous() {
        let t = TickCounter::new();
        let mut applied = std::vec::Vec::new();

        let res = t.try_set_freq(TickFreq::Hz10, |f| {
            applied.push(f);
            if f == TickFreq::Hz10 { Err("reload out of range") } else { Ok(()) }
        });
        assert_eq!(res, Err("reload out of range"));
        assert_eq!(t.freq(), TickFreq::KHz1);
        assert_eq!(applied, [TickFreq::Hz10, TickFreq::KHz1]);

        t.inc();
        assert_eq!(t.get(), 1);
    }

    #[test]
    fn timeout_rules() {
        let forever = Timeout::starting_at(0, MAX_DELAY);
        assert!(!forever.is_expired_at(u32::MAX));

        let zero = Timeout::starting_at(10, 0);
        assert!(zero.is_expired_at(10));

        let t = Timeout::starting_at(u32::MAX - 1, 5);
        assert!(!t.is_expired_at(3));
        assert!(t.is_expired_at(4));
    }
}
