//! Busy-wait delays, counted in core cycles. These don't need the tick interrupt, so they work
//! before `tick::init()`, with interrupts masked, and in interrupt handlers. For longer waits
//! once the tick is running, prefer `tick::delay()`.

use cortex_m::asm;

#[cfg(feature = "embedded_hal")]
use embedded_hal::delay::DelayNs;

use crate::clocks::Clocks;

/// Core cycles in `us` microseconds, at `hclk` Hz. Saturates rather than wrapping.
pub(crate) fn cycles_us(us: u32, hclk: u32) -> u32 {
    let cycles = us as u64 * hclk as u64 / 1_000_000;
    cycles.min(u32::MAX as u64) as u32
}

/// Block for `us` microseconds, given the core clock in Hz.
pub fn delay_us(us: u32, hclk: u32) {
    asm::delay(cycles_us(us, hclk));
}

/// Block for `ms` milliseconds, given the core clock in Hz.
pub fn delay_ms(ms: u32, hclk: u32) {
    for _ in 0..ms {
        delay_us(1_000, hclk);
    }
}

/// A cycle-counting delay provider, for drivers that take an `embedded-hal` `DelayNs`.
#[derive(Clone, Copy)]
pub struct Delay {
    hclk: u32,
}

impl Delay {
    pub fn new(clock_cfg: &Clocks) -> Self {
        Self {
            hclk: clock_cfg.hclk(),
        }
    }

    pub fn delay_us(&mut self, us: u32) {
        delay_us(us, self.hclk);
    }

    pub fn delay_ms(&mut self, ms: u32) {
        delay_ms(ms, self.hclk);
    }
}

#[cfg(feature = "embedded_hal")]
impl DelayNs for Delay {
    fn delay_ns(&mut self, ns: u32) {
        let cycles = (ns as u64 * self.hclk as u64).div_ceil(1_000_000_000);
        asm::delay(cycles as u32);
    }

    fn delay_us(&mut self, us: u32) {
        Delay::delay_us(self, us);
    }

    fn delay_ms(&mut self, ms: u32) {
        Delay::delay_ms(self, ms);
    }
}
