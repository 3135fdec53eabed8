//! LED on a timer channel: on, off, a set brightness, or a repeating fade or blink pattern.
//!
//! Patterns are 128 compare values over an 11-bit period. The timer's update interrupt steps
//! through them, one value per PWM period; the speed setting slows the timer by multiplying
//! its prescaler.

use crate::{error::Result, timer::OutputCompare};

/// Entries per pattern.
pub const PATTERN_SIZE: usize = 128;
/// Largest pattern value; the timer period is set so this keeps the output on.
pub const PATTERN_MAX_VALUE: u16 = 2048;

/// One period of a sine, offset to 0..=2048.
pub static SINE_PATTERN: [u16; PATTERN_SIZE] = [
    1024, 1074, 1124, 1174, 1224, 1273, 1321, 1369, 1416, 1462, 1507, 1550, 1593, 1634, 1674, 1712,
    1748, 1783, 1816, 1846, 1875, 1902, 1927, 1950, 1970, 1988, 2004, 2017, 2028, 2037, 2043, 2047,
    2048, 2047, 2043, 2037, 2028, 2017, 2004, 1988, 1970, 1950, 1927, 1902, 1875, 1846, 1816, 1783,
    1748, 1712, 1674, 1634, 1593, 1550, 1507, 1462, 1416, 1369, 1321, 1273, 1224, 1174, 1124, 1074,
    1024, 974, 924, 874, 824, 775, 727, 679, 632, 586, 541, 498, 455, 414, 374, 336, 300, 265, 232,
    202, 173, 146, 121, 98, 78, 60, 44, 31, 20, 11, 5, 1, 0, 1, 5, 11, 20, 31, 44, 60, 78, 98, 121,
    146, 173, 202, 232, 265, 300, 336, 374, 414, 455, 498, 541, 586, 632, 679, 727, 775, 824, 874,
    924, 974,
];

/// Off for the first half, on for the second.
pub static SQUARE_PATTERN: [u16; PATTERN_SIZE] = {
    let mut p = [0; PATTERN_SIZE];
    let mut i = PATTERN_SIZE / 2;
    while i < PATTERN_SIZE {
        p[i] = PATTERN_MAX_VALUE;
        i += 1;
    }
    p
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LedSpeed {
    Fast,
    Medium,
    Slow,
}

impl LedSpeed {
    /// Prescaler multiplier for this speed.
    pub fn multiplier(&self) -> u16 {
        match self {
            Self::Fast => 1,
            Self::Medium => 4,
            Self::Slow => 8,
        }
    }

    /// The prescaler to run a pattern at, from the one the timer was set up with. Saturates
    /// at `u16::MAX`.
    pub fn prescaler(&self, base: u16) -> u16 {
        let mult = self.multiplier();
        if base < u16::MAX / mult {
            base * mult
        } else {
            u16::MAX
        }
    }
}

/// A timer output channel, as used by `LedPwm`.
pub trait PwmChannel {
    /// Set the auto-reload value.
    fn set_period(&mut self, arr: u32) -> Result<()>;

    fn period(&self) -> u32;

    fn prescaler(&self) -> u16;

    fn set_prescaler(&mut self, psc: u16);

    fn set_mode(&mut self, mode: OutputCompare);

    fn set_pulse(&mut self, pulse: u32);

    /// Enable the channel output and the counter.
    fn start(&mut self);

    fn enable_update_interrupt(&mut self);

    fn disable_update_interrupt(&mut self);
}

struct PatternRun {
    values: &'static [u16; PATTERN_SIZE],
    index: usize,
}

pub struct LedPwm<C> {
    pub ch: C,
    pub id: u32,
    /// The prescaler in place at init. Pattern speeds are multiples of it.
    base_prescaler: u16,
    mode: OutputCompare,
    pattern: Option<PatternRun>,
}

impl<C: PwmChannel> LedPwm<C> {
    /// Set the period for 11-bit patterns, force the output inactive, and start the timer.
    pub fn new(mut ch: C, id: u32) -> Result<Self> {
        ch.set_period(PATTERN_MAX_VALUE as u32 - 1)?;
        ch.set_mode(OutputCompare::ForceInactive);
        ch.set_pulse(0);
        ch.start();

        Ok(Self {
            base_prescaler: ch.prescaler(),
            ch,
            id,
            mode: OutputCompare::ForceInactive,
            pattern: None,
        })
    }

    pub fn free(mut self) -> C {
        self.stop_pattern();
        self.ch
    }

    fn set_mode(&mut self, mode: OutputCompare) {
        self.ch.set_mode(mode);
        self.mode = mode;
    }

    pub fn on(&mut self) {
        self.stop_pattern();
        self.set_mode(OutputCompare::ForceActive);
    }

    pub fn off(&mut self) {
        self.stop_pattern();
        self.set_mode(OutputCompare::ForceInactive);
    }

    /// Switch between forced on and off. From a brightness or pattern, this turns the LED off.
    pub fn toggle(&mut self) {
        self.stop_pattern();
        let next = if self.mode == OutputCompare::ForceInactive {
            OutputCompare::ForceActive
        } else {
            OutputCompare::ForceInactive
        };
        self.set_mode(next);
    }

    /// Set a constant brightness, 0 (off) to 255 (fully on).
    pub fn set_brightness(&mut self, brightness: u8) {
        self.stop_pattern();
        let pulse = brightness_pulse(self.ch.period(), brightness);
        self.set_mode(OutputCompare::Pwm1);
        self.ch.set_pulse(pulse);
    }

    /// Repeatedly fade in and out.
    pub fn fade(&mut self, speed: LedSpeed) {
        self.start_pattern(speed, &SINE_PATTERN);
    }

    /// Repeatedly blink.
    pub fn blink(&mut self, speed: LedSpeed) {
        self.start_pattern(speed, &SQUARE_PATTERN);
    }

    fn start_pattern(&mut self, speed: LedSpeed, values: &'static [u16; PATTERN_SIZE]) {
        self.stop_pattern();

        self.ch.set_prescaler(speed.prescaler(self.base_prescaler));
        self.set_mode(OutputCompare::Pwm1);
        self.ch.set_pulse(values[0] as u32);
        self.pattern = Some(PatternRun { values, index: 1 });
        self.ch.enable_update_interrupt();

        debug!("LED {=u32}: pattern started", self.id);
    }

    /// Stop a running pattern, leaving the output at its current value, and restore the
    /// prescaler.
    pub fn stop_pattern(&mut self) {
        if self.pattern.take().is_some() {
            self.ch.disable_update_interrupt();
            self.ch.set_prescaler(self.base_prescaler);
        }
    }

    pub fn is_pattern_running(&self) -> bool {
        self.pattern.is_some()
    }

    /// Run this in the timer's update interrupt handler, after clearing the flag. Loads the
    /// next pattern value.
    pub fn on_update(&mut self) {
        if let Some(run) = &mut self.pattern {
            self.ch.set_pulse(run.values[run.index] as u32);
            run.index = (run.index + 1) % PATTERN_SIZE;
        }
    }
}

/// Compare value for a brightness of 0 to 255, over a period of `arr + 1` counts.
pub fn brightness_pulse(arr: u32, brightness: u8) -> u32 {
    (arr + 1) * brightness as u32 / u8::MAX as u32
}

#[cfg(feature = "u5")]
mod hw {
    use super::*;
    use crate::timer::{TimChannel, TimChannels, Timer, TimerInterrupt};

    /// One channel of a timer, driving an LED.
    pub struct TimerPwm<R> {
        pub timer: Timer<R>,
        pub channel: TimChannel,
    }

    impl<R: TimChannels> TimerPwm<R> {
        pub fn new(timer: Timer<R>, channel: TimChannel) -> Self {
            Self { timer, channel }
        }
    }

    impl<R: TimChannels> PwmChannel for TimerPwm<R> {
        fn set_period(&mut self, arr: u32) -> Result<()> {
            self.timer.set_auto_reload(arr)
        }

        fn period(&self) -> u32 {
            self.timer.get_max_duty()
        }

        fn prescaler(&self) -> u16 {
            self.timer.get_prescaler()
        }

        fn set_prescaler(&mut self, psc: u16) {
            self.timer.set_prescaler(psc);
        }

        fn set_mode(&mut self, mode: OutputCompare) {
            self.timer.set_output_compare(self.channel, mode);
        }

        fn set_pulse(&mut self, pulse: u32) {
            self.timer.set_duty(self.channel, pulse);
        }

        fn start(&mut self) {
            self.timer.set_preload(self.channel, true);
            self.timer.enable_capture_compare(self.channel);
            self.timer.enable();
        }

        fn enable_update_interrupt(&mut self) {
            self.timer.clear_interrupt(TimerInterrupt::Update);
            self.timer.enable_interrupt(TimerInterrupt::Update);
        }

        fn disable_update_interrupt(&mut self) {
            self.timer.disable_interrupt(TimerInterrupt::Update);
        }
    }
}

#[cfg(feature = "u5")]
pub use hw::TimerPwm;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeChannel {
        arr: u32,
        psc: u16,
        mode: Option<OutputCompare>,
        pulse: u32,
        running: bool,
        update_irq: bool,
    }

    impl PwmChannel for FakeChannel {
        fn set_period(&mut self, arr: u32) -> Result<()> {
            self.arr = arr;
            Ok(())
        }

        fn period(&self) -> u32 {
            self.arr
        }

        fn prescaler(&self) -> u16 {
            self.psc
        }

        fn set_prescaler(&mut self, psc: u16) {
            self.psc = psc;
        }

        fn set_mode(&mut self, mode: OutputCompare) {
            self.mode = Some(mode);
        }

        fn set_pulse(&mut self, pulse: u32) {
            self.pulse = pulse;
        }

        fn start(&mut self) {
            self.running = true;
        }

        fn enable_update_interrupt(&mut self) {
            self.update_irq = true;
        }

        fn disable_update_interrupt(&mut self) {
            self.update_irq = false;
        }
    }

    fn led(psc: u16) -> LedPwm<FakeChannel> {
        let ch = FakeChannel {
            psc,
            ..Default::default()
        };
        LedPwm::new(ch, 0).unwrap()
    }

    #[test]
    fn init_forces_inactive() {
        let led = led(249);
        assert_eq!(led.ch.arr, 2047);
        assert_eq!(led.ch.mode, Some(OutputCompare::ForceInactive));
        assert!(led.ch.running);
        assert!(!led.is_pattern_running());
    }

    #[test]
    fn on_off_toggle() {
        let mut led = led(0);
        led.toggle();
        assert_eq!(led.ch.mode, Some(OutputCompare::ForceActive));
        led.toggle();
        assert_eq!(led.ch.mode, Some(OutputCompare::ForceInactive));
        led.on();
        assert_eq!(led.ch.mode, Some(OutputCompare::ForceActive));
        led.off();
        assert_eq!(led.ch.mode, Some(OutputCompare::ForceInactive));

        led.set_brightness(10);
        led.toggle();
        assert_eq!(led.ch.mode, Some(OutputCompare::ForceInactive));
    }

    #[test]
    fn brightness() {
        assert_eq!(brightness_pulse(2047, 255), 2048);
        assert_eq!(brightness_pulse(2047, 0), 0);
        assert_eq!(brightness_pulse(2047, 128), 1028);
        assert_eq!(brightness_pulse(0x28, 127), 20);

        let mut led = led(0);
        led.set_brightness(64);
        assert_eq!(led.ch.mode, Some(OutputCompare::Pwm1));
        assert_eq!(led.ch.pulse, 514);
    }

    #[test]
    fn speed_prescalers() {
        assert_eq!(LedSpeed::Fast.multiplier(), 1);
        assert_eq!(LedSpeed::Medium.multiplier(), 4);
        assert_eq!(LedSpeed::Slow.multiplier(), 8);

        assert_eq!(LedSpeed::Fast.prescaler(249), 249);
        assert_eq!(LedSpeed::Medium.prescaler(249), 996);
        assert_eq!(LedSpeed::Slow.prescaler(249), 1992);
        assert_eq!(LedSpeed::Slow.prescaler(8190), 65_520);
        assert_eq!(LedSpeed::Slow.prescaler(8191), u16::MAX);
        assert_eq!(LedSpeed::Fast.prescaler(u16::MAX), u16::MAX);
    }

    #[test]
    fn fade_steps_through_sine() {
        let mut led = led(100);
        led.fade(LedSpeed::Medium);
        assert!(led.is_pattern_running());
        assert!(led.ch.update_irq);
        assert_eq!(led.ch.psc, 400);
        assert_eq!(led.ch.pulse, 1024);

        led.on_update();
        assert_eq!(led.ch.pulse, 1074);
        for _ in 0..31 {
            led.on_update();
        }
        assert_eq!(led.ch.pulse, 2048);

        // Wraps around to the start.
        for _ in 0..96 {
            led.on_update();
        }
        assert_eq!(led.ch.pulse, 1024);

        led.off();
        assert!(!led.is_pattern_running());
        assert!(!led.ch.update_irq);
        assert_eq!(led.ch.psc, 100);

        let pulse = led.ch.pulse;
        led.on_update();
        assert_eq!(led.ch.pulse, pulse);
    }

    #[test]
    fn blink_is_half_on() {
        assert_eq!(SQUARE_PATTERN.iter().filter(|&&v| v == 0).count(), 64);
        assert_eq!(SQUARE_PATTERN[64], PATTERN_MAX_VALUE);

        let mut led = led(10);
        led.blink(LedSpeed::Fast);
        assert_eq!(led.ch.pulse, 0);
        for _ in 0..64 {
            led.on_update();
        }
        assert_eq!(led.ch.pulse, PATTERN_MAX_VALUE as u32);

        // A new pattern replaces the old one, from the base prescaler.
        led.fade(LedSpeed::Slow);
        assert_eq!(led.ch.psc, 80);
    }
}
