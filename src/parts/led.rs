//! LED on a GPIO output.

use super::OutputLine;
use crate::gpio::PinState;

pub struct Led<P> {
    pub io: P,
    /// Pin level that lights the LED.
    active_state: PinState,
    on: bool,
}

impl<P: OutputLine> Led<P> {
    /// Take ownership of a configured output, and switch the LED off.
    pub fn new(io: P, active_state: PinState) -> Self {
        let mut result = Self {
            io,
            active_state,
            on: true,
        };
        result.off();
        result
    }

    pub fn on(&mut self) {
        self.io.set_state(self.active_state);
        self.on = true;
    }

    pub fn off(&mut self) {
        self.io.set_state(self.active_state.toggled());
        self.on = false;
    }

    pub fn toggle(&mut self) {
        self.io.toggle();
        self.on = !self.on;
    }

    pub fn set(&mut self, on: bool) {
        if on { self.on() } else { self.off() }
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn free(self) -> P {
        self.io
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parts::fakes::FakeOutput;

    #[test]
    fn active_high() {
        let mut io = FakeOutput::default();
        io.high = true;
        let mut led = Led::new(io, PinState::High);
        assert!(!led.io.high);
        assert!(!led.is_on());

        led.on();
        assert!(led.io.high);
        led.toggle();
        assert!(!led.io.high);
        assert!(!led.is_on());
    }

    #[test]
    fn active_low() {
        let mut led = Led::new(FakeOutput::default(), PinState::Low);
        assert!(led.io.high);

        led.set(true);
        assert!(!led.io.high);
        assert!(led.is_on());

        led.toggle();
        assert!(led.io.high);
        assert_eq!(led.free().writes, 3);
    }
}
