//! Drivers for parts found on U5 boards: push buttons, LEDs on a GPIO or timer channel, and
//! the TCPP01 USB Type-C port protection chip.
//!
//! Each driver talks to hardware through a small trait defined here or in its module, and
//! implemented for this crate's peripherals when a device feature is enabled. Other
//! implementations (an IO expander, a test double) plug in the same way.

pub mod button;
pub mod led;
pub mod led_pwm;
pub mod tcpp01;

use crate::gpio::{Edge, PinState};

/// A digital output driving a part.
pub trait OutputLine {
    fn set_state(&mut self, state: PinState);

    fn toggle(&mut self);
}

/// A digital input routed to an EXTI line.
pub trait ExtiLine {
    fn is_high(&self) -> bool;

    /// Unmask the line, triggering on `edge`.
    fn enable_interrupt(&mut self, edge: Edge);

    fn disable_interrupt(&mut self);

    fn clear_interrupt(&mut self, edge: Edge);

    /// The edge pending on the line, if any.
    fn pending_edge(&self) -> Option<Edge>;
}

#[cfg(feature = "u5")]
mod hw {
    use super::*;
    use crate::gpio::{Pin, clear_exti_interrupt, exti_pending_edge};

    impl OutputLine for Pin {
        fn set_state(&mut self, state: PinState) {
            Pin::set_state(self, state);
        }

        fn toggle(&mut self) {
            Pin::toggle(self);
        }
    }

    impl ExtiLine for Pin {
        fn is_high(&self) -> bool {
            Pin::is_high(self)
        }

        fn enable_interrupt(&mut self, edge: Edge) {
            Pin::enable_interrupt(self, edge);
        }

        fn disable_interrupt(&mut self) {
            Pin::disable_interrupt(self);
        }

        fn clear_interrupt(&mut self, edge: Edge) {
            clear_exti_interrupt(self.pin, edge);
        }

        fn pending_edge(&self) -> Option<Edge> {
            exti_pending_edge(self.pin)
        }
    }
}

/// Test doubles shared by the part driver tests.
#[cfg(test)]
pub(crate) mod fakes {
    use super::*;

    #[derive(Default)]
    pub struct FakeOutput {
        pub high: bool,
        pub writes: u32,
    }

    impl OutputLine for FakeOutput {
        fn set_state(&mut self, state: PinState) {
            self.high = state == PinState::High;
            self.writes += 1;
        }

        fn toggle(&mut self) {
            self.high = !self.high;
            self.writes += 1;
        }
    }

    #[derive(Default)]
    pub struct FakeExti {
        pub high: bool,
        pub enabled: Option<Edge>,
        pub pending: Option<Edge>,
        pub clears: u32,
    }

    impl ExtiLine for FakeExti {
        fn is_high(&self) -> bool {
            self.high
        }

        fn enable_interrupt(&mut self, edge: Edge) {
            self.enabled = Some(edge);
        }

        fn disable_interrupt(&mut self) {
            self.enabled = None;
        }

        fn clear_interrupt(&mut self, _edge: Edge) {
            self.pending = None;
            self.clears += 1;
        }

        fn pending_edge(&self) -> Option<Edge> {
            self.pending
        }
    }
}
