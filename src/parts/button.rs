//! Push button on an EXTI line, with optional debouncing and a press/release callback.
//!
//! With debouncing, the button's state is the one implied by the last accepted edge; an edge
//! less than `debounce_ms` after the previous accepted one is a rebound, and is dropped.
//! Without it, the state is read from the pin.
//!
//! Example, for the NUCLEO-U575ZI-Q user button on PC13 (active high):
//! ```rust,ignore
//! let pin = Pin::new(Port::C, 13, PinMode::Input);
//! let mut button = Button::new(pin, 0, ButtonConfig::default());
//! button.register_callback(ButtonEvent::Pressed, on_press, 0);
//! button.enable_it();
//!
//! #[interrupt]
//! fn EXTI13() {
//!     critical_section::with(|cs| {
//!         access_global!(BUTTON, button, cs);
//!         button.on_interrupt(tick::get_tick());
//!     });
//! }
//! ```

use super::ExtiLine;
use crate::gpio::{Edge, PinState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ButtonState {
    Pressed,
    Unpressed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Which transitions a registered callback is run on.
pub enum ButtonEvent {
    Pressed,
    Unpressed,
    Any,
}

impl ButtonEvent {
    fn matches(&self, state: ButtonState) -> bool {
        match self {
            Self::Pressed => state == ButtonState::Pressed,
            Self::Unpressed => state == ButtonState::Unpressed,
            Self::Any => true,
        }
    }
}

/// Run from the EXTI handler on a matching transition, with the button's id and the argument
/// given at registration.
pub type ButtonCallback = fn(id: u32, state: ButtonState, arg: usize);

#[derive(Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ButtonConfig {
    /// Pin level when the button is pressed.
    pub active_state: PinState,
    /// Edges closer together than this, in ms, are treated as bounces. `None` disables
    /// debouncing.
    pub debounce_ms: Option<u32>,
}

impl Default for ButtonConfig {
    fn default() -> Self {
        Self {
            active_state: PinState::High,
            debounce_ms: Some(50),
        }
    }
}

struct CallbackSlot {
    event: ButtonEvent,
    f: ButtonCallback,
    arg: usize,
}

pub struct Button<P> {
    pub io: P,
    pub id: u32,
    pub cfg: ButtonConfig,
    last_state: ButtonState,
    last_event_tick: Option<u32>,
    callback: Option<CallbackSlot>,
}

impl<P: ExtiLine> Button<P> {
    /// Take ownership of a configured input, and leave its interrupt disabled.
    pub fn new(io: P, id: u32, cfg: ButtonConfig) -> Self {
        let mut result = Self {
            io,
            id,
            cfg,
            last_state: ButtonState::Unpressed,
            last_event_tick: None,
            callback: None,
        };
        result.disable_it();
        result
    }

    /// Disable the interrupt, and release the input.
    pub fn deinit(mut self) -> P {
        self.disable_it();
        self.io
    }

    /// Clear anything pending, and interrupt on both edges.
    pub fn enable_it(&mut self) {
        self.io.clear_interrupt(Edge::Either);
        self.io.enable_interrupt(Edge::Either);
    }

    pub fn disable_it(&mut self) {
        self.io.disable_interrupt();
        self.io.clear_interrupt(Edge::Either);
    }

    pub fn get_state(&self) -> ButtonState {
        if self.cfg.debounce_ms.is_some() {
            return self.last_state;
        }
        self.state_for_level(self.io.is_high().into())
    }

    /// Run `f` from the interrupt handler on transitions matching `event`. Replaces any
    /// previous callback.
    pub fn register_callback(&mut self, event: ButtonEvent, f: ButtonCallback, arg: usize) {
        self.callback = Some(CallbackSlot { event, f, arg });
    }

    pub fn unregister_callback(&mut self) {
        self.callback = None;
    }

    /// Run this in the EXTI line's interrupt handler, with the current tick. Clears the
    /// pending edge, and handles it as `on_exti` does.
    pub fn on_interrupt(&mut self, tick: u32) -> Option<ButtonState> {
        let edge = self.io.pending_edge()?;
        self.io.clear_interrupt(edge);
        self.on_exti(edge, tick)
    }

    /// Handle an edge seen at `tick`. Returns the new state if the edge was accepted, and
    /// runs the registered callback if the new state matches its filter.
    pub fn on_exti(&mut self, edge: Edge, tick: u32) -> Option<ButtonState> {
        if let Some(debounce) = self.cfg.debounce_ms {
            if let Some(last) = self.last_event_tick {
                if tick.wrapping_sub(last) < debounce {
                    trace!("Button {=u32}: bounce dropped", self.id);
                    return None;
                }
            }
            self.last_event_tick = Some(tick);
        }

        let level = match edge {
            Edge::Rising => PinState::High,
            Edge::Falling => PinState::Low,
            // Both flags were pending; the pin tells where it settled.
            Edge::Either => self.io.is_high().into(),
        };
        let state = self.state_for_level(level);
        self.last_state = state;

        if let Some(cb) = &self.callback {
            if cb.event.matches(state) {
                (cb.f)(self.id, state, cb.arg);
            }
        }

        Some(state)
    }

    fn state_for_level(&self, level: PinState) -> ButtonState {
        if level == self.cfg.active_state {
            ButtonState::Pressed
        } else {
            ButtonState::Unpressed
        }
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::parts::fakes::FakeExti;

    #[test]
    fn init_disables_and_enable_arms_both_edges() {
        let mut io = FakeExti::default();
        io.enabled = Some(Edge::Rising);
        let mut button = Button::new(io, 1, ButtonConfig::default());
        assert_eq!(button.io.enabled, None);

        button.enable_it();
        assert_eq!(button.io.enabled, Some(Edge::Either));

        let io = button.deinit();
        assert_eq!(io.enabled, None);
    }

    #[test]
    fn debounce_drops_rebounds() {
        let mut button = Button::new(FakeExti::default(), 0, ButtonConfig::default());
        assert_eq!(button.get_state(), ButtonState::Unpressed);

        assert_eq!(button.on_exti(Edge::Rising, 1_000), Some(ButtonState::Pressed));
        // Bounces within 50 ms.
        assert_eq!(button.on_exti(Edge::Falling, 1_010), None);
        assert_eq!(button.on_exti(Edge::Rising, 1_049), None);
        assert_eq!(button.get_state(), ButtonState::Pressed);

        assert_eq!(button.on_exti(Edge::Falling, 1_050), Some(ButtonState::Unpressed));
        assert_eq!(button.get_state(), ButtonState::Unpressed);
    }

    #[test]
    fn debounce_across_tick_wrap() {
        let mut button = Button::new(FakeExti::default(), 0, ButtonConfig::default());
        assert!(button.on_exti(Edge::Rising, u32::MAX - 10).is_some());
        assert!(button.on_exti(Edge::Falling, 20).is_none());
        assert!(button.on_exti(Edge::Falling, 40).is_some());
    }

    #[test]
    fn active_low_button() {
        let cfg = ButtonConfig {
            active_state: PinState::Low,
            debounce_ms: Some(20),
        };
        let mut button = Button::new(FakeExti::default(), 0, cfg);
        assert_eq!(button.on_exti(Edge::Falling, 0), Some(ButtonState::Pressed));
        assert_eq!(button.on_exti(Edge::Rising, 100), Some(ButtonState::Unpressed));
    }

    #[test]
    fn without_debounce_state_follows_pin() {
        let cfg = ButtonConfig {
            debounce_ms: None,
            ..Default::default()
        };
        let mut button = Button::new(FakeExti::default(), 0, cfg);
        assert_eq!(button.get_state(), ButtonState::Unpressed);
        button.io.high = true;
        assert_eq!(button.get_state(), ButtonState::Pressed);

        // Every edge is accepted, even back to back.
        assert!(button.on_exti(Edge::Rising, 5).is_some());
        assert!(button.on_exti(Edge::Falling, 5).is_some());
    }

    static PRESSES: AtomicU32 = AtomicU32::new(0);
    static ANY: AtomicU32 = AtomicU32::new(0);

    fn count_press(id: u32, state: ButtonState, arg: usize) {
        assert_eq!(id, 7);
        assert_eq!(state, ButtonState::Pressed);
        PRESSES.fetch_add(arg as u32, Ordering::Relaxed);
    }

    fn count_any(_id: u32, _state: ButtonState, _arg: usize) {
        ANY.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn callback_filters_events() {
        let mut button = Button::new(FakeExti::default(), 7, ButtonConfig::default());
        button.register_callback(ButtonEvent::Pressed, count_press, 3);

        button.on_exti(Edge::Rising, 0);
        button.on_exti(Edge::Falling, 100);
        button.on_exti(Edge::Rising, 200);
        assert_eq!(PRESSES.load(Ordering::Relaxed), 6);

        button.register_callback(ButtonEvent::Any, count_any, 0);
        button.on_exti(Edge::Falling, 300);
        button.on_exti(Edge::Rising, 400);
        assert_eq!(ANY.load(Ordering::Relaxed), 2);
        assert_eq!(PRESSES.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn interrupt_uses_pending_edge() {
        let mut button = Button::new(FakeExti::default(), 0, ButtonConfig::default());
        assert_eq!(button.on_interrupt(10), None);

        button.io.pending = Some(Edge::Rising);
        assert_eq!(button.on_interrupt(100), Some(ButtonState::Pressed));
        assert_eq!(button.io.pending, None);

        // Both edges pending: the pin level decides.
        button.io.pending = Some(Edge::Either);
        button.io.high = false;
        assert_eq!(button.on_interrupt(200), Some(ButtonState::Unpressed));
    }
}
