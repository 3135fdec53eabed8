//! Atomic handle state, shared between a driver's thread-mode API and its interrupt handler.
//! Starting an operation is a compare-and-set from the expected idle state to the active
//! state; if something else got there first, the caller gets `Error::Busy`.

use core::{
    marker::PhantomData,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::error::{Error, Result};

/// A state enum that can be stored in a `HandleState`.
pub trait StateRepr: Copy {
    fn to_u32(self) -> u32;
    fn from_u32(val: u32) -> Self;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
/// Global state of a peripheral handle.
pub enum PeriphState {
    Reset = 0,
    Init = 1,
    Idle = 2,
    TxActive = 3,
    RxActive = 4,
    /// Combined transmit and receive, eg I2C write-then-read or SPI full duplex.
    TxRxActive = 5,
    Abort = 6,
}

impl StateRepr for PeriphState {
    fn to_u32(self) -> u32 {
        self as u32
    }

    /// Unknown values read as `Reset`.
    fn from_u32(val: u32) -> Self {
        match val {
            1 => Self::Init,
            2 => Self::Idle,
            3 => Self::TxActive,
            4 => Self::RxActive,
            5 => Self::TxRxActive,
            6 => Self::Abort,
            _ => Self::Reset,
        }
    }
}

/// Atomically updated handle state.
pub struct HandleState<S> {
    val: AtomicU32,
    _state: PhantomData<S>,
}

impl<S: StateRepr> HandleState<S> {
    pub fn new(initial: S) -> Self {
        Self {
            val: AtomicU32::new(initial.to_u32()),
            _state: PhantomData,
        }
    }

    pub fn get(&self) -> S {
        S::from_u32(self.val.load(Ordering::Acquire))
    }

    pub fn set(&self, state: S) {
        self.val.store(state.to_u32(), Ordering::Release);
    }

    /// Move from `expected` to `new`, or return `Error::Busy` if the handle is in any other
    /// state. Never blocks.
    pub fn check_update(&self, expected: S, new: S) -> Result<()> {
        self.val
            .compare_exchange(
                expected.to_u32(),
                new.to_u32(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| Error::Busy)
    }

    /// Like `check_update`, but accepts any of the `expected` states.
    pub fn check_update_any(&self, expected: &[S], new: S) -> Result<()> {
        for e in expected {
            if self.check_update(*e, new).is_ok() {
                return Ok(());
            }
        }
        Err(Error::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_from_expected() {
        let s = HandleState::new(PeriphState::Idle);
        assert!(s.check_update(PeriphState::Idle, PeriphState::TxActive).is_ok());
        assert_eq!(s.get(), PeriphState::TxActive);
    }

    #[test]
    fn busy_when_not_expected() {
        let s = HandleState::new(PeriphState::RxActive);
        assert_eq!(
            s.check_update(PeriphState::Idle, PeriphState::TxActive),
            Err(Error::Busy)
        );
        assert_eq!(s.get(), PeriphState::RxActive);
    }

    #[test]
    fn any_of_several() {
        let s = HandleState::new(PeriphState::Init);
        assert!(
            s.check_update_any(&[PeriphState::Reset, PeriphState::Init], PeriphState::Idle)
                .is_ok()
        );
        assert_eq!(s.get(), PeriphState::Idle);
    }

    #[test]
    fn any_busy_when_none_match() {
        let s = HandleState::new(PeriphState::TxActive);
        assert_eq!(
            s.check_update_any(&[PeriphState::Reset, PeriphState::Idle], PeriphState::Init),
            Err(Error::Busy)
        );
        assert_eq!(s.get(), PeriphState::TxActive);

        assert_eq!(s.check_update_any(&[], PeriphState::Idle), Err(Error::Busy));
        assert_eq!(s.get(), PeriphState::TxActive);
    }

    #[test]
    fn any_takes_matching_entry_regardless_of_order() {
        let s = HandleState::new(PeriphState::Reset);
        assert!(
            s.check_update_any(&[PeriphState::Idle, PeriphState::Reset], PeriphState::Init)
                .is_ok()
        );
        assert_eq!(s.get(), PeriphState::Init);
    }

    #[test]
    fn one_winner_under_contention() {
        extern crate std;
        use std::{sync::Arc, thread, vec::Vec};

        let s = Arc::new(HandleState::new(PeriphState::Idle));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = s.clone();
                thread::spawn(move || {
                    s.check_update_any(
                        &[PeriphState::Idle, PeriphState::Init],
                        PeriphState::TxActive,
                    )
                    .is_ok()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(s.get(), PeriphState::TxActive);
    }

    #[test]
    fn unknown_value_maps_to_first() {
        assert_eq!(PeriphState::from_u32(77), PeriphState::Reset);
        assert_eq!(PeriphState::from_u32(6), PeriphState::Abort);
    }
}
