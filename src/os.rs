//! Binary semaphore and mutex for bare-metal use, without an RTOS. Taking spins on an atomic
//! compare-and-set, which compiles to an exclusive load/store (`LDREX`/`STREX`) pair on
//! Cortex-M33; the acquire and release orderings place the `DMB` barriers. Waiting is bounded
//! by a millisecond timeout measured against the tick.
//!
//! These are spin locks: a thread-mode taker waiting on a semaphore held by an interrupt
//! handler works, but the reverse deadlocks, so interrupt handlers may only poll (timeout 0).

use core::sync::atomic::{AtomicU32, Ordering};

/// Wait without limit.
pub const OS_FOREVER: u32 = 0xFFFF_FFFF;

const FREE: u32 = 0;
const TAKEN: u32 = 1;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OsError {
    /// The semaphore wasn't released within the timeout.
    Timeout,
    /// A blocking take was attempted from an interrupt handler.
    InIsr,
}

/// What the semaphore needs from the platform.
pub trait OsPort {
    /// Returns `true` in exception or interrupt context.
    fn in_isr(&self) -> bool;
    /// Milliseconds since start, wrapping.
    fn tick_ms(&self) -> u32;
}

#[cfg(feature = "u5")]
/// Reads IPSR through the SCB, and the global tick.
pub struct CortexPort;

#[cfg(feature = "u5")]
impl OsPort for CortexPort {
    fn in_isr(&self) -> bool {
        crate::cortex::in_isr()
    }

    fn tick_ms(&self) -> u32 {
        crate::tick::get_tick()
    }
}

/// A binary semaphore. Created free.
pub struct Semaphore {
    val: AtomicU32,
}

impl Semaphore {
    pub const fn new() -> Self {
        Self {
            val: AtomicU32::new(FREE),
        }
    }

    /// Make one attempt to take the semaphore.
    pub fn try_take(&self) -> bool {
        self.val
            .compare_exchange(FREE, TAKEN, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Take the semaphore, waiting up to `timeout_ms`. A timeout of 0 makes a single attempt;
    /// `OS_FOREVER` waits without limit.
    pub fn take<P: OsPort>(&self, port: &P, timeout_ms: u32) -> Result<(), OsError> {
        if timeout_ms != 0 && port.in_isr() {
            return Err(OsError::InIsr);
        }

        let start = port.tick_ms();

        loop {
            if self.try_take() {
                return Ok(());
            }

            if timeout_ms == 0 {
                return Err(OsError::Timeout);
            }

            if timeout_ms != OS_FOREVER && port.tick_ms().wrapping_sub(start) > timeout_ms {
                return Err(OsError::Timeout);
            }

            core::hint::spin_loop();
        }
    }

    pub fn release(&self) {
        self.val.store(FREE, Ordering::Release);
    }

    /// Return the semaphore to its created state. Any holder loses it.
    pub fn delete(&self) {
        self.val.store(FREE, Ordering::Release);
    }

    pub fn is_taken(&self) -> bool {
        self.val.load(Ordering::Relaxed) == TAKEN
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

/// A mutex with the same semantics as `Semaphore`. It doesn't track an owner, and isn't
/// recursive.
pub struct Mutex {
    sem: Semaphore,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            sem: Semaphore::new(),
        }
    }

    pub fn take<P: OsPort>(&self, port: &P, timeout_ms: u32) -> Result<(), OsError> {
        self.sem.take(port, timeout_ms)
    }

    pub fn release(&self) {
        self.sem.release();
    }

    pub fn delete(&self) {
        self.sem.delete();
    }

    /// Take the mutex, returning a guard that releases it when dropped.
    pub fn lock<P: OsPort>(&self, port: &P, timeout_ms: u32) -> Result<MutexGuard<'_>, OsError> {
        self.take(port, timeout_ms)?;
        Ok(MutexGuard { mutex: self })
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::cell::Cell;
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    /// Advances 1 ms each time the tick is read.
    struct FakePort {
        isr: bool,
        now: Cell<u32>,
    }

    impl FakePort {
        fn thread() -> Self {
            Self {
                isr: false,
                now: Cell::new(0),
            }
        }
    }

    impl OsPort for FakePort {
        fn in_isr(&self) -> bool {
            self.isr
        }

        fn tick_ms(&self) -> u32 {
            let t = self.now.get();
            self.now.set(t.wrapping_add(1));
            t
        }
    }

    #[test]
    fn take_and_release() {
        let port = FakePort::thread();
        let sem = Semaphore::new();

        assert!(sem.take(&port, 10).is_ok());
        assert!(sem.is_taken());
        sem.release();
        assert!(!sem.is_taken());
        assert!(sem.take(&port, 0).is_ok());
    }

    #[test]
    fn times_out_when_held() {
        let port = FakePort::thread();
        let sem = Semaphore::new();
        sem.take(&port, 0).unwrap();

        assert_eq!(sem.take(&port, 5), Err(OsError::Timeout));
        // The loop gave up once more than 5 ms had passed.
        assert!(port.now.get() > 6);
    }

    #[test]
    fn zero_timeout_is_single_attempt() {
        let port = FakePort::thread();
        let sem = Semaphore::new();
        sem.take(&port, 0).unwrap();

        let before = port.now.get();
        assert_eq!(sem.take(&port, 0), Err(OsError::Timeout));
        assert_eq!(port.now.get(), before + 1);
    }

    #[test]
    fn blocking_take_rejected_in_isr() {
        let port = FakePort {
            isr: true,
            now: Cell::new(0),
        };
        let sem = Semaphore::new();

        assert_eq!(sem.take(&port, 10), Err(OsError::InIsr));
        // Polling is still allowed.
        assert!(sem.take(&port, 0).is_ok());
    }

    #[test]
    fn delete_frees() {
        let port = FakePort::thread();
        let sem = Semaphore::new();
        sem.take(&port, 0).unwrap();
        sem.delete();
        assert!(sem.take(&port, 0).is_ok());
    }

    #[test]
    fn forever_waits_for_release_from_another_thread() {
        struct WallClock;
        impl OsPort for WallClock {
            fn in_isr(&self) -> bool {
                false
            }
            fn tick_ms(&self) -> u32 {
                0
            }
        }

        let sem = Arc::new(Semaphore::new());
        assert!(sem.try_take());

        let releaser = {
            let sem = sem.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                sem.release();
            })
        };

        assert!(sem.take(&WallClock, OS_FOREVER).is_ok());
        releaser.join().unwrap();
    }

    #[test]
    fn guard_releases_mutex() {
        let port = FakePort::thread();
        let mutex = Mutex::new();
        {
            let _guard = mutex.lock(&port, 0).unwrap();
            assert_eq!(mutex.take(&port, 0), Err(OsError::Timeout));
        }
        assert!(mutex.take(&port, 0).is_ok());
    }
}
