//! Retry loop for message exchanges between two boards over an interrupt-driven link
//! (I2C, UART, USART), or a blocking full-duplex one (SPI).
//!
//! The interrupt handler reports completion through a shared `TransferFlags`; the main loop
//! starts each leg of the exchange, sleeps until a flag is set, and retries the whole exchange
//! on any error, up to a fixed number of attempts. The controller sends a message and expects
//! it echoed back; the responder receives a message and echoes it.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::Error;

/// Attempts made before an exchange is reported as failed.
pub const MAX_COM_ATTEMPTS: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(i8)]
/// Status returned by the `app_init` / `app_process` / `app_deinit` steps of an application.
pub enum AppStatus {
    Unknown = 0,
    Error = -1,
    InitOk = 1,
    Ok = 2,
}

/// Completion flags, set from interrupt context and read and cleared by the main loop.
pub struct TransferFlags {
    tx_complete: AtomicBool,
    rx_complete: AtomicBool,
    error: AtomicBool,
}

impl TransferFlags {
    pub const fn new() -> Self {
        Self {
            tx_complete: AtomicBool::new(false),
            rx_complete: AtomicBool::new(false),
            error: AtomicBool::new(false),
        }
    }

    pub fn clear(&self) {
        self.tx_complete.store(false, Ordering::Release);
        self.rx_complete.store(false, Ordering::Release);
        self.error.store(false, Ordering::Release);
    }

    pub fn set_tx_complete(&self) {
        self.tx_complete.store(true, Ordering::Release);
    }

    pub fn set_rx_complete(&self) {
        self.rx_complete.store(true, Ordering::Release);
    }

    pub fn set_error(&self) {
        self.error.store(true, Ordering::Release);
    }

    pub fn tx_complete(&self) -> bool {
        self.tx_complete.load(Ordering::Acquire)
    }

    pub fn rx_complete(&self) -> bool {
        self.rx_complete.load(Ordering::Acquire)
    }

    pub fn error(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    fn done(&self, leg: Leg) -> bool {
        match leg {
            Leg::Tx => self.tx_complete(),
            Leg::Rx => self.rx_complete(),
        }
    }
}

impl Default for TransferFlags {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Leg {
    Tx,
    Rx,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    /// Sends first, then reads the echo and compares.
    Controller,
    /// Receives first, then echoes what it received.
    Responder,
}

/// An interrupt-driven link. Implementations start transfers that complete in the background,
/// with the interrupt handler setting the matching `TransferFlags` bit.
pub trait ComLink {
    /// Start sending `buf`. The caller keeps `buf` borrowed until the transfer completes,
    /// fails, or is aborted.
    fn start_tx(&mut self, buf: &[u8]) -> Result<(), Error>;

    /// Start receiving into `buf`. Same borrowing rule as `start_tx`.
    fn start_rx(&mut self, buf: &mut [u8]) -> Result<(), Error>;

    /// Error code bitmask of the last failed transfer.
    fn last_error(&self) -> u32;

    /// Stop any transfer in progress, so its buffer is no longer accessed.
    fn abort(&mut self);

    /// Sleep until the next interrupt. On the MCU this is `WFI`.
    fn wait_for_interrupt(&mut self);

    /// Block for `ms` milliseconds between attempts.
    fn delay_ms(&mut self, _ms: u32) {}
}

/// A link whose transfers complete before returning, eg a polled SPI full-duplex transfer.
pub trait FullDuplexLink {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Error>;

    fn last_error(&self) -> u32;

    fn delay_ms(&mut self, _ms: u32) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ExchangeOutcome {
    /// `Ok` if a full exchange succeeded, otherwise `Error`.
    pub status: AppStatus,
    pub attempts: u32,
    /// Error code bitmask reported by the link for the last failed attempt, or 0.
    pub last_error: u32,
}

enum Attempt {
    Done,
    Failed(u32),
}

/// Exchange parameters.
pub struct Exchange {
    pub role: Role,
    pub max_attempts: u32,
    /// Pause after a failed attempt, in ms. 0 retries immediately.
    pub retry_delay_ms: u32,
}

impl Default for Exchange {
    fn default() -> Self {
        Self {
            role: Role::Controller,
            max_attempts: MAX_COM_ATTEMPTS,
            retry_delay_ms: 0,
        }
    }
}

impl Exchange {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            ..Default::default()
        }
    }

    /// Run the exchange. The controller sends `tx`, receives into `rx` and compares the two;
    /// the responder receives into `rx` and sends it back, ignoring `tx`. `rx` is zeroed first.
    pub fn run<L: ComLink>(
        &self,
        link: &mut L,
        flags: &TransferFlags,
        tx: &[u8],
        rx: &mut [u8],
    ) -> ExchangeOutcome {
        rx.fill(0);

        let mut outcome = ExchangeOutcome {
            status: AppStatus::Error,
            attempts: 0,
            last_error: 0,
        };

        while outcome.attempts < self.max_attempts && outcome.status == AppStatus::Error {
            flags.clear();
            outcome.attempts += 1;

            let result = match self.role {
                Role::Controller => self.controller_attempt(link, flags, tx, rx),
                Role::Responder => self.responder_attempt(link, flags, rx),
            };

            match result {
                Attempt::Done => {
                    if self.role == Role::Responder || tx.get(..rx.len()) == Some(&rx[..]) {
                        outcome.status = AppStatus::Ok;
                    } else {
                        warn!("Exchange: received data doesn't match; retrying");
                    }
                }
                Attempt::Failed(code) => {
                    outcome.last_error = code;
                    error!(
                        "Exchange: communication error {=u32:#x}; attempt {=u32} of {=u32}",
                        code,
                        outcome.attempts,
                        self.max_attempts
                    );
                    link.abort();
                    self.pause(link);
                }
            }
        }

        outcome
    }

    fn pause<L: ComLink>(&self, link: &mut L) {
        if self.retry_delay_ms != 0 {
            link.delay_ms(self.retry_delay_ms);
        }
    }

    fn controller_attempt<L: ComLink>(
        &self,
        link: &mut L,
        flags: &TransferFlags,
        tx: &[u8],
        rx: &mut [u8],
    ) -> Attempt {
        if link.start_tx(tx).is_err() {
            return Attempt::Failed(link.last_error());
        }
        if let Attempt::Failed(code) = wait_leg(link, flags, Leg::Tx) {
            return Attempt::Failed(code);
        }

        if link.start_rx(rx).is_err() {
            return Attempt::Failed(link.last_error());
        }
        wait_leg(link, flags, Leg::Rx)
    }

    fn responder_attempt<L: ComLink>(
        &self,
        link: &mut L,
        flags: &TransferFlags,
        rx: &mut [u8],
    ) -> Attempt {
        if link.start_rx(rx).is_err() {
            return Attempt::Failed(link.last_error());
        }
        if let Attempt::Failed(code) = wait_leg(link, flags, Leg::Rx) {
            return Attempt::Failed(code);
        }

        if link.start_tx(rx).is_err() {
            return Attempt::Failed(link.last_error());
        }
        wait_leg(link, flags, Leg::Tx)
    }

    /// Run a blocking full-duplex exchange: send `tx` while receiving into `rx`, and compare.
    /// Both sides of a full-duplex link use this.
    pub fn run_full_duplex<L: FullDuplexLink>(
        &self,
        link: &mut L,
        tx: &[u8],
        rx: &mut [u8],
    ) -> ExchangeOutcome {
        rx.fill(0);

        let mut outcome = ExchangeOutcome {
            status: AppStatus::Error,
            attempts: 0,
            last_error: 0,
        };

        while outcome.attempts < self.max_attempts && outcome.status == AppStatus::Error {
            outcome.attempts += 1;

            match link.transfer(tx, rx) {
                Ok(()) if tx.get(..rx.len()) == Some(&rx[..]) => outcome.status = AppStatus::Ok,
                Ok(()) => warn!("Exchange: received data doesn't match; retrying"),
                Err(_) => {
                    outcome.last_error = link.last_error();
                    error!("Exchange: communication error {=u32:#x}", outcome.last_error);
                    if self.retry_delay_ms != 0 {
                        link.delay_ms(self.retry_delay_ms);
                    }
                }
            }
        }

        outcome
    }
}

/// Sleep until the leg completes or the link reports an error.
fn wait_leg<L: ComLink>(link: &mut L, flags: &TransferFlags, leg: Leg) -> Attempt {
    while !flags.done(leg) && !flags.error() {
        link.wait_for_interrupt();
    }

    if flags.error() {
        Attempt::Failed(link.last_error())
    } else {
        Attempt::Done
    }
}

/// Two messages, sent alternately on successive exchanges so that stale data in the
/// receive buffer can't pass for a successful echo.
pub struct MessagePair<'a> {
    a: &'a [u8],
    b: &'a [u8],
    use_b: bool,
}

impl<'a> MessagePair<'a> {
    pub const fn new(a: &'a [u8], b: &'a [u8]) -> Self {
        Self { a, b, use_b: true }
    }

    /// Switch to the other message and return it. The first call returns `a`.
    pub fn next(&mut self) -> &'a [u8] {
        self.use_b = !self.use_b;
        self.current()
    }

    pub fn current(&self) -> &'a [u8] {
        if self.use_b { self.b } else { self.a }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use super::*;

    #[derive(Clone, Copy, PartialEq, Debug)]
    enum Step {
        /// Leg completes; an rx leg copies the given echo data.
        Complete,
        /// Error callback fires during the leg.
        IrqError,
        /// The start call itself fails.
        StartFails,
        /// rx leg completes with corrupted data.
        Corrupt,
    }

    /// Simulates a peer plus the interrupt handler: each leg consumes one scripted step.
    struct FakeLink<'f> {
        flags: &'f TransferFlags,
        script: Vec<Step>,
        pending: Option<(Leg, Step)>,
        echo: Vec<u8>,
        rx_dst: *mut u8,
        rx_len: usize,
        sent: Vec<Vec<u8>>,
        aborts: u32,
        delays: u32,
    }

    impl<'f> FakeLink<'f> {
        fn new(flags: &'f TransferFlags, script: &[Step], echo: &[u8]) -> Self {
            Self {
                flags,
                script: script.iter().rev().copied().collect(),
                pending: None,
                echo: echo.to_vec(),
                rx_dst: core::ptr::null_mut(),
                rx_len: 0,
                sent: Vec::new(),
                aborts: 0,
                delays: 0,
            }
        }

        fn next_step(&mut self) -> Step {
            self.script.pop().unwrap_or(Step::Complete)
        }
    }

    impl ComLink for FakeLink<'_> {
        fn start_tx(&mut self, buf: &[u8]) -> Result<(), Error> {
            let step = self.next_step();
            if step == Step::StartFails {
                return Err(Error::Busy);
            }
            self.sent.push(buf.to_vec());
            self.pending = Some((Leg::Tx, step));
            Ok(())
        }

        fn start_rx(&mut self, buf: &mut [u8]) -> Result<(), Error> {
            let step = self.next_step();
            if step == Step::StartFails {
                return Err(Error::Busy);
            }
            self.rx_dst = buf.as_mut_ptr();
            self.rx_len = buf.len();
            self.pending = Some((Leg::Rx, step));
            Ok(())
        }

        fn last_error(&self) -> u32 {
            0x4
        }

        fn abort(&mut self) {
            self.aborts += 1;
            self.pending = None;
        }

        fn wait_for_interrupt(&mut self) {
            match self.pending.take() {
                Some((_, Step::IrqError)) => self.flags.set_error(),
                Some((Leg::Tx, _)) => self.flags.set_tx_complete(),
                Some((Leg::Rx, step)) => {
                    let rx = unsafe { core::slice::from_raw_parts_mut(self.rx_dst, self.rx_len) };
                    let n = self.echo.len().min(rx.len());
                    rx[..n].copy_from_slice(&self.echo[..n]);
                    if step == Step::Corrupt {
                        rx[0] ^= 0xff;
                    }
                    self.flags.set_rx_complete();
                }
                None => panic!("waiting with no transfer in progress"),
            }
        }

        fn delay_ms(&mut self, _ms: u32) {
            self.delays += 1;
        }
    }

    const MSG: &[u8] = b"I2C Two Boards Communication - Message A\0";

    #[test]
    fn controller_first_try() {
        let flags = TransferFlags::new();
        let mut link = FakeLink::new(&flags, &[], MSG);
        let mut rx = [0xAA; 41];

        let out = Exchange::new(Role::Controller).run(&mut link, &flags, MSG, &mut rx);

        assert_eq!(out.status, AppStatus::Ok);
        assert_eq!(out.attempts, 1);
        assert_eq!(rx, MSG);
        assert_eq!(link.sent.len(), 1);
    }

    #[test]
    fn controller_retries_after_errors() {
        let flags = TransferFlags::new();
        let script = [
            Step::StartFails,
            // Attempt 2: tx fine, rx error callback.
            Step::Complete,
            Step::IrqError,
            // Attempt 3: data corrupted.
            Step::Complete,
            Step::Corrupt,
        ];
        let mut link = FakeLink::new(&flags, &script, MSG);
        let mut rx = [0; 41];
        let ex = Exchange {
            retry_delay_ms: 1_000,
            ..Exchange::new(Role::Controller)
        };

        let out = ex.run(&mut link, &flags, MSG, &mut rx);

        assert_eq!(out.status, AppStatus::Ok);
        assert_eq!(out.attempts, 4);
        assert_eq!(out.last_error, 0x4);
        assert_eq!(link.aborts, 2);
        // The mismatch on attempt 3 retries without a pause.
        assert_eq!(link.delays, 2);
    }

    #[test]
    fn mismatch_retries_without_delay() {
        let flags = TransferFlags::new();
        let script = [Step::Complete, Step::Corrupt];
        let mut link = FakeLink::new(&flags, &script, MSG);
        let mut rx = [0; 41];
        let ex = Exchange {
            retry_delay_ms: 500,
            ..Exchange::new(Role::Controller)
        };

        let out = ex.run(&mut link, &flags, MSG, &mut rx);

        assert_eq!(out.status, AppStatus::Ok);
        assert_eq!(out.attempts, 2);
        assert_eq!(out.last_error, 0);
        assert_eq!(link.aborts, 0);
        assert_eq!(link.delays, 0);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let flags = TransferFlags::new();
        let script = [Step::StartFails; 20];
        let mut link = FakeLink::new(&flags, &script, MSG);
        let mut rx = [0; 41];

        let out = Exchange::new(Role::Controller).run(&mut link, &flags, MSG, &mut rx);

        assert_eq!(out.status, AppStatus::Error);
        assert_eq!(out.attempts, MAX_COM_ATTEMPTS);
    }

    #[test]
    fn responder_echoes_what_it_received() {
        let flags = TransferFlags::new();
        let mut link = FakeLink::new(&flags, &[Step::IrqError], MSG);
        let mut rx = [0; 41];

        let out = Exchange::new(Role::Responder).run(&mut link, &flags, &[], &mut rx);

        assert_eq!(out.status, AppStatus::Ok);
        assert_eq!(out.attempts, 2);
        assert_eq!(link.sent, [MSG.to_vec()]);
    }

    #[test]
    fn flags_cleared_each_attempt() {
        let flags = TransferFlags::new();
        flags.set_error();
        let mut link = FakeLink::new(&flags, &[], MSG);
        let mut rx = [0; 41];

        let out = Exchange::new(Role::Controller).run(&mut link, &flags, MSG, &mut rx);
        assert_eq!(out.attempts, 1);
    }

    struct LoopbackSpi {
        fail_first: bool,
        corrupt_first: bool,
        delays: u32,
    }

    impl FullDuplexLink for LoopbackSpi {
        fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Error> {
            if self.fail_first {
                self.fail_first = false;
                return Err(Error::Timeout);
            }
            rx.copy_from_slice(tx);
            if self.corrupt_first {
                self.corrupt_first = false;
                rx[0] ^= 0xff;
            }
            Ok(())
        }

        fn last_error(&self) -> u32 {
            0x10
        }

        fn delay_ms(&mut self, _ms: u32) {
            self.delays += 1;
        }
    }

    #[test]
    fn full_duplex_retries() {
        let mut spi = LoopbackSpi {
            fail_first: true,
            corrupt_first: true,
            delays: 0,
        };
        let tx = b"SPI Full Duplex Two Boards Communication - Message A\0";
        let mut rx = [0; 53];
        let ex = Exchange {
            retry_delay_ms: 10,
            ..Exchange::new(Role::Controller)
        };

        let out = ex.run_full_duplex(&mut spi, tx, &mut rx);

        assert_eq!(out.status, AppStatus::Ok);
        assert_eq!(out.attempts, 3);
        assert_eq!(out.last_error, 0x10);
        // Only the failed transfer pauses.
        assert_eq!(spi.delays, 1);
    }

    #[test]
    fn messages_alternate() {
        let mut msgs = MessagePair::new(b"A", b"B");
        assert_eq!(msgs.next(), b"A");
        assert_eq!(msgs.next(), b"B");
        assert_eq!(msgs.next(), b"A");
        assert_eq!(msgs.current(), b"A");
    }
}
