//! This module allows for serial communication using the STM32 U(S)ART peripheral.
//! It provides APIs to configure, read, and write from U(S)ART, with blocking and
//! interrupt functionality.
//!
//! USART instances can also run synchronously: as a master, driving a clock on CK, or as
//! an SPI-like slave clocked by the other side.

use core::ops::Deref;

use cfg_if::cfg_if;

use crate::{
    error::{Error, Result},
    state::{HandleState, PeriphState},
    tick::Timeout,
};

/// Serial error
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsartError {
    /// Framing error
    Framing,
    /// Noise error
    Noise,
    /// RX buffer overrun
    Overrun,
    /// Parity check error
    Parity,
}

// Error code bitmask, as reported by `last_error()`. Receive errors in the low half, transmit
// errors in the high half.
pub const ERROR_NONE: u32 = 0;
pub const ERROR_PE: u32 = 1 << 0;
pub const ERROR_NE: u32 = 1 << 1;
pub const ERROR_FE: u32 = 1 << 2;
pub const ERROR_ORE: u32 = 1 << 3;
pub const ERROR_RTO: u32 = 1 << 5;
/// Underrun, in synchronous slave mode.
pub const ERROR_UDR: u32 = 1 << 17;

impl UsartError {
    /// The most significant receive error in a code bitmask.
    pub fn from_code(code: u32) -> Option<Self> {
        if code & ERROR_PE != 0 {
            Some(Self::Parity)
        } else if code & ERROR_FE != 0 {
            Some(Self::Framing)
        } else if code & ERROR_ORE != 0 {
            Some(Self::Overrun)
        } else if code & ERROR_NE != 0 {
            Some(Self::Noise)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
/// The number of stop bits. (USART_CR2, STOP)
pub enum StopBits {
    S1 = 0b00,
    S0_5 = 0b01,
    S2 = 0b10,
    S1_5 = 0b11,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Parity control enable/disable, and even/odd selection (USART_CR1, PCE and PS)
pub enum Parity {
    EnabledEven,
    EnabledOdd,
    Disabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The length of word to transmit and receive, parity bit included. (USART_CR1, M)
pub enum WordLen {
    W8,
    W9,
    W7,
}

impl WordLen {
    /// We use this function due to the M field being split into 2 separate bits.
    /// Returns M1 val, M0 val
    pub fn bits(&self) -> (u8, u8) {
        match self {
            Self::W8 => (0, 0),
            Self::W9 => (0, 1),
            Self::W7 => (1, 0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
/// Set Oversampling16 or Oversampling8 modes.
pub enum OverSampling {
    O16 = 0,
    O8 = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Synchronous operation. USART instances only; UART4 and UART5 are always asynchronous.
pub enum SyncMode {
    Disabled,
    /// Drive the clock on CK. `cpol` is the idle clock level, `cpha` captures on the second
    /// edge, and `last_bit_clock` outputs a clock pulse for the last data bit.
    Master {
        cpol: bool,
        cpha: bool,
        last_bit_clock: bool,
    },
    /// Clocked by the master on CK, with NSS ignored.
    Slave { cpol: bool, cpha: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The type of USART interrupt to configure. Reference the USART_ISR register.
pub enum UsartInterrupt {
    /// If the inner value of this is `Some`, its inner value will set
    /// the character to match on `enable_interrupt`. The option's value doesn't
    /// affect anything when stopping or clearing interrupts.
    CharDetect(Option<u8>),
    Cts,
    EndOfBlock,
    Idle,
    /// Framing, noise and overrun errors share one enable bit.
    FramingError,
    LineBreak,
    Overrun,
    ParityError,
    ReadNotEmpty,
    ReceiverTimeout,
    Tcbgt,
    TransmissionComplete,
    TransmitEmpty,
}

/// BRR value for `baud`, given the kernel clock, rounding to the nearest divider. `None` if
/// the divider is out of range (BRR must be at least 16).
pub fn brr_value(fclk: u32, baud: u32, oversampling: OverSampling) -> Option<u32> {
    if baud == 0 {
        return None;
    }
    let (fclk, baud) = (fclk as u64, baud as u64);

    let brr = match oversampling {
        OverSampling::O16 => (fclk + baud / 2) / baud,
        // BRR[2:0] = USARTDIV[3:0] shifted 1 bit to the right; BRR[3] must be kept cleared.
        OverSampling::O8 => {
            let div = (2 * fclk + baud / 2) / baud;
            (div & 0xffff_fff0) | ((div & 0xf) >> 1)
        }
    };

    if (16..=0xffff).contains(&brr) {
        Some(brr as u32)
    } else {
        None
    }
}

/// Configuration for U(S)ART. Can be used with default::Default.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UsartConfig {
    /// Word length. Defaults to 8-bits.
    pub word_len: WordLen,
    /// Stop bits: Defaults to 1.
    pub stop_bits: StopBits,
    /// Oversampling rate. Defaults to 16x.
    pub oversampling: OverSampling,
    /// Enable or disable parity control. Defaults to disabled.
    pub parity: Parity,
    /// The first-in, first-out buffer is enabled. Defaults to enabled.
    pub fifo_enabled: bool,
    /// Optionally, disable the overrun functionality. Defaults to `false`.
    pub overrun_disabled: bool,
    pub sync: SyncMode,
    /// Timeout for blocking transfers, in ms.
    pub timeout_ms: u32,
}

impl Default for UsartConfig {
    fn default() -> Self {
        Self {
            word_len: WordLen::W8,
            stop_bits: StopBits::S1,
            oversampling: OverSampling::O16,
            parity: Parity::Disabled,
            fifo_enabled: true,
            overrun_disabled: false,
            sync: SyncMode::Disabled,
            timeout_ms: 1_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Completion reported by `on_interrupt()`.
pub enum UsartEvent {
    TxComplete,
    RxComplete,
    /// A transfer ended with errors; the value is the error code bitmask.
    Error(u32),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Flags read from USART_ISR. With the FIFO enabled, `rxne` is RXFNE and `txe` is TXFNF.
pub struct UsartStatus {
    pub pe: bool,
    pub fe: bool,
    pub ne: bool,
    pub ore: bool,
    pub idle: bool,
    pub rxne: bool,
    pub tc: bool,
    pub txe: bool,
    pub lbdf: bool,
    pub ctsif: bool,
    pub rtof: bool,
    pub eobf: bool,
    pub udr: bool,
    pub cmf: bool,
    pub tcbgt: bool,
}

impl UsartStatus {
    pub const NONE: Self = Self {
        pe: false,
        fe: false,
        ne: false,
        ore: false,
        idle: false,
        rxne: false,
        tc: false,
        txe: false,
        lbdf: false,
        ctsif: false,
        rtof: false,
        eobf: false,
        udr: false,
        cmf: false,
        tcbgt: false,
    };

    /// Every flag cleared through USART_ICR.
    pub const CLEARABLE: Self = Self {
        pe: true,
        fe: true,
        ne: true,
        ore: true,
        idle: true,
        tc: true,
        lbdf: true,
        ctsif: true,
        rtof: true,
        eobf: true,
        udr: true,
        cmf: true,
        tcbgt: true,
        ..Self::NONE
    };

    /// Only the receive error flags of this read.
    pub fn rx_errors(&self) -> Self {
        Self {
            pe: self.pe,
            fe: self.fe,
            ne: self.ne,
            ore: self.ore,
            ..Self::NONE
        }
    }

    /// Map the error flags to the error code bitmask.
    pub fn error_code(&self) -> u32 {
        let mut code = ERROR_NONE;
        if self.pe {
            code |= ERROR_PE;
        }
        if self.ne {
            code |= ERROR_NE;
        }
        if self.fe {
            code |= ERROR_FE;
        }
        if self.ore {
            code |= ERROR_ORE;
        }
        if self.rtof {
            code |= ERROR_RTO;
        }
        if self.udr {
            code |= ERROR_UDR;
        }
        code
    }

    /// Whether the flag for `interrupt` is set.
    pub fn is_set(&self, interrupt: UsartInterrupt) -> bool {
        match interrupt {
            UsartInterrupt::CharDetect(_) => self.cmf,
            UsartInterrupt::Cts => self.ctsif,
            UsartInterrupt::EndOfBlock => self.eobf,
            UsartInterrupt::Idle => self.idle,
            UsartInterrupt::FramingError => self.fe,
            UsartInterrupt::LineBreak => self.lbdf,
            UsartInterrupt::Overrun => self.ore,
            UsartInterrupt::ParityError => self.pe,
            UsartInterrupt::ReadNotEmpty => self.rxne,
            UsartInterrupt::ReceiverTimeout => self.rtof,
            UsartInterrupt::Tcbgt => self.tcbgt,
            UsartInterrupt::TransmissionComplete => self.tc,
            UsartInterrupt::TransmitEmpty => self.txe,
        }
    }
}

impl From<UsartInterrupt> for UsartStatus {
    /// The status with only the flag of `interrupt` set.
    fn from(interrupt: UsartInterrupt) -> Self {
        let mut status = Self::NONE;
        let flag = match interrupt {
            UsartInterrupt::CharDetect(_) => &mut status.cmf,
            UsartInterrupt::Cts => &mut status.ctsif,
            UsartInterrupt::EndOfBlock => &mut status.eobf,
            UsartInterrupt::Idle => &mut status.idle,
            UsartInterrupt::FramingError => &mut status.fe,
            UsartInterrupt::LineBreak => &mut status.lbdf,
            UsartInterrupt::Overrun => &mut status.ore,
            UsartInterrupt::ParityError => &mut status.pe,
            UsartInterrupt::ReadNotEmpty => &mut status.rxne,
            UsartInterrupt::ReceiverTimeout => &mut status.rtof,
            UsartInterrupt::Tcbgt => &mut status.tcbgt,
            UsartInterrupt::TransmissionComplete => &mut status.tc,
            UsartInterrupt::TransmitEmpty => &mut status.txe,
        };
        *flag = true;
        status
    }
}

/// Register access for one U(S)ART instance. Implemented for the PAC register block.
pub trait UsartRegs {
    fn status(&self) -> UsartStatus;
    /// Clear the ICR-cleared flags set in `flags`.
    fn clear_flags(&self, flags: UsartStatus);
    /// Whether the enable bit of `interrupt` is set. Framing and overrun share EIE.
    fn interrupt_enabled(&self, interrupt: UsartInterrupt) -> bool;
    fn set_interrupt(&self, interrupt: UsartInterrupt, enabled: bool);
    /// Write ADD and ADDM7, for character match. Only while disabled.
    fn set_char_match(&self, char: u8);
    fn read_data(&self) -> u8;
    fn write_data(&self, byte: u8);
    /// Drop received data (RXFRQ).
    fn flush_rx(&self);
    /// Drop data waiting to be sent (TXFRQ).
    fn flush_tx(&self);
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn set_brr(&self, brr: u32);
    /// Framing, parity, oversampling, FIFO, overrun and synchronous mode. Only while disabled.
    fn configure(&self, cfg: &UsartConfig);
    /// Set or clear TE and RE.
    fn set_tx_rx(&self, enabled: bool);
    /// Clear CR1, CR2 and CR3.
    fn reset(&self);
}

/// Progress of one direction of an interrupt transfer.
struct Xfer {
    buf: *mut u8,
    len: usize,
    count: usize,
}

impl Xfer {
    const fn empty() -> Self {
        Self {
            buf: core::ptr::null_mut(),
            len: 0,
            count: 0,
        }
    }
}

/// Represents the USART peripheral, for serial communications.
pub struct Usart<R> {
    pub regs: R,
    baud: u32,
    pub config: UsartConfig,
    tx_state: HandleState<PeriphState>,
    rx_state: HandleState<PeriphState>,
    last_error: u32,
    tx: Xfer,
    rx: Xfer,
}

// The transfer pointers are only dereferenced while their transfer is active, and the
// caller keeps those buffers borrowed until it completes or is aborted.
unsafe impl<R: Send> Send for Usart<R> {}

impl<R> Usart<R>
where
    R: Deref,
    R::Target: UsartRegs,
{
    #[cfg_attr(not(any(feature = "u5", test)), allow(dead_code))]
    fn from_regs(regs: R, baud: u32, config: UsartConfig) -> Self {
        Self {
            regs,
            baud,
            config,
            tx_state: HandleState::new(PeriphState::Reset),
            rx_state: HandleState::new(PeriphState::Reset),
            last_error: ERROR_NONE,
            tx: Xfer::empty(),
            rx: Xfer::empty(),
        }
    }

    /// Apply `self.config` and the baud rate, with a kernel clock of `fclk`, then enable the
    /// transmitter and receiver. RM0456, section 69.5.5: "USART transmitter".
    #[cfg_attr(not(any(feature = "u5", test)), allow(dead_code))]
    fn setup(&mut self, fclk: u32) -> Result<()> {
        // This should already be disabled on power up, but disable here just in case;
        // some bits can't be set with USART enabled.
        self.disable()?;

        // Word length, parity, stop bits and clock. A synchronous slave takes its clock from
        // the master, so it has no baud rate.
        self.regs.configure(&self.config);
        if !matches!(self.config.sync, SyncMode::Slave { .. }) {
            self.apply_baud(fclk, self.baud)?;
        }

        self.enable()?;

        // Setting TE sends an idle frame as first transmission; RE starts the search for a
        // start bit.
        self.regs.set_tx_rx(true);

        self.tx_state.set(PeriphState::Idle);
        self.rx_state.set(PeriphState::Idle);
        Ok(())
    }

    /// Write BRR for `baud`, from a kernel clock of `fclk`. The peripheral is disabled while
    /// BRR changes, if it was enabled.
    pub fn apply_baud(&mut self, fclk: u32, baud: u32) -> Result<()> {
        let brr = brr_value(fclk, baud, self.config.oversampling).ok_or(Error::InvalidParam)?;

        let originally_enabled = self.regs.is_enabled();
        if originally_enabled {
            self.disable()?;
        }

        self.regs.set_brr(brr);
        self.baud = baud;

        if originally_enabled {
            self.enable()?;
        }
        Ok(())
    }

    /// Disable the peripheral and return its register block.
    pub fn deinit(mut self) -> R {
        self.abort();
        self.regs.reset();
        self.regs
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Enable this U(S)ART peripheral.
    pub fn enable(&mut self) -> Result<()> {
        self.regs.set_enabled(true);
        bounded_loop!(!self.regs.is_enabled(), Error::RegisterUnchanged);
        Ok(())
    }

    /// Disable this U(S)ART peripheral.
    pub fn disable(&mut self) -> Result<()> {
        self.regs.set_enabled(false);
        bounded_loop!(self.regs.is_enabled(), Error::RegisterUnchanged);
        Ok(())
    }

    /// Error code bitmask of the last transfer. See the `ERROR_` constants.
    pub fn last_error(&self) -> u32 {
        self.last_error
    }

    pub fn tx_state(&self) -> PeriphState {
        self.tx_state.get()
    }

    pub fn rx_state(&self) -> PeriphState {
        self.rx_state.get()
    }

    fn wait_isr(&self, done: impl Fn(&UsartStatus) -> bool, timeout: &Timeout) -> Result<()> {
        while !done(&self.regs.status()) {
            if timeout.is_expired() {
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }

    /// Transmit data, as a sequence of u8. Returns once the last frame has left the shift
    /// register. RM0456, section 69.5.5: "Character transmission procedure".
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.tx_state.check_update(PeriphState::Idle, PeriphState::TxActive)?;
        let timeout = Timeout::new(self.config.timeout_ms);

        let mut result = Ok(());
        for word in data {
            // With the FIFO enabled, this flag is TXFNF: room for one more.
            result = self.wait_isr(|s| s.txe, &timeout);
            if result.is_err() {
                break;
            }
            self.write_one(*word);
        }
        // After writing the last data into USART_TDR, wait until TC=1.
        if result.is_ok() {
            result = self.wait_isr(|s| s.tc, &timeout);
        }

        self.tx_state.set(PeriphState::Idle);
        result
    }

    /// Write a single word, without waiting until ready for the next. Compared to the
    /// `write()` function, this does not block.
    pub fn write_one(&mut self, word: u8) {
        self.regs.write_data(word);
    }

    /// Receive data into a u8 buffer. RM0456, section 69.5.6: "Character reception procedure".
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.rx_state.check_update(PeriphState::Idle, PeriphState::RxActive)?;
        let timeout = Timeout::new(self.config.timeout_ms);

        let mut result = Ok(());
        for slot in buf.iter_mut() {
            result = self.wait_isr(
                |s| s.rxne || s.rx_errors() != UsartStatus::NONE,
                &timeout,
            );
            if result.is_ok() {
                result = self.check_status().map_err(Error::UsartError);
            }
            if result.is_err() {
                break;
            }
            *slot = self.read_one();
        }

        self.rx_state.set(PeriphState::Idle);
        result
    }

    /// Read a single word, without waiting until ready for the next. Compared to the
    /// `read()` function, this does not block.
    pub fn read_one(&mut self) -> u8 {
        self.regs.read_data()
    }

    /// Start sending `data` in the background. `on_interrupt()` reports `TxComplete`
    /// once the last frame is sent. `data` must stay untouched until then.
    pub fn write_it(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidParam);
        }
        self.tx_state.check_update(PeriphState::Idle, PeriphState::TxActive)?;

        self.last_error &= !ERROR_UDR;
        self.tx = Xfer {
            buf: data.as_ptr() as *mut u8,
            len: data.len(),
            count: 0,
        };
        self.regs.clear_flags(UsartStatus {
            tc: true,
            ..UsartStatus::NONE
        });
        self.regs.set_interrupt(UsartInterrupt::TransmitEmpty, true);
        Ok(())
    }

    /// Start receiving into `buf` in the background; completes with `RxComplete`.
    pub fn read_it(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Err(Error::InvalidParam);
        }
        self.rx_state.check_update(PeriphState::Idle, PeriphState::RxActive)?;

        self.last_error &= !(ERROR_PE | ERROR_NE | ERROR_FE | ERROR_ORE | ERROR_RTO);
        self.rx = Xfer {
            buf: buf.as_mut_ptr(),
            len: buf.len(),
            count: 0,
        };
        self.regs.clear_flags(UsartStatus::CLEARABLE.rx_errors());
        // Drop anything received before this call.
        self.regs.flush_rx();
        if self.config.parity != Parity::Disabled {
            self.regs.set_interrupt(UsartInterrupt::ParityError, true);
        }
        self.regs.set_interrupt(UsartInterrupt::Overrun, true);
        self.regs.set_interrupt(UsartInterrupt::ReadNotEmpty, true);
        Ok(())
    }

    /// Move data for interrupt transfers. Call this from the instance's interrupt
    /// handler. Returns an event when a transfer ends; if both directions end in the
    /// same call, the transmit completion is reported on the next interrupt.
    pub fn on_interrupt(&mut self) -> Option<UsartEvent> {
        let isr = self.regs.status();

        if self.rx_state.get() == PeriphState::RxActive {
            let errors = isr.rx_errors();
            if errors != UsartStatus::NONE {
                self.regs.clear_flags(errors);
                self.last_error |= errors.error_code();
                // Overrun loses data; the others still deliver the frame, which is
                // stored, and reported at the end.
                if errors.ore {
                    self.stop_rx();
                    warn!("USART overrun");
                    return Some(UsartEvent::Error(self.last_error));
                }
            }

            if isr.rxne && self.regs.interrupt_enabled(UsartInterrupt::ReadNotEmpty) {
                let byte = self.read_one();
                if self.rx.count < self.rx.len {
                    unsafe { *self.rx.buf.add(self.rx.count) = byte };
                    self.rx.count += 1;
                }
                if self.rx.count == self.rx.len {
                    self.stop_rx();
                    if self.last_error & !ERROR_UDR != ERROR_NONE {
                        return Some(UsartEvent::Error(self.last_error));
                    }
                    return Some(UsartEvent::RxComplete);
                }
            }
        }

        if self.tx_state.get() == PeriphState::TxActive {
            if isr.udr {
                self.regs.clear_flags(UsartStatus {
                    udr: true,
                    ..UsartStatus::NONE
                });
                self.last_error |= ERROR_UDR;
            }

            if isr.txe && self.regs.interrupt_enabled(UsartInterrupt::TransmitEmpty) {
                if self.tx.count < self.tx.len {
                    let byte = unsafe { *self.tx.buf.add(self.tx.count) };
                    self.write_one(byte);
                    self.tx.count += 1;
                }
                if self.tx.count == self.tx.len {
                    // The last frame is written; wait for it to leave.
                    self.regs.set_interrupt(UsartInterrupt::TransmitEmpty, false);
                    self.regs
                        .set_interrupt(UsartInterrupt::TransmissionComplete, true);
                }
            } else if isr.tc
                && self
                    .regs
                    .interrupt_enabled(UsartInterrupt::TransmissionComplete)
            {
                self.regs
                    .set_interrupt(UsartInterrupt::TransmissionComplete, false);
                self.regs.clear_flags(UsartStatus {
                    tc: true,
                    ..UsartStatus::NONE
                });
                self.tx = Xfer::empty();
                self.tx_state.set(PeriphState::Idle);
                if self.last_error & ERROR_UDR != 0 {
                    return Some(UsartEvent::Error(self.last_error));
                }
                return Some(UsartEvent::TxComplete);
            }
        }

        None
    }

    fn stop_rx(&mut self) {
        self.regs.set_interrupt(UsartInterrupt::ReadNotEmpty, false);
        self.regs.set_interrupt(UsartInterrupt::ParityError, false);
        self.regs.set_interrupt(UsartInterrupt::Overrun, false);
        self.rx = Xfer::empty();
        self.rx_state.set(PeriphState::Idle);
    }

    /// Stop interrupt transfers in both directions.
    pub fn abort(&mut self) {
        self.regs.set_interrupt(UsartInterrupt::TransmitEmpty, false);
        self.regs
            .set_interrupt(UsartInterrupt::TransmissionComplete, false);
        self.tx = Xfer::empty();
        self.regs.flush_tx();
        self.tx_state.set(PeriphState::Idle);

        self.stop_rx();
        self.regs.clear_flags(UsartStatus::CLEARABLE);
        self.regs.flush_rx();
    }

    /// Enable a specific type of interrupt. RM0456, table 711: "USART interrupt requests".
    /// If `Some`, the inner value of `CharDetect` sets the address of the char to match.
    /// If `None`, the interrupt is enabled without changing the char to match.
    pub fn enable_interrupt(&mut self, interrupt: UsartInterrupt) -> Result<()> {
        if let UsartInterrupt::CharDetect(Some(char)) = interrupt {
            // Disable the UART to allow writing the `add` and `addm7` bits
            self.disable()?;
            self.regs.set_char_match(char);
            self.enable()?;
        }

        self.regs.set_interrupt(interrupt, true);
        Ok(())
    }

    /// Disable a specific type of interrupt. Note that the inner value of `CharDetect`
    /// doesn't do anything here.
    pub fn disable_interrupt(&mut self, interrupt: UsartInterrupt) {
        self.regs.set_interrupt(interrupt, false);
    }

    /// Read the status register.
    pub fn read_status(&self) -> UsartStatus {
        self.regs.status()
    }

    /// Clears the interrupt pending flag for a specific type of interrupt. Note that
    /// it can also clear error flags, like Overrun and framing errors.
    pub fn clear_interrupt(&mut self, interrupt: UsartInterrupt) {
        match interrupt {
            UsartInterrupt::ReadNotEmpty => self.regs.flush_rx(),
            UsartInterrupt::TransmitEmpty => self.regs.flush_tx(),
            i => self.regs.clear_flags(i.into()),
        }
    }

    /// Checks if a given status flag is set. Returns `true` if the status flag is set.
    /// Note that this preforms a read each time called. If checking multiple flags,
    /// this isn't optimal.
    pub fn check_status_flag(&mut self, flag: UsartInterrupt) -> bool {
        self.regs.status().is_set(flag)
    }

    /// Check the receive error flags, clearing them if any is set.
    pub fn check_status(&mut self) -> core::result::Result<(), UsartError> {
        let errors = self.regs.status().rx_errors();
        if errors == UsartStatus::NONE {
            return Ok(());
        }

        // Clear error flags by reading ISR, clearing ICR, then reading RDR
        self.regs.clear_flags(errors);
        let _ = self.regs.read_data();

        let code = errors.error_code();
        self.last_error |= code;
        match UsartError::from_code(code) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

cfg_if! {
    if #[cfg(feature = "u5")] {
        use cortex_m::interrupt::free;

        use crate::{
            clocks::Clocks,
            pac::{self, RCC, usart1::RegisterBlock},
            util::{BaudPeriph, RccPeriph},
        };

        /// A U(S)ART instance: its register block, its clock, and whether it can run
        /// synchronously.
        pub trait UsartInstance: Deref<Target = RegisterBlock> + RccPeriph + BaudPeriph {
            const SYNC_CAPABLE: bool;
        }

        impl UsartInstance for pac::USART1 {
            const SYNC_CAPABLE: bool = true;
        }
        #[cfg(usart2)]
        impl UsartInstance for pac::USART2 {
            const SYNC_CAPABLE: bool = true;
        }
        impl UsartInstance for pac::USART3 {
            const SYNC_CAPABLE: bool = true;
        }
        impl UsartInstance for pac::UART4 {
            const SYNC_CAPABLE: bool = false;
        }
        impl UsartInstance for pac::UART5 {
            const SYNC_CAPABLE: bool = false;
        }

        impl UsartRegs for RegisterBlock {
            fn status(&self) -> UsartStatus {
                let isr = self.isr().read();
                UsartStatus {
                    pe: isr.pe().bit_is_set(),
                    fe: isr.fe().bit_is_set(),
                    ne: isr.ne().bit_is_set(),
                    ore: isr.ore().bit_is_set(),
                    idle: isr.idle().bit_is_set(),
                    rxne: isr.rxfne().bit_is_set(),
                    tc: isr.tc().bit_is_set(),
                    txe: isr.txfnf().bit_is_set(),
                    lbdf: isr.lbdf().bit_is_set(),
                    ctsif: isr.ctsif().bit_is_set(),
                    rtof: isr.rtof().bit_is_set(),
                    eobf: isr.eobf().bit_is_set(),
                    udr: isr.udr().bit_is_set(),
                    cmf: isr.cmf().bit_is_set(),
                    tcbgt: isr.tcbgt().bit_is_set(),
                }
            }

            fn clear_flags(&self, flags: UsartStatus) {
                self.icr().write(|w| {
                    w.pecf().bit(flags.pe);
                    w.fecf().bit(flags.fe);
                    w.necf().bit(flags.ne);
                    w.orecf().bit(flags.ore);
                    w.idlecf().bit(flags.idle);
                    w.tccf().bit(flags.tc);
                    w.tcbgtcf().bit(flags.tcbgt);
                    w.lbdcf().bit(flags.lbdf);
                    w.ctscf().bit(flags.ctsif);
                    w.rtocf().bit(flags.rtof);
                    w.eobcf().bit(flags.eobf);
                    w.udrcf().bit(flags.udr);
                    w.cmcf().bit(flags.cmf)
                });
            }

            fn interrupt_enabled(&self, interrupt: UsartInterrupt) -> bool {
                let cr1 = self.cr1().read();
                let cr2 = self.cr2().read();
                let cr3 = self.cr3().read();
                match interrupt {
                    UsartInterrupt::CharDetect(_) => cr1.cmie().bit_is_set(),
                    UsartInterrupt::Cts => cr3.ctsie().bit_is_set(),
                    UsartInterrupt::EndOfBlock => cr1.eobie().bit_is_set(),
                    UsartInterrupt::Idle => cr1.idleie().bit_is_set(),
                    UsartInterrupt::FramingError | UsartInterrupt::Overrun => {
                        cr3.eie().bit_is_set()
                    }
                    UsartInterrupt::LineBreak => cr2.lbdie().bit_is_set(),
                    UsartInterrupt::ParityError => cr1.peie().bit_is_set(),
                    UsartInterrupt::ReadNotEmpty => cr1.rxfneie().bit_is_set(),
                    UsartInterrupt::ReceiverTimeout => cr1.rtoie().bit_is_set(),
                    UsartInterrupt::Tcbgt => cr3.tcbgtie().bit_is_set(),
                    UsartInterrupt::TransmissionComplete => cr1.tcie().bit_is_set(),
                    UsartInterrupt::TransmitEmpty => cr1.txfnfie().bit_is_set(),
                }
            }

            fn set_interrupt(&self, interrupt: UsartInterrupt, enabled: bool) {
                match interrupt {
                    UsartInterrupt::CharDetect(_) => {
                        self.cr1().modify(|_, w| w.cmie().bit(enabled));
                    }
                    UsartInterrupt::Cts => {
                        self.cr3().modify(|_, w| w.ctsie().bit(enabled));
                    }
                    UsartInterrupt::EndOfBlock => {
                        self.cr1().modify(|_, w| w.eobie().bit(enabled));
                    }
                    UsartInterrupt::Idle => {
                        self.cr1().modify(|_, w| w.idleie().bit(enabled));
                    }
                    UsartInterrupt::FramingError | UsartInterrupt::Overrun => {
                        self.cr3().modify(|_, w| w.eie().bit(enabled));
                    }
                    UsartInterrupt::LineBreak => {
                        self.cr2().modify(|_, w| w.lbdie().bit(enabled));
                    }
                    UsartInterrupt::ParityError => {
                        self.cr1().modify(|_, w| w.peie().bit(enabled));
                    }
                    UsartInterrupt::ReadNotEmpty => {
                        self.cr1().modify(|_, w| w.rxfneie().bit(enabled));
                    }
                    UsartInterrupt::ReceiverTimeout => {
                        self.cr1().modify(|_, w| w.rtoie().bit(enabled));
                    }
                    UsartInterrupt::Tcbgt => {
                        self.cr3().modify(|_, w| w.tcbgtie().bit(enabled));
                    }
                    UsartInterrupt::TransmissionComplete => {
                        self.cr1().modify(|_, w| w.tcie().bit(enabled));
                    }
                    UsartInterrupt::TransmitEmpty => {
                        self.cr1().modify(|_, w| w.txfnfie().bit(enabled));
                    }
                }
            }

            fn set_char_match(&self, char: u8) {
                self.cr2().modify(|_, w| unsafe {
                    w.add().bits(char);
                    w.addm7().bit(true)
                });
            }

            fn read_data(&self) -> u8 {
                self.rdr().read().rdr().bits() as u8
            }

            fn write_data(&self, byte: u8) {
                self.tdr().write(|w| unsafe { w.tdr().bits(byte as u16) });
            }

            fn flush_rx(&self) {
                self.rqr().write(|w| w.rxfrq().bit(true));
            }

            fn flush_tx(&self) {
                self.rqr().write(|w| w.txfrq().bit(true));
            }

            fn is_enabled(&self) -> bool {
                self.cr1().read().ue().bit_is_set()
            }

            fn set_enabled(&self, enabled: bool) {
                self.cr1().modify(|_, w| w.ue().bit(enabled));
            }

            fn set_brr(&self, brr: u32) {
                self.brr().write(|w| unsafe { w.brr().bits(brr as u16) });
            }

            fn configure(&self, cfg: &UsartConfig) {
                let (m1, m0) = cfg.word_len.bits();
                self.cr1().modify(|_, w| {
                    w.m1().bit(m1 != 0);
                    w.m0().bit(m0 != 0);
                    w.over8().bit(cfg.oversampling == OverSampling::O8);
                    w.pce().bit(cfg.parity != Parity::Disabled);
                    w.ps().bit(cfg.parity == Parity::EnabledOdd);
                    w.fifoen().bit(cfg.fifo_enabled)
                });

                self.cr3().modify(|_, w| w.ovrdis().bit(cfg.overrun_disabled));

                let (clken, slven, cpol, cpha, lbcl) = match cfg.sync {
                    SyncMode::Disabled => (false, false, false, false, false),
                    SyncMode::Master {
                        cpol,
                        cpha,
                        last_bit_clock,
                    } => (true, false, cpol, cpha, last_bit_clock),
                    SyncMode::Slave { cpol, cpha } => (false, true, cpol, cpha, false),
                };
                self.cr2().modify(|_, w| unsafe {
                    w.stop().bits(cfg.stop_bits as u8);
                    w.clken().bit(clken);
                    w.slven().bit(slven);
                    // A synchronous slave ignores NSS.
                    w.dis_nss().bit(slven);
                    w.cpol().bit(cpol);
                    w.cpha().bit(cpha);
                    w.lbcl().bit(lbcl)
                });
            }

            fn set_tx_rx(&self, enabled: bool) {
                self.cr1().modify(|_, w| {
                    w.te().bit(enabled);
                    w.re().bit(enabled)
                });
            }

            fn reset(&self) {
                self.cr1().reset();
                self.cr2().reset();
                self.cr3().reset();
            }
        }

        impl<R: UsartInstance> Usart<R> {
            /// Initialize a U(S)ART peripheral, including configuration register writes, and
            /// enabling and resetting its RCC peripheral clock. `baud` is the baud rate, in
            /// bits-per-second.
            pub fn new(regs: R, baud: u32, config: UsartConfig, clock_cfg: &Clocks) -> Result<Self> {
                if config.sync != SyncMode::Disabled && !R::SYNC_CAPABLE {
                    return Err(Error::InvalidParam);
                }

                free(|_| {
                    let rcc = unsafe { &(*RCC::ptr()) };
                    R::en_reset(rcc);
                });

                let mut usart = Self::from_regs(regs, baud, config);
                // This assumes the USART clock is the default, PCLK.
                usart.setup(R::baud(clock_cfg))?;

                Ok(usart)
            }

            /// Set the BAUD rate. Called during init, and can be called later to change BAUD
            /// during program execution.
            pub fn set_baud(&mut self, baud: u32, clock_cfg: &Clocks) -> Result<()> {
                self.apply_baud(R::baud(clock_cfg), baud)
            }
        }
    }
}

#[cfg(feature = "embedded_hal")]
mod embedded_io_impl {
    use embedded_io::{ErrorType, Read, ReadReady, Write, WriteReady};

    use super::*;

    impl<R> ErrorType for Usart<R> {
        type Error = Error;
    }

    impl<R> Read for Usart<R>
    where
        R: Deref,
        R::Target: UsartRegs,
    {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            // Block until at least one byte can be read:
            while !self.read_ready()? {
                core::hint::spin_loop();
            }

            let mut n = 0;
            for slot in buf.iter_mut() {
                if !self.read_ready()? {
                    break;
                }
                *slot = self.read_one();
                n += 1;
            }
            Ok(n)
        }
    }

    impl<R> ReadReady for Usart<R>
    where
        R: Deref,
        R::Target: UsartRegs,
    {
        fn read_ready(&mut self) -> Result<bool> {
            self.check_status()?;
            Ok(self.regs.status().rxne)
        }
    }

    impl<R> Write for Usart<R>
    where
        R: Deref,
        R::Target: UsartRegs,
    {
        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            // Block until at least one byte can be written:
            while !self.write_ready()? {
                core::hint::spin_loop();
            }

            let mut n = 0;
            for byte in buf {
                if !self.write_ready()? {
                    break;
                }
                self.write_one(*byte);
                n += 1;
            }
            Ok(n)
        }

        fn flush(&mut self) -> Result<()> {
            bounded_loop!(!self.regs.status().tc, Error::RegisterUnchanged);
            Ok(())
        }
    }

    impl<R> WriteReady for Usart<R>
    where
        R: Deref,
        R::Target: UsartRegs,
    {
        fn write_ready(&mut self) -> Result<bool> {
            Ok(self.regs.status().txe)
        }
    }
}

#[cfg(test)]
mod tests {
    use core::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    use super::*;

    /// U(S)ART register model. Enable bits are kept per interrupt; framing and overrun share
    /// one, as EIE does.
    #[derive(Default)]
    struct FakeUsart {
        isr: Cell<UsartStatus>,
        enabled_ints: RefCell<Vec<UsartInterrupt>>,
        ue: Cell<bool>,
        te_re: Cell<bool>,
        brr: Cell<u32>,
        char_match: Cell<Option<u8>>,
        rx: RefCell<VecDeque<u8>>,
        tx: RefCell<Vec<u8>>,
        rx_flushes: Cell<u32>,
    }

    fn shared(interrupt: UsartInterrupt) -> UsartInterrupt {
        match interrupt {
            UsartInterrupt::FramingError => UsartInterrupt::Overrun,
            UsartInterrupt::CharDetect(_) => UsartInterrupt::CharDetect(None),
            i => i,
        }
    }

    impl FakeUsart {
        fn raise(&self, f: impl FnOnce(&mut UsartStatus)) {
            let mut isr = UsartStatus::NONE;
            f(&mut isr);
            self.isr.set(isr);
        }
    }

    impl UsartRegs for FakeUsart {
        fn status(&self) -> UsartStatus {
            self.isr.get()
        }

        fn clear_flags(&self, flags: UsartStatus) {
            let mut isr = self.isr.get();
            isr.pe &= !flags.pe;
            isr.fe &= !flags.fe;
            isr.ne &= !flags.ne;
            isr.ore &= !flags.ore;
            isr.tc &= !flags.tc;
            isr.udr &= !flags.udr;
            isr.cmf &= !flags.cmf;
            self.isr.set(isr);
        }

        fn interrupt_enabled(&self, interrupt: UsartInterrupt) -> bool {
            self.enabled_ints.borrow().contains(&shared(interrupt))
        }

        fn set_interrupt(&self, interrupt: UsartInterrupt, enabled: bool) {
            let i = shared(interrupt);
            let mut ints = self.enabled_ints.borrow_mut();
            ints.retain(|&e| e != i);
            if enabled {
                ints.push(i);
            }
        }

        fn set_char_match(&self, char: u8) {
            self.char_match.set(Some(char));
        }

        fn read_data(&self) -> u8 {
            self.rx.borrow_mut().pop_front().unwrap_or(0)
        }

        fn write_data(&self, byte: u8) {
            self.tx.borrow_mut().push(byte);
        }

        fn flush_rx(&self) {
            self.rx_flushes.set(self.rx_flushes.get() + 1);
        }

        fn flush_tx(&self) {}

        fn is_enabled(&self) -> bool {
            self.ue.get()
        }

        fn set_enabled(&self, enabled: bool) {
            self.ue.set(enabled);
        }

        fn set_brr(&self, brr: u32) {
            self.brr.set(brr);
        }

        fn configure(&self, _cfg: &UsartConfig) {}

        fn set_tx_rx(&self, enabled: bool) {
            self.te_re.set(enabled);
        }

        fn reset(&self) {}
    }

    fn usart(fake: &FakeUsart) -> Usart<&FakeUsart> {
        let mut usart = Usart::from_regs(fake, 115_200, UsartConfig::default());
        usart.setup(160_000_000).unwrap();
        usart
    }

    #[test]
    fn baud_divider() {
        // 160 MHz PCLK2, 115200 baud: 1388.9 rounds to 1389.
        assert_eq!(brr_value(160_000_000, 115_200, OverSampling::O16), Some(1_389));
        // Oversampling by 8: USARTDIV 2778 = 0xada; BRR[2:0] = 0xa >> 1.
        assert_eq!(brr_value(160_000_000, 115_200, OverSampling::O8), Some(0xad5));
        // Divider below 16.
        assert_eq!(brr_value(16_000_000, 2_000_000, OverSampling::O16), None);
        // Divider above 16 bits.
        assert_eq!(brr_value(160_000_000, 1_200, OverSampling::O16), None);
        assert_eq!(brr_value(160_000_000, 0, OverSampling::O16), None);
    }

    #[test]
    fn word_length_bits() {
        assert_eq!(WordLen::W8.bits(), (0, 0));
        assert_eq!(WordLen::W9.bits(), (0, 1));
        assert_eq!(WordLen::W7.bits(), (1, 0));
    }

    #[test]
    fn error_codes() {
        let mut isr = UsartStatus::NONE;
        isr.rxne = true;
        isr.txe = true;
        assert_eq!(isr.error_code(), ERROR_NONE);
        assert_eq!(isr.rx_errors(), UsartStatus::NONE);

        isr.fe = true;
        isr.ore = true;
        assert_eq!(isr.error_code(), ERROR_FE | ERROR_ORE);
        assert!(isr.is_set(UsartInterrupt::Overrun));

        let udr = UsartStatus {
            udr: true,
            ..UsartStatus::NONE
        };
        assert_eq!(udr.error_code(), ERROR_UDR);

        assert_eq!(UsartError::from_code(ERROR_FE | ERROR_ORE), Some(UsartError::Framing));
        assert_eq!(UsartError::from_code(ERROR_NE), Some(UsartError::Noise));
        assert_eq!(UsartError::from_code(ERROR_UDR), None);
    }

    #[test]
    fn interrupt_flags() {
        let tc = UsartStatus::from(UsartInterrupt::TransmissionComplete);
        assert!(tc.tc);
        assert_eq!(UsartStatus { tc: false, ..tc }, UsartStatus::NONE);
        assert!(UsartStatus::from(UsartInterrupt::CharDetect(Some(b'\n'))).cmf);
        assert!(!UsartStatus::CLEARABLE.rxne);
        assert!(!UsartStatus::CLEARABLE.txe);
    }

    #[test]
    fn setup_enables() {
        let fake = FakeUsart::default();
        let usart = usart(&fake);
        assert!(fake.ue.get());
        assert!(fake.te_re.get());
        assert_eq!(fake.brr.get(), 1_389);
        assert_eq!(usart.tx_state(), PeriphState::Idle);
        assert_eq!(usart.rx_state(), PeriphState::Idle);

        // A synchronous slave has no baud rate.
        let fake = FakeUsart::default();
        let cfg = UsartConfig {
            sync: SyncMode::Slave {
                cpol: false,
                cpha: true,
            },
            ..Default::default()
        };
        let mut usart = Usart::from_regs(&fake, 0, cfg);
        usart.setup(160_000_000).unwrap();
        assert_eq!(fake.brr.get(), 0);
    }

    #[test]
    fn bad_baud_keeps_setting() {
        let fake = FakeUsart::default();
        let mut usart = usart(&fake);
        assert_eq!(usart.apply_baud(160_000_000, 0), Err(Error::InvalidParam));
        assert_eq!(usart.baud(), 115_200);
        assert_eq!(fake.brr.get(), 1_389);
        assert!(fake.ue.get());
    }

    #[test]
    fn read_it_completes() {
        let fake = FakeUsart::default();
        let mut usart = usart(&fake);
        fake.rx.borrow_mut().extend([1, 2, 3]);
        let mut buf = [0; 3];

        usart.read_it(&mut buf).unwrap();
        assert_eq!(usart.rx_state(), PeriphState::RxActive);
        assert_eq!(fake.rx_flushes.get(), 1);
        assert!(fake.interrupt_enabled(UsartInterrupt::ReadNotEmpty));
        assert!(fake.interrupt_enabled(UsartInterrupt::Overrun));
        assert_eq!(usart.read_it(&mut [0; 2]), Err(Error::Busy));

        fake.raise(|s| s.rxne = true);
        assert_eq!(usart.on_interrupt(), None);
        assert_eq!(usart.on_interrupt(), None);
        assert_eq!(usart.on_interrupt(), Some(UsartEvent::RxComplete));

        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(usart.rx_state(), PeriphState::Idle);
        assert!(!fake.interrupt_enabled(UsartInterrupt::ReadNotEmpty));
    }

    #[test]
    fn overrun_ends_reception() {
        let fake = FakeUsart::default();
        let mut usart = usart(&fake);
        let mut buf = [0; 4];
        usart.read_it(&mut buf).unwrap();

        fake.raise(|s| {
            s.ore = true;
            s.rxne = true;
        });
        assert_eq!(usart.on_interrupt(), Some(UsartEvent::Error(ERROR_ORE)));
        assert!(!fake.isr.get().ore);
        assert_eq!(usart.rx_state(), PeriphState::Idle);
        assert!(!fake.interrupt_enabled(UsartInterrupt::Overrun));

        // Usable again.
        assert!(usart.read_it(&mut buf).is_ok());
        assert_eq!(usart.last_error(), ERROR_NONE);
    }

    #[test]
    fn parity_error_reported_at_end() {
        let fake = FakeUsart::default();
        let mut usart = usart(&fake);
        fake.rx.borrow_mut().extend([0x55, 0xaa]);
        let mut buf = [0; 2];
        usart.read_it(&mut buf).unwrap();

        fake.raise(|s| {
            s.pe = true;
            s.rxne = true;
        });
        assert_eq!(usart.on_interrupt(), None);
        fake.raise(|s| s.rxne = true);
        assert_eq!(usart.on_interrupt(), Some(UsartEvent::Error(ERROR_PE)));
        assert_eq!(buf, [0x55, 0xaa]);
    }

    #[test]
    fn write_it_waits_for_tc() {
        let fake = FakeUsart::default();
        let mut usart = usart(&fake);
        let data = [b'h', b'i'];

        usart.write_it(&data).unwrap();
        assert_eq!(usart.write_it(&data), Err(Error::Busy));
        assert_eq!(usart.write_it(&[]), Err(Error::InvalidParam));

        fake.raise(|s| s.txe = true);
        assert_eq!(usart.on_interrupt(), None);
        assert_eq!(usart.on_interrupt(), None);
        assert_eq!(*fake.tx.borrow(), data);
        assert!(!fake.interrupt_enabled(UsartInterrupt::TransmitEmpty));
        assert!(fake.interrupt_enabled(UsartInterrupt::TransmissionComplete));

        fake.raise(|s| s.tc = true);
        assert_eq!(usart.on_interrupt(), Some(UsartEvent::TxComplete));
        assert_eq!(usart.tx_state(), PeriphState::Idle);
        assert!(!fake.interrupt_enabled(UsartInterrupt::TransmissionComplete));
    }

    #[test]
    fn underrun_reported_at_tc() {
        let fake = FakeUsart::default();
        let mut usart = usart(&fake);
        usart.write_it(&[1]).unwrap();

        fake.raise(|s| {
            s.txe = true;
            s.udr = true;
        });
        assert_eq!(usart.on_interrupt(), None);
        fake.raise(|s| s.tc = true);
        assert_eq!(usart.on_interrupt(), Some(UsartEvent::Error(ERROR_UDR)));
        assert_eq!(usart.tx_state(), PeriphState::Idle);
    }

    #[test]
    fn blocking_read_reports_framing() {
        let fake = FakeUsart::default();
        let mut usart = usart(&fake);
        fake.raise(|s| {
            s.fe = true;
            s.rxne = true;
        });

        let mut buf = [0; 2];
        assert_eq!(usart.read(&mut buf), Err(Error::UsartError(UsartError::Framing)));
        assert!(!fake.isr.get().fe);
        assert_eq!(usart.rx_state(), PeriphState::Idle);
    }

    #[test]
    fn blocking_write() {
        let fake = FakeUsart::default();
        let mut usart = usart(&fake);
        fake.raise(|s| {
            s.txe = true;
            s.tc = true;
        });
        usart.write(b"ok").unwrap();
        assert_eq!(*fake.tx.borrow(), *b"ok");
        assert_eq!(usart.tx_state(), PeriphState::Idle);
    }

    #[test]
    fn char_match_interrupt() {
        let fake = FakeUsart::default();
        let mut usart = usart(&fake);

        usart
            .enable_interrupt(UsartInterrupt::CharDetect(Some(b'\n')))
            .unwrap();
        assert_eq!(fake.char_match.get(), Some(b'\n'));
        assert!(fake.ue.get());
        assert!(fake.interrupt_enabled(UsartInterrupt::CharDetect(None)));

        fake.raise(|s| s.cmf = true);
        assert!(usart.check_status_flag(UsartInterrupt::CharDetect(None)));
        usart.clear_interrupt(UsartInterrupt::CharDetect(None));
        assert!(!usart.read_status().cmf);

        usart.disable_interrupt(UsartInterrupt::CharDetect(None));
        assert!(!fake.interrupt_enabled(UsartInterrupt::CharDetect(None)));
    }

    #[test]
    fn abort_returns_to_idle() {
        let fake = FakeUsart::default();
        let mut usart = usart(&fake);
        let mut buf = [0; 4];
        usart.read_it(&mut buf).unwrap();
        usart.write_it(&[1, 2]).unwrap();

        usart.abort();
        assert_eq!(usart.tx_state(), PeriphState::Idle);
        assert_eq!(usart.rx_state(), PeriphState::Idle);
        assert!(fake.enabled_ints.borrow().is_empty());
    }
}
