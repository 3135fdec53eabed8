//! Support for the Serial Peripheral Interface (SPI) bus peripheral.
//! Provides APIs to configure, read, and write from SPI, with blocking and interrupt
//! functionality.
//!
//! The U5 SPI counts frames with CR2 TSIZE, so each transfer enables the peripheral, runs to
//! EOT, and disables it again. Frames are 4 to 8 bits.

use core::{ops::Deref, ptr};

use cfg_if::cfg_if;

use crate::{
    error::{Error, Result},
    state::{HandleState, PeriphState},
    tick::Timeout,
    transfer::FullDuplexLink,
};

/// SPI error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiError {
    /// Overrun occurred
    Overrun,
    /// Mode fault occurred
    ModeFault,
    /// CRC error
    Crc,
    /// Underrun, in slave mode
    Underrun,
    /// TI mode frame format error
    Frame,
}

// Error code bitmask, as reported by `last_error()`.
pub const ERROR_NONE: u32 = 0;
pub const ERROR_MODF: u32 = 1 << 0;
pub const ERROR_CRC: u32 = 1 << 1;
pub const ERROR_OVR: u32 = 1 << 2;
pub const ERROR_FRE: u32 = 1 << 3;
pub const ERROR_ABORT: u32 = 1 << 5;
pub const ERROR_UDR: u32 = 1 << 6;

impl SpiError {
    /// The most significant error in a code bitmask.
    pub fn from_code(code: u32) -> Option<Self> {
        if code & ERROR_OVR != 0 {
            Some(Self::Overrun)
        } else if code & ERROR_MODF != 0 {
            Some(Self::ModeFault)
        } else if code & ERROR_CRC != 0 {
            Some(Self::Crc)
        } else if code & ERROR_UDR != 0 {
            Some(Self::Underrun)
        } else if code & ERROR_FRE != 0 {
            Some(Self::Frame)
        } else {
            None
        }
    }
}

/// Set the factor to divide the kernel clock by to set baud rate. Sets the CFG1 register,
/// `MBR` field; `Div1` sets `BPASS`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BaudRate {
    Div1,
    Div2,
    Div4,
    Div8,
    Div16,
    Div32,
    Div64,
    Div128,
    Div256,
}

impl BaudRate {
    const ALL: [Self; 9] = [
        Self::Div1,
        Self::Div2,
        Self::Div4,
        Self::Div8,
        Self::Div16,
        Self::Div32,
        Self::Div64,
        Self::Div128,
        Self::Div256,
    ];

    pub fn divisor(&self) -> u32 {
        1 << (*self as u32)
    }

    /// The CFG1 MBR field. `None` for `Div1`, which sets BPASS instead.
    pub fn mbr(&self) -> Option<u8> {
        match self {
            Self::Div1 => None,
            _ => Some(*self as u8 - 1),
        }
    }

    /// The fastest rate that doesn't exceed `max_hz`, or `Div256` if none does.
    pub fn from_freq(kernel_clock: u32, max_hz: u32) -> Self {
        for br in Self::ALL {
            if kernel_clock / br.divisor() <= max_hz {
                return br;
            }
        }
        Self::Div256
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Clock polarity. Sets CFG2 register, CPOL field.
pub enum SpiPolarity {
    /// Clock signal low when idle
    IdleLow,
    /// Clock signal high when idle
    IdleHigh,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Clock phase. Sets CFG2 register, CPHA field.
pub enum SpiPhase {
    /// Data in "captured" on the first clock transition
    CaptureOnFirstTransition,
    /// Data in "captured" on the second clock transition
    CaptureOnSecondTransition,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// SPI mode. Sets CFG2 register, CPOL and CPHA fields.
pub struct SpiMode {
    pub polarity: SpiPolarity,
    pub phase: SpiPhase,
}

impl SpiMode {
    /// Set Spi Mode 0: Idle low, capture on first transition.
    pub const fn mode0() -> Self {
        Self {
            polarity: SpiPolarity::IdleLow,
            phase: SpiPhase::CaptureOnFirstTransition,
        }
    }

    /// Set Spi Mode 1: Idle low, capture on second transition.
    pub const fn mode1() -> Self {
        Self {
            polarity: SpiPolarity::IdleLow,
            phase: SpiPhase::CaptureOnSecondTransition,
        }
    }

    /// Set Spi Mode 2: Idle high, capture on first transition.
    pub const fn mode2() -> Self {
        Self {
            polarity: SpiPolarity::IdleHigh,
            phase: SpiPhase::CaptureOnFirstTransition,
        }
    }

    /// Set Spi Mode 3: Idle high, capture on second transition.
    pub const fn mode3() -> Self {
        Self {
            polarity: SpiPolarity::IdleHigh,
            phase: SpiPhase::CaptureOnSecondTransition,
        }
    }
}

#[cfg(feature = "embedded_hal")]
impl From<embedded_hal::spi::Mode> for SpiMode {
    fn from(mode: embedded_hal::spi::Mode) -> Self {
        use embedded_hal::spi::{Phase, Polarity};
        Self {
            polarity: match mode.polarity {
                Polarity::IdleLow => SpiPolarity::IdleLow,
                Polarity::IdleHigh => SpiPolarity::IdleHigh,
            },
            phase: match mode.phase {
                Phase::CaptureOnFirstTransition => SpiPhase::CaptureOnFirstTransition,
                Phase::CaptureOnSecondTransition => SpiPhase::CaptureOnSecondTransition,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiRole {
    Master,
    Slave,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Select the duplex communication mode between the 2 devices. Sets CFG2 register, `COMM`
/// field.
pub enum SpiCommMode {
    FullDuplex = 0b00,
    /// Simplex Transmit only.
    TransmitOnly = 0b01,
    /// Simplex Receive only.
    ReceiveOnly = 0b10,
    HalfDuplex = 0b11,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Used for managing NSS / CS pin. Sets CFG2 register, `SSM` and `SSOE` fields.
pub enum SlaveSelect {
    /// Slave select information is driven internally by the SSI bit value in CR1. The
    /// external NSS pin is free for other application uses.
    Software,
    /// Master only. NSS is driven low while the SPI is enabled.
    HardwareOutEnable,
    /// NSS is an input: the slave is selected while it's low. As a master, a low NSS is a
    /// mode fault.
    HardwareOutDisable,
}

/// Number of bits in a single SPI data frame. Sets `CFG1` register, `DSIZE` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DataSize {
    D4 = 3,
    D5 = 4,
    D6 = 5,
    D7 = 6,
    D8 = 7,
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Configuration data for SPI.
pub struct SpiConfig {
    /// SPI mode associated with Polarity and Phase. Defaults to Mode0: Idle low, capture on
    /// first transition.
    pub mode: SpiMode,
    pub role: SpiRole,
    /// Sets the (duplex) communication mode between the devices. Defaults to full duplex.
    pub comm_mode: SpiCommMode,
    /// Controls use of hardware vs software CS/NSS pin. Defaults to software.
    pub slave_select: SlaveSelect,
    /// Data size. Defaults to 8 bits.
    pub data_size: DataSize,
    pub lsb_first: bool,
    /// Timeout for blocking transfers, in ms.
    pub timeout_ms: u32,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            mode: SpiMode::mode0(),
            role: SpiRole::Master,
            comm_mode: SpiCommMode::FullDuplex,
            slave_select: SlaveSelect::Software,
            data_size: DataSize::D8,
            lsb_first: false,
            timeout_ms: 100,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Completion reported by `on_interrupt()`.
pub enum SpiEvent {
    TxComplete,
    RxComplete,
    TxRxComplete,
    /// The transfer ended with errors; the value is the error code bitmask.
    Error(u32),
}

/// Largest transfer in one TSIZE count.
pub const MAX_TSIZE: usize = 0xffff;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Flags read from SPI_SR.
pub struct SpiStatus {
    pub rxp: bool,
    pub txp: bool,
    pub eot: bool,
    pub txtf: bool,
    pub udr: bool,
    pub ovr: bool,
    pub crce: bool,
    pub tifre: bool,
    pub modf: bool,
    pub susp: bool,
}

impl SpiStatus {
    pub const NONE: Self = Self {
        rxp: false,
        txp: false,
        eot: false,
        txtf: false,
        udr: false,
        ovr: false,
        crce: false,
        tifre: false,
        modf: false,
        susp: false,
    };

    /// Every flag cleared through SPI_IFCR.
    pub const CLEARABLE: Self = Self {
        eot: true,
        txtf: true,
        udr: true,
        ovr: true,
        crce: true,
        tifre: true,
        modf: true,
        susp: true,
        ..Self::NONE
    };

    /// Only the error flags of this read.
    pub fn errors(&self) -> Self {
        Self {
            udr: self.udr,
            ovr: self.ovr,
            crce: self.crce,
            tifre: self.tifre,
            modf: self.modf,
            ..Self::NONE
        }
    }

    /// Map the error flags to the error code bitmask.
    pub fn error_code(&self) -> u32 {
        let mut code = ERROR_NONE;
        if self.modf {
            code |= ERROR_MODF;
        }
        if self.crce {
            code |= ERROR_CRC;
        }
        if self.ovr {
            code |= ERROR_OVR;
        }
        if self.tifre {
            code |= ERROR_FRE;
        }
        if self.udr {
            code |= ERROR_UDR;
        }
        code
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Interrupt enables in SPI_IER. `errors` covers UDR, OVR, CRCE, TIFRE and MODF.
pub struct SpiInterrupts {
    pub rxp: bool,
    pub txp: bool,
    pub eot: bool,
    pub errors: bool,
}

impl SpiInterrupts {
    pub const NONE: Self = Self {
        rxp: false,
        txp: false,
        eot: false,
        errors: false,
    };

    pub fn any(&self) -> bool {
        *self != Self::NONE
    }
}

/// Register access for one SPI instance. Implemented for the PAC register block.
pub trait SpiRegs {
    fn status(&self) -> SpiStatus;
    /// Clear the IFCR-cleared flags set in `flags`.
    fn clear_flags(&self, flags: SpiStatus);
    fn interrupts(&self) -> SpiInterrupts;
    fn set_interrupts(&self, ints: SpiInterrupts);
    fn read_frame(&self) -> u8;
    fn write_frame(&self, byte: u8);
    /// Write CR2 TSIZE.
    fn set_tsize(&self, frames: u16);
    /// Set or clear SPE.
    fn set_enabled(&self, enabled: bool);
    /// Set CSTART.
    fn start(&self);
    fn is_started(&self) -> bool;
    /// Request suspension of an ongoing master transfer (CSUSP).
    fn suspend(&self);
    /// Half duplex: transmit when set, receive otherwise.
    fn set_half_duplex_tx(&self, tx: bool);
    /// Write SSI, CFG1 and CFG2 for `cfg`, and clear TSIZE. Only while disabled.
    fn configure(&self, cfg: &SpiConfig, baud_rate: BaudRate);
    fn set_baud_rate(&self, baud_rate: BaudRate);
    fn set_data_size(&self, size: DataSize);
}

/// Progress of an interrupt transfer. A null pointer means that side is unused: nothing
/// to send (zeros go out), or nothing to keep (received frames are dropped).
struct Xfer {
    tx: *const u8,
    rx: *mut u8,
    len: usize,
    tx_count: usize,
    rx_count: usize,
}

impl Xfer {
    const fn empty() -> Self {
        Self {
            tx: ptr::null(),
            rx: ptr::null_mut(),
            len: 0,
            tx_count: 0,
            rx_count: 0,
        }
    }
}

/// Represents a Serial Peripheral Interface (SPI) peripheral.
pub struct Spi<R> {
    pub regs: R,
    pub cfg: SpiConfig,
    state: HandleState<PeriphState>,
    last_error: u32,
    xfer: Xfer,
}

// The transfer pointers are only dereferenced while their transfer is active, and the
// caller keeps those buffers borrowed until it completes or is aborted.
unsafe impl<R: Send> Send for Spi<R> {}

impl<R> Spi<R>
where
    R: Deref,
    R::Target: SpiRegs,
{
    /// Check and apply `cfg`. The peripheral stays disabled until a transfer starts.
    #[cfg_attr(not(any(feature = "u5", test)), allow(dead_code))]
    fn from_regs(regs: R, cfg: SpiConfig, baud_rate: BaudRate) -> Result<Self> {
        if cfg.role == SpiRole::Slave && cfg.slave_select == SlaveSelect::HardwareOutEnable {
            return Err(Error::InvalidParam);
        }

        regs.configure(&cfg, baud_rate);

        Ok(Self {
            regs,
            cfg,
            state: HandleState::new(PeriphState::Idle),
            last_error: ERROR_NONE,
            xfer: Xfer::empty(),
        })
    }

    /// Disable the peripheral and return its register block.
    pub fn deinit(self) -> R {
        self.regs.set_enabled(false);
        self.regs.set_interrupts(SpiInterrupts::NONE);
        self.regs.clear_flags(SpiStatus::CLEARABLE);
        self.regs
    }

    /// Change the SPI baud rate.
    pub fn reclock(&mut self, baud_rate: BaudRate) -> Result<()> {
        self.state.check_update(PeriphState::Idle, PeriphState::Init)?;
        self.regs.set_baud_rate(baud_rate);
        self.state.set(PeriphState::Idle);
        Ok(())
    }

    pub fn set_data_size(&mut self, size: DataSize) -> Result<()> {
        self.state.check_update(PeriphState::Idle, PeriphState::Init)?;
        self.regs.set_data_size(size);
        self.cfg.data_size = size;
        self.state.set(PeriphState::Idle);
        Ok(())
    }

    pub fn state(&self) -> PeriphState {
        self.state.get()
    }

    /// Error code bitmask of the last transfer. See the `ERROR_` constants.
    pub fn last_error(&self) -> u32 {
        self.last_error
    }

    /// Read the status register.
    pub fn read_status(&self) -> SpiStatus {
        self.regs.status()
    }

    /// Program TSIZE, enable, and start.
    fn begin(&mut self, len: usize) {
        self.regs.clear_flags(SpiStatus::CLEARABLE);
        self.regs.set_tsize(len as u16);
        self.regs.set_enabled(true);
        if self.cfg.role == SpiRole::Master {
            self.regs.start();
        }
    }

    /// RM0456, section 68.4.14: "Procedure for disabling the SPI". Clears the end of
    /// transfer flags and disables the peripheral.
    fn end(&mut self) {
        self.regs.clear_flags(SpiStatus {
            eot: true,
            txtf: true,
            ..SpiStatus::NONE
        });
        self.regs.set_interrupts(SpiInterrupts::NONE);
        self.regs.set_enabled(false);
    }

    fn check_errors(&mut self, sr: &SpiStatus) -> Result<()> {
        let errors = sr.errors();
        if errors == SpiStatus::NONE {
            return Ok(());
        }
        self.regs.clear_flags(errors);
        let code = errors.error_code();
        self.last_error |= code;
        match SpiError::from_code(code) {
            Some(e) => Err(Error::SpiError(e)),
            None => Ok(()),
        }
    }

    /// Exchange `len` frames. Frames past the end of `tx` are sent as 0; received
    /// frames past the end of `rx` are dropped.
    fn transfer_blocking(&mut self, tx: &[u8], rx: &mut [u8], len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if len > MAX_TSIZE {
            return Err(Error::InvalidParam);
        }
        // In half duplex, a call with nothing to send receives, and vice versa.
        let half = self.cfg.comm_mode == SpiCommMode::HalfDuplex;
        let rx_only = self.cfg.comm_mode == SpiCommMode::ReceiveOnly || (half && tx.is_empty());
        let tx_only = self.cfg.comm_mode == SpiCommMode::TransmitOnly || (half && rx.is_empty());
        if half {
            self.regs.set_half_duplex_tx(tx_only);
        }

        let timeout = Timeout::new(self.cfg.timeout_ms);
        self.last_error = ERROR_NONE;
        self.begin(len);

        let mut tx_count = if rx_only { len } else { 0 };
        let mut rx_count = if tx_only { len } else { 0 };

        let result = loop {
            let sr = self.regs.status();

            if let Err(e) = self.check_errors(&sr) {
                break Err(e);
            }
            if tx_count < len && sr.txp {
                self.regs.write_frame(tx.get(tx_count).copied().unwrap_or(0));
                tx_count += 1;
            }
            if rx_count < len && sr.rxp {
                let byte = self.regs.read_frame();
                if let Some(slot) = rx.get_mut(rx_count) {
                    *slot = byte;
                }
                rx_count += 1;
            }
            if tx_count == len && rx_count == len && sr.eot {
                break Ok(());
            }
            if timeout.is_expired() {
                self.last_error |= ERROR_ABORT;
                break Err(Error::Timeout);
            }
        };

        self.end();
        result
    }

    /// Write bytes, discarding anything received.
    pub fn write(&mut self, words: &[u8]) -> Result<()> {
        self.state.check_update(PeriphState::Idle, PeriphState::TxActive)?;
        let result = self.transfer_blocking(words, &mut [], words.len());
        self.state.set(PeriphState::Idle);
        result
    }

    /// Read bytes, sending zeros.
    pub fn read(&mut self, words: &mut [u8]) -> Result<()> {
        self.state.check_update(PeriphState::Idle, PeriphState::RxActive)?;
        let len = words.len();
        let result = self.transfer_blocking(&[], words, len);
        self.state.set(PeriphState::Idle);
        result
    }

    /// Full duplex: write `tx` while reading into `rx`. The transfer is as long as the
    /// longer of the two.
    pub fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        self.state.check_update(PeriphState::Idle, PeriphState::TxRxActive)?;
        let len = tx.len().max(rx.len());
        let result = self.transfer_blocking(tx, rx, len);
        self.state.set(PeriphState::Idle);
        result
    }

    /// Full duplex, replacing each written byte with the one read.
    pub fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<()> {
        self.state.check_update(PeriphState::Idle, PeriphState::TxRxActive)?;
        let timeout = Timeout::new(self.cfg.timeout_ms);
        let len = words.len();
        if len > MAX_TSIZE {
            self.state.set(PeriphState::Idle);
            return Err(Error::InvalidParam);
        }
        self.last_error = ERROR_NONE;
        self.begin(len);

        // Each frame is read back before the next is written, so the in-place slot
        // is never needed twice.
        let mut result = Ok(());
        for word in words.iter_mut() {
            result = self.wait_sr(|s| s.txp, &timeout);
            if result.is_err() {
                break;
            }
            self.regs.write_frame(*word);
            result = self.wait_sr(|s| s.rxp, &timeout);
            if result.is_err() {
                break;
            }
            *word = self.regs.read_frame();
        }
        if result.is_ok() && len > 0 {
            result = self.wait_sr(|s| s.eot, &timeout);
        }

        self.end();
        self.state.set(PeriphState::Idle);
        result
    }

    fn wait_sr(&mut self, done: impl Fn(&SpiStatus) -> bool, timeout: &Timeout) -> Result<()> {
        loop {
            let sr = self.regs.status();
            self.check_errors(&sr)?;
            if done(&sr) {
                return Ok(());
            }
            if timeout.is_expired() {
                return Err(Error::Timeout);
            }
        }
    }

    fn start_it(&mut self, new: PeriphState, tx: *const u8, rx: *mut u8, len: usize) -> Result<()> {
        if len == 0 || len > MAX_TSIZE {
            return Err(Error::InvalidParam);
        }
        self.state.check_update(PeriphState::Idle, new)?;

        self.last_error = ERROR_NONE;
        self.xfer = Xfer {
            tx,
            rx,
            len,
            tx_count: 0,
            rx_count: 0,
        };
        if self.cfg.comm_mode == SpiCommMode::ReceiveOnly {
            self.xfer.tx_count = len;
        }
        if self.cfg.comm_mode == SpiCommMode::TransmitOnly {
            self.xfer.rx_count = len;
        }

        self.regs.clear_flags(SpiStatus::CLEARABLE);
        self.regs.set_tsize(len as u16);
        self.regs.set_enabled(true);
        self.regs.set_interrupts(SpiInterrupts {
            rxp: self.xfer.rx_count < len,
            txp: self.xfer.tx_count < len,
            eot: true,
            errors: true,
        });
        if self.cfg.role == SpiRole::Master {
            self.regs.start();
        }
        Ok(())
    }

    /// Start sending `words` in the background. `words` must stay untouched until
    /// `on_interrupt()` reports the end of the transfer.
    pub fn write_it(&mut self, words: &[u8]) -> Result<()> {
        self.start_it(PeriphState::TxActive, words.as_ptr(), ptr::null_mut(), words.len())
    }

    /// Start receiving into `words` in the background, sending zeros.
    pub fn read_it(&mut self, words: &mut [u8]) -> Result<()> {
        let len = words.len();
        self.start_it(PeriphState::RxActive, ptr::null(), words.as_mut_ptr(), len)
    }

    /// Start a full duplex transfer in the background. `tx` and `rx` must be the same
    /// length.
    pub fn transfer_it(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        if tx.len() != rx.len() {
            return Err(Error::InvalidParam);
        }
        self.start_it(PeriphState::TxRxActive, tx.as_ptr(), rx.as_mut_ptr(), tx.len())
    }

    fn store_rx(&mut self, byte: u8) {
        if !self.xfer.rx.is_null() {
            unsafe { *self.xfer.rx.add(self.xfer.rx_count) = byte };
        }
        self.xfer.rx_count += 1;
    }

    /// Move data for an interrupt transfer. Call this from the instance's interrupt
    /// handler. Returns an event when the transfer ends.
    pub fn on_interrupt(&mut self) -> Option<SpiEvent> {
        let sr = self.regs.status();
        let ints = self.regs.interrupts();
        if !ints.any() {
            return None;
        }

        let errors = sr.errors();
        if errors != SpiStatus::NONE {
            self.regs.clear_flags(errors);
            self.last_error |= errors.error_code();
            // Overrun and mode fault stop the transfer; the rest are reported at EOT.
            if errors.ovr || errors.modf {
                return Some(self.finish_it());
            }
        }

        if self.xfer.rx_count < self.xfer.len && sr.rxp {
            let byte = self.regs.read_frame();
            self.store_rx(byte);
        }
        if self.xfer.tx_count < self.xfer.len && sr.txp {
            let byte = if self.xfer.tx.is_null() {
                0
            } else {
                unsafe { *self.xfer.tx.add(self.xfer.tx_count) }
            };
            self.regs.write_frame(byte);
            self.xfer.tx_count += 1;
            if self.xfer.tx_count == self.xfer.len {
                self.regs.set_interrupts(SpiInterrupts { txp: false, ..ints });
            }
        }

        if sr.eot {
            // Drain frames still in the FIFO.
            while self.xfer.rx_count < self.xfer.len && self.regs.status().rxp {
                let byte = self.regs.read_frame();
                self.store_rx(byte);
            }
            return Some(self.finish_it());
        }

        None
    }

    fn finish_it(&mut self) -> SpiEvent {
        self.end();

        let state = self.state.get();
        self.xfer = Xfer::empty();
        self.state.set(PeriphState::Idle);

        if self.last_error != ERROR_NONE {
            return SpiEvent::Error(self.last_error);
        }
        match state {
            PeriphState::TxActive => SpiEvent::TxComplete,
            PeriphState::RxActive => SpiEvent::RxComplete,
            _ => SpiEvent::TxRxComplete,
        }
    }

    /// Stop a transfer in progress. As master, the transfer is suspended before the
    /// peripheral is disabled.
    pub fn abort(&mut self) {
        self.state.set(PeriphState::Abort);
        self.regs.set_interrupts(SpiInterrupts::NONE);
        if self.cfg.role == SpiRole::Master && self.regs.is_started() {
            self.regs.suspend();
            let mut iters = 0;
            while !self.regs.status().susp && iters < crate::MAX_ITERS {
                iters += 1;
            }
        }
        self.regs.set_enabled(false);
        self.regs.clear_flags(SpiStatus::CLEARABLE);
        self.last_error |= ERROR_ABORT;
        self.xfer = Xfer::empty();
        self.state.set(PeriphState::Idle);
    }
}

impl<R> FullDuplexLink for Spi<R>
where
    R: Deref,
    R::Target: SpiRegs,
{
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        Spi::transfer(self, tx, rx)
    }

    fn last_error(&self) -> u32 {
        self.last_error
    }

    fn delay_ms(&mut self, ms: u32) {
        crate::tick::delay(ms);
    }
}

cfg_if! {
    if #[cfg(feature = "u5")] {
        use cortex_m::interrupt::free;

        use crate::{
            clocks::Clocks,
            pac::{self, RCC, spi1::RegisterBlock},
            util::{KernelClock, RccPeriph},
        };

        /// An SPI instance: its register block and which clock feeds it.
        pub trait SpiInstance: Deref<Target = RegisterBlock> + RccPeriph + KernelClock {}

        impl SpiInstance for pac::SPI1 {}
        impl SpiInstance for pac::SPI2 {}
        impl SpiInstance for pac::SPI3 {}

        impl SpiRegs for RegisterBlock {
            fn status(&self) -> SpiStatus {
                let sr = self.sr().read();
                SpiStatus {
                    rxp: sr.rxp().bit_is_set(),
                    txp: sr.txp().bit_is_set(),
                    eot: sr.eot().bit_is_set(),
                    txtf: sr.txtf().bit_is_set(),
                    udr: sr.udr().bit_is_set(),
                    ovr: sr.ovr().bit_is_set(),
                    crce: sr.crce().bit_is_set(),
                    tifre: sr.tifre().bit_is_set(),
                    modf: sr.modf().bit_is_set(),
                    susp: sr.susp().bit_is_set(),
                }
            }

            fn clear_flags(&self, flags: SpiStatus) {
                self.ifcr().write(|w| {
                    w.eotc().bit(flags.eot);
                    w.txtfc().bit(flags.txtf);
                    w.udrc().bit(flags.udr);
                    w.ovrc().bit(flags.ovr);
                    w.crcec().bit(flags.crce);
                    w.tifrec().bit(flags.tifre);
                    w.modfc().bit(flags.modf);
                    w.suspc().bit(flags.susp)
                });
            }

            fn interrupts(&self) -> SpiInterrupts {
                let ier = self.ier().read();
                SpiInterrupts {
                    rxp: ier.rxpie().bit_is_set(),
                    txp: ier.txpie().bit_is_set(),
                    eot: ier.eotie().bit_is_set(),
                    errors: ier.ovrie().bit_is_set(),
                }
            }

            fn set_interrupts(&self, ints: SpiInterrupts) {
                self.ier().write(|w| {
                    w.rxpie().bit(ints.rxp);
                    w.txpie().bit(ints.txp);
                    w.eotie().bit(ints.eot);
                    w.udrie().bit(ints.errors);
                    w.ovrie().bit(ints.errors);
                    w.crceie().bit(ints.errors);
                    w.tifreie().bit(ints.errors);
                    w.modfie().bit(ints.errors)
                });
            }

            // Frames are at most 8 bits, so the data registers are accessed by byte: a
            // wider access would pack several frames.
            fn read_frame(&self) -> u8 {
                unsafe { ptr::read_volatile(self.rxdr().as_ptr() as *const u8) }
            }

            fn write_frame(&self, byte: u8) {
                unsafe { ptr::write_volatile(self.txdr().as_ptr() as *mut u8, byte) };
            }

            fn set_tsize(&self, frames: u16) {
                self.cr2().write(|w| unsafe { w.tsize().bits(frames) });
            }

            fn set_enabled(&self, enabled: bool) {
                self.cr1().modify(|_, w| w.spe().bit(enabled));
            }

            fn start(&self) {
                self.cr1().modify(|_, w| w.cstart().bit(true));
            }

            fn is_started(&self) -> bool {
                self.cr1().read().cstart().bit_is_set()
            }

            fn suspend(&self) {
                self.cr1().modify(|_, w| w.csusp().bit(true));
            }

            fn set_half_duplex_tx(&self, tx: bool) {
                self.cr1().modify(|_, w| w.hddir().bit(tx));
            }

            fn configure(&self, cfg: &SpiConfig, baud_rate: BaudRate) {
                // Internal NSS high, so a software-managed master doesn't see a mode fault.
                let ssi = cfg.slave_select == SlaveSelect::Software && cfg.role == SpiRole::Master;
                self.cr1().modify(|_, w| w.ssi().bit(ssi));

                self.cfg1().write(|w| unsafe { w.dsize().bits(cfg.data_size as u8) });
                self.set_baud_rate(baud_rate);

                self.cfg2().write(|w| unsafe {
                    w.comm().bits(cfg.comm_mode as u8);
                    w.master().bit(cfg.role == SpiRole::Master);
                    w.lsbfrst().bit(cfg.lsb_first);
                    w.cpha()
                        .bit(cfg.mode.phase == SpiPhase::CaptureOnSecondTransition);
                    w.cpol().bit(cfg.mode.polarity == SpiPolarity::IdleHigh);
                    w.ssm().bit(cfg.slave_select == SlaveSelect::Software);
                    w.ssoe()
                        .bit(cfg.slave_select == SlaveSelect::HardwareOutEnable);
                    // Keep control of the pins while the SPI is disabled between transfers.
                    w.afcntr().bit(true)
                });

                self.cr2().reset();
            }

            fn set_baud_rate(&self, baud_rate: BaudRate) {
                self.cfg1().modify(|_, w| unsafe {
                    match baud_rate.mbr() {
                        Some(mbr) => {
                            w.bpass().bit(false);
                            w.mbr().bits(mbr)
                        }
                        None => w.bpass().bit(true),
                    }
                });
            }

            fn set_data_size(&self, size: DataSize) {
                self.cfg1().modify(|_, w| unsafe { w.dsize().bits(size as u8) });
            }
        }

        impl<R: SpiInstance> Spi<R> {
            /// Initialize an SPI peripheral, including configuration register writes, and
            /// enabling and resetting its RCC peripheral clock. The peripheral stays disabled
            /// until a transfer starts.
            pub fn new(regs: R, cfg: SpiConfig, baud_rate: BaudRate) -> Result<Self> {
                free(|_| {
                    let rcc = unsafe { &(*RCC::ptr()) };
                    R::en_reset(rcc);
                });

                Self::from_regs(regs, cfg, baud_rate)
            }

            /// Choose the fastest baud rate not above `max_hz`, given the kernel clock.
            pub fn new_with_freq(
                regs: R,
                cfg: SpiConfig,
                max_hz: u32,
                clock_cfg: &Clocks,
            ) -> Result<Self> {
                let br = BaudRate::from_freq(R::kernel_clock(clock_cfg), max_hz);
                Self::new(regs, cfg, br)
            }
        }
    }
}

#[cfg(feature = "embedded_hal")]
mod embedded_hal_impl {
    use embedded_hal::spi::{ErrorType, SpiBus};

    use super::*;

    impl<R> ErrorType for Spi<R> {
        type Error = Error;
    }

    impl<R> SpiBus<u8> for Spi<R>
    where
        R: Deref,
        R::Target: SpiRegs,
    {
        fn read(&mut self, words: &mut [u8]) -> Result<()> {
            Spi::read(self, words)
        }

        fn write(&mut self, words: &[u8]) -> Result<()> {
            Spi::write(self, words)
        }

        fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<()> {
            Spi::transfer(self, write, read)
        }

        fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<()> {
            Spi::transfer_in_place(self, words)
        }

        /// Blocking transfers run to EOT before returning.
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }
}
