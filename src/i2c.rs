//! Inter-Integrated Circuit (I2C) bus, as a controller or a target. Blocking transfers use a
//! millisecond timeout from `I2cConfig`; interrupt transfers are driven by `on_interrupt()`,
//! which you call from both the event and error handlers of the instance.
//!
//! TIMINGR is computed from the kernel clock by `i2c_timing`. Transfers longer than 255 bytes
//! are split with NBYTES reload.

use core::ops::Deref;

use cfg_if::cfg_if;

use crate::{
    error::{Error, Result},
    i2c_timing::{self, TimeoutAMode, Timing, TimingConfig},
    state::{HandleState, PeriphState},
    tick::Timeout,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum I2cError {
    /// Misplaced start or stop condition.
    Bus,
    /// Arbitration lost to another controller.
    Arbitration,
    /// No acknowledge from the addressed device.
    Nack,
    /// Overrun or underrun, in target mode with clock stretching disabled.
    Overrun,
    /// A target transfer ended before the buffer was filled or emptied.
    Size,
}

// Error code bitmask, as reported by `last_error()`. The values match ST's drivers.
pub const ERROR_NONE: u32 = 0;
pub const ERROR_BERR: u32 = 1 << 0;
pub const ERROR_ARLO: u32 = 1 << 1;
/// Acknowledge failure.
pub const ERROR_AF: u32 = 1 << 2;
pub const ERROR_OVR: u32 = 1 << 3;
pub const ERROR_SIZE: u32 = 1 << 4;

impl I2cError {
    /// The most significant error in a code bitmask.
    pub fn from_code(code: u32) -> Option<Self> {
        if code & ERROR_BERR != 0 {
            Some(Self::Bus)
        } else if code & ERROR_ARLO != 0 {
            Some(Self::Arbitration)
        } else if code & ERROR_AF != 0 {
            Some(Self::Nack)
        } else if code & ERROR_OVR != 0 {
            Some(Self::Overrun)
        } else if code & ERROR_SIZE != 0 {
            Some(Self::Size)
        } else {
            None
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::Bus => ERROR_BERR,
            Self::Arbitration => ERROR_ARLO,
            Self::Nack => ERROR_AF,
            Self::Overrun => ERROR_OVR,
            Self::Size => ERROR_SIZE,
        }
    }
}

/// NBYTES is 8 bits wide.
pub const MAX_NBYTES: usize = 255;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Flags read from I2C_ISR.
pub struct I2cStatus {
    pub txe: bool,
    pub txis: bool,
    pub rxne: bool,
    pub addr: bool,
    pub nackf: bool,
    pub stopf: bool,
    pub tc: bool,
    pub tcr: bool,
    pub berr: bool,
    pub arlo: bool,
    pub ovr: bool,
    pub busy: bool,
    /// Target mode: addressed for reading.
    pub dir: bool,
}

impl I2cStatus {
    pub const NONE: Self = Self {
        txe: false,
        txis: false,
        rxne: false,
        addr: false,
        nackf: false,
        stopf: false,
        tc: false,
        tcr: false,
        berr: false,
        arlo: false,
        ovr: false,
        busy: false,
        dir: false,
    };

    /// The flags cleared through I2C_ICR.
    pub const CLEARABLE: Self = Self {
        addr: true,
        nackf: true,
        stopf: true,
        berr: true,
        arlo: true,
        ovr: true,
        ..Self::NONE
    };

    /// The error code bitmask for the error flags that are set.
    pub fn error_code(&self) -> u32 {
        let mut code = ERROR_NONE;
        if self.berr {
            code |= ERROR_BERR;
        }
        if self.arlo {
            code |= ERROR_ARLO;
        }
        if self.ovr {
            code |= ERROR_OVR;
        }
        if self.nackf {
            code |= ERROR_AF;
        }
        code
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Interrupt enables in I2C_CR1.
pub struct I2cInterrupts {
    pub tx: bool,
    pub rx: bool,
    pub addr: bool,
    pub nack: bool,
    pub stop: bool,
    pub tc: bool,
    pub err: bool,
}

impl I2cInterrupts {
    pub const NONE: Self = Self {
        tx: false,
        rx: false,
        addr: false,
        nack: false,
        stop: false,
        tc: false,
        err: false,
    };

    pub fn any(&self) -> bool {
        *self != Self::NONE
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressMode {
    SevenBit,
    TenBit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Direction of a transfer, from the controller's point of view.
pub enum Direction {
    Write,
    Read,
}

/// Split a transfer of `remaining` bytes: the NBYTES value of the next chunk, and whether
/// more chunks follow it.
pub fn next_chunk(remaining: usize) -> (u8, bool) {
    if remaining > MAX_NBYTES {
        (MAX_NBYTES as u8, true)
    } else {
        (remaining as u8, false)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The NBYTES, RELOAD and AUTOEND fields of CR2, for one chunk of a controller transfer.
pub struct Chunk {
    pub nbytes: u8,
    pub reload: bool,
    pub autoend: bool,
}

impl Chunk {
    /// The next chunk with `remaining` bytes left. `autoend` only applies to the last chunk.
    pub fn next(remaining: usize, autoend: bool) -> Self {
        let (nbytes, reload) = next_chunk(remaining);
        Self {
            nbytes,
            reload,
            autoend: autoend && !reload,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Target address and direction, written to CR2 with START.
pub struct Start {
    pub addr: u16,
    pub mode: AddressMode,
    pub dir: Direction,
}

impl Start {
    /// The SADD field. A 7-bit address sits in SADD[7:1].
    pub fn sadd(&self) -> u16 {
        match self.mode {
            AddressMode::SevenBit => (self.addr & 0x7f) << 1,
            AddressMode::TenBit => self.addr & 0x3ff,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Completion reported by `on_interrupt()`.
pub enum I2cEvent {
    TxComplete,
    RxComplete,
    /// The transfer ended with errors; the value is the error code bitmask.
    Error(u32),
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct I2cConfig {
    /// SCL frequency, in Hz. Up to 1 MHz (Fast-mode Plus).
    pub speed: u32,
    pub analog_filter: bool,
    /// Digital noise filter length, in kernel clock periods. 0 to 15.
    pub digital_filter: u8,
    pub address_mode: AddressMode,
    /// Our address when operating as a target. `None` disables target mode.
    pub own_address: Option<u16>,
    /// Disable clock stretching, in target mode.
    pub no_stretch: bool,
    /// SMBus SCL-low timeout, in ns (25 to 35 ms). `None` leaves it disabled.
    pub smbus_timeout_ns: Option<u32>,
    /// Timeout for blocking transfers, in ms.
    pub timeout_ms: u32,
}

impl Default for I2cConfig {
    fn default() -> Self {
        Self {
            speed: 100_000,
            analog_filter: true,
            digital_filter: 0,
            address_mode: AddressMode::SevenBit,
            own_address: None,
            no_stretch: false,
            smbus_timeout_ns: None,
            timeout_ms: 100,
        }
    }
}

impl I2cConfig {
    /// The OAR1 OA1 field and OA1MODE for `own_address`. `None` leaves OA1EN clear.
    pub fn oa1(&self) -> Option<(u16, bool)> {
        self.own_address.map(|a| match self.address_mode {
            AddressMode::SevenBit => ((a & 0x7f) << 1, false),
            AddressMode::TenBit => (a & 0x3ff, true),
        })
    }
}

/// Register access for one I2C instance. Implemented for the PAC register block.
pub trait I2cRegs {
    fn status(&self) -> I2cStatus;
    fn interrupts(&self) -> I2cInterrupts;
    /// Write every interrupt enable bit.
    fn set_interrupts(&self, ints: I2cInterrupts);
    /// Clear the ICR-cleared flags set in `flags`.
    fn clear_flags(&self, flags: I2cStatus);
    fn read_data(&self) -> u8;
    fn write_data(&self, byte: u8);
    /// Write the address, direction and first chunk to CR2, then request START.
    fn start(&self, start: Start, chunk: Chunk);
    /// Set up the next chunk after TCR.
    fn reload(&self, chunk: Chunk);
    fn stop(&self);
    /// Clear the address, direction and chunk fields of CR2.
    fn reset_transfer(&self);
    /// Target mode: NACK the next byte received.
    fn set_nack(&self, nack: bool);
    /// Set TXE, dropping any byte in TXDR.
    fn discard_txdr(&self);
    fn set_enabled(&self, enabled: bool);
    /// Write TIMINGR, the filters, the own address and TIMEOUTR. Only while disabled.
    fn configure(&self, timing: &Timing, cfg: &I2cConfig, timeout_a: Option<u16>);
    /// Clear CR1 and every ICR flag.
    fn reset(&self);
}

#[derive(Clone, Copy)]
enum Flag {
    Txis,
    Rxne,
    Tc,
    Tcr,
    Stopf,
}

impl Flag {
    fn is_set(self, isr: &I2cStatus) -> bool {
        match self {
            Self::Txis => isr.txis,
            Self::Rxne => isr.rxne,
            Self::Tc => isr.tc,
            Self::Tcr => isr.tcr,
            Self::Stopf => isr.stopf,
        }
    }
}

/// Progress of an interrupt transfer.
struct Xfer {
    buf: *mut u8,
    len: usize,
    count: usize,
    dir: Direction,
    target: bool,
}

impl Xfer {
    const fn empty() -> Self {
        Self {
            buf: core::ptr::null_mut(),
            len: 0,
            count: 0,
            dir: Direction::Write,
            target: false,
        }
    }
}

/// Represents an Inter-Integrated Circuit (I2C) peripheral.
pub struct I2c<R> {
    pub regs: R,
    pub cfg: I2cConfig,
    state: HandleState<PeriphState>,
    last_error: u32,
    xfer: Xfer,
}

// The transfer pointer is only dereferenced while the transfer that set it is active, and the
// caller keeps that buffer borrowed until it completes or is aborted.
unsafe impl<R: Send> Send for I2c<R> {}

impl<R> I2c<R>
where
    R: Deref,
    R::Target: I2cRegs,
{
    #[cfg_attr(not(any(feature = "u5", test)), allow(dead_code))]
    fn from_regs(regs: R, cfg: I2cConfig) -> Self {
        Self {
            regs,
            cfg,
            state: HandleState::new(PeriphState::Reset),
            last_error: ERROR_NONE,
            xfer: Xfer::empty(),
        }
    }

    /// Apply `self.cfg` for a kernel clock of `clock_hz`. The peripheral is disabled while its
    /// timings are written.
    pub fn configure(&mut self, clock_hz: u32) -> Result<()> {
        if self.cfg.digital_filter > 15 {
            return Err(Error::InvalidParam);
        }
        let timing = i2c_timing::compute_timing(&TimingConfig::new(
            clock_hz,
            self.cfg.speed,
            self.cfg.analog_filter,
            self.cfg.digital_filter,
        ))?;
        let timeout_a = match self.cfg.smbus_timeout_ns {
            Some(ns) => Some(i2c_timing::timeout_a(clock_hz, ns, TimeoutAMode::SclLow)?),
            None => None,
        };

        self.regs.set_enabled(false);
        self.regs.configure(&timing, &self.cfg, timeout_a);
        self.regs.set_enabled(true);

        debug!("I2C configured. TIMINGR: {=u32:x}", timing.bits());
        Ok(())
    }

    /// Disable the peripheral and return its register block.
    pub fn deinit(self) -> R {
        self.regs.reset();
        self.regs
    }

    pub fn state(&self) -> PeriphState {
        self.state.get()
    }

    /// Error code bitmask of the last transfer. See the `ERROR_` constants.
    pub fn last_error(&self) -> u32 {
        self.last_error
    }

    /// Flush TXDR: write a dummy byte if TXIS is pending, then set TXE if TXDR isn't empty.
    fn flush_txdr(&self) {
        if self.regs.status().txis {
            self.regs.write_data(0);
        }
        if !self.regs.status().txe {
            self.regs.discard_txdr();
        }
    }

    /// Wait for a status flag. Bus error, arbitration loss and NACK are checked first: a NACK
    /// ends the transfer with STOP, so STOPF alone doesn't mean the target acknowledged.
    fn wait_flag(&mut self, flag: Flag, autoend: bool, timeout: &Timeout) -> Result<()> {
        loop {
            let isr = self.regs.status();

            if isr.berr {
                self.regs.clear_flags(I2cStatus {
                    berr: true,
                    ..I2cStatus::NONE
                });
                self.last_error |= ERROR_BERR;
                return Err(Error::I2cError(I2cError::Bus));
            } else if isr.arlo {
                self.regs.clear_flags(I2cStatus {
                    arlo: true,
                    ..I2cStatus::NONE
                });
                self.last_error |= ERROR_ARLO;
                return Err(Error::I2cError(I2cError::Arbitration));
            } else if isr.nackf {
                return self.on_nack(isr.stopf, autoend);
            } else if flag.is_set(&isr) {
                return Ok(());
            } else if timeout.is_expired() {
                return Err(Error::Timeout);
            }
        }
    }

    /// End a blocking transfer the target didn't acknowledge. Without AUTOEND, we send the
    /// STOP ourselves.
    fn on_nack(&mut self, stopf: bool, autoend: bool) -> Result<()> {
        if !stopf && !autoend {
            self.regs.stop();
        }
        bounded_loop!(!self.regs.status().stopf, Error::RegisterUnchanged);

        self.regs.clear_flags(I2cStatus {
            nackf: true,
            stopf: true,
            ..I2cStatus::NONE
        });
        self.flush_txdr();
        self.regs.reset_transfer();
        self.last_error |= ERROR_AF;
        Err(Error::I2cError(I2cError::Nack))
    }

    /// Run a controller transfer of `len` bytes, calling `data` once per byte when TXIS or
    /// RXNE is set. Ends with STOP if `autoend`; otherwise leaves the bus held after TC,
    /// for a repeated start.
    fn transfer_blocking(
        &mut self,
        addr: u16,
        dir: Direction,
        len: usize,
        autoend: bool,
        timeout: &Timeout,
        mut data: impl FnMut(&R::Target, usize),
    ) -> Result<()> {
        let start = Start {
            addr,
            mode: self.cfg.address_mode,
            dir,
        };
        let chunk = Chunk::next(len, autoend);
        self.regs.start(start, chunk);

        let flag = match dir {
            Direction::Write => Flag::Txis,
            Direction::Read => Flag::Rxne,
        };
        let mut chunk_left = chunk.nbytes as usize;

        for i in 0..len {
            if chunk_left == 0 {
                self.wait_flag(Flag::Tcr, autoend, timeout)?;
                let chunk = Chunk::next(len - i, autoend);
                self.regs.reload(chunk);
                chunk_left = chunk.nbytes as usize;
            }
            self.wait_flag(flag, autoend, timeout)?;
            data(&*self.regs, i);
            chunk_left -= 1;
        }

        if autoend {
            self.wait_flag(Flag::Stopf, autoend, timeout)?;
            self.regs.clear_flags(I2cStatus {
                stopf: true,
                ..I2cStatus::NONE
            });
            self.regs.reset_transfer();
        } else {
            self.wait_flag(Flag::Tc, autoend, timeout)?;
        }
        Ok(())
    }

    fn begin_blocking(&mut self, new: PeriphState) -> Result<Timeout> {
        self.state.check_update(PeriphState::Idle, new)?;
        self.last_error = ERROR_NONE;

        let timeout = Timeout::new(self.cfg.timeout_ms);
        while self.regs.status().busy {
            if timeout.is_expired() {
                self.state.set(PeriphState::Idle);
                return Err(Error::Busy);
            }
        }
        Ok(timeout)
    }

    /// Write bytes to a target, ending with STOP.
    pub fn write(&mut self, addr: u16, bytes: &[u8]) -> Result<()> {
        let timeout = self.begin_blocking(PeriphState::TxActive)?;
        let result = self.transfer_blocking(
            addr,
            Direction::Write,
            bytes.len(),
            true,
            &timeout,
            |regs, i| regs.write_data(bytes[i]),
        );
        self.state.set(PeriphState::Idle);
        result
    }

    /// Read bytes from a target, ending with STOP.
    pub fn read(&mut self, addr: u16, bytes: &mut [u8]) -> Result<()> {
        let timeout = self.begin_blocking(PeriphState::RxActive)?;
        let len = bytes.len();
        let result = self.transfer_blocking(
            addr,
            Direction::Read,
            len,
            true,
            &timeout,
            |regs, i| bytes[i] = regs.read_data(),
        );
        self.state.set(PeriphState::Idle);
        result
    }

    /// Write, then read after a repeated start. This is how registers are commonly read
    /// from a device: write the register address, then read its value.
    pub fn write_read(&mut self, addr: u16, bytes: &[u8], buffer: &mut [u8]) -> Result<()> {
        let timeout = self.begin_blocking(PeriphState::TxRxActive)?;

        let mut result = self.transfer_blocking(
            addr,
            Direction::Write,
            bytes.len(),
            false,
            &timeout,
            |regs, i| regs.write_data(bytes[i]),
        );
        if result.is_ok() {
            let len = buffer.len();
            result = self.transfer_blocking(
                addr,
                Direction::Read,
                len,
                true,
                &timeout,
                |regs, i| buffer[i] = regs.read_data(),
            );
        }
        self.state.set(PeriphState::Idle);
        result
    }

    /// Check whether a target acknowledges its address, trying up to `trials` times.
    pub fn is_device_ready(&mut self, addr: u16, trials: u32) -> Result<()> {
        for _ in 0..trials {
            match self.write(addr, &[]) {
                Ok(()) => return Ok(()),
                Err(Error::I2cError(I2cError::Nack)) => (),
                Err(e) => return Err(e),
            }
        }
        Err(Error::I2cError(I2cError::Nack))
    }

    fn start_it(
        &mut self,
        new: PeriphState,
        buf: *mut u8,
        len: usize,
        dir: Direction,
        target: bool,
    ) -> Result<()> {
        self.state.check_update(PeriphState::Idle, new)?;

        if !target && self.regs.status().busy {
            self.state.set(PeriphState::Idle);
            return Err(Error::Busy);
        }

        self.last_error = ERROR_NONE;
        self.xfer = Xfer {
            buf,
            len,
            count: 0,
            dir,
            target,
        };
        self.regs.clear_flags(I2cStatus::CLEARABLE);

        self.regs.set_interrupts(I2cInterrupts {
            tx: dir == Direction::Write,
            rx: dir == Direction::Read,
            addr: target,
            nack: true,
            stop: true,
            tc: !target,
            err: true,
        });
        Ok(())
    }

    fn start_controller_it(
        &mut self,
        new: PeriphState,
        addr: u16,
        buf: *mut u8,
        len: usize,
        dir: Direction,
    ) -> Result<()> {
        self.start_it(new, buf, len, dir, false)?;

        let start = Start {
            addr,
            mode: self.cfg.address_mode,
            dir,
        };
        self.regs.start(start, Chunk::next(len, true));
        Ok(())
    }

    /// Start writing `bytes` to a target. `on_interrupt()` reports `TxComplete` or
    /// `Error` once the STOP condition is sent. `bytes` must stay untouched until then.
    pub fn write_it(&mut self, addr: u16, bytes: &[u8]) -> Result<()> {
        self.start_controller_it(
            PeriphState::TxActive,
            addr,
            bytes.as_ptr() as *mut u8,
            bytes.len(),
            Direction::Write,
        )
    }

    /// Start reading from a target into `buf`; completes with `RxComplete`.
    pub fn read_it(&mut self, addr: u16, buf: &mut [u8]) -> Result<()> {
        self.start_controller_it(
            PeriphState::RxActive,
            addr,
            buf.as_mut_ptr(),
            buf.len(),
            Direction::Read,
        )
    }

    /// As a target, wait to be addressed for reading, and send `bytes`. Completes with
    /// `TxComplete` at the controller's STOP.
    pub fn slave_write_it(&mut self, bytes: &[u8]) -> Result<()> {
        if self.cfg.own_address.is_none() {
            return Err(Error::InvalidParam);
        }
        self.start_it(
            PeriphState::TxActive,
            bytes.as_ptr() as *mut u8,
            bytes.len(),
            Direction::Write,
            true,
        )?;
        self.regs.set_nack(false);
        Ok(())
    }

    /// As a target, wait to be addressed for writing, and receive into `buf`. Completes
    /// with `RxComplete` at the controller's STOP.
    pub fn slave_read_it(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.cfg.own_address.is_none() {
            return Err(Error::InvalidParam);
        }
        self.start_it(
            PeriphState::RxActive,
            buf.as_mut_ptr(),
            buf.len(),
            Direction::Read,
            true,
        )?;
        self.regs.set_nack(false);
        Ok(())
    }

    /// Handle the interrupt flags of an interrupt transfer. Call this from the instance's
    /// event and error handlers. Returns an event when the transfer ends.
    pub fn on_interrupt(&mut self) -> Option<I2cEvent> {
        let isr = self.regs.status();
        let ints = self.regs.interrupts();

        if !ints.any() {
            return None;
        }

        let bus_errors = I2cStatus {
            berr: isr.berr,
            arlo: isr.arlo,
            ovr: isr.ovr,
            ..I2cStatus::NONE
        };
        if bus_errors != I2cStatus::NONE {
            self.regs.clear_flags(bus_errors);
            self.last_error |= bus_errors.error_code();
            if isr.berr || isr.arlo {
                warn!("I2C bus error: {=u32:x}", self.last_error);
                return Some(self.finish_it());
            }
        }

        if isr.addr && ints.addr {
            if isr.dir {
                // Addressed for reading: discard anything left in TXDR.
                self.regs.discard_txdr();
            }
            self.regs.clear_flags(I2cStatus {
                addr: true,
                ..I2cStatus::NONE
            });
        }

        if isr.nackf {
            self.regs.clear_flags(I2cStatus {
                nackf: true,
                ..I2cStatus::NONE
            });
            // A controller ends its read from us with a NACK.
            let expected = self.xfer.target && self.xfer.count >= self.xfer.len;
            if !expected {
                self.last_error |= ERROR_AF;
            }
            self.flush_txdr();
        } else if isr.txis && ints.tx {
            let byte = if self.xfer.count < self.xfer.len {
                let b = unsafe { *self.xfer.buf.add(self.xfer.count) };
                self.xfer.count += 1;
                b
            } else {
                0xff
            };
            self.regs.write_data(byte);
        } else if isr.rxne && ints.rx {
            let byte = self.regs.read_data();
            if self.xfer.count < self.xfer.len {
                unsafe { *self.xfer.buf.add(self.xfer.count) = byte };
                self.xfer.count += 1;
            }
        }

        if isr.tcr && !self.xfer.target {
            self.regs
                .reload(Chunk::next(self.xfer.len - self.xfer.count, true));
        } else if isr.tc && !self.xfer.target {
            self.regs.stop();
        }

        if isr.stopf {
            self.regs.clear_flags(I2cStatus {
                stopf: true,
                ..I2cStatus::NONE
            });
            if self.xfer.target && self.xfer.count < self.xfer.len {
                self.last_error |= ERROR_SIZE;
            }
            return Some(self.finish_it());
        }

        None
    }

    fn finish_it(&mut self) -> I2cEvent {
        self.regs.set_interrupts(I2cInterrupts::NONE);
        self.regs.reset_transfer();
        self.flush_txdr();

        let dir = self.xfer.dir;
        self.xfer = Xfer::empty();
        self.state.set(PeriphState::Idle);

        if self.last_error != ERROR_NONE {
            I2cEvent::Error(self.last_error)
        } else if dir == Direction::Write {
            I2cEvent::TxComplete
        } else {
            I2cEvent::RxComplete
        }
    }

    /// Stop an interrupt transfer. As a controller, a STOP condition is sent if the bus
    /// is still held.
    pub fn abort(&mut self) {
        self.state.set(PeriphState::Abort);
        self.regs.set_interrupts(I2cInterrupts::NONE);
        if !self.xfer.target && self.regs.status().busy {
            self.regs.stop();
        }
        self.regs.clear_flags(I2cStatus::CLEARABLE);
        self.regs.reset_transfer();
        self.flush_txdr();
        self.xfer = Xfer::empty();
        self.state.set(PeriphState::Idle);
    }
}

cfg_if! {
    if #[cfg(feature = "u5")] {
        use cortex_m::interrupt::free;

        use crate::{
            clocks::Clocks,
            pac::{self, RCC, i2c1::RegisterBlock},
            util::{KernelClock, RccPeriph},
        };

        /// An I2C instance: its register block, and which clock feeds it.
        pub trait I2cInstance: Deref<Target = RegisterBlock> + RccPeriph + KernelClock {}

        impl I2cInstance for pac::I2C1 {}
        impl I2cInstance for pac::I2C2 {}
        impl I2cInstance for pac::I2C3 {}
        #[cfg(i2c4)]
        impl I2cInstance for pac::I2C4 {}

        impl I2cRegs for RegisterBlock {
            fn status(&self) -> I2cStatus {
                let isr = self.isr().read();
                I2cStatus {
                    txe: isr.txe().bit_is_set(),
                    txis: isr.txis().bit_is_set(),
                    rxne: isr.rxne().bit_is_set(),
                    addr: isr.addr().bit_is_set(),
                    nackf: isr.nackf().bit_is_set(),
                    stopf: isr.stopf().bit_is_set(),
                    tc: isr.tc().bit_is_set(),
                    tcr: isr.tcr().bit_is_set(),
                    berr: isr.berr().bit_is_set(),
                    arlo: isr.arlo().bit_is_set(),
                    ovr: isr.ovr().bit_is_set(),
                    busy: isr.busy().bit_is_set(),
                    dir: isr.dir().bit_is_set(),
                }
            }

            fn interrupts(&self) -> I2cInterrupts {
                let cr1 = self.cr1().read();
                I2cInterrupts {
                    tx: cr1.txie().bit_is_set(),
                    rx: cr1.rxie().bit_is_set(),
                    addr: cr1.addrie().bit_is_set(),
                    nack: cr1.nackie().bit_is_set(),
                    stop: cr1.stopie().bit_is_set(),
                    tc: cr1.tcie().bit_is_set(),
                    err: cr1.errie().bit_is_set(),
                }
            }

            fn set_interrupts(&self, ints: I2cInterrupts) {
                self.cr1().modify(|_, w| {
                    w.txie().bit(ints.tx);
                    w.rxie().bit(ints.rx);
                    w.addrie().bit(ints.addr);
                    w.nackie().bit(ints.nack);
                    w.stopie().bit(ints.stop);
                    w.tcie().bit(ints.tc);
                    w.errie().bit(ints.err)
                });
            }

            fn clear_flags(&self, flags: I2cStatus) {
                self.icr().write(|w| {
                    w.addrcf().bit(flags.addr);
                    w.nackcf().bit(flags.nackf);
                    w.stopcf().bit(flags.stopf);
                    w.berrcf().bit(flags.berr);
                    w.arlocf().bit(flags.arlo);
                    w.ovrcf().bit(flags.ovr)
                });
            }

            fn read_data(&self) -> u8 {
                self.rxdr().read().rxdata().bits()
            }

            fn write_data(&self, byte: u8) {
                self.txdr().write(|w| unsafe { w.txdata().bits(byte) });
            }

            fn start(&self, start: Start, chunk: Chunk) {
                self.cr2().write(|w| unsafe {
                    w.sadd().bits(start.sadd());
                    w.add10().bit(start.mode == AddressMode::TenBit);
                    w.rd_wrn().bit(start.dir == Direction::Read);
                    w.nbytes().bits(chunk.nbytes);
                    w.reload().bit(chunk.reload);
                    w.autoend().bit(chunk.autoend);
                    w.start().bit(true)
                });
            }

            fn reload(&self, chunk: Chunk) {
                self.cr2().modify(|_, w| unsafe {
                    w.nbytes().bits(chunk.nbytes);
                    w.reload().bit(chunk.reload);
                    w.autoend().bit(chunk.autoend)
                });
            }

            fn stop(&self) {
                self.cr2().modify(|_, w| w.stop().bit(true));
            }

            fn reset_transfer(&self) {
                self.cr2().modify(|_, w| unsafe {
                    w.sadd().bits(0);
                    w.rd_wrn().bit(false);
                    w.add10().bit(false);
                    w.nbytes().bits(0);
                    w.reload().bit(false);
                    w.autoend().bit(false)
                });
            }

            fn set_nack(&self, nack: bool) {
                self.cr2().modify(|_, w| w.nack().bit(nack));
            }

            fn discard_txdr(&self) {
                self.isr().modify(|_, w| w.txe().bit(true));
            }

            fn set_enabled(&self, enabled: bool) {
                self.cr1().modify(|_, w| w.pe().bit(enabled));
            }

            fn configure(&self, timing: &Timing, cfg: &I2cConfig, timeout_a: Option<u16>) {
                self.timingr().write(|w| unsafe {
                    w.presc().bits(timing.presc);
                    w.scldel().bits(timing.scldel);
                    w.sdadel().bits(timing.sdadel);
                    w.sclh().bits(timing.sclh);
                    w.scll().bits(timing.scll)
                });

                self.cr1().modify(|_, w| unsafe {
                    w.dnf().bits(cfg.digital_filter);
                    w.anfoff().bit(!cfg.analog_filter);
                    w.nostretch().bit(cfg.no_stretch)
                });

                // OA1EN must be clear while the address is written.
                self.oar1().reset();
                if let Some((oa1, ten_bit)) = cfg.oa1() {
                    self.oar1().write(|w| unsafe {
                        w.oa1().bits(oa1);
                        w.oa1mode().bit(ten_bit);
                        w.oa1en().bit(true)
                    });
                }

                match timeout_a {
                    Some(t) => {
                        self.timeoutr().write(|w| unsafe {
                            w.timeouta().bits(t);
                            w.timouten().bit(true)
                        });
                    }
                    None => {
                        self.timeoutr().reset();
                    }
                }
            }

            fn reset(&self) {
                self.cr1().reset();
                self.clear_flags(I2cStatus::CLEARABLE);
            }
        }

        impl<R: I2cInstance> I2c<R> {
            /// Initialize an I2C peripheral, including configuration register writes, and enabling
            /// and resetting its RCC peripheral clock.
            pub fn new(regs: R, cfg: I2cConfig, clock_cfg: &Clocks) -> Result<Self> {
                free(|_| {
                    let rcc = unsafe { &(*RCC::ptr()) };
                    R::en_reset(rcc);
                });

                let mut result = Self::from_regs(regs, cfg);
                result.set_config(clock_cfg)?;
                result.state.set(PeriphState::Idle);

                Ok(result)
            }

            /// Apply `self.cfg`, from the instance's kernel clock.
            pub fn set_config(&mut self, clock_cfg: &Clocks) -> Result<()> {
                self.configure(R::kernel_clock(clock_cfg))
            }
        }
    }
}

#[cfg(feature = "embedded_hal")]
mod embedded_hal_impl {
    use embedded_hal::i2c::{ErrorType, I2c as I2cTrait, Operation, SevenBitAddress};

    use super::*;

    impl<R> ErrorType for I2c<R> {
        type Error = Error;
    }

    impl<R> I2cTrait<SevenBitAddress> for I2c<R>
    where
        R: Deref,
        R::Target: I2cRegs,
    {
        fn read(&mut self, address: u8, read: &mut [u8]) -> Result<()> {
            I2c::read(self, address as u16, read)
        }

        fn write(&mut self, address: u8, write: &[u8]) -> Result<()> {
            I2c::write(self, address as u16, write)
        }

        fn write_read(&mut self, address: u8, write: &[u8], read: &mut [u8]) -> Result<()> {
            I2c::write_read(self, address as u16, write, read)
        }

        /// Each operation starts with a (repeated) start; STOP follows the last one.
        fn transaction(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<()> {
            let timeout = self.begin_blocking(PeriphState::TxRxActive)?;
            let last = operations.len().saturating_sub(1);
            let mut result = Ok(());

            for (i, op) in operations.iter_mut().enumerate() {
                let autoend = i == last;
                result = match op {
                    Operation::Write(bytes) => self.transfer_blocking(
                        address as u16,
                        Direction::Write,
                        bytes.len(),
                        autoend,
                        &timeout,
                        |regs, j| regs.write_data(bytes[j]),
                    ),
                    Operation::Read(buf) => {
                        let len = buf.len();
                        self.transfer_blocking(
                            address as u16,
                            Direction::Read,
                            len,
                            autoend,
                            &timeout,
                            |regs, j| buf[j] = regs.read_data(),
                        )
                    }
                };
                if result.is_err() {
                    break;
                }
            }
            self.state.set(PeriphState::Idle);
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use core::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    use super::*;

    /// I2C register model. Tests raise status flags directly; `respond` flags are raised on
    /// each START, standing in for the target.
    #[derive(Default)]
    struct FakeI2c {
        isr: Cell<I2cStatus>,
        ints: Cell<I2cInterrupts>,
        respond: Cell<I2cStatus>,
        rx: RefCell<VecDeque<u8>>,
        tx: RefCell<Vec<u8>>,
        starts: RefCell<Vec<(Start, Chunk)>>,
        reloads: RefCell<Vec<Chunk>>,
        stops: Cell<u32>,
        nack: Cell<bool>,
    }

    impl FakeI2c {
        fn raise(&self, flags: I2cStatus) {
            self.isr.set(flags);
        }
    }

    impl I2cRegs for FakeI2c {
        fn status(&self) -> I2cStatus {
            self.isr.get()
        }

        fn interrupts(&self) -> I2cInterrupts {
            self.ints.get()
        }

        fn set_interrupts(&self, ints: I2cInterrupts) {
            self.ints.set(ints);
        }

        fn clear_flags(&self, flags: I2cStatus) {
            let mut isr = self.isr.get();
            isr.addr &= !flags.addr;
            isr.nackf &= !flags.nackf;
            isr.stopf &= !flags.stopf;
            isr.berr &= !flags.berr;
            isr.arlo &= !flags.arlo;
            isr.ovr &= !flags.ovr;
            self.isr.set(isr);
        }

        fn read_data(&self) -> u8 {
            self.rx.borrow_mut().pop_front().unwrap_or(0)
        }

        fn write_data(&self, byte: u8) {
            self.tx.borrow_mut().push(byte);
        }

        fn start(&self, start: Start, chunk: Chunk) {
            self.starts.borrow_mut().push((start, chunk));
            let respond = self.respond.get();
            if respond != I2cStatus::NONE {
                self.isr.set(respond);
            }
        }

        fn reload(&self, chunk: Chunk) {
            self.reloads.borrow_mut().push(chunk);
        }

        fn stop(&self) {
            self.stops.set(self.stops.get() + 1);
        }

        fn reset_transfer(&self) {}

        fn set_nack(&self, nack: bool) {
            self.nack.set(nack);
        }

        fn discard_txdr(&self) {
            let mut isr = self.isr.get();
            isr.txe = true;
            self.isr.set(isr);
        }

        fn set_enabled(&self, _enabled: bool) {}

        fn configure(&self, _timing: &Timing, _cfg: &I2cConfig, _timeout_a: Option<u16>) {}

        fn reset(&self) {}
    }

    fn i2c(fake: &FakeI2c, cfg: I2cConfig) -> I2c<&FakeI2c> {
        let i2c = I2c::from_regs(fake, cfg);
        i2c.state.set(PeriphState::Idle);
        i2c
    }

    fn flags(f: impl FnOnce(&mut I2cStatus)) -> I2cStatus {
        let mut s = I2cStatus::NONE;
        f(&mut s);
        s
    }

    #[test]
    fn chunks() {
        assert_eq!(next_chunk(0), (0, false));
        assert_eq!(next_chunk(10), (10, false));
        assert_eq!(next_chunk(255), (255, false));
        assert_eq!(next_chunk(256), (255, true));

        // AUTOEND waits for the last chunk.
        assert_eq!(
            Chunk::next(300, true),
            Chunk {
                nbytes: 255,
                reload: true,
                autoend: false
            }
        );
        assert_eq!(
            Chunk::next(45, true),
            Chunk {
                nbytes: 45,
                reload: false,
                autoend: true
            }
        );
    }

    #[test]
    fn addresses() {
        let start = Start {
            addr: 0x42,
            mode: AddressMode::SevenBit,
            dir: Direction::Write,
        };
        assert_eq!(start.sadd(), 0x84);

        let start = Start {
            addr: 0x2a5,
            mode: AddressMode::TenBit,
            dir: Direction::Read,
        };
        assert_eq!(start.sadd(), 0x2a5);
    }

    #[test]
    fn error_codes() {
        assert_eq!(I2cStatus::NONE.error_code(), ERROR_NONE);
        assert_eq!(
            flags(|s| {
                s.berr = true;
                s.nackf = true;
            })
            .error_code(),
            ERROR_BERR | ERROR_AF
        );
        assert_eq!(
            flags(|s| {
                s.ovr = true;
                s.txe = true;
            })
            .error_code(),
            ERROR_OVR
        );

        assert_eq!(I2cError::from_code(ERROR_AF | ERROR_OVR), Some(I2cError::Nack));
        assert_eq!(I2cError::from_code(ERROR_SIZE), Some(I2cError::Size));
        assert_eq!(I2cError::from_code(ERROR_NONE), None);
        assert_eq!(I2cError::Arbitration.code(), ERROR_ARLO);
    }

    #[test]
    fn own_address() {
        let mut cfg = I2cConfig::default();
        assert_eq!(cfg.oa1(), None);

        cfg.own_address = Some(0x30);
        assert_eq!(cfg.oa1(), Some((0x60, false)));

        cfg.address_mode = AddressMode::TenBit;
        cfg.own_address = Some(0x3ff);
        assert_eq!(cfg.oa1(), Some((0x3ff, true)));
    }

    #[test]
    fn absent_device_is_not_ready() {
        // NACK, then the automatic STOP: both flags are set by the time we look.
        let fake = FakeI2c::default();
        fake.respond.set(flags(|s| {
            s.nackf = true;
            s.stopf = true;
        }));
        let mut i2c = i2c(&fake, I2cConfig::default());

        assert_eq!(
            i2c.is_device_ready(0x50, 3),
            Err(Error::I2cError(I2cError::Nack))
        );
        assert_eq!(fake.starts.borrow().len(), 3);
        assert!(!fake.isr.get().nackf);
        assert!(!fake.isr.get().stopf);
        assert_eq!(i2c.last_error(), ERROR_AF);
        assert_eq!(i2c.state(), PeriphState::Idle);
    }

    #[test]
    fn present_device_is_ready() {
        let fake = FakeI2c::default();
        fake.respond.set(flags(|s| s.stopf = true));
        let mut i2c = i2c(&fake, I2cConfig::default());

        assert_eq!(i2c.is_device_ready(0x50, 3), Ok(()));
        assert_eq!(fake.starts.borrow().len(), 1);
        assert_eq!(fake.starts.borrow()[0].1.nbytes, 0);
        assert!(!fake.isr.get().stopf);
    }

    #[test]
    fn nack_wins_over_data_flag() {
        let fake = FakeI2c::default();
        fake.respond.set(flags(|s| {
            s.txis = true;
            s.nackf = true;
            s.stopf = true;
        }));
        let mut i2c = i2c(&fake, I2cConfig::default());

        assert_eq!(
            i2c.write(0x50, &[1, 2, 3]),
            Err(Error::I2cError(I2cError::Nack))
        );
        // Only the dummy byte that flushes TXDR.
        assert_eq!(*fake.tx.borrow(), [0]);
        assert!(!fake.isr.get().nackf);
    }

    #[test]
    fn nack_without_autoend_sends_stop() {
        let fake = FakeI2c::default();
        // The STOP we request shows up as STOPF.
        fake.raise(flags(|s| {
            s.nackf = true;
            s.stopf = true;
        }));
        let mut i2c = i2c(&fake, I2cConfig::default());

        assert_eq!(i2c.on_nack(false, false), Err(Error::I2cError(I2cError::Nack)));
        assert_eq!(fake.stops.get(), 1);
        assert!(!fake.isr.get().nackf);

        // With AUTOEND, the hardware sends it.
        fake.raise(flags(|s| {
            s.nackf = true;
            s.stopf = true;
        }));
        assert!(i2c.on_nack(false, true).is_err());
        assert_eq!(fake.stops.get(), 1);
    }

    #[test]
    fn bus_error_ends_blocking_write() {
        let fake = FakeI2c::default();
        fake.respond.set(flags(|s| s.berr = true));
        let mut i2c = i2c(&fake, I2cConfig::default());

        assert_eq!(i2c.write(0x50, &[1]), Err(Error::I2cError(I2cError::Bus)));
        assert!(!fake.isr.get().berr);
        assert_eq!(i2c.last_error(), ERROR_BERR);
        assert_eq!(i2c.state(), PeriphState::Idle);
    }

    #[test]
    fn blocking_write_read() {
        let fake = FakeI2c::default();
        fake.respond.set(flags(|s| {
            s.txis = true;
            s.rxne = true;
            s.tc = true;
            s.stopf = true;
        }));
        fake.rx.borrow_mut().extend([0xaa, 0xbb]);
        let mut i2c = i2c(&fake, I2cConfig::default());

        let mut buf = [0; 2];
        i2c.write_read(0x50, &[0x10], &mut buf).unwrap();

        assert_eq!(*fake.tx.borrow(), [0x10]);
        assert_eq!(buf, [0xaa, 0xbb]);
        let starts = fake.starts.borrow();
        assert_eq!(starts[0].0.dir, Direction::Write);
        assert!(!starts[0].1.autoend);
        assert_eq!(starts[1].0.dir, Direction::Read);
        assert!(starts[1].1.autoend);
        assert_eq!(i2c.state(), PeriphState::Idle);
    }

    #[test]
    fn write_it_completes() {
        let fake = FakeI2c::default();
        let mut i2c = i2c(&fake, I2cConfig::default());
        let data = [1, 2, 3];

        i2c.write_it(0x50, &data).unwrap();
        assert_eq!(i2c.state(), PeriphState::TxActive);
        assert!(fake.ints.get().tx && fake.ints.get().err && fake.ints.get().stop);
        assert_eq!(i2c.write_it(0x50, &data), Err(Error::Busy));

        for _ in 0..3 {
            fake.raise(flags(|s| s.txis = true));
            assert_eq!(i2c.on_interrupt(), None);
        }
        assert_eq!(*fake.tx.borrow(), data);

        fake.raise(flags(|s| s.stopf = true));
        assert_eq!(i2c.on_interrupt(), Some(I2cEvent::TxComplete));
        assert_eq!(i2c.state(), PeriphState::Idle);
        assert!(!fake.ints.get().any());

        // Nothing enabled: stray interrupts are ignored.
        fake.raise(flags(|s| s.stopf = true));
        assert_eq!(i2c.on_interrupt(), None);
    }

    #[test]
    fn write_it_nack_returns_to_idle() {
        let fake = FakeI2c::default();
        let mut i2c = i2c(&fake, I2cConfig::default());
        i2c.write_it(0x50, &[1, 2]).unwrap();

        fake.raise(flags(|s| {
            s.nackf = true;
            s.stopf = true;
        }));
        assert_eq!(i2c.on_interrupt(), Some(I2cEvent::Error(ERROR_AF)));
        assert!(!fake.isr.get().nackf);
        assert_eq!(i2c.state(), PeriphState::Idle);
        assert!(!fake.ints.get().any());

        // Usable again.
        assert!(i2c.write_it(0x50, &[1]).is_ok());
    }

    #[test]
    fn bus_error_ends_interrupt_transfer() {
        let fake = FakeI2c::default();
        let mut i2c = i2c(&fake, I2cConfig::default());
        let mut buf = [0; 4];
        i2c.read_it(0x50, &mut buf).unwrap();

        fake.raise(flags(|s| s.arlo = true));
        assert_eq!(i2c.on_interrupt(), Some(I2cEvent::Error(ERROR_ARLO)));
        assert_eq!(i2c.state(), PeriphState::Idle);
        assert!(!fake.isr.get().arlo);
    }

    #[test]
    fn read_it_reloads_long_transfers() {
        let fake = FakeI2c::default();
        let mut i2c = i2c(&fake, I2cConfig::default());
        fake.rx.borrow_mut().extend((0..300).map(|i| i as u8));
        let mut buf = [0; 300];

        i2c.read_it(0x50, &mut buf).unwrap();
        assert_eq!(fake.starts.borrow()[0].1, Chunk::next(300, true));

        for i in 0..300 {
            if i == 255 {
                fake.raise(flags(|s| s.tcr = true));
                assert_eq!(i2c.on_interrupt(), None);
            }
            fake.raise(flags(|s| s.rxne = true));
            assert_eq!(i2c.on_interrupt(), None);
        }
        assert_eq!(*fake.reloads.borrow(), [Chunk::next(45, true)]);

        fake.raise(flags(|s| s.stopf = true));
        assert_eq!(i2c.on_interrupt(), Some(I2cEvent::RxComplete));
        assert!(buf.iter().enumerate().all(|(i, &b)| b == i as u8));
    }

    #[test]
    fn target_receive_short() {
        let fake = FakeI2c::default();
        let cfg = I2cConfig {
            own_address: Some(0x30),
            ..Default::default()
        };
        let mut i2c = i2c(&fake, cfg);
        fake.rx.borrow_mut().extend([7, 8]);
        let mut buf = [0; 4];

        i2c.slave_read_it(&mut buf).unwrap();
        assert!(fake.ints.get().addr);
        assert!(!fake.nack.get());

        fake.raise(flags(|s| s.addr = true));
        assert_eq!(i2c.on_interrupt(), None);
        assert!(!fake.isr.get().addr);

        for _ in 0..2 {
            fake.raise(flags(|s| s.rxne = true));
            assert_eq!(i2c.on_interrupt(), None);
        }
        fake.raise(flags(|s| s.stopf = true));
        assert_eq!(i2c.on_interrupt(), Some(I2cEvent::Error(ERROR_SIZE)));
        assert_eq!(buf[..2], [7, 8]);
        assert_eq!(i2c.state(), PeriphState::Idle);
    }

    #[test]
    fn target_needs_own_address() {
        let fake = FakeI2c::default();
        let mut i2c = i2c(&fake, I2cConfig::default());
        assert_eq!(i2c.slave_write_it(&[1]), Err(Error::InvalidParam));
        assert_eq!(i2c.state(), PeriphState::Idle);
    }

    #[test]
    fn abort_returns_to_idle() {
        let fake = FakeI2c::default();
        let mut i2c = i2c(&fake, I2cConfig::default());
        i2c.write_it(0x50, &[1, 2]).unwrap();

        fake.raise(flags(|s| s.busy = true));
        i2c.abort();
        assert_eq!(i2c.state(), PeriphState::Idle);
        assert_eq!(fake.stops.get(), 1);
        assert!(!fake.ints.get().any());
    }
}
