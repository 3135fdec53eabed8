//! Common error definitions.

use crate::{
    clocks::RccError, dlyb::DlybError, fdcan_timing::FdcanTimingError, i2c_timing::I2cTimingError,
    i2c::I2cError, iwdg::IwdgError, os::OsError, spi::SpiError, timer::TimerError,
    usart::UsartError, wwdg::WwdgError,
};

macro_rules! impl_from_error {
    ($error:ident) => {
        impl From<$error> for Error {
            fn from(error: $error) -> Self {
                Self::$error(error)
            }
        }
    };
}

/// Alias for Result<T, Error>.
pub type Result<T> = core::result::Result<T, Error>;

/// Collection of all errors that can occur.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Occurs when an expected change of a register does not happen in time.
    ///
    /// This is returned when a bounded loop exceeds its alotted iteration count.
    RegisterUnchanged,
    /// A handle was not in the state an operation requires; eg a transfer is already
    /// in progress.
    Busy,
    /// A millisecond timeout, measured against the tick counter, elapsed.
    Timeout,
    /// An argument was out of range for this peripheral.
    InvalidParam,
    I2cError(I2cError),
    UsartError(UsartError),
    /// SPI errors.
    SpiError(SpiError),
    TimerError(TimerError),
    /// Clock errors.
    RccError(RccError),
    DlybError(DlybError),
    IwdgError(IwdgError),
    WwdgError(WwdgError),
    OsError(OsError),
    FdcanTimingError(FdcanTimingError),
    I2cTimingError(I2cTimingError),
}

impl_from_error!(I2cError);
impl_from_error!(UsartError);
impl_from_error!(SpiError);
impl_from_error!(TimerError);
impl_from_error!(RccError);
impl_from_error!(DlybError);
impl_from_error!(IwdgError);
impl_from_error!(WwdgError);
impl_from_error!(OsError);
impl_from_error!(FdcanTimingError);
impl_from_error!(I2cTimingError);

/// Status codes as reported over a C-compatible boundary, or in logs. These keep the
/// numeric values used by ST's driver package, so a status read out with a debugger
/// means the same thing on both sides.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum HalStatus {
    Ok = 0,
    Error = 0xFFFF_FFFF,
    Busy = 0x5555_5555,
    InvalidParam = 0xAAAA_AAAA,
    Timeout = 0x5A5A_5A5A,
}

impl From<&Error> for HalStatus {
    fn from(error: &Error) -> Self {
        match error {
            Error::Busy => Self::Busy,
            Error::InvalidParam => Self::InvalidParam,
            Error::Timeout | Error::RegisterUnchanged => Self::Timeout,
            Error::OsError(OsError::Timeout) => Self::Timeout,
            Error::OsError(OsError::InIsr) => Self::InvalidParam,
            _ => Self::Error,
        }
    }
}

impl<T> From<&Result<T>> for HalStatus {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(e) => e.into(),
        }
    }
}

#[cfg(feature = "embedded_hal")]
mod embedded_io_impl {
    use embedded_hal::i2c::{Error as I2cEhError, ErrorKind as I2cErrorKind, NoAcknowledgeSource};
    use embedded_hal::spi::{Error as SpiEhError, ErrorKind as SpiErrorKind};
    use embedded_io::{Error as IoError, ErrorKind as IoErrorKind};

    use super::{Error, I2cError, SpiError, UsartError};

    impl I2cEhError for Error {
        fn kind(&self) -> I2cErrorKind {
            match self {
                Error::I2cError(i) => match i {
                    I2cError::Bus => I2cErrorKind::Bus,
                    I2cError::Arbitration => I2cErrorKind::ArbitrationLoss,
                    I2cError::Nack => I2cErrorKind::NoAcknowledge(NoAcknowledgeSource::Unknown),
                    I2cError::Overrun => I2cErrorKind::Overrun,
                    _ => I2cErrorKind::Other,
                },
                _ => I2cErrorKind::Other,
            }
        }
    }

    impl SpiEhError for Error {
        fn kind(&self) -> SpiErrorKind {
            match self {
                Error::SpiError(s) => match s {
                    SpiError::Overrun => SpiErrorKind::Overrun,
                    SpiError::ModeFault => SpiErrorKind::ModeFault,
                    _ => SpiErrorKind::Other,
                },
                _ => SpiErrorKind::Other,
            }
        }
    }

    impl IoError for Error {
        fn kind(&self) -> IoErrorKind {
            match self {
                Error::RegisterUnchanged | Error::Timeout => IoErrorKind::TimedOut,
                Error::InvalidParam => IoErrorKind::InvalidInput,
                Error::UsartError(u) => match u {
                    UsartError::Framing => IoErrorKind::Other,
                    UsartError::Noise => IoErrorKind::Other,
                    UsartError::Overrun => IoErrorKind::OutOfMemory,
                    UsartError::Parity => IoErrorKind::InvalidData,
                },
                _ => IoErrorKind::Other,
            }
        }
    }
}
