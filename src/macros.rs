//! This module contains utility macros that are not STM32-specific, or specific
//! to this library.

/// Syntax helper for getting global variables of the form `Mutex<RefCell<Option>>>` from an interrupt-free
/// context - eg in interrupt handlers. Returns early from the enclosing function if the global
/// hasn't been initialized yet.
///
/// Example: `access_global!(DELAY, delay, cs)`
#[macro_export]
macro_rules! access_global {
    ($NAME_GLOBAL:ident, $name_local:ident, $cs:expr) => {
        let mut part1 = $NAME_GLOBAL.borrow($cs).borrow_mut();
        let Some($name_local) = part1.as_mut() else {
            return;
        };
    };
}

/// Syntax helper for setting global variables of the form `Mutex<RefCell<Option>>>`.
/// eg in interrupt handlers. Ideal for non-copy-type variables that can't be initialized
/// immediatiately.
///
/// Example: `make_globals!(
///     (I2C_HANDLE, I2c<I2C1>),
///     (BUTTON, Button<ExtiPin>),
/// )`
#[macro_export]
macro_rules! make_globals {
    ($(($NAME:ident, $type:ty)),+ $(,)?) => {
        $(
            static $NAME: ::critical_section::Mutex<core::cell::RefCell<Option<$type>>> = ::critical_section::Mutex::new(core::cell::RefCell::new(None));
        )+
    };
}

/// Initialize one or more globals inside a critical section.
///
/// Usage:
/// ```rust,ignore
/// init_globals!(
///     (I2C_HANDLE, i2c1),
///     (STATUS_LED, led),
/// );
/// ```
#[macro_export]
macro_rules! init_globals {
    ($(($NAME:ident, $val:expr)),* $(,)?) => {
        ::critical_section::with(|cs| {
            $(
                $NAME.borrow(cs).replace(Some($val));
            )*
        });
    };
}

/// Automates Cortex-M NVIC setup. The second value is NVIC priority; lower
/// is higher priority. Priorities are written to the 4 implemented bits. Example use:
/// setup_nvic!([
///     (I2C1_EV, 2),
///     (I2C1_ER, 2),
///     (EXTI13, 4),
/// ], cp);
#[macro_export]
macro_rules! setup_nvic {
    (
        [ $( ($int:ident, $prio:expr) ),* $(,)? ],
        $cp:ident
    ) => {
        unsafe {
            $(
                $cp.NVIC.set_priority(pac::Interrupt::$int, ($prio as u8) << 4);
            )*
            $(
                cortex_m::peripheral::NVIC::unmask(pac::Interrupt::$int);
            )*
        }
    };
}

/// Poll a condition until it clears, for at most `MAX_ITERS` iterations. Used when waiting on
/// a register flag that hardware should change within a few peripheral clock cycles.
///
/// Example: `bounded_loop!(regs.isr().read().bits() & ISR_TXE == 0, Error::RegisterUnchanged);`
macro_rules! bounded_loop {
    ($cond:expr, $err:expr $(,)?) => {{
        let mut iter = 0;
        while $cond {
            iter += 1;
            if iter >= $crate::MAX_ITERS {
                return Err($err);
            }
        }
    }};
}

// Logging shims: forward to `defmt` when present, otherwise evaluate nothing. This lets the
// hardware-independent modules build and test on the host.

macro_rules! trace {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::trace!($s $(, $x)*);
        #[cfg(not(feature = "defmt"))]
        let _ = ($( & $x ),*);
    }};
}

macro_rules! debug {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::debug!($s $(, $x)*);
        #[cfg(not(feature = "defmt"))]
        let _ = ($( & $x ),*);
    }};
}

macro_rules! info {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::info!($s $(, $x)*);
        #[cfg(not(feature = "defmt"))]
        let _ = ($( & $x ),*);
    }};
}

macro_rules! warn {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::warn!($s $(, $x)*);
        #[cfg(not(feature = "defmt"))]
        let _ = ($( & $x ),*);
    }};
}

macro_rules! error {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::error!($s $(, $x)*);
        #[cfg(not(feature = "defmt"))]
        let _ = ($( & $x ),*);
    }};
}
