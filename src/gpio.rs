//! This module provides functionality for General Purpose Input and Output (GPIO) pins,
//! including all GPIOx register functions, and EXTI interrupts.
//! It includes implementations of `embedded-hal` pin abstraction.
//!
//! The configuration enums build without a device feature; the part drivers use `PinState`
//! and `Edge` on the host.

use cfg_if::cfg_if;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Values for `GPIOx_MODER`. Sets whether a pin is input, output, alternate function, or analog.
pub enum PinMode {
    Input,
    Output,
    Alt(u8),
    Analog,
}

impl PinMode {
    /// We use this function to find the value bits due to being unable to repr(u8) with
    /// the wrapped `AltFn` value.
    pub fn val(&self) -> u8 {
        match self {
            Self::Input => 0b00,
            Self::Output => 0b01,
            Self::Alt(_) => 0b10,
            Self::Analog => 0b11,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
/// Values for `GPIOx_OTYPER`.
pub enum OutputType {
    PushPull = 0,
    OpenDrain = 1,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
/// Values for `GPIOx_OSPEEDR`. This configures I/O output speed. See the user manual
/// for your MCU for what speeds these are. Note that Fast speed (0b10) is not
/// available on all STM32 families.
pub enum OutputSpeed {
    Low = 0b00,
    Medium = 0b01,
    High = 0b10,
    VeryHigh = 0b11,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
/// Values for `GPIOx_PUPDR`. Sets if the pin uses the internal pull-up or pull-down
// resistor.
pub enum Pull {
    Floating = 0b00,
    Up = 0b01,
    Dn = 0b10,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
/// Values for `GPIOx_IDR` and `GPIOx_ODR`.
pub enum PinState {
    High = 1,
    Low = 0,
}

impl PinState {
    pub fn toggled(self) -> Self {
        match self {
            Self::High => Self::Low,
            Self::Low => Self::High,
        }
    }
}

impl From<bool> for PinState {
    fn from(high: bool) -> Self {
        if high { Self::High } else { Self::Low }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// GPIO port letter. Ports above E aren't bonded out on every package.
pub enum Port {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
    I,
}

impl Port {
    /// The index used in `RCC_AHB2ENR1` and `EXTI_EXTICRx`. RM0456, section 24.6.
    pub fn index(&self) -> u8 {
        match self {
            Self::A => 0,
            Self::B => 1,
            Self::C => 2,
            Self::D => 3,
            Self::E => 4,
            Self::F => 5,
            Self::G => 6,
            Self::H => 7,
            Self::I => 8,
        }
    }

    pub fn from_index(i: u8) -> Option<Self> {
        Some(match i {
            0 => Self::A,
            1 => Self::B,
            2 => Self::C,
            3 => Self::D,
            4 => Self::E,
            5 => Self::F,
            6 => Self::G,
            7 => Self::H,
            8 => Self::I,
            _ => return None,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The pulse edge used to trigger interrupts. Either can be specified.
pub enum Edge {
    Rising,
    Falling,
    Either,
}

impl Edge {
    /// (rising trigger, falling trigger) enable bits.
    pub fn triggers(&self) -> (bool, bool) {
        match self {
            Self::Rising => (true, false),
            Self::Falling => (false, true),
            Self::Either => (true, true),
        }
    }
}

cfg_if! {
    if #[cfg(feature = "u5")] {
        #[cfg(feature = "embedded_hal")]
        use core::convert::Infallible;

        use paste::paste;

        use crate::{
            error::{Error, Result},
            pac::{self, EXTI, PWR, RCC},
            util::{rcc_en, rcc_en_reset},
        };

        #[cfg(feature = "embedded_hal")]
        use embedded_hal::digital::{ErrorType, InputPin, OutputPin, StatefulOutputPin};

        /// Write a per-pin field, eg `MODE3` of `MODER`. `$bit` is `bit` or `bits`.
        macro_rules! set_field {
            ($pin:expr, $regs:expr, $reg:ident, $field:ident, $bit:ident, $val:expr, [$($num:literal),+]) => {
                paste! {
                    // Unsafe may or may not be required, depending on the field.
                    #[allow(unused_unsafe)]
                    unsafe {
                        match $pin {
                            $(
                                $num => {
                                    $regs.$reg().modify(|_, w| w.[<$field $num>]().$bit($val));
                                }
                            )+
                            _ => unreachable!(),
                        }
                    }
                }
            };
        }

        /// Route an EXTI line to a port, and set its trigger edges.
        macro_rules! set_exti {
            ($line:expr, $exti:expr, $port:expr, $rise:expr, $fall:expr, [$(($num:literal, $crnum:literal)),+]) => {
                paste! {
                    match $line {
                        $(
                            $num => {
                                $exti.[<exticr $crnum>]().modify(|_, w| unsafe { w.[<exti $num>]().bits($port) });
                                $exti.rtsr1().modify(|_, w| w.[<rt $num>]().bit($rise));
                                $exti.ftsr1().modify(|_, w| w.[<ft $num>]().bit($fall));
                            }
                        )+
                        _ => unreachable!(),
                    }
                }
            };
        }

        /// Read the port an EXTI line is routed to.
        macro_rules! get_exti_port {
            ($line:expr, $exti:expr, [$(($num:literal, $crnum:literal)),+]) => {
                paste! {
                    match $line {
                        $(
                            $num => $exti.[<exticr $crnum>]().read().[<exti $num>]().bits(),
                        )+
                        _ => unreachable!(),
                    }
                }
            };
        }

        /// Enable a port's clock, if it isn't already.
        macro_rules! port_en {
            ($port:expr, $rcc:expr, [$(($P:ident, $p:ident)),+]) => {
                paste! {
                    match $port {
                        $(
                            Port::$P => {
                                if $rcc.ahb2enr1().read().[<gpio $p en>]().bit_is_clear() {
                                    rcc_en_reset!(ahb2_1, [<gpio $p>], $rcc);
                                }
                            }
                        )+
                    }
                }
            };
        }

        /// Get the register block of a port.
        fn regs(port: Port) -> *const pac::gpioa::RegisterBlock {
            match port {
                Port::A => pac::GPIOA::ptr(),
                Port::B => pac::GPIOB::ptr() as _,
                Port::C => pac::GPIOC::ptr() as _,
                Port::D => pac::GPIOD::ptr() as _,
                Port::E => pac::GPIOE::ptr() as _,
                Port::F => pac::GPIOF::ptr() as _,
                Port::G => pac::GPIOG::ptr() as _,
                Port::H => pac::GPIOH::ptr() as _,
                Port::I => pac::GPIOI::ptr() as _,
            }
        }

        fn exti() -> &'static pac::exti::RegisterBlock {
            unsafe { &(*EXTI::ptr()) }
        }

        #[derive(Clone, Debug)]
        #[cfg_attr(feature = "defmt", derive(defmt::Format))]
        /// Represents a single GPIO pin. Allows configuration, and reading/setting state.
        pub struct Pin {
            /// The GPIO Port letter. Eg A, B, C.
            pub port: Port,
            /// The pin number: 1 - 15.
            pub pin: u8,
        }

        impl Pin {
            /// Internal function to get the appropriate GPIO block.
            fn regs(&self) -> &'static pac::gpioa::RegisterBlock {
                unsafe { &(*regs(self.port)) }
            }

            /// Create a new pin, with a specific mode. Enables the RCC peripheral clock to the port,
            /// if not already enabled. Example: `let pa1 = Pin::new(Port::A, 1, PinMode::Output);` Leaves settings
            /// other than mode and alternate function (if applicable) at their defaults.
            pub fn new(port: Port, pin: u8, mode: PinMode) -> Self {
                assert!(pin <= 15, "Pin must be 0 - 15.");

                let rcc = unsafe { &(*RCC::ptr()) };
                port_en!(
                    port,
                    rcc,
                    [(A, a), (B, b), (C, c), (D, d), (E, e), (F, f), (G, g), (H, h), (I, i)]
                );

                // Port G pins 2 to 15 are powered from VDDIO2, which must be marked valid first.
                if port == Port::G {
                    let pwr = unsafe { &(*PWR::ptr()) };
                    rcc_en!(ahb3, pwr, rcc);
                    pwr.svmcr().modify(|_, w| w.io2sv().set_bit());
                }

                let mut result = Self { port, pin };
                result.mode(mode);

                result
            }

            /// Set pin mode. Eg, Output, Input, Analog, or Alt. Sets the `MODER` register.
            pub fn mode(&mut self, value: PinMode) {
                set_field!(
                    self.pin,
                    self.regs(),
                    moder,
                    mode,
                    bits,
                    value.val(),
                    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]
                );

                if let PinMode::Alt(alt) = value {
                    self.alt_fn(alt);
                }
            }

            /// Set output type. Sets the `OTYPER` register.
            pub fn output_type(&mut self, value: OutputType) {
                set_field!(
                    self.pin,
                    self.regs(),
                    otyper,
                    ot,
                    bit,
                    value == OutputType::OpenDrain,
                    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]
                );
            }

            /// Set output speed to Low, Medium, or High. Sets the `OSPEEDR` register.
            pub fn output_speed(&mut self, value: OutputSpeed) {
                set_field!(
                    self.pin,
                    self.regs(),
                    ospeedr,
                    ospeed,
                    bits,
                    value as u8,
                    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]
                );
            }

            /// Set internal pull resistor: Pull up, pull down, or floating. Sets the `PUPDR` register.
            pub fn pull(&mut self, value: Pull) {
                set_field!(
                    self.pin,
                    self.regs(),
                    pupdr,
                    pupd,
                    bits,
                    value as u8,
                    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]
                );
            }

            /// Set up a pin's alternate function. We set this up initially using `mode()`.
            pub fn alt_fn(&mut self, value: u8) {
                assert!(value <= 15, "Alt function must be 0 - 15.");

                if self.pin < 8 {
                    set_field!(self.pin, self.regs(), afrl, afsel, bits, value, [0, 1, 2, 3, 4, 5, 6, 7]);
                } else {
                    set_field!(
                        self.pin,
                        self.regs(),
                        afrh,
                        afsel,
                        bits,
                        value,
                        [8, 9, 10, 11, 12, 13, 14, 15]
                    );
                }
            }

            /// Lock or unlock a port configuration. Once locked, the configuration can't be
            /// changed until the next reset. Runs the `LCKR` write sequence, RM0456 section 13.4.8.
            pub fn lock(&mut self) -> Result<()> {
                let regs = self.regs();
                let pins = (regs.lckr().read().bits() & 0xffff) | 1 << self.pin;

                regs.lckr().write(|w| unsafe {
                    w.bits(pins);
                    w.lckk().set_bit()
                });
                regs.lckr().write(|w| unsafe { w.bits(pins) });
                regs.lckr().write(|w| unsafe {
                    w.bits(pins);
                    w.lckk().set_bit()
                });
                // The read completes the sequence.
                let _ = regs.lckr().read();

                if regs.lckr().read().lckk().bit_is_clear() {
                    return Err(Error::RegisterUnchanged);
                }
                Ok(())
            }

            /// Configure this pin as an interrupt source. Routes the EXTI line to this port,
            /// sets the trigger edges, clears anything pending, and unmasks the line.
            pub fn enable_interrupt(&mut self, edge: Edge) {
                let exti = exti();
                let (rise, fall) = edge.triggers();

                set_exti!(
                    self.pin,
                    exti,
                    self.port.index(),
                    rise,
                    fall,
                    [
                        (0, 1), (1, 1), (2, 1), (3, 1), (4, 2), (5, 2), (6, 2), (7, 2),
                        (8, 3), (9, 3), (10, 3), (11, 3), (12, 4), (13, 4), (14, 4), (15, 4)
                    ]
                );

                clear_exti_interrupt(self.pin, Edge::Either);
                set_field!(
                    self.pin,
                    exti,
                    imr1,
                    im,
                    bit,
                    true,
                    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]
                );
            }

            /// Mask this pin's EXTI line, and clear its trigger edges.
            pub fn disable_interrupt(&mut self) {
                let exti = exti();
                let line = 1 << self.pin;

                exti.imr1().modify(|r, w| unsafe { w.bits(r.bits() & !line) });
                exti.rtsr1().modify(|r, w| unsafe { w.bits(r.bits() & !line) });
                exti.ftsr1().modify(|r, w| unsafe { w.bits(r.bits() & !line) });
            }

            /// Clear pending flags on this pin's EXTI line.
            pub fn clear_interrupt(&mut self, edge: Edge) {
                clear_exti_interrupt(self.pin, edge);
            }

            /// Check if a rising edge is pending on this pin's EXTI line.
            pub fn is_rising_pending(&self) -> bool {
                exti_rising_pending(self.pin)
            }

            /// Check if a falling edge is pending on this pin's EXTI line.
            pub fn is_falling_pending(&self) -> bool {
                exti_falling_pending(self.pin)
            }

            /// Trigger this pin's EXTI line from software.
            pub fn generate_swi(&mut self) {
                exti().swier1().write(|w| unsafe { w.bits(1 << self.pin) });
            }

            /// Check if the pin's input voltage is high. Reads from the `IDR` register.
            pub fn is_high(&self) -> bool {
                self.regs().idr().read().bits() & (1 << self.pin) != 0
            }

            /// Check if the pin's input voltage is low. Reads from the `IDR` register.
            pub fn is_low(&self) -> bool {
                !self.is_high()
            }

            /// Read the pin's input state.
            pub fn get_state(&self) -> PinState {
                self.is_high().into()
            }

            /// Set a pin state (ie set high or low output voltage level). Writes to `BSRR`.
            pub fn set_state(&mut self, value: PinState) {
                let offset = match value {
                    PinState::Low => 16,
                    PinState::High => 0,
                };

                self.regs()
                    .bsrr()
                    .write(|w| unsafe { w.bits(1 << (offset + self.pin)) });
            }

            /// Set the pin's output voltage to high. Sets the `BSRR` register. Atomic.
            pub fn set_high(&mut self) {
                self.set_state(PinState::High);
            }

            /// Set the pin's output voltage to low. Sets the `BSRR` register. Atomic.
            pub fn set_low(&mut self) {
                self.set_state(PinState::Low);
            }

            /// The output level last written, from `ODR`.
            pub fn output_state(&self) -> PinState {
                (self.regs().odr().read().bits() & (1 << self.pin) != 0).into()
            }

            /// Toggle output voltage between low and high. Sets the `BSRR` register. Atomic.
            pub fn toggle(&mut self) {
                let next = self.output_state().toggled();
                self.set_state(next);
            }
        }

        /// Check if a rising edge is pending on an EXTI line. Does not need a `Pin`, so is
        /// usable from interrupt handlers.
        pub fn exti_rising_pending(line: u8) -> bool {
            exti().rpr1().read().bits() & (1 << line) != 0
        }

        pub fn exti_falling_pending(line: u8) -> bool {
            exti().fpr1().read().bits() & (1 << line) != 0
        }

        /// Clear an EXTI line's pending flags. Run this in the line's interrupt handler.
        /// `RPR1` and `FPR1` are write-1-to-clear.
        pub fn clear_exti_interrupt(line: u8, edge: Edge) {
            let exti = exti();
            let (rise, fall) = edge.triggers();
            if rise {
                exti.rpr1().write(|w| unsafe { w.bits(1 << line) });
            }
            if fall {
                exti.fpr1().write(|w| unsafe { w.bits(1 << line) });
            }
        }

        /// Which edge is pending on a line, if any. A line with both pending reports `Either`.
        pub fn exti_pending_edge(line: u8) -> Option<Edge> {
            match (exti_rising_pending(line), exti_falling_pending(line)) {
                (true, true) => Some(Edge::Either),
                (true, false) => Some(Edge::Rising),
                (false, true) => Some(Edge::Falling),
                (false, false) => None,
            }
        }

        /// The port an EXTI line is currently routed to.
        pub fn exti_port(line: u8) -> Option<Port> {
            let index = get_exti_port!(
                line & 0xf,
                exti(),
                [
                    (0, 1), (1, 1), (2, 1), (3, 1), (4, 2), (5, 2), (6, 2), (7, 2),
                    (8, 3), (9, 3), (10, 3), (11, 3), (12, 4), (13, 4), (14, 4), (15, 4)
                ]
            );
            Port::from_index(index)
        }

        #[cfg(feature = "embedded_hal")]
        impl ErrorType for Pin {
            type Error = Infallible;
        }

        #[cfg(feature = "embedded_hal")]
        impl InputPin for Pin {
            fn is_high(&mut self) -> core::result::Result<bool, Self::Error> {
                Ok(Pin::is_high(self))
            }

            fn is_low(&mut self) -> core::result::Result<bool, Self::Error> {
                Ok(Pin::is_low(self))
            }
        }

        #[cfg(feature = "embedded_hal")]
        impl OutputPin for Pin {
            fn set_low(&mut self) -> core::result::Result<(), Self::Error> {
                Pin::set_low(self);
                Ok(())
            }

            fn set_high(&mut self) -> core::result::Result<(), Self::Error> {
                Pin::set_high(self);
                Ok(())
            }
        }

        #[cfg(feature = "embedded_hal")]
        impl StatefulOutputPin for Pin {
            fn is_set_high(&mut self) -> core::result::Result<bool, Self::Error> {
                Ok(self.output_state() == PinState::High)
            }

            fn is_set_low(&mut self) -> core::result::Result<bool, Self::Error> {
                Ok(self.output_state() == PinState::Low)
            }

            fn toggle(&mut self) -> core::result::Result<(), Self::Error> {
                Pin::toggle(self);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_indices() {
        assert_eq!(Port::A.index(), 0);
        assert_eq!(Port::I.index(), 8);
        assert_eq!(Port::from_index(Port::G.index()), Some(Port::G));
        assert_eq!(Port::from_index(9), None);
    }

    #[test]
    fn edges_and_states() {
        assert_eq!(Edge::Rising.triggers(), (true, false));
        assert_eq!(Edge::Either.triggers(), (true, true));
        assert_eq!(PinState::High.toggled(), PinState::Low);
        assert_eq!(PinState::from(false), PinState::Low);
        assert_eq!(PinMode::Alt(7).val(), 0b10);
    }
}
