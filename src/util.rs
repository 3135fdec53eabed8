//! This is an internal module that contains utility functionality used by other modules.

use crate::{
    clocks::Clocks,
    pac::{self, rcc::RegisterBlock},
};

/// Enables and resets peripheral clocks on various RCC registers.
/// The first argument is a `apb1_1`, `ahb2_1` etc to specify the reg block. The second is the
/// peripheral name, as it appears in the enable and reset field names, and the third is the
/// RCC register block.
macro_rules! rcc_en_reset {
    (@regs $enr:ident, $rstr:ident, $periph:ident, $rcc:expr) => {
        paste::paste! {
            $rcc.$enr().modify(|_, w| w.[<$periph en>]().set_bit());
            $rcc.$rstr().modify(|_, w| w.[<$periph rst>]().set_bit());
            $rcc.$rstr().modify(|_, w| w.[<$periph rst>]().clear_bit());
        }
    };
    (ahb2_1, $periph:ident, $rcc:expr) => {
        $crate::util::rcc_en_reset!(@regs ahb2enr1, ahb2rstr1, $periph, $rcc)
    };
    (ahb2_2, $periph:ident, $rcc:expr) => {
        $crate::util::rcc_en_reset!(@regs ahb2enr2, ahb2rstr2, $periph, $rcc)
    };
    (ahb3, $periph:ident, $rcc:expr) => {
        $crate::util::rcc_en_reset!(@regs ahb3enr, ahb3rstr, $periph, $rcc)
    };
    (apb1_1, $periph:ident, $rcc:expr) => {
        $crate::util::rcc_en_reset!(@regs apb1enr1, apb1rstr1, $periph, $rcc)
    };
    (apb1_2, $periph:ident, $rcc:expr) => {
        $crate::util::rcc_en_reset!(@regs apb1enr2, apb1rstr2, $periph, $rcc)
    };
    (apb2, $periph:ident, $rcc:expr) => {
        $crate::util::rcc_en_reset!(@regs apb2enr, apb2rstr, $periph, $rcc)
    };
    (apb3, $periph:ident, $rcc:expr) => {
        $crate::util::rcc_en_reset!(@regs apb3enr, apb3rstr, $periph, $rcc)
    };
}

/// Enable a peripheral clock without resetting the peripheral. Used for blocks whose reset
/// would lose state we need, eg PWR.
macro_rules! rcc_en {
    (@reg $enr:ident, $periph:ident, $rcc:expr) => {
        paste::paste! {
            $rcc.$enr().modify(|_, w| w.[<$periph en>]().set_bit());
        }
    };
    (ahb2_1, $periph:ident, $rcc:expr) => {
        $crate::util::rcc_en!(@reg ahb2enr1, $periph, $rcc)
    };
    (ahb2_2, $periph:ident, $rcc:expr) => {
        $crate::util::rcc_en!(@reg ahb2enr2, $periph, $rcc)
    };
    (ahb3, $periph:ident, $rcc:expr) => {
        $crate::util::rcc_en!(@reg ahb3enr, $periph, $rcc)
    };
    (apb1_1, $periph:ident, $rcc:expr) => {
        $crate::util::rcc_en!(@reg apb1enr1, $periph, $rcc)
    };
    (apb3, $periph:ident, $rcc:expr) => {
        $crate::util::rcc_en!(@reg apb3enr, $periph, $rcc)
    };
}

pub(crate) use {rcc_en, rcc_en_reset};

/// Enable and reset a peripheral's clock, when constructing its driver.
pub trait RccPeriph {
    fn en_reset(rcc: &RegisterBlock);
}

macro_rules! impl_rcc_periph {
    ($periph:ident, $bus:ident, $field:ident) => {
        impl RccPeriph for pac::$periph {
            fn en_reset(rcc: &RegisterBlock) {
                rcc_en_reset!($bus, $field, rcc);
            }
        }
    };
}

impl_rcc_periph!(TIM1, apb2, tim1);
impl_rcc_periph!(TIM2, apb1_1, tim2);
impl_rcc_periph!(TIM3, apb1_1, tim3);
impl_rcc_periph!(TIM4, apb1_1, tim4);
impl_rcc_periph!(TIM5, apb1_1, tim5);
impl_rcc_periph!(TIM6, apb1_1, tim6);
impl_rcc_periph!(TIM7, apb1_1, tim7);
#[cfg(tim8)]
impl_rcc_periph!(TIM8, apb2, tim8);
impl_rcc_periph!(TIM15, apb2, tim15);
impl_rcc_periph!(TIM16, apb2, tim16);
impl_rcc_periph!(TIM17, apb2, tim17);

impl_rcc_periph!(I2C1, apb1_1, i2c1);
impl_rcc_periph!(I2C2, apb1_1, i2c2);
impl_rcc_periph!(I2C3, apb3, i2c3);
#[cfg(i2c4)]
impl_rcc_periph!(I2C4, apb1_2, i2c4);

impl_rcc_periph!(SPI1, apb2, spi1);
impl_rcc_periph!(SPI2, apb1_1, spi2);
impl_rcc_periph!(SPI3, apb3, spi3);

impl_rcc_periph!(USART1, apb2, usart1);
#[cfg(usart2)]
impl_rcc_periph!(USART2, apb1_1, usart2);
impl_rcc_periph!(USART3, apb1_1, usart3);
impl_rcc_periph!(UART4, apb1_1, uart4);
impl_rcc_periph!(UART5, apb1_1, uart5);

/// Uart only. Important: This assumes we use the default UART clock, ie PCLK.
pub trait BaudPeriph {
    fn baud(clock_cfg: &Clocks) -> u32;
}

impl BaudPeriph for pac::USART1 {
    fn baud(clock_cfg: &Clocks) -> u32 {
        clock_cfg.apb2()
    }
}

macro_rules! impl_baud_apb1 {
    ($($periph:ident),+) => {
        $(
            impl BaudPeriph for pac::$periph {
                fn baud(clock_cfg: &Clocks) -> u32 {
                    clock_cfg.apb1()
                }
            }
        )+
    };
}

impl_baud_apb1!(USART3, UART4, UART5);
#[cfg(usart2)]
impl_baud_apb1!(USART2);

/// The kernel clock feeding an I2C or SPI instance, with the default clock selection
/// (PCLK) in RCC_CCIPRx.
pub trait KernelClock {
    fn kernel_clock(clock_cfg: &Clocks) -> u32;
}

macro_rules! impl_kernel_clock {
    ($getter:ident: $($periph:ident),+) => {
        $(
            impl KernelClock for pac::$periph {
                fn kernel_clock(clock_cfg: &Clocks) -> u32 {
                    clock_cfg.$getter()
                }
            }
        )+
    };
}

impl_kernel_clock!(apb1: I2C1, I2C2, SPI2);
impl_kernel_clock!(apb2: SPI1);
impl_kernel_clock!(apb3: I2C3, SPI3);
#[cfg(i2c4)]
impl_kernel_clock!(apb1: I2C4);
