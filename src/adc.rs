//! API for the ADC (Analog to Digital Converter). Supports ADC1 (14-bit, up to 20 channels)
//! and ADC4 (12-bit, low power) in single conversion mode, with a blocking or polled
//! read of one channel at a time.
//!
//! The resolution, sample time and prescaler tables build on the host; the driver needs a
//! device feature.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdcDevice {
    One,
    Four,
}

impl AdcDevice {
    /// Highest ADC clock the converter supports, in Hz.
    pub fn max_clock(&self) -> u32 {
        55_000_000
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Conversion resolution. ADC1 supports 14 to 8 bits; ADC4, 12 to 6.
pub enum AdcResolution {
    B14,
    B12,
    B10,
    B8,
    B6,
}

impl AdcResolution {
    pub fn bits(&self) -> u8 {
        match self {
            Self::B14 => 14,
            Self::B12 => 12,
            Self::B10 => 10,
            Self::B8 => 8,
            Self::B6 => 6,
        }
    }

    /// Largest conversion result at this resolution.
    pub fn full_scale(&self) -> u32 {
        (1 << self.bits()) - 1
    }

    /// Value of the CFGR1 RES field, or `None` if `device` doesn't support this resolution.
    pub fn res_field(&self, device: AdcDevice) -> Option<u8> {
        match (device, self) {
            (AdcDevice::One, Self::B14) => Some(0b00),
            (AdcDevice::One, Self::B12) => Some(0b01),
            (AdcDevice::One, Self::B10) => Some(0b10),
            (AdcDevice::One, Self::B8) => Some(0b11),
            (AdcDevice::Four, Self::B12) => Some(0b00),
            (AdcDevice::Four, Self::B10) => Some(0b01),
            (AdcDevice::Four, Self::B8) => Some(0b10),
            (AdcDevice::Four, Self::B6) => Some(0b11),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
/// ADC sampling time, as the SMPx field value. Cycle counts differ between ADC1 and ADC4;
/// see `cycles()`. Longer times suit higher source impedances, eg a resistor divider.
pub enum SampleTime {
    T0 = 0,
    T1 = 1,
    T2 = 2,
    T3 = 3,
    T4 = 4,
    T5 = 5,
    T6 = 6,
    T7 = 7,
}

impl SampleTime {
    /// Sampling time in tenths of ADC clock cycles.
    pub fn cycles_x10(&self, device: AdcDevice) -> u32 {
        let table: [u32; 8] = match device {
            AdcDevice::One => [50, 60, 120, 200, 360, 680, 3_910, 8_140],
            AdcDevice::Four => [15, 35, 75, 125, 195, 395, 795, 8_145],
        };
        table[*self as usize]
    }
}

/// CCR PRESC field values, and the division each gives.
const PRESCALERS: [(u8, u32); 12] = [
    (0b0000, 1),
    (0b0001, 2),
    (0b0010, 4),
    (0b0011, 6),
    (0b0100, 8),
    (0b0101, 10),
    (0b0110, 12),
    (0b0111, 16),
    (0b1000, 32),
    (0b1001, 64),
    (0b1010, 128),
    (0b1011, 256),
];

/// The smallest common-clock prescaler that brings `kernel_clock` within `max`: (PRESC
/// field, division).
pub fn prescaler_for(kernel_clock: u32, max: u32) -> (u8, u32) {
    for (bits, div) in PRESCALERS {
        if kernel_clock / div <= max {
            return (bits, div);
        }
    }
    PRESCALERS[PRESCALERS.len() - 1]
}

/// Convert a reading to mV, given the reference voltage.
pub fn reading_to_voltage(reading: u32, resolution: AdcResolution, vref_mv: u32) -> u32 {
    (reading as u64 * vref_mv as u64 / resolution.full_scale() as u64) as u32
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdcConfig {
    pub resolution: AdcResolution,
    pub sample_time: SampleTime,
    /// Run the offset (and for ADC1, linearity) calibration on init.
    pub calibrate: bool,
}

impl Default for AdcConfig {
    fn default() -> Self {
        Self {
            resolution: AdcResolution::B12,
            sample_time: SampleTime::T4,
            calibrate: true,
        }
    }
}

#[cfg(feature = "u5")]
mod hw {
    use cortex_m::asm;
    use paste::paste;

    use super::*;
    use crate::{
        clocks::Clocks,
        error::{Error, Result},
        pac::{self, ADC1, ADC12_COMMON, ADC4, PWR, RCC},
        tick::Timeout,
        util::rcc_en,
    };

    /// Write the SMPx field of one ADC1 channel, over SMPR1 (0 to 9) and SMPR2 (10 to 19).
    macro_rules! set_smp {
        ($ch:expr, $regs:expr, $val:expr, [$($num:literal),+], [$($num2:literal),+]) => {
            paste! {
                match $ch {
                    $(
                        $num => $regs.smpr1().modify(|_, w| unsafe { w.[<smp $num>]().bits($val) }),
                    )+
                    $(
                        $num2 => $regs.smpr2().modify(|_, w| unsafe { w.[<smp $num2>]().bits($val) }),
                    )+
                    _ => (),
                }
            }
        };
    }

    fn adc1() -> &'static pac::adc1::RegisterBlock {
        unsafe { &(*ADC1::ptr()) }
    }

    fn adc4() -> &'static pac::adc4::RegisterBlock {
        unsafe { &(*ADC4::ptr()) }
    }

    /// Analog Digital Converter Peripheral
    pub struct Adc {
        pub device: AdcDevice,
        pub cfg: AdcConfig,
        /// ADC clock after the common prescaler, in Hz.
        pub clock: u32,
    }

    impl Adc {
        /// Init a new ADC: enable its clock and the analog supply, leave deep power down, start
        /// the voltage regulator, optionally calibrate, and enable.
        pub fn new(device: AdcDevice, cfg: AdcConfig, clocks: &Clocks) -> Result<Self> {
            let Some(res) = cfg.resolution.res_field(device) else {
                return Err(Error::InvalidParam);
            };

            let rcc = unsafe { &(*RCC::ptr()) };
            let pwr = unsafe { &(*PWR::ptr()) };

            match device {
                AdcDevice::One => rcc_en!(ahb2_1, adc12, rcc),
                AdcDevice::Four => rcc_en!(ahb3, adc4, rcc),
            }
            // VDDA is in its own domain; mark it valid.
            rcc_en!(ahb3, pwr, rcc);
            pwr.svmcr().modify(|_, w| w.asv().set_bit());

            // Kernel clock is HCLK, the CCIPR3 ADCDACSEL reset value.
            let (presc, div) = prescaler_for(clocks.hclk(), device.max_clock());
            match device {
                AdcDevice::One => {
                    let common = unsafe { &(*ADC12_COMMON::ptr()) };
                    common.ccr().modify(|_, w| unsafe { w.presc().bits(presc) });
                }
                AdcDevice::Four => adc4().ccr().modify(|_, w| unsafe { w.presc().bits(presc) }),
            }

            let mut result = Self {
                device,
                cfg,
                clock: clocks.hclk() / div,
            };

            result.advregen_enable(clocks.hclk())?;

            match device {
                AdcDevice::One => adc1().cfgr1().modify(|_, w| unsafe {
                    w.res().bits(res);
                    w.cont().clear_bit()
                }),
                AdcDevice::Four => adc4().cfgr1().modify(|_, w| unsafe {
                    w.res().bits(res);
                    w.cont().clear_bit()
                }),
            }

            if result.cfg.calibrate {
                result.calibrate()?;
            }
            result.enable()?;

            debug!("ADC set up. Clock: {=u32} Hz", result.clock);

            Ok(result)
        }

        /// Leave deep power down and start the voltage regulator, and wait until it's ready.
        fn advregen_enable(&mut self, hclk: u32) -> Result<()> {
            match self.device {
                AdcDevice::One => {
                    let regs = adc1();
                    regs.cr().modify(|_, w| w.deeppwd().clear_bit());
                    regs.cr().modify(|_, w| w.advregen().set_bit());
                    bounded_loop!(regs.isr().read().ldordy().bit_is_clear(), Error::RegisterUnchanged);
                }
                AdcDevice::Four => {
                    adc4().cr().modify(|_, w| w.advregen().set_bit());
                    // ADC4 start-up time, tADCVREG_SETUP: 20 µs.
                    asm::delay(hclk / 1_000_000 * 20);
                }
            }
            Ok(())
        }

        /// Run the self calibration. The ADC must be disabled.
        pub fn calibrate(&mut self) -> Result<()> {
            match self.device {
                AdcDevice::One => {
                    let regs = adc1();
                    regs.cr().modify(|_, w| {
                        w.adcallin().set_bit();
                        w.adcal().set_bit()
                    });
                    bounded_loop!(regs.cr().read().adcal().bit_is_set(), Error::RegisterUnchanged);
                }
                AdcDevice::Four => {
                    let regs = adc4();
                    regs.cr().modify(|_, w| w.adcal().set_bit());
                    bounded_loop!(regs.cr().read().adcal().bit_is_set(), Error::RegisterUnchanged);
                }
            }
            Ok(())
        }

        /// Enable the ADC, and wait for it to be ready.
        pub fn enable(&mut self) -> Result<()> {
            // ADRDY is write-1-to-clear.
            match self.device {
                AdcDevice::One => {
                    let regs = adc1();
                    regs.isr().write(|w| w.adrdy().set_bit());
                    regs.cr().modify(|_, w| w.aden().set_bit());
                    bounded_loop!(regs.isr().read().adrdy().bit_is_clear(), Error::RegisterUnchanged);
                }
                AdcDevice::Four => {
                    let regs = adc4();
                    regs.isr().write(|w| w.adrdy().set_bit());
                    regs.cr().modify(|_, w| w.aden().set_bit());
                    bounded_loop!(regs.isr().read().adrdy().bit_is_clear(), Error::RegisterUnchanged);
                }
            }
            Ok(())
        }

        /// Stop any conversion and disable the ADC.
        pub fn disable(&mut self) -> Result<()> {
            self.stop_conversion()?;
            match self.device {
                AdcDevice::One => {
                    let regs = adc1();
                    regs.cr().modify(|_, w| w.addis().set_bit());
                    bounded_loop!(regs.cr().read().aden().bit_is_set(), Error::RegisterUnchanged);
                }
                AdcDevice::Four => {
                    let regs = adc4();
                    regs.cr().modify(|_, w| w.addis().set_bit());
                    bounded_loop!(regs.cr().read().aden().bit_is_set(), Error::RegisterUnchanged);
                }
            }
            Ok(())
        }

        pub fn is_enabled(&self) -> bool {
            match self.device {
                AdcDevice::One => adc1().cr().read().aden().bit_is_set(),
                AdcDevice::Four => adc4().cr().read().aden().bit_is_set(),
            }
        }

        /// Select the single channel converted by `start_conversion`, with the configured
        /// sample time.
        pub fn set_channel(&mut self, ch: u8) {
            match self.device {
                AdcDevice::One => {
                    let regs = adc1();
                    regs.pcsel().write(|w| unsafe { w.bits(1 << ch) });
                    // One conversion, of `ch`.
                    regs.sqr1().write(|w| unsafe {
                        w.l().bits(0);
                        w.sq1().bits(ch)
                    });
                }
                AdcDevice::Four => adc4().chselr().write(|w| unsafe { w.bits(1 << ch) }),
            }
            self.set_sample_time(ch, self.cfg.sample_time);
        }

        /// Set a channel's sample time. ADC4 has one sample time, SMP1, for all channels.
        pub fn set_sample_time(&mut self, ch: u8, time: SampleTime) {
            match self.device {
                AdcDevice::One => set_smp!(
                    ch,
                    adc1(),
                    time as u8,
                    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
                    [10, 11, 12, 13, 14, 15, 16, 17, 18, 19]
                ),
                AdcDevice::Four => adc4().smpr().modify(|_, w| unsafe { w.smp1().bits(time as u8) }),
            }
        }

        pub fn start_conversion(&mut self) {
            match self.device {
                AdcDevice::One => {
                    let regs = adc1();
                    regs.isr().write(|w| {
                        w.eoc().set_bit();
                        w.eos().set_bit();
                        w.ovr().set_bit()
                    });
                    regs.cr().modify(|_, w| w.adstart().set_bit());
                }
                AdcDevice::Four => {
                    let regs = adc4();
                    regs.isr().write(|w| {
                        w.eoc().set_bit();
                        w.eos().set_bit();
                        w.ovr().set_bit()
                    });
                    regs.cr().modify(|_, w| w.adstart().set_bit());
                }
            }
        }

        fn is_converted(&self) -> bool {
            match self.device {
                AdcDevice::One => adc1().isr().read().eoc().bit_is_set(),
                AdcDevice::Four => adc4().isr().read().eoc().bit_is_set(),
            }
        }

        /// Wait for the end of conversion, for up to `timeout_ms`.
        pub fn poll_for_conversion(&mut self, timeout_ms: u32) -> Result<()> {
            let timeout = Timeout::new(timeout_ms);
            loop {
                if self.is_converted() {
                    return Ok(());
                }
                if timeout.is_expired() {
                    return Err(Error::Timeout);
                }
            }
        }

        /// Stop a conversion in progress, if any.
        pub fn stop_conversion(&mut self) -> Result<()> {
            match self.device {
                AdcDevice::One => {
                    let regs = adc1();
                    if regs.cr().read().adstart().bit_is_set() {
                        regs.cr().modify(|_, w| w.adstp().set_bit());
                        bounded_loop!(regs.cr().read().adstp().bit_is_set(), Error::RegisterUnchanged);
                    }
                }
                AdcDevice::Four => {
                    let regs = adc4();
                    if regs.cr().read().adstart().bit_is_set() {
                        regs.cr().modify(|_, w| w.adstp().set_bit());
                        bounded_loop!(regs.cr().read().adstp().bit_is_set(), Error::RegisterUnchanged);
                    }
                }
            }
            Ok(())
        }

        /// Read the data register. This clears EOC.
        pub fn read_result(&mut self) -> u32 {
            match self.device {
                AdcDevice::One => adc1().dr().read().bits(),
                AdcDevice::Four => adc4().dr().read().bits(),
            }
        }

        /// Convert one channel, and wait for the result.
        pub fn read(&mut self, ch: u8, timeout_ms: u32) -> Result<u32> {
            self.set_channel(ch);
            self.start_conversion();
            self.poll_for_conversion(timeout_ms)?;
            Ok(self.read_result())
        }

        /// Convert a reading to mV, given the reference voltage.
        pub fn reading_to_voltage(&self, reading: u32, vref_mv: u32) -> u32 {
            reading_to_voltage(reading, self.cfg.resolution, vref_mv)
        }
    }
}

#[cfg(feature = "u5")]
pub use hw::Adc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolutions() {
        assert_eq!(AdcResolution::B14.full_scale(), 16_383);
        assert_eq!(AdcResolution::B12.full_scale(), 4_095);
        assert_eq!(AdcResolution::B12.res_field(AdcDevice::One), Some(0b01));
        assert_eq!(AdcResolution::B12.res_field(AdcDevice::Four), Some(0b00));
        assert_eq!(AdcResolution::B14.res_field(AdcDevice::Four), None);
        assert_eq!(AdcResolution::B6.res_field(AdcDevice::One), None);
    }

    #[test]
    fn prescaler_selection() {
        assert_eq!(prescaler_for(160_000_000, 55_000_000), (0b0010, 4));
        assert_eq!(prescaler_for(48_000_000, 55_000_000), (0b0000, 1));
        assert_eq!(prescaler_for(110_000_000, 55_000_000), (0b0001, 2));
        assert_eq!(prescaler_for(300_000_000, 55_000_000), (0b0011, 6));
    }

    #[test]
    fn sample_time_cycles() {
        assert_eq!(SampleTime::T6.cycles_x10(AdcDevice::One), 3_910);
        assert_eq!(SampleTime::T0.cycles_x10(AdcDevice::Four), 15);
    }

    #[test]
    fn voltage() {
        assert_eq!(reading_to_voltage(4_095, AdcResolution::B12, 3_300), 3_300);
        assert_eq!(reading_to_voltage(2_048, AdcResolution::B12, 3_300), 1_650);
        assert_eq!(reading_to_voltage(0, AdcResolution::B14, 3_300), 0);
    }
}
