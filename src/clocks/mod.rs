//! Clock config for STM32U5. Describes the clock tree (input source, MSIS range, PLL1
//! factors, bus prescalers and voltage scaling range), computes the resulting bus speeds, and
//! writes it to RCC, PWR and FLASH with `setup()`.
//!
//! The default configuration runs SYSCLK at 160 MHz from PLL1, fed by MSIS at 4 MHz.

#[cfg(feature = "u5")]
mod u5;

#[cfg(feature = "u5")]
pub use u5::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RccError {
    /// A bus or the system clock is above the limit for the selected voltage range.
    Speed,
    /// A PLL1 factor or frequency is outside its valid range.
    Pll,
    /// An oscillator didn't become ready.
    Hardware,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
/// MSIS frequency range, in RCC_ICSCR1.MSISRANGE. The default after reset is 4 MHz.
pub enum MsisRange {
    R48M = 0,
    R24M = 1,
    R16M = 2,
    R12M = 3,
    R4M = 4,
    R2M = 5,
    R1_33M = 6,
    R1M = 7,
    R3_072M = 8,
    R1_536M = 9,
    R1_024M = 10,
    R768k = 11,
    R400k = 12,
    R200k = 13,
    R133k = 14,
    R100k = 15,
}

impl MsisRange {
    /// Nominal frequency, in Hz.
    pub fn value(&self) -> u32 {
        match self {
            Self::R48M => 48_000_000,
            Self::R24M => 24_000_000,
            Self::R16M => 16_000_000,
            Self::R12M => 12_000_000,
            Self::R4M => 4_000_000,
            Self::R2M => 2_000_000,
            Self::R1_33M => 1_330_000,
            Self::R1M => 1_000_000,
            Self::R3_072M => 3_072_000,
            Self::R1_536M => 1_536_000,
            Self::R1_024M => 1_024_000,
            Self::R768k => 768_000,
            Self::R400k => 400_000,
            Self::R200k => 200_000,
            Self::R133k => 133_000,
            Self::R100k => 100_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PllSrc {
    None,
    Msis(MsisRange),
    Hsi,
    /// HSE, with its frequency in Hz.
    Hse(u32),
}

impl PllSrc {
    /// RCC_PLL1CFGR.PLL1SRC
    pub fn bits(&self) -> u8 {
        match self {
            Self::None => 0b00,
            Self::Msis(_) => 0b01,
            Self::Hsi => 0b10,
            Self::Hse(_) => 0b11,
        }
    }

    /// Frequency, in Hz.
    pub fn freq(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Msis(range) => range.value(),
            Self::Hsi => HSI_FREQ,
            Self::Hse(freq) => *freq,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InputSrc {
    Msis(MsisRange),
    Hsi,
    /// HSE, with its frequency in Hz.
    Hse(u32),
    Pll(PllSrc),
}

impl InputSrc {
    /// RCC_CFGR1.SW
    pub fn bits(&self) -> u8 {
        match self {
            Self::Msis(_) => 0b00,
            Self::Hsi => 0b01,
            Self::Hse(_) => 0b10,
            Self::Pll(_) => 0b11,
        }
    }
}

pub const HSI_FREQ: u32 = 16_000_000;
/// LSI frequency, without the /128 prescaler.
pub const LSI_FREQ: u32 = 32_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
/// Division factor for the AHB clock. Also known as AHB Prescaler. RCC_CFGR2.HPRE
pub enum HclkPrescaler {
    Div1 = 0b0000,
    Div2 = 0b1000,
    Div4 = 0b1001,
    Div8 = 0b1010,
    Div16 = 0b1011,
    Div64 = 0b1100,
    Div128 = 0b1101,
    Div256 = 0b1110,
    Div512 = 0b1111,
}

impl HclkPrescaler {
    pub fn value(&self) -> u16 {
        match self {
            Self::Div1 => 1,
            Self::Div2 => 2,
            Self::Div4 => 4,
            Self::Div8 => 8,
            Self::Div16 => 16,
            Self::Div64 => 64,
            Self::Div128 => 128,
            Self::Div256 => 256,
            Self::Div512 => 512,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
/// For use with RCC_CFGR2.PPRE1, PPRE2 and RCC_CFGR3.PPRE3.
pub enum ApbPrescaler {
    Div1 = 0b000,
    Div2 = 0b100,
    Div4 = 0b101,
    Div8 = 0b110,
    Div16 = 0b111,
}

impl ApbPrescaler {
    pub fn value(&self) -> u8 {
        match self {
            Self::Div1 => 1,
            Self::Div2 => 2,
            Self::Div4 => 4,
            Self::Div8 => 8,
            Self::Div16 => 16,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Core voltage scaling range, PWR_VOSR.VOS. Range 1 is the highest voltage and speed.
pub enum VoltageRange {
    Range1,
    Range2,
    Range3,
    Range4,
}

impl VoltageRange {
    /// PWR_VOSR.VOS
    pub fn bits(&self) -> u8 {
        match self {
            Self::Range1 => 0b11,
            Self::Range2 => 0b10,
            Self::Range3 => 0b01,
            Self::Range4 => 0b00,
        }
    }

    /// Maximum HCLK in this range, in Hz.
    pub fn max_freq(&self) -> u32 {
        match self {
            Self::Range1 => 160_000_000,
            Self::Range2 => 110_000_000,
            Self::Range3 => 55_000_000,
            Self::Range4 => 25_000_000,
        }
    }

    /// Flash wait states needed for `hclk` in this range. RM0456, table 54.
    pub fn wait_states(&self, hclk: u32) -> u8 {
        let steps: &[u32] = match self {
            Self::Range1 => &[32_000_000, 64_000_000, 96_000_000, 128_000_000],
            Self::Range2 => &[25_000_000, 50_000_000, 75_000_000, 100_000_000],
            Self::Range3 => &[12_500_000, 25_000_000, 37_500_000, 50_000_000],
            Self::Range4 => &[8_000_000, 16_000_000],
        };

        steps.iter().take_while(|&&max| hclk > max).count() as u8
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
/// Clock output on the MCO pin. RCC_CFGR1.MCOSEL
pub enum McoSrc {
    Disabled = 0,
    Sysclk = 1,
    Msis = 2,
    Hsi16 = 3,
    Hse = 4,
    Pll1R = 5,
    Lsi = 6,
    Lse = 7,
    Hsi48 = 8,
    Msik = 9,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
/// RCC_CFGR1.MCOPRE
pub enum McoPrescaler {
    Div1 = 0,
    Div2 = 1,
    Div4 = 2,
    Div8 = 3,
    Div16 = 4,
}

/// Settings used to configure clocks.
#[derive(Clone, Debug)]
pub struct Clocks {
    /// The input source for the system and peripheral clocks. Eg HSE, HSI, PLL etc
    pub input_src: InputSrc,
    /// PLL1 input divider, 1 to 16. The divided clock must be 4 to 16 MHz.
    pub pll_m: u8,
    /// PLL1 multiplier, 4 to 512. The VCO output must be 128 to 544 MHz.
    pub pll_n: u16,
    /// PLL1 divider for the system clock output, 1 to 128.
    pub pll_r: u8,
    /// The value to divide SYSCLK by, to get systick and peripheral clocks. Also known as AHB divider
    pub hclk_prescaler: HclkPrescaler,
    /// The divider of HCLK to get the APB1 peripheral clock
    pub apb1_prescaler: ApbPrescaler,
    /// The divider of HCLK to get the APB2 peripheral clock
    pub apb2_prescaler: ApbPrescaler,
    /// The divider of HCLK to get the APB3 peripheral clock
    pub apb3_prescaler: ApbPrescaler,
    /// Bypass the HSE output, for use with oscillators that don't need it. Saves power, and
    /// frees up the pin for use as GPIO.
    pub hse_bypass: bool,
    pub voltage_range: VoltageRange,
    /// Enable the HSI48, used by USB and RNG.
    pub hsi48_on: bool,
}

impl Default for Clocks {
    /// MSIS at 4 MHz into PLL1, for a 160 MHz system clock, with all buses at full speed.
    fn default() -> Self {
        Self {
            input_src: InputSrc::Pll(PllSrc::Msis(MsisRange::R4M)),
            pll_m: 1,
            pll_n: 80,
            pll_r: 2,
            hclk_prescaler: HclkPrescaler::Div1,
            apb1_prescaler: ApbPrescaler::Div1,
            apb2_prescaler: ApbPrescaler::Div1,
            apb3_prescaler: ApbPrescaler::Div1,
            hse_bypass: false,
            voltage_range: VoltageRange::Range1,
            hsi48_on: false,
        }
    }
}

impl Clocks {
    /// The clock tree as it is out of reset: MSIS at 4 MHz, no PLL, range 4.
    pub fn reset_state() -> Self {
        Self {
            input_src: InputSrc::Msis(MsisRange::R4M),
            voltage_range: VoltageRange::Range4,
            ..Default::default()
        }
    }

    /// PLL1 input frequency after the M divider, in Hz. 0 if the PLL isn't used.
    pub fn pll_input_freq(&self) -> u32 {
        match self.input_src {
            InputSrc::Pll(src) => src.freq() / self.pll_m.max(1) as u32,
            _ => 0,
        }
    }

    /// PLL1 VCO frequency, in Hz.
    pub fn pll_vco_freq(&self) -> u32 {
        self.pll_input_freq() * self.pll_n as u32
    }

    /// Calculate the systick, and input frequency, in Hz.
    fn calc_sysclock(&self) -> (u32, u32) {
        match self.input_src {
            InputSrc::Pll(src) => (src.freq(), self.pll_vco_freq() / self.pll_r.max(1) as u32),
            InputSrc::Msis(range) => (range.value(), range.value()),
            InputSrc::Hsi => (HSI_FREQ, HSI_FREQ),
            InputSrc::Hse(freq) => (freq, freq),
        }
    }

    pub fn sysclk(&self) -> u32 {
        let (_, sysclk) = self.calc_sysclock();
        sysclk
    }

    /// HCLK speed, in Hz. Ie AHB bus, core, memory, and DMA.
    pub fn hclk(&self) -> u32 {
        self.sysclk() / self.hclk_prescaler.value() as u32
    }

    /// Cortex System timer speed, in Hz. SysTick runs from the processor clock.
    pub fn systick(&self) -> u32 {
        self.hclk()
    }

    pub fn apb1(&self) -> u32 {
        self.hclk() / self.apb1_prescaler.value() as u32
    }

    pub fn apb1_timer(&self) -> u32 {
        // The timer clock frequencies are automatically defined by hardware. If the APB
        // prescaler equals 1, they run at the APB frequency; otherwise at twice it.
        if let ApbPrescaler::Div1 = self.apb1_prescaler {
            self.apb1()
        } else {
            self.apb1() * 2
        }
    }

    pub fn apb2(&self) -> u32 {
        self.hclk() / self.apb2_prescaler.value() as u32
    }

    pub fn apb2_timer(&self) -> u32 {
        if let ApbPrescaler::Div1 = self.apb2_prescaler {
            self.apb2()
        } else {
            self.apb2() * 2
        }
    }

    pub fn apb3(&self) -> u32 {
        self.hclk() / self.apb3_prescaler.value() as u32
    }

    /// Check that the PLL factors and bus speeds are valid for the voltage range.
    pub fn validate_speeds(&self) -> Result<(), RccError> {
        if let InputSrc::Pll(src) = self.input_src {
            if src == PllSrc::None
                || !(1..=16).contains(&self.pll_m)
                || !(4..=512).contains(&self.pll_n)
                || !(1..=128).contains(&self.pll_r)
            {
                return Err(RccError::Pll);
            }

            if !(4_000_000..=16_000_000).contains(&self.pll_input_freq())
                || !(128_000_000..=544_000_000).contains(&self.pll_vco_freq())
            {
                return Err(RccError::Pll);
            }
        }

        let max_clock = self.voltage_range.max_freq();

        if self.sysclk() > max_clock
            || self.hclk() > max_clock
            || self.apb1() > max_clock
            || self.apb2() > max_clock
            || self.apb3() > max_clock
        {
            return Err(RccError::Speed);
        }

        Ok(())
    }

    /// Flash wait states for this configuration's HCLK.
    pub fn flash_wait_states(&self) -> u8 {
        self.voltage_range.wait_states(self.hclk())
    }

    #[cfg_attr(not(feature = "u5"), allow(dead_code))]
    /// PLL1CFGR.PLL1RGE: input frequency range. 0 for 4 to 8 MHz, 3 for 8 to 16 MHz.
    pub(crate) fn pll_rge_bits(&self) -> u8 {
        if self.pll_input_freq() > 8_000_000 { 0b11 } else { 0b00 }
    }

    #[cfg_attr(not(feature = "u5"), allow(dead_code))]
    /// PLL1CFGR.PLL1MBOOST: divider bringing the PLL source into the 4 to 16 MHz range the
    /// EPOD booster needs. 0 is /1, 1 /2, 2 /4, up to 8 /16.
    pub(crate) fn boost_div_bits(&self) -> u8 {
        let src = match self.input_src {
            InputSrc::Pll(src) => src.freq(),
            _ => return 0,
        };

        let mut bits = 0;
        while bits < 8 && (src >> bits) > 16_000_000 {
            bits += 1;
        }
        bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_160mhz() {
        let c = Clocks::default();
        assert_eq!(c.sysclk(), 160_000_000);
        assert_eq!(c.hclk(), 160_000_000);
        assert_eq!(c.apb1(), 160_000_000);
        assert_eq!(c.apb1_timer(), 160_000_000);
        assert_eq!(c.pll_vco_freq(), 320_000_000);
        assert_eq!(c.validate_speeds(), Ok(()));
        assert_eq!(c.flash_wait_states(), 4);
        assert_eq!(c.pll_rge_bits(), 0);
    }

    #[test]
    fn timer_clock_doubles_with_apb_prescaler() {
        let c = Clocks {
            apb1_prescaler: ApbPrescaler::Div4,
            apb2_prescaler: ApbPrescaler::Div2,
            ..Default::default()
        };
        assert_eq!(c.apb1(), 40_000_000);
        assert_eq!(c.apb1_timer(), 80_000_000);
        assert_eq!(c.apb2(), 80_000_000);
        assert_eq!(c.apb2_timer(), 160_000_000);
        assert_eq!(c.apb3(), 160_000_000);
    }

    #[test]
    fn too_fast_for_range() {
        let c = Clocks {
            pll_n: 90,
            ..Default::default()
        };
        assert_eq!(c.sysclk(), 180_000_000);
        assert_eq!(c.validate_speeds(), Err(RccError::Speed));

        let c = Clocks {
            voltage_range: VoltageRange::Range2,
            ..Default::default()
        };
        assert_eq!(c.validate_speeds(), Err(RccError::Speed));
    }

    #[test]
    fn pll_limits() {
        // VCO below 128 MHz.
        let c = Clocks {
            pll_n: 20,
            pll_r: 1,
            ..Default::default()
        };
        assert_eq!(c.validate_speeds(), Err(RccError::Pll));

        // HSE at 16 MHz divided down to 8 MHz is fine.
        let c = Clocks {
            input_src: InputSrc::Pll(PllSrc::Hse(16_000_000)),
            pll_m: 2,
            pll_n: 40,
            pll_r: 2,
            ..Default::default()
        };
        assert_eq!(c.sysclk(), 160_000_000);
        assert_eq!(c.validate_speeds(), Ok(()));

        let c = Clocks {
            input_src: InputSrc::Pll(PllSrc::Hsi),
            pll_m: 1,
            pll_n: 10,
            pll_r: 1,
            ..Default::default()
        };
        assert_eq!(c.pll_rge_bits(), 0b11);
        assert_eq!(c.boost_div_bits(), 0);
    }

    #[test]
    fn boost_divider() {
        let c = Clocks {
            input_src: InputSrc::Pll(PllSrc::Hse(48_000_000)),
            ..Default::default()
        };
        // 48 MHz / 4 = 12 MHz.
        assert_eq!(c.boost_div_bits(), 2);
    }

    #[test]
    fn wait_states() {
        assert_eq!(VoltageRange::Range1.wait_states(32_000_000), 0);
        assert_eq!(VoltageRange::Range1.wait_states(32_000_001), 1);
        assert_eq!(VoltageRange::Range1.wait_states(100_000_000), 3);
        assert_eq!(VoltageRange::Range4.wait_states(4_000_000), 0);
        assert_eq!(VoltageRange::Range4.wait_states(24_000_000), 2);
    }

    #[test]
    fn direct_sources() {
        let c = Clocks {
            input_src: InputSrc::Hsi,
            hclk_prescaler: HclkPrescaler::Div2,
            ..Default::default()
        };
        assert_eq!(c.sysclk(), 16_000_000);
        assert_eq!(c.hclk(), 8_000_000);
        assert_eq!(c.systick(), 8_000_000);

        let c = Clocks::reset_state();
        assert_eq!(c.sysclk(), 4_000_000);
        assert_eq!(c.validate_speeds(), Ok(()));
    }
}
