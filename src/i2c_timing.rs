//! Computes I2C_TIMINGR and SMBus I2C_TIMEOUTR values from the kernel clock and the bus
//! characteristics in the I2C-bus specification (UM10204, table 10).
//!
//! The search is in two steps. First, for each prescaler, find the first SCLDEL/SDADEL pair
//! that meets the data setup and hold limits. Then, for every prescaler that has one, sweep
//! SCLL and SCLH and keep the combination whose SCL period is closest to the one requested.
//! Floating point is plain f64 arithmetic; no libm functions are needed.

const NS_PER_S: u32 = 1_000_000_000;

const ANALOG_FILTER_DELAY_MIN_NS: u32 = 50;
const ANALOG_FILTER_DELAY_MAX_NS: u32 = 260;

const PRESC_MAX: u32 = 16;
const SCLDEL_MAX: u32 = 16;
const SDADEL_MAX: u32 = 16;
const SCLH_MAX: u32 = 256;
const SCLL_MAX: u32 = 256;

const SMBUS_IDLE_TIMEOUT_MIN_NS: u32 = 25_000_000;
const SMBUS_IDLE_TIMEOUT_MAX_NS: u32 = 35_000_000;
const SMBUS_SLAVE_EXT_LOW_TIMEOUT_MAX_NS: u32 = 25_000_000;
const SMBUS_MASTER_EXT_LOW_TIMEOUT_MAX_NS: u32 = 10_000_000;

/// TIMEOUTA and TIMEOUTB are 12 bits wide.
const TIMEOUT_MAX: u32 = 0xfff;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum I2cTimingError {
    /// A clock of 0, a bus frequency outside every speed mode, or a timeout out of range.
    InvalidParam,
    /// No register values meet the bus limits at this kernel clock.
    NoSolution,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpeedMode {
    /// 100 kHz
    Standard,
    /// 400 kHz
    Fast,
    /// 1 MHz
    FastPlus,
}

/// Bus limits for one speed mode, in Hz and ns.
struct Charac {
    freq_min: u32,
    freq_max: u32,
    hddat_min: u32,
    vddat_max: u32,
    sudat_min: u32,
    lscl_min: u32,
    hscl_min: u32,
    trise_max: u32,
    tfall_max: u32,
}

impl SpeedMode {
    /// The speed mode whose frequency range (nominal ±20%) contains `bus_hz`.
    pub fn from_freq(bus_hz: u32) -> Option<Self> {
        [Self::Standard, Self::Fast, Self::FastPlus]
            .into_iter()
            .find(|m| (m.charac().freq_min..=m.charac().freq_max).contains(&bus_hz))
    }

    const fn charac(self) -> Charac {
        match self {
            Self::Standard => Charac {
                freq_min: 80_000,
                freq_max: 120_000,
                hddat_min: 0,
                vddat_max: 3_450,
                sudat_min: 250,
                lscl_min: 4_700,
                hscl_min: 4_000,
                trise_max: 1_000,
                tfall_max: 300,
            },
            Self::Fast => Charac {
                freq_min: 320_000,
                freq_max: 480_000,
                hddat_min: 0,
                vddat_max: 900,
                sudat_min: 100,
                lscl_min: 1_300,
                hscl_min: 600,
                trise_max: 300,
                tfall_max: 300,
            },
            Self::FastPlus => Charac {
                freq_min: 800_000,
                freq_max: 1_200_000,
                hddat_min: 0,
                vddat_max: 450,
                sudat_min: 50,
                lscl_min: 500,
                hscl_min: 260,
                trise_max: 120,
                tfall_max: 120,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Inputs to the timing calculation.
pub struct TimingConfig {
    /// I2C kernel clock.
    pub clock_hz: u32,
    /// Requested SCL frequency.
    pub bus_hz: u32,
    /// SCL and SDA rise time, as measured on the board.
    pub rise_ns: u32,
    pub fall_ns: u32,
    /// Digital noise filter length, in kernel clock periods. 0 to 15.
    pub digital_filter: u8,
    pub analog_filter: bool,
}

impl TimingConfig {
    /// Rise and fall times at half the maximum the bus allows for this speed mode.
    pub fn new(clock_hz: u32, bus_hz: u32, analog_filter: bool, digital_filter: u8) -> Self {
        let (rise_ns, fall_ns) = match SpeedMode::from_freq(bus_hz) {
            Some(mode) => (mode.charac().trise_max / 2, mode.charac().tfall_max / 2),
            None => (0, 0),
        };

        Self {
            clock_hz,
            bus_hz,
            rise_ns,
            fall_ns,
            digital_filter,
            analog_filter,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// TIMINGR fields.
pub struct Timing {
    pub presc: u8,
    pub scldel: u8,
    pub sdadel: u8,
    pub sclh: u8,
    pub scll: u8,
}

impl Timing {
    /// Encode as I2C_TIMINGR: PRESC[31:28], SCLDEL[23:20], SDADEL[19:16], SCLH[15:8], SCLL[7:0].
    pub fn bits(&self) -> u32 {
        (self.presc as u32 & 0xf) << 28
            | (self.scldel as u32 & 0xf) << 20
            | (self.sdadel as u32 & 0xf) << 16
            | (self.sclh as u32) << 8
            | self.scll as u32
    }
}

/// Compute I2C_TIMINGR with rise and fall times at half the bus maximum. See `compute_timing`.
pub fn compute_timingr(
    clock_hz: u32,
    bus_hz: u32,
    analog_filter: bool,
    digital_filter: u8,
) -> Result<u32, I2cTimingError> {
    compute_timing(&TimingConfig::new(clock_hz, bus_hz, analog_filter, digital_filter))
        .map(|t| t.bits())
}

/// Compute the TIMINGR fields for an SCL frequency as close as possible to `bus_hz`, within
/// the limits of its speed mode.
pub fn compute_timing(cfg: &TimingConfig) -> Result<Timing, I2cTimingError> {
    if cfg.clock_hz == 0 || cfg.bus_hz == 0 {
        return Err(I2cTimingError::InvalidParam);
    }
    let mode = SpeedMode::from_freq(cfg.bus_hz).ok_or(I2cTimingError::InvalidParam)?;
    let ch = mode.charac();

    let (af_min, af_max) = if cfg.analog_filter {
        (ANALOG_FILTER_DELAY_MIN_NS as f64, ANALOG_FILTER_DELAY_MAX_NS as f64)
    } else {
        (0., 0.)
    };
    let dnf = cfg.digital_filter as u32;
    let t_clk = NS_PER_S as f64 / cfg.clock_hz as f64;

    // SDADEL >= (tf + tHD;DAT(min) - tAF(min) - tDNF - 3 tI2CCLK) / tPRESC
    // SDADEL <= (tVD;DAT(max) - tr - tAF(max) - tDNF - 4 tI2CCLK) / tPRESC
    // SCLDEL >= (tr + tSU;DAT(min)) / tPRESC - 1
    let sdadel_min = ((cfg.fall_ns + ch.hddat_min) as f64 - af_min - (dnf + 3) as f64 * t_clk).max(0.);
    let sdadel_max = (ch.vddat_max as f64 - cfg.rise_ns as f64 - af_max - (dnf + 4) as f64 * t_clk).max(0.);
    let scldel_min = (cfg.rise_ns + ch.sudat_min) as f64;

    // The SCL sweep works with whole nanoseconds.
    let t_clk_ns = (NS_PER_S / cfg.clock_hz) as f64;
    let t_speed = (NS_PER_S / cfg.bus_hz) as f64;
    let scl_max = (NS_PER_S / ch.freq_min) as f64;
    let scl_min = (NS_PER_S / ch.freq_max) as f64;
    let dnf_delay = dnf as f64 * t_clk_ns;

    let mut best = None;
    let mut best_error = t_speed;

    for presc in 0..PRESC_MAX {
        let Some((scldel, sdadel)) =
            data_delays(presc, t_clk, scldel_min, sdadel_min, sdadel_max)
        else {
            continue;
        };

        let t_presc = (presc + 1) as f64 * t_clk_ns;

        for scll in 0..SCLL_MAX {
            let t_low = af_min + dnf_delay + 2. * t_clk_ns + (scll + 1) as f64 * t_presc;

            // tI2CCLK < (tLOW - tfilters) / 4
            if t_low <= ch.lscl_min as f64 || t_clk_ns >= (t_low - af_min - dnf_delay) / 4. {
                continue;
            }

            for sclh in 0..SCLH_MAX {
                let t_high = af_min + dnf_delay + 2. * t_clk_ns + (sclh + 1) as f64 * t_presc;
                let t_scl = t_low + t_high + cfg.rise_ns as f64 + cfg.fall_ns as f64;

                if t_scl < scl_min
                    || t_scl > scl_max
                    || t_high < ch.hscl_min as f64
                    || t_clk_ns >= t_high
                {
                    continue;
                }

                let error = ((t_scl as i32) - (t_speed as i32)).unsigned_abs() as f64;
                if error < best_error {
                    best_error = error;
                    best = Some(Timing {
                        presc: presc as u8,
                        scldel: scldel as u8,
                        sdadel: sdadel as u8,
                        sclh: sclh as u8,
                        scll: scll as u8,
                    });
                }
            }
        }
    }

    best.ok_or(I2cTimingError::NoSolution)
}

/// The first (SCLDEL, SDADEL) pair meeting the setup and hold limits at this prescaler.
fn data_delays(
    presc: u32,
    t_clk: f64,
    scldel_min: f64,
    sdadel_min: f64,
    sdadel_max: f64,
) -> Option<(u32, u32)> {
    for scldel in 0..SCLDEL_MAX {
        let t_scldel = ((scldel + 1) * (presc + 1)) as f64 * t_clk;
        if t_scldel < scldel_min {
            continue;
        }

        for sdadel in 0..SDADEL_MAX {
            let t_sdadel = (sdadel * (presc + 1)) as f64 * t_clk;
            if t_sdadel >= sdadel_min && t_sdadel <= sdadel_max {
                return Some((scldel, sdadel));
            }
        }
    }
    None
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// What SMBus TIMEOUTA detects.
pub enum TimeoutAMode {
    /// SCL held low: tTIMEOUT, 25 to 35 ms.
    SclLow,
    /// Both lines high: tIDLE, the bus idle condition.
    BusIdle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SmbusRole {
    Host,
    Device,
}

/// `round(timeout / (t_clk * mult)) - 1`, range checked against the 12-bit field.
fn timeout_field(clock_hz: u32, timeout_ns: u32, mult: u32) -> Result<u16, I2cTimingError> {
    if clock_hz == 0 {
        return Err(I2cTimingError::InvalidParam);
    }
    let t_clk = NS_PER_S as f64 / clock_hz as f64;
    let d = t_clk * mult as f64;
    let periods = ((timeout_ns as f64 + d / 2.) / d) as u32;

    match periods.checked_sub(1) {
        Some(v) if v <= TIMEOUT_MAX => Ok(v as u16),
        _ => Err(I2cTimingError::InvalidParam),
    }
}

/// Compute TIMEOUTA. SCL-low detection counts in units of 2048 kernel clocks, and needs a
/// timeout of 25 to 35 ms. Bus idle detection counts in units of 4 kernel clocks.
pub fn timeout_a(clock_hz: u32, timeout_ns: u32, mode: TimeoutAMode) -> Result<u16, I2cTimingError> {
    match mode {
        TimeoutAMode::BusIdle => timeout_field(clock_hz, timeout_ns, 4),
        TimeoutAMode::SclLow => {
            if !(SMBUS_IDLE_TIMEOUT_MIN_NS..=SMBUS_IDLE_TIMEOUT_MAX_NS).contains(&timeout_ns) {
                return Err(I2cTimingError::InvalidParam);
            }
            timeout_field(clock_hz, timeout_ns, 2048)
        }
    }
}

/// Compute TIMEOUTB, the cumulative clock-low extend time: at most 25 ms as a device
/// (tLOW:SEXT), 10 ms as a host (tLOW:MEXT).
pub fn timeout_b(clock_hz: u32, timeout_ns: u32, role: SmbusRole) -> Result<u16, I2cTimingError> {
    let max = match role {
        SmbusRole::Device => SMBUS_SLAVE_EXT_LOW_TIMEOUT_MAX_NS,
        SmbusRole::Host => SMBUS_MASTER_EXT_LOW_TIMEOUT_MAX_NS,
    };
    if timeout_ns > max {
        return Err(I2cTimingError::InvalidParam);
    }
    timeout_field(clock_hz, timeout_ns, 2048)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_mode_ranges() {
        assert_eq!(SpeedMode::from_freq(100_000), Some(SpeedMode::Standard));
        assert_eq!(SpeedMode::from_freq(480_000), Some(SpeedMode::Fast));
        assert_eq!(SpeedMode::from_freq(1_000_000), Some(SpeedMode::FastPlus));
        assert_eq!(SpeedMode::from_freq(200_000), None);
    }

    #[test]
    fn timingr_16mhz() {
        assert_eq!(compute_timingr(16_000_000, 100_000, true, 0), Ok(0x00b0_4649));
        assert_eq!(compute_timingr(16_000_000, 400_000, true, 0), Ok(0x0030_0a12));
        assert_eq!(compute_timingr(16_000_000, 1_000_000, true, 0), Ok(0x0010_0205));
    }

    #[test]
    fn timingr_160mhz() {
        assert_eq!(compute_timingr(160_000_000, 100_000, true, 0), Ok(0x80d2_5455));
        assert_eq!(compute_timingr(160_000_000, 400_000, true, 0), Ok(0x20d5_2d44));
        assert_eq!(compute_timingr(160_000_000, 1_000_000, true, 0), Ok(0x1080_1924));
    }

    #[test]
    fn filters_change_result() {
        assert_eq!(compute_timingr(160_000_000, 100_000, false, 0), Ok(0xd082_3637));
        assert_eq!(compute_timingr(48_000_000, 400_000, true, 2), Ok(0x00b0_253a));
    }

    #[test]
    fn fields_decode() {
        let t = compute_timing(&TimingConfig::new(160_000_000, 1_000_000, true, 0)).unwrap();
        assert_eq!(
            t,
            Timing {
                presc: 1,
                scldel: 8,
                sdadel: 0,
                sclh: 25,
                scll: 36,
            }
        );
    }

    #[test]
    fn invalid_inputs() {
        assert_eq!(
            compute_timingr(160_000_000, 50_000, true, 0),
            Err(I2cTimingError::InvalidParam)
        );
        assert_eq!(compute_timingr(0, 100_000, true, 0), Err(I2cTimingError::InvalidParam));
        // Kernel clock too slow for Fast-mode Plus.
        assert_eq!(
            compute_timingr(1_000_000, 1_000_000, true, 0),
            Err(I2cTimingError::NoSolution)
        );
    }

    #[test]
    fn smbus_timeouts() {
        assert_eq!(timeout_a(160_000_000, 25_000_000, TimeoutAMode::SclLow), Ok(1952));
        assert_eq!(timeout_a(160_000_000, 50_000, TimeoutAMode::BusIdle), Ok(1999));
        assert_eq!(timeout_b(160_000_000, 25_000_000, SmbusRole::Device), Ok(1952));
        assert_eq!(timeout_b(160_000_000, 10_000_000, SmbusRole::Host), Ok(780));
    }

    #[test]
    fn smbus_timeouts_out_of_range() {
        assert_eq!(
            timeout_a(160_000_000, 20_000_000, TimeoutAMode::SclLow),
            Err(I2cTimingError::InvalidParam)
        );
        // Exceeds the 12-bit field.
        assert_eq!(
            timeout_a(160_000_000, 200_000, TimeoutAMode::BusIdle),
            Err(I2cTimingError::InvalidParam)
        );
        assert_eq!(
            timeout_b(160_000_000, 11_000_000, SmbusRole::Host),
            Err(I2cTimingError::InvalidParam)
        );
        assert_eq!(
            timeout_a(0, 30_000_000, TimeoutAMode::SclLow),
            Err(I2cTimingError::InvalidParam)
        );
    }
}
