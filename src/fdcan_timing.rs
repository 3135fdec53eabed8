//! FDCAN bit timing calculation: find a prescaler and time segments that give a bit rate
//! within tolerance of the one requested, with the requested sample point.
//!
//! All rates are in kHz/kbit/s, and sample points and tolerances in per mille (87.5% is 875).

/// Limits on the timing fields for one phase of a CAN FD frame.
#[derive(Clone, Copy, Debug)]
struct Limits {
    prescaler: (u32, u32),
    seg1: (u32, u32),
    seg2: (u32, u32),
}

const NOMINAL_LIMITS: Limits = Limits {
    prescaler: (1, 512),
    seg1: (2, 256),
    seg2: (2, 128),
};

const DATA_LIMITS: Limits = Limits {
    prescaler: (1, 32),
    seg1: (1, 32),
    seg2: (1, 16),
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FdcanTimingError {
    /// No prescaler gives a bit rate within tolerance.
    NoSolution,
    /// A timing field is zero, or too large for its register field.
    InvalidTiming,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Which phase of the frame the timing is for.
pub enum Phase {
    /// Arbitration phase, and the whole frame on classic CAN.
    Nominal,
    /// Data phase of a CAN FD frame with bit rate switching.
    Data,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Bus parameters to compute a timing for.
pub struct BusParams {
    /// FDCAN kernel clock.
    pub clock_khz: u32,
    pub bitrate_kbps: u32,
    pub sample_point_permille: u16,
    pub tolerance_permille: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Bit timing, as real (not register-encoded) values, in time quanta.
pub struct BitTiming {
    pub prescaler: u32,
    pub sync_jump_width: u32,
    pub time_seg1: u32,
    pub time_seg2: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// What a bit timing actually achieves.
pub struct RealTiming {
    pub bitrate_kbps: u32,
    pub sample_point_permille: u16,
}

fn div_round_closest(x: u64, d: u64) -> u64 {
    (x + d / 2) / d
}

fn div_round_up(x: u64, d: u64) -> u64 {
    x.div_ceil(d)
}

fn sample_point(seg1: u32, seg2: u32) -> u16 {
    div_round_closest(1_000 + 1_000 * seg1 as u64, 1 + seg1 as u64 + seg2 as u64) as u16
}

fn bitrate(clock_khz: u32, sample_point: u16, prescaler: u32, seg1: u32) -> u32 {
    div_round_closest(
        clock_khz as u64 * sample_point as u64,
        1_000 * prescaler as u64 * (1 + seg1 as u64),
    ) as u32
}

/// Search prescalers from smallest to largest, and return the first timing whose bit rate
/// deviates from the requested one by no more than the tolerance.
pub fn compute(params: &BusParams, phase: Phase) -> Result<(BitTiming, RealTiming), FdcanTimingError> {
    let limits = match phase {
        Phase::Nominal => NOMINAL_LIMITS,
        Phase::Data => DATA_LIMITS,
    };

    let clk_sp = params.clock_khz as u64 * params.sample_point_permille as u64;
    // Clock ticks after the sample point, scaled by 1000.
    let after_sp = (1_000 * params.clock_khz as u64).saturating_sub(clk_sp);

    for prescaler in limits.prescaler.0..=limits.prescaler.1 {
        let product = prescaler as u64 * params.bitrate_kbps as u64 * 1_000;
        if product == 0 {
            continue;
        }

        let seg1 = div_round_closest(clk_sp, product).wrapping_sub(1);
        let seg2 = div_round_closest(after_sp, product);

        let in_range = |v: u64, (min, max): (u32, u32)| v >= min as u64 && v <= max as u64;
        if !in_range(seg1, limits.seg1) || !in_range(seg2, limits.seg2) {
            continue;
        }

        let (seg1, seg2) = (seg1 as u32, seg2 as u32);
        let real_sp = sample_point(seg1, seg2);
        let real_br = bitrate(params.clock_khz, real_sp, prescaler, seg1);

        let desired = params.bitrate_kbps as u64;
        let deviation = div_round_up(
            2 * 1_000 * desired.abs_diff(real_br as u64),
            desired + real_br as u64,
        );

        if deviation <= params.tolerance_permille as u64 {
            return Ok((
                BitTiming {
                    prescaler,
                    sync_jump_width: 1,
                    time_seg1: seg1,
                    time_seg2: seg2,
                },
                RealTiming {
                    bitrate_kbps: real_br,
                    sample_point_permille: real_sp,
                },
            ));
        }
    }

    Err(FdcanTimingError::NoSolution)
}

impl BitTiming {
    /// Check each field is in `1..=max`, where `max` is the largest value its register field
    /// holds (the field stores the value minus one).
    fn check(&self, psc: u32, sjw: u32, seg1: u32, seg2: u32) -> Result<(), FdcanTimingError> {
        let ok = |v: u32, max: u32| (1..=max).contains(&v);
        if ok(self.prescaler, psc)
            && ok(self.sync_jump_width, sjw)
            && ok(self.time_seg1, seg1)
            && ok(self.time_seg2, seg2)
        {
            Ok(())
        } else {
            Err(FdcanTimingError::InvalidTiming)
        }
    }

    /// The bit rate and sample point this timing gives with a kernel clock of `clock_khz`.
    pub fn real(&self, clock_khz: u32) -> Result<RealTiming, FdcanTimingError> {
        if self.prescaler == 0 {
            return Err(FdcanTimingError::InvalidTiming);
        }
        let sp = sample_point(self.time_seg1, self.time_seg2);
        Ok(RealTiming {
            bitrate_kbps: bitrate(clock_khz, sp, self.prescaler, self.time_seg1),
            sample_point_permille: sp,
        })
    }

    /// Encode as FDCAN_NBTP: NSJW[31:25], NBRP[24:16], NTSEG1[15:8], NTSEG2[6:0]. Each field
    /// holds its value minus one.
    pub fn nbtp_bits(&self) -> Result<u32, FdcanTimingError> {
        self.check(512, 128, 256, 128)?;
        Ok((self.sync_jump_width - 1) << 25
            | (self.prescaler - 1) << 16
            | (self.time_seg1 - 1) << 8
            | (self.time_seg2 - 1))
    }

    /// Encode as FDCAN_DBTP: DBRP[20:16], DTSEG1[12:8], DTSEG2[7:4], DSJW[3:0].
    pub fn dbtp_bits(&self) -> Result<u32, FdcanTimingError> {
        self.check(32, 16, 32, 16)?;
        Ok((self.prescaler - 1) << 16
            | (self.time_seg1 - 1) << 8
            | (self.time_seg2 - 1) << 4
            | (self.sync_jump_width - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominal_500k_at_80mhz() {
        let params = BusParams {
            clock_khz: 80_000,
            bitrate_kbps: 500,
            sample_point_permille: 875,
            tolerance_permille: 10,
        };
        let (timing, real) = compute(&params, Phase::Nominal).unwrap();

        assert_eq!(
            timing,
            BitTiming {
                prescaler: 1,
                sync_jump_width: 1,
                time_seg1: 139,
                time_seg2: 20,
            }
        );
        assert_eq!(real.bitrate_kbps, 500);
        assert_eq!(real.sample_point_permille, 875);
        assert_eq!(timing.real(80_000), Ok(real));
    }

    #[test]
    fn data_2m_at_80mhz() {
        let params = BusParams {
            clock_khz: 80_000,
            bitrate_kbps: 2_000,
            sample_point_permille: 750,
            tolerance_permille: 10,
        };
        let (timing, real) = compute(&params, Phase::Data).unwrap();

        assert_eq!((timing.prescaler, timing.time_seg1, timing.time_seg2), (1, 29, 10));
        assert_eq!(real.bitrate_kbps, 2_000);
        assert_eq!(real.sample_point_permille, 750);
    }

    #[test]
    fn larger_prescaler_when_segments_overflow() {
        // 125 kbit/s from 80 MHz needs 640 quanta per bit at prescaler 1.
        let params = BusParams {
            clock_khz: 80_000,
            bitrate_kbps: 125,
            sample_point_permille: 875,
            tolerance_permille: 5,
        };
        let (timing, real) = compute(&params, Phase::Nominal).unwrap();

        assert!(timing.prescaler > 1);
        assert!((2..=256).contains(&timing.time_seg1));
        assert!((2..=128).contains(&timing.time_seg2));
        assert_eq!(real.bitrate_kbps, 125);
    }

    #[test]
    fn zero_bitrate_has_no_solution() {
        let params = BusParams {
            clock_khz: 80_000,
            bitrate_kbps: 0,
            sample_point_permille: 875,
            tolerance_permille: 10,
        };
        assert_eq!(compute(&params, Phase::Nominal), Err(FdcanTimingError::NoSolution));
    }

    #[test]
    fn data_phase_limits_reject_slow_rates() {
        // Needs more than 32 * 49 quanta per bit.
        let params = BusParams {
            clock_khz: 160_000,
            bitrate_kbps: 50,
            sample_point_permille: 800,
            tolerance_permille: 0,
        };
        assert_eq!(compute(&params, Phase::Data), Err(FdcanTimingError::NoSolution));
    }

    #[test]
    fn register_encoding() {
        let t = BitTiming {
            prescaler: 1,
            sync_jump_width: 1,
            time_seg1: 139,
            time_seg2: 20,
        };
        assert_eq!(t.nbtp_bits(), Ok((138 << 8) | 19));

        let d = BitTiming {
            prescaler: 2,
            sync_jump_width: 4,
            time_seg1: 29,
            time_seg2: 10,
        };
        assert_eq!(d.dbtp_bits(), Ok((1 << 16) | (28 << 8) | (9 << 4) | 3));
    }

    #[test]
    fn zeroed_timing_is_rejected() {
        let zero = BitTiming {
            prescaler: 0,
            sync_jump_width: 0,
            time_seg1: 0,
            time_seg2: 0,
        };
        assert_eq!(zero.nbtp_bits(), Err(FdcanTimingError::InvalidTiming));
        assert_eq!(zero.dbtp_bits(), Err(FdcanTimingError::InvalidTiming));
        assert_eq!(zero.real(80_000), Err(FdcanTimingError::InvalidTiming));

        // One field at zero is enough.
        let no_sjw = BitTiming {
            prescaler: 1,
            sync_jump_width: 0,
            time_seg1: 139,
            time_seg2: 20,
        };
        assert_eq!(no_sjw.nbtp_bits(), Err(FdcanTimingError::InvalidTiming));
    }

    #[test]
    fn oversized_fields_are_rejected() {
        // Fits NBTP, but DTSEG1 only holds 32.
        let t = BitTiming {
            prescaler: 1,
            sync_jump_width: 1,
            time_seg1: 139,
            time_seg2: 20,
        };
        assert!(t.nbtp_bits().is_ok());
        assert_eq!(t.dbtp_bits(), Err(FdcanTimingError::InvalidTiming));

        let wide = BitTiming {
            prescaler: 513,
            ..t
        };
        assert_eq!(wide.nbtp_bits(), Err(FdcanTimingError::InvalidTiming));
    }
}
