//! Provides support for the general-purpose, advanced-control and basic timers. Includes
//! initialization, time base, interrupts, output compare and PWM features.
//!
//! Low-power timers (LPTIM) are not supported.
//!
//! Each instance implements `TimRegs` through the `hal!` macro. General-purpose and
//! advanced-control timers add the capture/compare channels in `TimChannels`.

use num_traits::float::Float;

use cfg_if::cfg_if;

use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerError {
    /// The requested frequency is zero, negative, or not a number.
    InvalidFreq,
    /// The requested frequency, or a PSC or ARR value, doesn't fit the timer's registers.
    OutOfRange,
}

/// Timer interrupt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerInterrupt {
    /// Update interrupt can be used for a timeout. DIER UIE to set, SR UIF to clear.
    Update,
    /// Trigger. DIER TIE to set, SR TIF to clear.
    Trigger,
    /// Capture/Compare. CC1IE to set, CC1IF to clear.
    CaptureCompare1,
    CaptureCompare2,
    CaptureCompare3,
    CaptureCompare4,
    /// Update DMA. DIER UDE to set.
    UpdateDma,
    /// Trigger DMA. TDE to set.
    TriggerDma,
    /// Capture/Compare DMA. CC1DE to set.
    CaptureCompare1Dma,
    CaptureCompare2Dma,
    CaptureCompare3Dma,
    CaptureCompare4Dma,
}

/// Counter alignment. Center-aligned modes count up then down, so a PWM output has half
/// the frequency of the edge-aligned equivalent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Alignment {
    Edge = 0b00,
    Center1 = 0b01,
    Center2 = 0b10,
    Center3 = 0b11,
}

/// Timer channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimChannel {
    C1,
    C2,
    C3,
    C4,
}

/// Timer count direction
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CountDir {
    Up = 0,
    Down = 1,
}

/// Capture/Compare selection.
/// This field defines the direction of the channel (input/output) as well as the used input.
/// It affects the TIMx_CCMRx register, CCxS fields.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CaptureCompare {
    Output = 0b00,
    InputTi1 = 0b01,
    InputTi2 = 0b10,
    InputTrc = 0b11,
}

/// Capture/Compare output polarity. Defaults to `ActiveHigh` in hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

impl Polarity {
    /// The CCxP / CCxNP bit for this polarity.
    pub fn bit(&self) -> bool {
        *self == Self::ActiveLow
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
/// Behavior of the output reference signal OCxREF, from which OCx and OCxN are derived.
/// OCxREF is active high; the OCx active level depends on the CCxP bit. RM0456, section
/// 54.6.7.
///
/// - `Frozen`: the comparison between CCRx and the counter has no effect on the outputs.
///   This mode is used to generate a time base.
/// - `Active` / `Inactive`: OCxREF is forced high / low when the counter matches CCRx.
/// - `Toggle`: OCxREF toggles when the counter matches CCRx.
/// - `ForceInactive` / `ForceActive`: OCxREF is held low / high.
/// - `Pwm1`: in upcounting, active while CNT < CCRx, else inactive. `Pwm2` is the inverse.
/// - The remaining modes combine the outputs of two channels, or retrigger on TRGI.
pub enum OutputCompare {
    Frozen = 0b0000,
    Active = 0b0001,
    Inactive = 0b0010,
    Toggle = 0b0011,
    ForceInactive = 0b0100,
    ForceActive = 0b0101,
    Pwm1 = 0b0110,
    Pwm2 = 0b0111,
    RetriggerableOpmMode1 = 0b1000,
    RetriggerableOpmMode2 = 0b1001,
    CombinedPwm1 = 0b1100,
    CombinedPwm2 = 0b1101,
    AsymmetricPwm1 = 0b1110,
    AsymmetricPwm2 = 0b1111,
}

impl OutputCompare {
    /// The OCxM field is split: its low three bits sit at bits 6:4 of the channel's CCMR
    /// byte, and the high bit at bit 16 (or 24 for channels 2 and 4).
    pub fn left_bit(&self) -> bool {
        (*self as u8) & 0b1000 != 0
    }

    /// The low three bits of OCxM.
    pub fn low_bits(&self) -> u8 {
        (*self as u8) & 0b111
    }
}

/// Initial configuration for a timer.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimerConfig {
    /// Stop the counter at the next update event. CR1 OPM.
    pub one_pulse_mode: bool,
    /// Buffer ARR writes until the next update event; useful when changing period
    /// mid-run. CR1 ARPE.
    pub auto_reload_preload: bool,
    pub alignment: Alignment,
    /// Count direction. Ignored by the hardware in center-aligned modes.
    pub direction: CountDir,
    /// Advanced timers only: generate an update event every `repetition_counter + 1`
    /// counter overflows.
    pub repetition_counter: u16,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            one_pulse_mode: false,
            auto_reload_preload: true,
            alignment: Alignment::Edge,
            direction: CountDir::Up,
            repetition_counter: 0,
        }
    }
}

/// Calculate values required to set the timer frequency: `PSC` and `ARR`. This can be
/// used for initial timer setup, or changing the value later. `freq` and `clock_speed`
/// are both in Hz.
///
/// (PSC+1)*(ARR+1) = TIMclk / update frequency. We set PSC and ARR equal to each other,
/// at the square root of the right-hand side. This doesn't limit the maximum period, at
/// the cost of some rounding error compared to an exhaustive factorization.
pub fn calc_freq_vals(freq: f32, clock_speed: u32) -> core::result::Result<(u16, u16), TimerError> {
    if !(freq > 0.) || !freq.is_finite() {
        return Err(TimerError::InvalidFreq);
    }

    let rhs = clock_speed as f32 / freq;
    let root = rhs.sqrt().round();

    if !(1. ..=65_536.).contains(&root) {
        return Err(TimerError::OutOfRange);
    }

    let arr = (root as u32 - 1) as u16;
    let psc = arr;

    Ok((psc, arr))
}

/// The update frequency, in Hz, that a PSC and ARR pair gives.
pub fn freq_from_vals(psc: u16, arr: u32, clock_speed: u32) -> f32 {
    clock_speed as f32 / ((psc as f32 + 1.) * (arr as f32 + 1.))
}

/// Convert a duty cycle, as a portion of the period (0. to 1.), to a CCR value.
pub fn duty_from_portion(max_duty: u32, portion: f32) -> u32 {
    let portion = portion.clamp(0., 1.);
    (max_duty as f32 * portion).round() as u32
}

/// Register access for a timer's time base and interrupt flags.
pub trait TimRegs {
    /// TIM2 to TIM5 have 32-bit counters; the rest are 16-bit.
    const ARR_32_BIT: bool;

    /// Apply `cfg` to CR1, and RCR where the timer has one. Leaves CEN alone.
    fn configure(&self, cfg: &TimerConfig);
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Set or clear an interrupt or DMA request enable in DIER. Requests the instance
    /// doesn't have are ignored.
    fn set_interrupt(&self, interrupt: TimerInterrupt, enabled: bool);
    fn clear_flag(&self, interrupt: TimerInterrupt);
    /// The SR flag for `interrupt`. DMA requests have none.
    fn flag(&self, interrupt: TimerInterrupt) -> bool;
    fn auto_reload(&self) -> u32;
    fn set_auto_reload(&self, arr: u32);
    fn prescaler(&self) -> u16;
    fn set_prescaler(&self, psc: u16);
    fn counter(&self) -> u32;
    fn set_counter(&self, count: u32);
    /// Set EGR UG.
    fn trigger_update(&self);
    fn set_arpe(&self, preload: bool);
    /// Stop the counter, mask interrupts, turn channel outputs off and clear flags.
    fn shut_down(&self);
}

/// Register access for the capture/compare channels.
pub trait TimChannels: TimRegs {
    fn set_alignment(&self, alignment: Alignment);
    fn compare(&self, channel: TimChannel) -> u32;
    fn set_compare(&self, channel: TimChannel, value: u32);
    fn set_oc_mode(&self, channel: TimChannel, mode: OutputCompare);
    fn set_cc_mode(&self, channel: TimChannel, mode: CaptureCompare);
    fn set_oc_preload(&self, channel: TimChannel, preload: bool);
    fn set_cc_enabled(&self, channel: TimChannel, enabled: bool);
    fn set_cc_polarity(&self, channel: TimChannel, polarity: Polarity);
    fn set_ccn_polarity(&self, channel: TimChannel, polarity: Polarity);
    /// BDTR MOE, on timers that have a break and dead-time register. A no-op elsewhere.
    fn set_main_output(&self, enabled: bool);
}

/// Represents a timer peripheral.
pub struct Timer<R> {
    /// Associated timer clock speed in Hz.
    pub clock_speed: u32,
    pub cfg: TimerConfig,
    regs: R,
}

impl<R: TimRegs> Timer<R> {
    /// Apply `cfg`, set the update frequency and load it with an update event. The counter
    /// stays stopped until `enable()`.
    #[cfg_attr(not(any(feature = "u5", test)), allow(dead_code))]
    fn from_regs(regs: R, freq: f32, cfg: TimerConfig, clock_speed: u32) -> Result<Self> {
        regs.configure(&cfg);

        let mut timer = Self {
            clock_speed,
            cfg,
            regs,
        };

        timer.set_freq(freq)?;

        // Trigger an update event to load the prescaler value to the clock.
        timer.generate_update();
        // The above line raises an update event which will indicate that the timer
        // is already finished. Since this is not the case, it should be cleared.
        timer.clear_interrupt(TimerInterrupt::Update);

        Ok(timer)
    }

    /// Stop the counter, mask its interrupts, turn off channel outputs, and return the
    /// register block.
    pub fn deinit(self) -> R {
        self.regs.shut_down();
        self.regs
    }

    /// Enable a specific type of timer interrupt, or DMA request.
    pub fn enable_interrupt(&mut self, interrupt: TimerInterrupt) {
        self.regs.set_interrupt(interrupt, true);
    }

    /// Disable a specific type of timer interrupt, or DMA request.
    pub fn disable_interrupt(&mut self, interrupt: TimerInterrupt) {
        self.regs.set_interrupt(interrupt, false);
    }

    /// Clears interrupt associated with this timer.
    ///
    /// If the interrupt is not cleared, it will immediately retrigger after
    /// the ISR has finished. For example, place this at the top of your timer's
    /// interrupt handler.
    pub fn clear_interrupt(&mut self, interrupt: TimerInterrupt) {
        self.regs.clear_flag(interrupt);
    }

    /// Check if an interrupt flag is set. Always false for DMA requests.
    pub fn is_pending(&self, interrupt: TimerInterrupt) -> bool {
        self.regs.flag(interrupt)
    }

    /// Enable the timer.
    pub fn enable(&mut self) {
        self.regs.set_enabled(true);
    }

    /// Disable the timer.
    pub fn disable(&mut self) {
        self.regs.set_enabled(false);
    }

    /// Check if the timer is enabled.
    pub fn is_enabled(&self) -> bool {
        self.regs.is_enabled()
    }

    /// Set the timer frequency, in Hz. Overrides the period or frequency set
    /// in the constructor. If you use `center` aligned PWM, make sure to
    /// enter twice the freq you normally would.
    pub fn set_freq(&mut self, freq: f32) -> Result<()> {
        let (psc, arr) = calc_freq_vals(freq, self.clock_speed)?;

        self.regs.set_auto_reload(arr as u32);
        self.regs.set_prescaler(psc);

        Ok(())
    }

    /// Set the auto-reload register value. Used for adjusting frequency.
    pub fn set_auto_reload(&mut self, arr: u32) -> Result<()> {
        if !R::ARR_32_BIT && arr > u16::MAX as u32 {
            return Err(TimerError::OutOfRange.into());
        }
        self.regs.set_auto_reload(arr);
        Ok(())
    }

    /// Set the prescaler value. Used for adjusting frequency.
    pub fn set_prescaler(&mut self, psc: u16) {
        self.regs.set_prescaler(psc);
    }

    pub fn get_prescaler(&self) -> u16 {
        self.regs.prescaler()
    }

    /// The update frequency the current PSC and ARR give, in Hz.
    pub fn get_freq(&self) -> f32 {
        freq_from_vals(self.get_prescaler(), self.get_max_duty(), self.clock_speed)
    }

    /// Reset the count; set the counter to 0.
    pub fn reset_count(&mut self) {
        self.regs.set_counter(0);
    }

    /// Read the current counter value.
    pub fn read_count(&self) -> u32 {
        self.regs.counter()
    }

    /// Re-initialize the counter and load PSC, ARR and the preloaded CCRs. Also raises
    /// the update flag.
    pub fn generate_update(&mut self) {
        self.regs.trigger_update();
    }

    /// Return the integer associated with the maximum duty period.
    pub fn get_max_duty(&self) -> u32 {
        self.regs.auto_reload()
    }

    /// Set auto reload preloader; useful when changing period and duty mid-run.
    pub fn set_auto_reload_preload(&mut self, mode: bool) {
        self.regs.set_arpe(mode);
        self.cfg.auto_reload_preload = mode;
    }
}

impl<R: TimChannels> Timer<R> {
    /// Enables basic PWM output. `duty` is a portion of the period, from 0. to 1.
    pub fn enable_pwm_output(&mut self, channel: TimChannel, compare: OutputCompare, duty: f32) {
        self.set_capture_compare(channel, CaptureCompare::Output);
        self.set_preload(channel, true);
        self.set_output_compare(channel, compare);
        self.set_duty(channel, duty_from_portion(self.get_max_duty(), duty));
        self.enable_capture_compare(channel);
    }

    /// Set Output Compare Mode. See docs on the `OutputCompare` enum.
    pub fn set_output_compare(&mut self, channel: TimChannel, mode: OutputCompare) {
        self.regs.set_oc_mode(channel, mode);
    }

    /// Return the set duty period for a given channel. Divide by `get_max_duty()`
    /// to find the portion of the duty cycle used.
    pub fn get_duty(&self, channel: TimChannel) -> u32 {
        self.regs.compare(channel)
    }

    /// Set the duty cycle, as a portion of ARR (`get_max_duty()`). Note that this
    /// needs to be re-run if you change ARR at any point.
    pub fn set_duty(&mut self, channel: TimChannel, duty: u32) {
        self.regs.set_compare(channel, duty);
    }

    /// Set timer alignment to Edge, or one of 3 center modes. The counter must be
    /// disabled to change between edge and center modes.
    pub fn set_alignment(&mut self, alignment: Alignment) {
        self.regs.set_alignment(alignment);
        self.cfg.alignment = alignment;
    }

    /// Set output polarity. See docs on the `Polarity` enum.
    pub fn set_polarity(&mut self, channel: TimChannel, polarity: Polarity) {
        self.regs.set_cc_polarity(channel, polarity);
    }

    /// Set complementary output polarity. See docs on the `Polarity` enum.
    pub fn set_complementary_polarity(&mut self, channel: TimChannel, polarity: Polarity) {
        self.regs.set_ccn_polarity(channel, polarity);
    }

    /// Disables capture compare on a specific channel.
    pub fn disable_capture_compare(&mut self, channel: TimChannel) {
        self.regs.set_cc_enabled(channel, false);
    }

    /// Enables capture compare on a specific channel. On timers with a break and
    /// dead-time register, this also sets the main output enable.
    pub fn enable_capture_compare(&mut self, channel: TimChannel) {
        self.regs.set_cc_enabled(channel, true);
        self.regs.set_main_output(true);
    }

    /// Set Capture Compare Mode. See docs on the `CaptureCompare` enum.
    /// CCxS bits are writable only when the channel is off (CCxE = 0).
    pub fn set_capture_compare(&mut self, channel: TimChannel, mode: CaptureCompare) {
        self.regs.set_cc_mode(channel, mode);
    }

    /// Set preload mode. With preload, CCRx writes take effect at the next update
    /// event. Setting preload is required to enable PWM, outside one pulse mode.
    pub fn set_preload(&mut self, channel: TimChannel, value: bool) {
        self.regs.set_oc_preload(channel, value);

        // "As the preload registers are transferred to the shadow registers only when an
        // update event occurs, before starting the counter, you have to initialize all
        // the registers by setting the UG bit in the TIMx_EGR register."
        self.generate_update();
    }

    /// Borrow one channel as an `embedded-hal` PWM output.
    #[cfg(feature = "embedded_hal")]
    pub fn pwm_pin(&mut self, channel: TimChannel) -> PwmPin<'_, R> {
        PwmPin { timer: self, channel }
    }
}

/// One timer channel, implementing `SetDutyCycle`.
#[cfg(feature = "embedded_hal")]
pub struct PwmPin<'a, R> {
    timer: &'a mut Timer<R>,
    channel: TimChannel,
}

#[cfg(feature = "embedded_hal")]
impl<R> embedded_hal::pwm::ErrorType for PwmPin<'_, R> {
    type Error = core::convert::Infallible;
}

#[cfg(feature = "embedded_hal")]
impl<R: TimChannels> embedded_hal::pwm::SetDutyCycle for PwmPin<'_, R> {
    fn max_duty_cycle(&self) -> u16 {
        self.timer.get_max_duty().min(u16::MAX as u32) as u16
    }

    fn set_duty_cycle(&mut self, duty: u16) -> core::result::Result<(), Self::Error> {
        self.timer.set_duty(self.channel, duty as u32);
        Ok(())
    }
}

cfg_if! {
    if #[cfg(feature = "u5")] {
        use cortex_m::interrupt::free;

        use crate::{
            clocks::Clocks,
            pac::{self, RCC},
            util::RccPeriph,
        };

        use paste::paste;

        /// A timer instance the driver can construct: its RCC enable and which clock feeds it.
        pub trait TimInstance: TimRegs + RccPeriph {
            /// The timer kernel clock; twice the APB clock when that APB's prescaler isn't 1.
            fn clock(clocks: &Clocks) -> u32;
        }

        impl<R: TimInstance> Timer<R> {
            /// Enable the timer's clock, apply `cfg`, and set the update frequency. The
            /// counter stays stopped until `enable()`.
            pub fn new(regs: R, freq: f32, cfg: TimerConfig, clocks: &Clocks) -> Result<Self> {
                free(|_| {
                    let rcc = unsafe { &(*RCC::ptr()) };
                    R::en_reset(rcc);
                });

                Self::from_regs(regs, freq, cfg, R::clock(clocks))
            }
        }

        macro_rules! hal {
            ($TIMX:ident, $clock:ident, $kind:ident, arr32: $arr32:expr, rcr: $rcr:tt) => {
                impl TimRegs for pac::$TIMX {
                    const ARR_32_BIT: bool = $arr32;

                    fn configure(&self, cfg: &TimerConfig) {
                        hal!(@cr1 $kind, self, cfg);
                        hal!(@rcr $rcr, self, cfg.repetition_counter);
                    }

                    fn set_enabled(&self, enabled: bool) {
                        self.cr1().modify(|_, w| w.cen().bit(enabled));
                    }

                    fn is_enabled(&self) -> bool {
                        self.cr1().read().cen().bit_is_set()
                    }

                    fn set_interrupt(&self, interrupt: TimerInterrupt, enabled: bool) {
                        hal!(@dier $kind, self, interrupt, enabled);
                    }

                    fn clear_flag(&self, interrupt: TimerInterrupt) {
                        // SR flags are rc_w0: clear by writing 0.
                        hal!(@sr_clear $kind, self, interrupt);
                    }

                    fn flag(&self, interrupt: TimerInterrupt) -> bool {
                        hal!(@sr_read $kind, self, interrupt)
                    }

                    fn auto_reload(&self) -> u32 {
                        self.arr().read().bits()
                    }

                    fn set_auto_reload(&self, arr: u32) {
                        self.arr().write(|w| unsafe { w.bits(arr) });
                    }

                    fn prescaler(&self) -> u16 {
                        self.psc().read().bits() as u16
                    }

                    fn set_prescaler(&self, psc: u16) {
                        self.psc().write(|w| unsafe { w.bits(psc.into()) });
                    }

                    fn counter(&self) -> u32 {
                        self.cnt().read().bits()
                    }

                    fn set_counter(&self, count: u32) {
                        self.cnt().write(|w| unsafe { w.bits(count) });
                    }

                    fn trigger_update(&self) {
                        // NOTE(write): bits in EGR are write-only triggers.
                        self.egr().write(|w| w.ug().set_bit());
                    }

                    fn set_arpe(&self, preload: bool) {
                        self.cr1().modify(|_, w| w.arpe().bit(preload));
                    }

                    fn shut_down(&self) {
                        self.cr1().modify(|_, w| w.cen().clear_bit());
                        self.dier().reset();
                        hal!(@ccer $kind, self);
                        self.sr().write(|w| unsafe { w.bits(0) });
                    }
                }

                impl TimInstance for pac::$TIMX {
                    fn clock(clocks: &Clocks) -> u32 {
                        clocks.$clock()
                    }
                }

                paste! {
                    impl Timer<pac::$TIMX> {
                        /// Configures a TIM peripheral as a periodic count down timer.
                        pub fn [<new_ $TIMX:lower>](
                            regs: pac::$TIMX,
                            freq: f32,
                            cfg: TimerConfig,
                            clocks: &Clocks,
                        ) -> Result<Self> {
                            Self::new(regs, freq, cfg, clocks)
                        }
                    }
                }
            };

            (@cr1 general, $regs:expr, $cfg:expr) => {
                $regs.cr1().modify(|_, w| unsafe {
                    w.opm().bit($cfg.one_pulse_mode);
                    w.dir().bit($cfg.direction == CountDir::Down);
                    w.cms().bits($cfg.alignment as u8);
                    w.arpe().bit($cfg.auto_reload_preload)
                })
            };
            // Up-counting only: no DIR or CMS.
            (@cr1 basic, $regs:expr, $cfg:expr) => {
                $regs.cr1().modify(|_, w| {
                    w.opm().bit($cfg.one_pulse_mode);
                    w.arpe().bit($cfg.auto_reload_preload)
                })
            };

            (@rcr true, $regs:expr, $val:expr) => {
                $regs.rcr().write(|w| unsafe { w.bits($val as u32) })
            };
            (@rcr false, $regs:expr, $val:expr) => {
                let _ = $val;
            };

            (@dier general, $regs:expr, $int:expr, $en:expr) => {
                $regs.dier().modify(|_, w| match $int {
                    TimerInterrupt::Update => w.uie().bit($en),
                    TimerInterrupt::Trigger => w.tie().bit($en),
                    TimerInterrupt::CaptureCompare1 => w.cc1ie().bit($en),
                    TimerInterrupt::CaptureCompare2 => w.cc2ie().bit($en),
                    TimerInterrupt::CaptureCompare3 => w.cc3ie().bit($en),
                    TimerInterrupt::CaptureCompare4 => w.cc4ie().bit($en),
                    TimerInterrupt::UpdateDma => w.ude().bit($en),
                    TimerInterrupt::TriggerDma => w.tde().bit($en),
                    TimerInterrupt::CaptureCompare1Dma => w.cc1de().bit($en),
                    TimerInterrupt::CaptureCompare2Dma => w.cc2de().bit($en),
                    TimerInterrupt::CaptureCompare3Dma => w.cc3de().bit($en),
                    TimerInterrupt::CaptureCompare4Dma => w.cc4de().bit($en),
                })
            };
            (@dier basic, $regs:expr, $int:expr, $en:expr) => {
                $regs.dier().modify(|_, w| match $int {
                    TimerInterrupt::Update => w.uie().bit($en),
                    TimerInterrupt::UpdateDma => w.ude().bit($en),
                    _ => w,
                })
            };

            (@sr_clear general, $regs:expr, $int:expr) => {
                $regs.sr().modify(|_, w| match $int {
                    TimerInterrupt::Update => w.uif().clear_bit(),
                    TimerInterrupt::Trigger => w.tif().clear_bit(),
                    TimerInterrupt::CaptureCompare1 => w.cc1if().clear_bit(),
                    TimerInterrupt::CaptureCompare2 => w.cc2if().clear_bit(),
                    TimerInterrupt::CaptureCompare3 => w.cc3if().clear_bit(),
                    TimerInterrupt::CaptureCompare4 => w.cc4if().clear_bit(),
                    _ => w,
                })
            };
            (@sr_clear basic, $regs:expr, $int:expr) => {
                if $int == TimerInterrupt::Update {
                    $regs.sr().modify(|_, w| w.uif().clear_bit());
                }
            };

            (@sr_read general, $regs:expr, $int:expr) => {{
                let sr = $regs.sr().read();
                match $int {
                    TimerInterrupt::Update => sr.uif().bit_is_set(),
                    TimerInterrupt::Trigger => sr.tif().bit_is_set(),
                    TimerInterrupt::CaptureCompare1 => sr.cc1if().bit_is_set(),
                    TimerInterrupt::CaptureCompare2 => sr.cc2if().bit_is_set(),
                    TimerInterrupt::CaptureCompare3 => sr.cc3if().bit_is_set(),
                    TimerInterrupt::CaptureCompare4 => sr.cc4if().bit_is_set(),
                    _ => false,
                }
            }};
            (@sr_read basic, $regs:expr, $int:expr) => {
                $int == TimerInterrupt::Update && $regs.sr().read().uif().bit_is_set()
            };

            (@ccer general, $regs:expr) => {
                $regs.ccer().reset()
            };
            (@ccer basic, $regs:expr) => {};
        }

        /// Write one channel's field of CCMRx or CCER, eg `oc3pe` or `cc2np`.
        macro_rules! channel_field {
            (ccmr, $ch:expr, $regs:expr, $pre:ident, $suf:ident, $method:ident, $val:expr) => {
                paste! {
                    // Unsafe may or may not be required, depending on the field.
                    #[allow(unused_unsafe)]
                    unsafe {
                        match $ch {
                            TimChannel::C1 => $regs.ccmr1_output().modify(|_, w| w.[<$pre 1 $suf>]().$method($val)),
                            TimChannel::C2 => $regs.ccmr1_output().modify(|_, w| w.[<$pre 2 $suf>]().$method($val)),
                            TimChannel::C3 => $regs.ccmr2_output().modify(|_, w| w.[<$pre 3 $suf>]().$method($val)),
                            TimChannel::C4 => $regs.ccmr2_output().modify(|_, w| w.[<$pre 4 $suf>]().$method($val)),
                        }
                    }
                }
            };
            (ccer, $ch:expr, $regs:expr, $suf:ident, $val:expr) => {
                paste! {
                    match $ch {
                        TimChannel::C1 => $regs.ccer().modify(|_, w| w.[<cc1 $suf>]().bit($val)),
                        TimChannel::C2 => $regs.ccer().modify(|_, w| w.[<cc2 $suf>]().bit($val)),
                        TimChannel::C3 => $regs.ccer().modify(|_, w| w.[<cc3 $suf>]().bit($val)),
                        TimChannel::C4 => $regs.ccer().modify(|_, w| w.[<cc4 $suf>]().bit($val)),
                    }
                }
            };
        }

        macro_rules! pwm_features {
            ($TIMX:ident, bdtr: $bdtr:tt) => {
                impl TimChannels for pac::$TIMX {
                    fn set_alignment(&self, alignment: Alignment) {
                        self.cr1().modify(|_, w| unsafe { w.cms().bits(alignment as u8) });
                    }

                    fn compare(&self, channel: TimChannel) -> u32 {
                        match channel {
                            TimChannel::C1 => self.ccr1().read().bits(),
                            TimChannel::C2 => self.ccr2().read().bits(),
                            TimChannel::C3 => self.ccr3().read().bits(),
                            TimChannel::C4 => self.ccr4().read().bits(),
                        }
                    }

                    fn set_compare(&self, channel: TimChannel, value: u32) {
                        unsafe {
                            match channel {
                                TimChannel::C1 => self.ccr1().write(|w| w.bits(value)),
                                TimChannel::C2 => self.ccr2().write(|w| w.bits(value)),
                                TimChannel::C3 => self.ccr3().write(|w| w.bits(value)),
                                TimChannel::C4 => self.ccr4().write(|w| w.bits(value)),
                            }
                        }
                    }

                    fn set_oc_mode(&self, channel: TimChannel, mode: OutputCompare) {
                        channel_field!(ccmr, channel, self, oc, m, bits, mode.low_bits());
                        channel_field!(ccmr, channel, self, oc, m_3, bit, mode.left_bit());
                    }

                    fn set_cc_mode(&self, channel: TimChannel, mode: CaptureCompare) {
                        channel_field!(ccmr, channel, self, cc, s, bits, mode as u8);
                    }

                    fn set_oc_preload(&self, channel: TimChannel, preload: bool) {
                        channel_field!(ccmr, channel, self, oc, pe, bit, preload);
                    }

                    fn set_cc_enabled(&self, channel: TimChannel, enabled: bool) {
                        channel_field!(ccer, channel, self, e, enabled);
                    }

                    fn set_cc_polarity(&self, channel: TimChannel, polarity: Polarity) {
                        channel_field!(ccer, channel, self, p, polarity.bit());
                    }

                    fn set_ccn_polarity(&self, channel: TimChannel, polarity: Polarity) {
                        channel_field!(ccer, channel, self, np, polarity.bit());
                    }

                    fn set_main_output(&self, enabled: bool) {
                        pwm_features!(@moe $bdtr, self, enabled);
                    }
                }
            };

            (@moe true, $regs:expr, $en:expr) => {
                $regs.bdtr().modify(|_, w| w.moe().bit($en))
            };
            (@moe false, $regs:expr, $en:expr) => {
                let _ = $en;
            };
        }

        hal!(TIM1, apb2_timer, general, arr32: false, rcr: true);
        pwm_features!(TIM1, bdtr: true);
        hal!(TIM2, apb1_timer, general, arr32: true, rcr: false);
        pwm_features!(TIM2, bdtr: false);
        hal!(TIM3, apb1_timer, general, arr32: true, rcr: false);
        pwm_features!(TIM3, bdtr: false);
        hal!(TIM4, apb1_timer, general, arr32: true, rcr: false);
        pwm_features!(TIM4, bdtr: false);
        hal!(TIM5, apb1_timer, general, arr32: true, rcr: false);
        pwm_features!(TIM5, bdtr: false);
        hal!(TIM6, apb1_timer, basic, arr32: false, rcr: false);
        hal!(TIM7, apb1_timer, basic, arr32: false, rcr: false);
        #[cfg(tim8)]
        hal!(TIM8, apb2_timer, general, arr32: false, rcr: true);
        #[cfg(tim8)]
        pwm_features!(TIM8, bdtr: true);

        // TIM15 to TIM17 have fewer than four channels; they're used as time bases only.
        hal!(TIM15, apb2_timer, basic, arr32: false, rcr: true);
        hal!(TIM16, apb2_timer, basic, arr32: false, rcr: true);
        hal!(TIM17, apb2_timer, basic, arr32: false, rcr: true);
    }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use super::*;
    use crate::error::Error;

    #[test]
    fn freq_vals_exact_square() {
        // 160 MHz / 1 kHz = 160_000 = 400 * 400.
        assert_eq!(calc_freq_vals(1_000., 160_000_000), Ok((399, 399)));
    }

    #[test]
    fn freq_vals_slow_timer() {
        let (psc, arr) = calc_freq_vals(1., 160_000_000).unwrap();
        assert_eq!((psc, arr), (12_648, 12_648));

        let actual = freq_from_vals(psc, arr as u32, 160_000_000);
        assert!((actual - 1.).abs() < 0.001);
    }

    #[test]
    fn freq_vals_at_timer_clock() {
        assert_eq!(calc_freq_vals(160_000_000., 160_000_000), Ok((0, 0)));
    }

    #[test]
    fn freq_vals_out_of_range() {
        // Needs more than 65536 * 65536 timer clocks per period.
        assert_eq!(calc_freq_vals(0.001, 160_000_000), Err(TimerError::OutOfRange));
        // Faster than the timer clock.
        assert_eq!(calc_freq_vals(1.0e9, 160_000_000), Err(TimerError::OutOfRange));
    }

    #[test]
    fn freq_vals_invalid() {
        assert_eq!(calc_freq_vals(0., 16_000_000), Err(TimerError::InvalidFreq));
        assert_eq!(calc_freq_vals(-5., 16_000_000), Err(TimerError::InvalidFreq));
        assert_eq!(calc_freq_vals(f32::NAN, 16_000_000), Err(TimerError::InvalidFreq));
        assert_eq!(calc_freq_vals(f32::INFINITY, 16_000_000), Err(TimerError::InvalidFreq));
    }

    #[test]
    fn time_base_from_explicit_vals() {
        // 16 MHz, PSC 15999, ARR 4: one update every 5 ms.
        assert_eq!(freq_from_vals(15_999, 4, 16_000_000), 200.);
    }

    #[test]
    fn duty_portion() {
        assert_eq!(duty_from_portion(2047, 0.), 0);
        assert_eq!(duty_from_portion(2047, 1.), 2047);
        assert_eq!(duty_from_portion(40, 0.5), 20);
        assert_eq!(duty_from_portion(40, 1.5), 40);
        assert_eq!(duty_from_portion(40, -1.), 0);
    }

    #[test]
    fn output_compare_split_field() {
        assert!(!OutputCompare::Pwm1.left_bit());
        assert_eq!(OutputCompare::Pwm1.low_bits(), 0b110);
        assert!(OutputCompare::AsymmetricPwm2.left_bit());
        assert_eq!(OutputCompare::CombinedPwm1.low_bits(), 0b100);
        assert!(Polarity::ActiveLow.bit());
        assert!(!Polarity::ActiveHigh.bit());
    }

    /// A 16-bit timer with four channels and a BDTR.
    #[derive(Default)]
    struct FakeTim {
        cfg: Cell<Option<(bool, bool, CountDir, Alignment, u16)>>,
        cen: Cell<bool>,
        arpe: Cell<bool>,
        dier: Cell<u16>,
        uif: Cell<bool>,
        cc1if: Cell<bool>,
        arr: Cell<u32>,
        psc: Cell<u16>,
        cnt: Cell<u32>,
        updates: Cell<u32>,
        ccr: [Cell<u32>; 4],
        oc_mode: [Cell<u8>; 4],
        cc_output: [Cell<bool>; 4],
        preload: [Cell<bool>; 4],
        cc_en: [Cell<bool>; 4],
        cc_low: [Cell<bool>; 4],
        moe: Cell<bool>,
    }

    fn ch(channel: TimChannel) -> usize {
        match channel {
            TimChannel::C1 => 0,
            TimChannel::C2 => 1,
            TimChannel::C3 => 2,
            TimChannel::C4 => 3,
        }
    }

    impl TimRegs for FakeTim {
        const ARR_32_BIT: bool = false;

        fn configure(&self, cfg: &TimerConfig) {
            self.cfg.set(Some((
                cfg.one_pulse_mode,
                cfg.auto_reload_preload,
                cfg.direction,
                cfg.alignment,
                cfg.repetition_counter,
            )));
            self.arpe.set(cfg.auto_reload_preload);
        }
        fn set_enabled(&self, enabled: bool) {
            self.cen.set(enabled);
        }
        fn is_enabled(&self) -> bool {
            self.cen.get()
        }
        fn set_interrupt(&self, interrupt: TimerInterrupt, enabled: bool) {
            let bit = 1 << interrupt as u16;
            let dier = self.dier.get();
            self.dier.set(if enabled { dier | bit } else { dier & !bit });
        }
        fn clear_flag(&self, interrupt: TimerInterrupt) {
            match interrupt {
                TimerInterrupt::Update => self.uif.set(false),
                TimerInterrupt::CaptureCompare1 => self.cc1if.set(false),
                _ => (),
            }
        }
        fn flag(&self, interrupt: TimerInterrupt) -> bool {
            match interrupt {
                TimerInterrupt::Update => self.uif.get(),
                TimerInterrupt::CaptureCompare1 => self.cc1if.get(),
                _ => false,
            }
        }
        fn auto_reload(&self) -> u32 {
            self.arr.get()
        }
        fn set_auto_reload(&self, arr: u32) {
            self.arr.set(arr);
        }
        fn prescaler(&self) -> u16 {
            self.psc.get()
        }
        fn set_prescaler(&self, psc: u16) {
            self.psc.set(psc);
        }
        fn counter(&self) -> u32 {
            self.cnt.get()
        }
        fn set_counter(&self, count: u32) {
            self.cnt.set(count);
        }
        fn trigger_update(&self) {
            self.updates.set(self.updates.get() + 1);
            self.cnt.set(0);
            self.uif.set(true);
        }
        fn set_arpe(&self, preload: bool) {
            self.arpe.set(preload);
        }
        fn shut_down(&self) {
            self.cen.set(false);
            self.dier.set(0);
            for en in &self.cc_en {
                en.set(false);
            }
            self.uif.set(false);
            self.cc1if.set(false);
        }
    }

    impl TimChannels for FakeTim {
        fn set_alignment(&self, alignment: Alignment) {
            if let Some((opm, arpe, dir, _, rcr)) = self.cfg.get() {
                self.cfg.set(Some((opm, arpe, dir, alignment, rcr)));
            }
        }
        fn compare(&self, channel: TimChannel) -> u32 {
            self.ccr[ch(channel)].get()
        }
        fn set_compare(&self, channel: TimChannel, value: u32) {
            self.ccr[ch(channel)].set(value);
        }
        fn set_oc_mode(&self, channel: TimChannel, mode: OutputCompare) {
            self.oc_mode[ch(channel)].set(mode as u8);
        }
        fn set_cc_mode(&self, channel: TimChannel, mode: CaptureCompare) {
            self.cc_output[ch(channel)].set(mode == CaptureCompare::Output);
        }
        fn set_oc_preload(&self, channel: TimChannel, preload: bool) {
            self.preload[ch(channel)].set(preload);
        }
        fn set_cc_enabled(&self, channel: TimChannel, enabled: bool) {
            self.cc_en[ch(channel)].set(enabled);
        }
        fn set_cc_polarity(&self, channel: TimChannel, polarity: Polarity) {
            self.cc_low[ch(channel)].set(polarity.bit());
        }
        fn set_ccn_polarity(&self, _channel: TimChannel, _polarity: Polarity) {}
        fn set_main_output(&self, enabled: bool) {
            self.moe.set(enabled);
        }
    }

    fn timer(freq: f32) -> Timer<FakeTim> {
        Timer::from_regs(FakeTim::default(), freq, TimerConfig::default(), 160_000_000).unwrap()
    }

    #[test]
    fn new_loads_time_base() {
        let timer = timer(1_000.);
        let regs = &timer.regs;

        assert_eq!(regs.cfg.get(), Some((false, true, CountDir::Up, Alignment::Edge, 0)));
        assert_eq!((regs.psc.get(), regs.arr.get()), (399, 399));
        assert_eq!(regs.updates.get(), 1);
        // The update raised to load PSC doesn't read as a pending interrupt.
        assert!(!timer.is_pending(TimerInterrupt::Update));
        assert!(!timer.is_enabled());
        assert_eq!(timer.get_freq(), 1_000.);
    }

    #[test]
    fn new_rejects_bad_freq() {
        let result = Timer::from_regs(FakeTim::default(), 0., TimerConfig::default(), 160_000_000);
        assert!(matches!(result, Err(Error::TimerError(TimerError::InvalidFreq))));
    }

    #[test]
    fn auto_reload_width() {
        let mut timer = timer(1_000.);

        assert_eq!(
            timer.set_auto_reload(70_000),
            Err(Error::TimerError(TimerError::OutOfRange))
        );
        assert_eq!(timer.get_max_duty(), 399);

        timer.set_auto_reload(60_000).unwrap();
        assert_eq!(timer.get_max_duty(), 60_000);
    }

    #[test]
    fn interrupt_flags() {
        let mut timer = timer(1_000.);

        timer.enable_interrupt(TimerInterrupt::Update);
        timer.enable_interrupt(TimerInterrupt::CaptureCompare1);
        timer.disable_interrupt(TimerInterrupt::CaptureCompare1);
        assert_eq!(timer.regs.dier.get(), 1 << TimerInterrupt::Update as u16);

        timer.generate_update();
        assert!(timer.is_pending(TimerInterrupt::Update));
        assert!(!timer.is_pending(TimerInterrupt::UpdateDma));
        timer.clear_interrupt(TimerInterrupt::Update);
        assert!(!timer.is_pending(TimerInterrupt::Update));
    }

    #[test]
    fn pwm_output() {
        let mut timer = timer(1_000.);
        timer.enable_pwm_output(TimChannel::C2, OutputCompare::Pwm1, 0.25);

        let regs = &timer.regs;
        assert!(regs.cc_output[1].get());
        assert!(regs.preload[1].get());
        assert_eq!(regs.oc_mode[1].get(), OutputCompare::Pwm1 as u8);
        // 399 * 0.25 rounds to 100.
        assert_eq!(timer.get_duty(TimChannel::C2), 100);
        assert!(regs.cc_en[1].get());
        assert!(regs.moe.get());
        assert!(!regs.cc_en[0].get());

        timer.set_polarity(TimChannel::C2, Polarity::ActiveLow);
        assert!(timer.regs.cc_low[1].get());
        timer.disable_capture_compare(TimChannel::C2);
        assert!(!timer.regs.cc_en[1].get());
    }

    #[test]
    fn alignment_and_preload_track_config() {
        let mut timer = timer(1_000.);

        timer.set_alignment(Alignment::Center3);
        assert_eq!(timer.cfg.alignment, Alignment::Center3);
        assert_eq!(
            timer.regs.cfg.get(),
            Some((false, true, CountDir::Up, Alignment::Center3, 0))
        );

        timer.set_auto_reload_preload(false);
        assert!(!timer.cfg.auto_reload_preload);
        assert!(!timer.regs.arpe.get());
    }

    #[test]
    fn count_and_deinit() {
        let mut timer = timer(1_000.);
        timer.enable_pwm_output(TimChannel::C1, OutputCompare::Toggle, 0.5);
        timer.enable_interrupt(TimerInterrupt::Update);
        timer.enable();
        timer.regs.cnt.set(123);
        assert_eq!(timer.read_count(), 123);
        timer.reset_count();
        assert_eq!(timer.read_count(), 0);

        let regs = timer.deinit();
        assert!(!regs.cen.get());
        assert_eq!(regs.dier.get(), 0);
        assert!(!regs.cc_en[0].get());
    }
}
