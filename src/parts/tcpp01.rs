//! TCPP01-M12 USB Type-C port protection. The chip signals faults and cable events on its
//! open-drain FLT pin, routed to an EXTI line; VBUS is sensed through a resistor divider on
//! an ADC input; and its DB pin selects dead battery mode, which must be left once the MCU is
//! powered so the CC lines can be driven.

use crate::{
    error::{Error, Result},
    gpio::{Edge, PinState},
};

/// Time allowed for one VBUS conversion, in ms.
pub const ADC_CONVERSION_TIMEOUT_MS: u32 = 10;

/// Board wiring of the chip.
pub trait Tcpp01Io {
    /// Board-specific setup. Runs once, on the first `init`.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_dead_battery_pin(&mut self, state: PinState);

    /// Start a VBUS conversion, and wait for it.
    fn start_conversion(&mut self) -> Result<()>;

    fn stop_conversion(&mut self) -> Result<()>;

    /// The last conversion result, and the ADC resolution in bits.
    fn adc_value(&mut self) -> (u32, u8);

    fn enable_exti(&mut self) -> Result<()>;

    fn disable_exti(&mut self) -> Result<()>;

    fn clear_exti(&mut self);

    /// Unmask the FLT line's interrupt in the NVIC.
    fn enable_irq(&mut self);

    fn disable_irq(&mut self);
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Tcpp01Config {
    /// VBUS divider: the resistor from VBUS to the ADC input, in ohms.
    pub ra_ohm: u32,
    /// VBUS divider: the resistor from the ADC input to ground, in ohms.
    pub rb_ohm: u32,
    /// ADC reference voltage, in mV.
    pub vdd_mv: u32,
    /// The DB pin level that takes the chip out of dead battery mode.
    pub db_active_state: PinState,
}

impl Default for Tcpp01Config {
    /// The NUCLEO and Discovery boards: 40.2 kΩ over 10 kΩ, 3.3 V reference.
    fn default() -> Self {
        Self {
            ra_ohm: 40_200,
            rb_ohm: 10_000,
            vdd_mv: 3_300,
            db_active_state: PinState::High,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CableEvent {
    /// FLT fell.
    Plugged,
    /// FLT rose.
    Unplugged,
}

/// Run from the EXTI handler, with the device id and the argument given at registration.
pub type Tcpp01Callback = fn(dev_id: u32, arg: usize);

/// Converts an ADC reading to the ADC input voltage, then scales it up through the divider.
pub fn vbus_voltage_mv(cfg: &Tcpp01Config, raw: u32, resolution_bits: u8) -> u32 {
    let full_scale = (1u64 << resolution_bits) - 1;
    let adc_mv = raw as u64 * cfg.vdd_mv as u64 / full_scale;
    (adc_mv * (cfg.ra_ohm + cfg.rb_ohm) as u64 / cfg.rb_ohm as u64) as u32
}

pub struct Tcpp01<IO> {
    pub io: IO,
    pub cfg: Tcpp01Config,
    pub dev_id: u32,
    initialized: bool,
    plugged_cb: Option<(Tcpp01Callback, usize)>,
    unplugged_cb: Option<(Tcpp01Callback, usize)>,
}

impl<IO: Tcpp01Io> Tcpp01<IO> {
    pub fn new(io: IO, cfg: Tcpp01Config) -> Self {
        Self {
            io,
            cfg,
            dev_id: 0,
            initialized: false,
            plugged_cb: None,
            unplugged_cb: None,
        }
    }

    /// Run the board setup and leave dead battery mode. Does nothing but record `dev_id`
    /// if already initialized.
    pub fn init(&mut self, dev_id: u32) -> Result<()> {
        self.dev_id = dev_id;
        if !self.initialized {
            self.io.init()?;
            self.disable_dead_battery();
            self.initialized = true;
            debug!("TCPP01 {=u32} initialized", dev_id);
        }
        Ok(())
    }

    /// Put the chip back in dead battery mode. Errors if not initialized.
    pub fn deinit(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(Error::InvalidParam);
        }
        self.enable_dead_battery();
        self.initialized = false;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn enable_dead_battery(&mut self) {
        self.io.set_dead_battery_pin(self.cfg.db_active_state.toggled());
    }

    pub fn disable_dead_battery(&mut self) {
        self.io.set_dead_battery_pin(self.cfg.db_active_state);
    }

    pub fn enable_it(&mut self) -> Result<()> {
        self.io.clear_exti();
        self.io.enable_irq();
        self.io.enable_exti()
    }

    pub fn disable_it(&mut self) -> Result<()> {
        self.io.clear_exti();
        self.io.disable_irq();
        self.io.disable_exti()
    }

    pub fn clear_it(&mut self) {
        self.io.clear_exti();
    }

    pub fn register_cable_plugged_callback(&mut self, f: Tcpp01Callback, arg: usize) {
        self.plugged_cb = Some((f, arg));
    }

    pub fn register_cable_unplugged_callback(&mut self, f: Tcpp01Callback, arg: usize) {
        self.unplugged_cb = Some((f, arg));
    }

    /// Run this from the FLT line's EXTI handler. Runs the matching callback, and clears the
    /// line.
    pub fn on_exti(&mut self, edge: Edge) -> Option<CableEvent> {
        let event = match edge {
            Edge::Falling => Some(CableEvent::Plugged),
            Edge::Rising => Some(CableEvent::Unplugged),
            Edge::Either => None,
        };

        let cb = match event {
            Some(CableEvent::Plugged) => self.plugged_cb,
            Some(CableEvent::Unplugged) => self.unplugged_cb,
            None => None,
        };
        if let Some((f, arg)) = cb {
            f(self.dev_id, arg);
        }

        self.clear_it();
        event
    }

    /// Start VBUS sensing: start a conversion and wait for it.
    pub fn start_vbus(&mut self) -> Result<()> {
        self.io.start_conversion()
    }

    pub fn stop_vbus(&mut self) -> Result<()> {
        self.io.stop_conversion()
    }

    /// VBUS, in mV, from the last conversion.
    pub fn get_vbus_voltage(&mut self) -> u32 {
        let (raw, bits) = self.io.adc_value();
        vbus_voltage_mv(&self.cfg, raw, bits)
    }
}

#[cfg(feature = "u5")]
mod hw {
    use super::*;
    use crate::{
        adc::Adc,
        gpio::{Pin, clear_exti_interrupt},
        pac,
    };

    /// The usual wiring: VBUS divider on an ADC channel, FLT on an EXTI-capable pin, and DB on
    /// a GPIO output.
    pub struct AdcExtiIo {
        pub adc: Adc,
        pub vbus_channel: u8,
        pub flt: Pin,
        pub db: Pin,
        pub irq: pac::Interrupt,
    }

    impl Tcpp01Io for AdcExtiIo {
        fn set_dead_battery_pin(&mut self, state: PinState) {
            self.db.set_state(state);
        }

        fn start_conversion(&mut self) -> Result<()> {
            self.adc.set_channel(self.vbus_channel);
            self.adc.start_conversion();
            self.adc.poll_for_conversion(ADC_CONVERSION_TIMEOUT_MS)
        }

        fn stop_conversion(&mut self) -> Result<()> {
            self.adc.stop_conversion()
        }

        fn adc_value(&mut self) -> (u32, u8) {
            (self.adc.read_result(), self.adc.cfg.resolution.bits())
        }

        fn enable_exti(&mut self) -> Result<()> {
            self.flt.enable_interrupt(Edge::Either);
            Ok(())
        }

        fn disable_exti(&mut self) -> Result<()> {
            self.flt.disable_interrupt();
            Ok(())
        }

        fn clear_exti(&mut self) {
            clear_exti_interrupt(self.flt.pin, Edge::Either);
        }

        fn enable_irq(&mut self) {
            crate::cortex::enable_irq(self.irq);
        }

        fn disable_irq(&mut self) {
            crate::cortex::disable_irq(self.irq);
        }
    }
}

#[cfg(feature = "u5")]
pub use hw::AdcExtiIo;

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Default)]
    struct FakeIo {
        db: Option<PinState>,
        init_calls: u32,
        converting: bool,
        raw: u32,
        exti_enabled: bool,
        irq_enabled: bool,
        clears: u32,
    }

    impl Tcpp01Io for FakeIo {
        fn init(&mut self) -> Result<()> {
            self.init_calls += 1;
            Ok(())
        }

        fn set_dead_battery_pin(&mut self, state: PinState) {
            self.db = Some(state);
        }

        fn start_conversion(&mut self) -> Result<()> {
            self.converting = true;
            Ok(())
        }

        fn stop_conversion(&mut self) -> Result<()> {
            self.converting = false;
            Ok(())
        }

        fn adc_value(&mut self) -> (u32, u8) {
            (self.raw, 12)
        }

        fn enable_exti(&mut self) -> Result<()> {
            self.exti_enabled = true;
            Ok(())
        }

        fn disable_exti(&mut self) -> Result<()> {
            self.exti_enabled = false;
            Ok(())
        }

        fn clear_exti(&mut self) {
            self.clears += 1;
        }

        fn enable_irq(&mut self) {
            self.irq_enabled = true;
        }

        fn disable_irq(&mut self) {
            self.irq_enabled = false;
        }
    }

    #[test]
    fn init_leaves_dead_battery_once() {
        let mut dev = Tcpp01::new(FakeIo::default(), Tcpp01Config::default());
        assert_eq!(dev.deinit(), Err(Error::InvalidParam));

        dev.init(3).unwrap();
        dev.init(4).unwrap();
        assert_eq!(dev.io.init_calls, 1);
        assert_eq!(dev.io.db, Some(PinState::High));
        assert_eq!(dev.dev_id, 4);

        dev.deinit().unwrap();
        assert_eq!(dev.io.db, Some(PinState::Low));
        assert!(!dev.is_initialized());
    }

    #[test]
    fn interrupt_enable_and_disable() {
        let mut dev = Tcpp01::new(FakeIo::default(), Tcpp01Config::default());
        dev.enable_it().unwrap();
        assert!(dev.io.exti_enabled && dev.io.irq_enabled);
        assert_eq!(dev.io.clears, 1);

        dev.disable_it().unwrap();
        assert!(!dev.io.exti_enabled && !dev.io.irq_enabled);
        assert_eq!(dev.io.clears, 2);
    }

    static PLUGGED: AtomicU32 = AtomicU32::new(0);
    static UNPLUGGED: AtomicU32 = AtomicU32::new(0);

    fn on_plugged(dev_id: u32, arg: usize) {
        PLUGGED.fetch_add(dev_id + arg as u32, Ordering::Relaxed);
    }

    fn on_unplugged(_dev_id: u32, _arg: usize) {
        UNPLUGGED.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn cable_callbacks() {
        let mut dev = Tcpp01::new(FakeIo::default(), Tcpp01Config::default());
        dev.init(1).unwrap();

        // No callbacks yet; the line is still cleared.
        assert_eq!(dev.on_exti(Edge::Falling), Some(CableEvent::Plugged));
        assert_eq!(dev.io.clears, 1);

        dev.register_cable_plugged_callback(on_plugged, 10);
        dev.register_cable_unplugged_callback(on_unplugged, 0);

        dev.on_exti(Edge::Falling);
        dev.on_exti(Edge::Rising);
        dev.on_exti(Edge::Rising);
        assert_eq!(dev.on_exti(Edge::Either), None);

        assert_eq!(PLUGGED.load(Ordering::Relaxed), 11);
        assert_eq!(UNPLUGGED.load(Ordering::Relaxed), 2);
        assert_eq!(dev.io.clears, 5);
    }

    #[test]
    fn vbus_conversion() {
        let cfg = Tcpp01Config::default();
        // Full scale: 3300 mV at the pin, times 50.2 / 10.
        assert_eq!(vbus_voltage_mv(&cfg, 4095, 12), 16_566);
        // About 5 V.
        assert_eq!(vbus_voltage_mv(&cfg, 1236, 12), 4_999);
        assert_eq!(vbus_voltage_mv(&cfg, 0, 14), 0);

        let mut dev = Tcpp01::new(FakeIo::default(), cfg);
        dev.start_vbus().unwrap();
        assert!(dev.io.converting);
        dev.io.raw = 4095;
        assert_eq!(dev.get_vbus_voltage(), 16_566);
        dev.stop_vbus().unwrap();
        assert!(!dev.io.converting);
    }
}
