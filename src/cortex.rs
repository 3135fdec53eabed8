//! Cortex-M33 core peripherals: NVIC interrupt control and priorities, SysTick configuration
//! for the millisecond tick, and system reset.
//!
//! The U5 implements 4 priority bits. Priorities in this module are the logical 4-bit
//! values (0 is the highest priority); they're shifted into the upper nibble when written.

#[cfg(feature = "u5")]
use cortex_m::peripheral::{NVIC, SCB, SYST, scb::SystemHandler, syst::SystClkSource};

#[cfg(feature = "u5")]
use crate::{
    error::{Error, Result},
    pac,
};

/// Number of priority bits implemented by the NVIC.
pub const NVIC_PRIO_BITS: u8 = 4;

#[cfg(feature = "u5")]
const AIRCR_VECTKEY: u32 = 0x05FA << 16;
#[cfg(feature = "u5")]
const AIRCR_PRIGROUP_MASK: u32 = 0b111 << 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
/// How the 4 priority bits split between pre-emption priority and sub-priority. The value is
/// the number of pre-emption bits.
pub enum PriorityGroup {
    /// 0 bits for pre-emption, 4 bits for sub-priority.
    G0 = 0,
    G1 = 1,
    G2 = 2,
    G3 = 3,
    /// 4 bits for pre-emption, 0 bits for sub-priority. This is the reset grouping.
    G4 = 4,
}

impl PriorityGroup {
    /// The AIRCR PRIGROUP field value for this grouping.
    pub fn prigroup(&self) -> u32 {
        7 - *self as u32
    }

    fn sub_bits(&self) -> u8 {
        NVIC_PRIO_BITS - *self as u8
    }
}

/// Combine a pre-emption priority and a sub-priority into a 4-bit NVIC priority. Values
/// wider than their field are truncated.
pub fn encode_priority(group: PriorityGroup, preempt: u8, sub: u8) -> u8 {
    let pre_bits = group as u8;
    let sub_bits = group.sub_bits();

    let pre = preempt & ((1u16 << pre_bits) - 1) as u8;
    let sub = sub & ((1u16 << sub_bits) - 1) as u8;

    (pre << sub_bits) | sub
}

/// Split a 4-bit NVIC priority into (pre-emption priority, sub-priority).
pub fn decode_priority(group: PriorityGroup, priority: u8) -> (u8, u8) {
    let sub_bits = group.sub_bits();
    let priority = priority & 0x0f;

    (priority >> sub_bits, priority & ((1u16 << sub_bits) - 1) as u8)
}

#[cfg(feature = "u5")]
/// Set the priority grouping in SCB AIRCR. Do this once at startup, before setting priorities.
pub fn set_priority_grouping(scb: &mut SCB, group: PriorityGroup) {
    unsafe {
        scb.aircr.modify(|r| {
            (r & !(0xFFFF_0000 | AIRCR_PRIGROUP_MASK)) | AIRCR_VECTKEY | (group.prigroup() << 8)
        });
    }
}

#[cfg(feature = "u5")]
/// Unmask an interrupt line.
pub fn enable_irq(irq: pac::Interrupt) {
    unsafe { NVIC::unmask(irq) }
}

#[cfg(feature = "u5")]
pub fn disable_irq(irq: pac::Interrupt) {
    NVIC::mask(irq);
}

#[cfg(feature = "u5")]
/// Set an interrupt's priority from a grouping, a pre-emption priority and a sub-priority.
pub fn set_priority(nvic: &mut NVIC, irq: pac::Interrupt, group: PriorityGroup, preempt: u8, sub: u8) {
    let prio = encode_priority(group, preempt, sub);
    unsafe { nvic.set_priority(irq, prio << (8 - NVIC_PRIO_BITS)) }
}

#[cfg(feature = "u5")]
/// Read an interrupt's priority, as (pre-emption priority, sub-priority).
pub fn get_priority(irq: pac::Interrupt, group: PriorityGroup) -> (u8, u8) {
    decode_priority(group, NVIC::get_priority(irq) >> (8 - NVIC_PRIO_BITS))
}

#[cfg(feature = "u5")]
pub fn set_pending(irq: pac::Interrupt) {
    NVIC::pend(irq);
}

#[cfg(feature = "u5")]
pub fn clear_pending(irq: pac::Interrupt) {
    NVIC::unpend(irq);
}

#[cfg(feature = "u5")]
pub fn is_pending(irq: pac::Interrupt) -> bool {
    NVIC::is_pending(irq)
}

#[cfg(feature = "u5")]
pub fn is_active(irq: pac::Interrupt) -> bool {
    NVIC::is_active(irq)
}

#[cfg(feature = "u5")]
/// Request a system reset. Doesn't return.
pub fn system_reset() -> ! {
    SCB::sys_reset()
}

#[cfg(feature = "u5")]
/// Returns `true` when called from an exception or interrupt handler.
pub fn in_isr() -> bool {
    !matches!(SCB::vect_active(), cortex_m::peripheral::scb::VectActive::ThreadMode)
}

#[cfg(feature = "u5")]
/// Configure SysTick to count `ticks` core clock cycles per interrupt, and enable it.
/// The reload register is 24 bits wide.
pub fn systick_config(syst: &mut SYST, ticks: u32) -> Result<()> {
    if ticks == 0 || ticks - 1 > 0x00FF_FFFF {
        return Err(Error::InvalidParam);
    }

    syst.set_clock_source(SystClkSource::Core);
    syst.set_reload(ticks - 1);
    syst.clear_current();
    syst.enable_interrupt();
    syst.enable_counter();

    Ok(())
}

#[cfg(feature = "u5")]
/// Set the SysTick exception priority, as a 4-bit value.
pub fn set_systick_priority(scb: &mut SCB, priority: u8) {
    unsafe { scb.set_priority(SystemHandler::SysTick, priority << (8 - NVIC_PRIO_BITS)) }
}

#[cfg(feature = "u5")]
pub(crate) fn systick_disable_interrupt() {
    let mut syst = unsafe { cortex_m::Peripherals::steal() }.SYST;
    syst.disable_interrupt();
}

#[cfg(feature = "u5")]
pub(crate) fn systick_enable_interrupt() {
    let mut syst = unsafe { cortex_m::Peripherals::steal() }.SYST;
    syst.enable_interrupt();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prigroup_field() {
        assert_eq!(PriorityGroup::G4.prigroup(), 3);
        assert_eq!(PriorityGroup::G0.prigroup(), 7);
    }

    #[test]
    fn encode_splits_bits() {
        assert_eq!(encode_priority(PriorityGroup::G4, 5, 0), 5);
        assert_eq!(encode_priority(PriorityGroup::G0, 3, 9), 9);
        assert_eq!(encode_priority(PriorityGroup::G2, 2, 1), 0b1001);
        // Truncated to the field width.
        assert_eq!(encode_priority(PriorityGroup::G1, 3, 0x0f), 0b1111);
    }

    #[test]
    fn decode_inverts_encode() {
        for group in [
            PriorityGroup::G0,
            PriorityGroup::G1,
            PriorityGroup::G2,
            PriorityGroup::G3,
            PriorityGroup::G4,
        ] {
            for prio in 0..16 {
                let (pre, sub) = decode_priority(group, prio);
                assert_eq!(encode_priority(group, pre, sub), prio);
            }
        }
    }
}
