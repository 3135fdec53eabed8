// Test file for the timer API. No wiring needed.

#![deny(warnings)]
#![no_std]
#![no_main]

use panic_probe as _;

#[cfg(test)]
#[embedded_test::tests(setup = rtt_target::rtt_init_defmt!())]
mod tests {
    use hal::{
        clocks::Clocks,
        delay_ms,
        pac::{self, TIM2, TIM6},
        timer::{Timer, TimerInterrupt},
    };

    struct State {
        tim2: Option<TIM2>,
        tim6: Option<TIM6>,
        clocks: Clocks,
    }

    #[init]
    fn init() -> State {
        let dp = pac::Peripherals::take().unwrap();
        let clocks = Clocks::default();
        clocks.setup().unwrap();
        State {
            tim2: Some(dp.TIM2),
            tim6: Some(dp.TIM6),
            clocks,
        }
    }

    #[test]
    fn counter_runs(mut state: State) {
        let mut timer =
            Timer::new_tim2(state.tim2.take().unwrap(), 1., Default::default(), &state.clocks)
                .unwrap();
        defmt::assert!(!timer.is_enabled());
        defmt::assert_eq!(timer.read_count(), 0);

        timer.enable();
        delay_ms(1, state.clocks.hclk());
        defmt::assert!(timer.read_count() > 0);

        timer.disable();
        timer.reset_count();
        defmt::assert_eq!(timer.read_count(), 0);
    }

    #[test]
    fn update_flag_after_period(mut state: State) {
        let mut timer =
            Timer::new_tim6(state.tim6.take().unwrap(), 1_000., Default::default(), &state.clocks)
                .unwrap();
        // Init loads the prescaler with an update event, and clears the flag it raises.
        defmt::assert!(!timer.is_pending(TimerInterrupt::Update));

        timer.enable();
        delay_ms(5, state.clocks.hclk());
        defmt::assert!(timer.is_pending(TimerInterrupt::Update));

        timer.clear_interrupt(TimerInterrupt::Update);
        timer.disable();
        defmt::assert!(!timer.is_pending(TimerInterrupt::Update));
    }

    #[test]
    fn frequency_matches(mut state: State) {
        let timer =
            Timer::new_tim6(state.tim6.take().unwrap(), 1_000., Default::default(), &state.clocks)
                .unwrap();
        let freq = timer.get_freq();
        defmt::assert!(freq > 999. && freq < 1_001.);
    }
}
