//! A cooperative task sequencer: a lightweight alternative to an RTOS for applications built
//! from run-to-completion tasks. Interrupt handlers mark tasks pending with `set_task()`; the
//! main loop calls `run()`, which executes pending tasks by priority, then enters the idle
//! hook when nothing is left to do.
//!
//! There's no pre-emption. A task runs until it returns, or until it blocks in `wait_evt()`,
//! during which other tasks keep running.
//!
//! Tasks and events are identified by bitmasks; task `n` is `1 << n`. Within a priority level,
//! tasks are picked highest-bit-first, with round-robin and starvation tracking so a task that
//! re-marks itself pending can't run twice while another pending task of the same priority
//! waits.
//!
//! Example:
//! ```rust,ignore
//! static SEQ: Sequencer<WfiHooks, 8, 2> = Sequencer::new(WfiHooks);
//!
//! const TASK_TOGGLE: u32 = 1 << 0;
//!
//! SEQ.reg_task(TASK_TOGGLE, toggle_led);
//! loop {
//!     SEQ.run(ALL_TASKS);
//! }
//!
//! #[exception]
//! fn SysTick() {
//!     SEQ.set_task(TASK_TOGGLE, 0);
//! }
//! ```

use core::cell::RefCell;

use critical_section::Mutex;

/// `current_task()` value outside of a task.
pub const NO_TASK_RUNNING: u32 = 0xFFFF_FFFF;

/// Mask allowing every task to run.
pub const ALL_TASKS: u32 = !0;

/// A task entry point.
pub type Task = fn();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SeqWarning {
    /// A pending task has no registered function.
    InvalidTaskId,
}

/// Application hooks called by the sequencer. All have empty defaults, except `evt_idle`.
pub trait SeqHooks: Sized {
    /// Called with interrupts masked when no task is pending. Typically enters a low power
    /// mode; a pending interrupt still wakes the core.
    fn idle(&self) {}

    fn pre_idle(&self) {}

    fn post_idle(&self) {}

    fn pre_task(&self, _task_id: u32) {}

    fn post_task(&self, _task_id: u32) {}

    fn catch_warning(&self, _warning: SeqWarning) {}

    /// Called repeatedly while `wait_evt()` waits. `task_bm` is the waiting task (0 if called
    /// from outside a task); by default, every other task keeps running.
    fn evt_idle<const N: usize, const P: usize>(
        &self,
        seq: &Sequencer<Self, N, P>,
        task_bm: u32,
        _evt_bm: u32,
    ) {
        seq.run(!task_bm);
    }
}

/// Hooks that do nothing; the idle loop spins.
pub struct NoHooks;

impl SeqHooks for NoHooks {}

#[cfg(feature = "u5")]
/// Waits for an interrupt when idle.
pub struct WfiHooks;

#[cfg(feature = "u5")]
impl SeqHooks for WfiHooks {
    fn idle(&self) {
        cortex_m::asm::wfi();
    }
}

#[derive(Clone, Copy)]
struct PrioList {
    /// Pending tasks at this priority.
    pending: u32,
    /// Tasks still allowed to run in the current round.
    round_robin: u32,
}

struct State<const N: usize, const P: usize> {
    task_set: u32,
    task_mask: u32,
    super_mask: u32,
    evt_set: u32,
    evt_waited: u32,
    current_task: u32,
    tasks: [Option<Task>; N],
    prio: [PrioList; P],
    /// Tasks that ran since the last time every pending task got a turn.
    clear_list: u32,
}

impl<const N: usize, const P: usize> State<N, P> {
    const fn new() -> Self {
        Self {
            task_set: 0,
            task_mask: ALL_TASKS,
            super_mask: ALL_TASKS,
            evt_set: 0,
            evt_waited: 0,
            current_task: 0,
            tasks: [None; N],
            prio: [PrioList {
                pending: 0,
                round_robin: 0,
            }; P],
            clear_list: 0,
        }
    }

    /// Pick the next task to run, and remove it from the pending lists.
    fn select_next(&mut self, task_mask: u32) -> Option<u32> {
        let mask = task_mask & self.super_mask;
        let level = self.prio.iter().position(|p| p.pending & mask != 0)?;

        let mut candidates = self.prio[level].pending & mask;
        if self.prio[level].round_robin & candidates == 0 {
            // Everyone at this level has had a turn; start a new round.
            self.prio[level].round_robin = ALL_TASKS;
        }

        self.clear_list |= !self.prio[level].round_robin;
        let starving = self.task_set & !self.clear_list;

        if starving & candidates != 0 {
            candidates &= starving;
        }
        if starving == 0 {
            self.clear_list = 0;
        }

        let idx = bit_position(candidates & self.prio[level].round_robin)?;

        self.current_task = idx;
        self.task_set &= !(1 << idx);
        for p in self.prio.iter_mut() {
            p.pending &= !(1 << idx);
        }

        Some(idx)
    }
}

/// Index of the highest set bit.
fn bit_position(val: u32) -> Option<u32> {
    31u32.checked_sub(val.leading_zeros())
}

/// A sequencer with up to `N` tasks (at most 32) and `P` priority levels. Level 0 is the
/// highest priority.
pub struct Sequencer<H, const N: usize, const P: usize> {
    state: Mutex<RefCell<State<N, P>>>,
    hooks: H,
}

impl<H: SeqHooks, const N: usize, const P: usize> Sequencer<H, N, P> {
    pub const fn new(hooks: H) -> Self {
        const { assert!(N <= 32 && P > 0) };

        Self {
            state: Mutex::new(RefCell::new(State::new())),
            hooks,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut State<N, P>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.state.borrow_ref_mut(cs)))
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Reset to the initial state: no tasks registered or pending, all tasks enabled, no events.
    pub fn init(&self) {
        self.with(|s| *s = State::new());
    }

    /// Run pending tasks whose bit is set in `mask`, until none are left or a waited event
    /// is set. Then go idle, unless a waited event is set.
    pub fn run(&self, mask: u32) {
        let super_mask_backup = self.with(|s| {
            let backup = s.super_mask;
            s.super_mask &= mask;
            backup
        });

        let snapshot = |s: &mut State<N, P>| (s.task_set, s.evt_set, s.task_mask, s.evt_waited);
        let (mut task_set, mut evt_set, mut task_mask, mut evt_waited) = self.with(snapshot);

        loop {
            let super_mask = self.with(|s| s.super_mask);
            if task_set & task_mask & super_mask == 0 || evt_set & evt_waited != 0 {
                break;
            }

            let Some(idx) = self.with(|s| s.select_next(task_mask)) else {
                break;
            };

            self.hooks.pre_task(idx);

            let task = self.with(|s| s.tasks.get(idx as usize).copied().flatten());

            match task {
                Some(task) => {
                    // Tasks that run while this one is blocked in `wait_evt()` must not
                    // re-admit it to the current round.
                    let round_robin = self.with(|s| {
                        let mut saved = [0; P];
                        for (p, rr) in s.prio.iter_mut().zip(saved.iter_mut()) {
                            p.round_robin &= !(1 << idx);
                            *rr = p.round_robin;
                        }
                        saved
                    });

                    task();

                    self.with(|s| {
                        for (p, rr) in s.prio.iter_mut().zip(round_robin) {
                            p.round_robin &= rr;
                        }
                    });

                    self.hooks.post_task(idx);

                    (task_set, evt_set, task_mask, evt_waited) = self.with(|s| {
                        s.clear_list |= 1 << idx;
                        snapshot(s)
                    });
                }
                None => {
                    self.hooks.catch_warning(SeqWarning::InvalidTaskId);
                    (task_set, evt_set, task_mask, evt_waited) = self.with(snapshot);
                }
            }
        }

        // Lets `wait_evt()` be called from the idle hooks.
        let evt_waited = self.with(|s| {
            s.current_task = NO_TASK_RUNNING;
            s.evt_waited
        });

        if evt_set & evt_waited == 0 {
            self.hooks.pre_idle();
            critical_section::with(|cs| {
                let go_idle = {
                    let s = self.state.borrow_ref(cs);
                    s.task_set & s.task_mask & s.super_mask == 0 && s.evt_set & s.evt_waited == 0
                };
                if go_idle {
                    self.hooks.idle();
                }
            });
            self.hooks.post_idle();
        }

        self.with(|s| s.super_mask = super_mask_backup);
    }

    /// Register `task` as the function for the task identified by the highest bit of `task_bm`.
    pub fn reg_task(&self, task_bm: u32, task: Task) {
        self.with(|s| {
            if let Some(pos) = bit_position(task_bm) {
                if let Some(slot) = s.tasks.get_mut(pos as usize) {
                    *slot = Some(task);
                }
            }
        });
    }

    pub fn is_registered_task(&self, task_bm: u32) -> bool {
        self.with(|s| {
            bit_position(task_bm)
                .and_then(|pos| s.tasks.get(pos as usize))
                .is_some_and(|t| t.is_some())
        })
    }

    /// Mark tasks pending, at priority level `prio`. Safe to call from interrupt handlers.
    pub fn set_task(&self, task_bm: u32, prio: usize) {
        debug_assert!(prio < P);
        self.with(|s| {
            s.task_set |= task_bm;
            if let Some(p) = s.prio.get_mut(prio) {
                p.pending |= task_bm;
            }
        });
    }

    /// `true` if every task in `task_bm` is pending and not paused or masked.
    pub fn is_schedulable_task(&self, task_bm: u32) -> bool {
        self.with(|s| s.task_set & s.task_mask & s.super_mask & task_bm == task_bm)
    }

    /// Prevent tasks from running. They stay pending.
    pub fn pause_task(&self, task_bm: u32) {
        self.with(|s| s.task_mask &= !task_bm);
    }

    /// `true` unless every task in `task_bm` is enabled.
    pub fn is_pause_task(&self, task_bm: u32) -> bool {
        self.with(|s| s.task_mask & task_bm != task_bm)
    }

    pub fn resume_task(&self, task_bm: u32) {
        self.with(|s| s.task_mask |= task_bm);
    }

    pub fn set_evt(&self, evt_bm: u32) {
        self.with(|s| s.evt_set |= evt_bm);
    }

    pub fn clr_evt(&self, evt_bm: u32) {
        self.with(|s| s.evt_set &= !evt_bm);
    }

    /// Block until one of the events in `evt_bm` is set, then clear them. Other tasks run
    /// in the meantime through the `evt_idle` hook.
    pub fn wait_evt(&self, evt_bm: u32) {
        let (current_task, evt_waited_backup) = self.with(|s| {
            let backup = s.evt_waited;
            s.evt_waited = evt_bm;
            (s.current_task, backup)
        });

        let wait_task_bm = if current_task == NO_TASK_RUNNING {
            0
        } else {
            1 << current_task
        };

        while self.with(|s| s.evt_set & evt_bm) == 0 {
            self.hooks.evt_idle(self, wait_task_bm, evt_bm);
        }

        self.with(|s| {
            s.current_task = current_task;
            s.evt_set &= !evt_bm;
            s.evt_waited = evt_waited_backup;
        });
    }

    /// Events that are both set and currently waited for.
    pub fn is_evt_pend(&self) -> u32 {
        self.with(|s| s.evt_set & s.evt_waited)
    }

    /// Index of the running task, or `NO_TASK_RUNNING`.
    pub fn current_task(&self) -> u32 {
        self.with(|s| s.current_task)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::sync::atomic::{AtomicU32, Ordering};
    use std::{cell::RefCell, vec::Vec};

    use super::*;

    std::thread_local! {
        static LOG: RefCell<Vec<u32>> = const { RefCell::new(Vec::new()) };
    }

    fn log(v: u32) {
        LOG.with(|l| l.borrow_mut().push(v));
    }

    fn take_log() -> Vec<u32> {
        LOG.with(|l| core::mem::take(&mut *l.borrow_mut()))
    }

    struct CountingHooks {
        idle: AtomicU32,
        warnings: AtomicU32,
    }

    impl CountingHooks {
        const fn new() -> Self {
            Self {
                idle: AtomicU32::new(0),
                warnings: AtomicU32::new(0),
            }
        }
    }

    impl SeqHooks for CountingHooks {
        fn idle(&self) {
            self.idle.fetch_add(1, Ordering::Relaxed);
        }

        fn catch_warning(&self, _warning: SeqWarning) {
            self.warnings.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn bit_positions() {
        assert_eq!(bit_position(1), Some(0));
        assert_eq!(bit_position(0b1010), Some(3));
        assert_eq!(bit_position(1 << 31), Some(31));
        assert_eq!(bit_position(0), None);
    }

    #[test]
    fn runs_by_priority_then_highest_bit() {
        static SEQ: Sequencer<NoHooks, 4, 2> = Sequencer::new(NoHooks);
        SEQ.reg_task(1 << 0, || log(0));
        SEQ.reg_task(1 << 1, || log(1));
        SEQ.reg_task(1 << 2, || log(2));

        SEQ.set_task(1 << 0, 1);
        SEQ.set_task(1 << 1, 1);
        SEQ.set_task(1 << 2, 0);
        SEQ.run(ALL_TASKS);

        assert_eq!(take_log(), [2, 1, 0]);
        assert_eq!(SEQ.current_task(), NO_TASK_RUNNING);
    }

    #[test]
    fn self_rescheduling_tasks_alternate() {
        static SEQ: Sequencer<NoHooks, 4, 1> = Sequencer::new(NoHooks);
        static RUNS: AtomicU32 = AtomicU32::new(0);

        fn task(id: u32) {
            log(id);
            if RUNS.fetch_add(1, Ordering::Relaxed) < 5 {
                SEQ.set_task(1 << id, 0);
            }
        }

        SEQ.reg_task(1 << 0, || task(0));
        SEQ.reg_task(1 << 1, || task(1));
        SEQ.set_task(0b11, 0);
        SEQ.run(ALL_TASKS);

        assert_eq!(take_log(), [1, 0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn mask_limits_run() {
        static SEQ: Sequencer<NoHooks, 4, 1> = Sequencer::new(NoHooks);
        SEQ.reg_task(1 << 0, || log(0));
        SEQ.reg_task(1 << 3, || log(3));
        SEQ.set_task((1 << 0) | (1 << 3), 0);

        SEQ.run(1 << 0);
        assert_eq!(take_log(), [0]);
        assert!(SEQ.is_schedulable_task(1 << 3));

        SEQ.run(ALL_TASKS);
        assert_eq!(take_log(), [3]);
    }

    #[test]
    fn pause_and_resume() {
        static SEQ: Sequencer<NoHooks, 4, 1> = Sequencer::new(NoHooks);
        SEQ.reg_task(1 << 2, || log(2));
        SEQ.set_task(1 << 2, 0);

        SEQ.pause_task(1 << 2);
        assert!(SEQ.is_pause_task(1 << 2));
        assert!(!SEQ.is_schedulable_task(1 << 2));
        SEQ.run(ALL_TASKS);
        assert!(take_log().is_empty());

        SEQ.resume_task(1 << 2);
        assert!(!SEQ.is_pause_task(1 << 2));
        SEQ.run(ALL_TASKS);
        assert_eq!(take_log(), [2]);
    }

    #[test]
    fn idle_when_nothing_pending() {
        static SEQ: Sequencer<CountingHooks, 4, 1> = Sequencer::new(CountingHooks::new());
        SEQ.run(ALL_TASKS);
        SEQ.run(ALL_TASKS);
        assert_eq!(SEQ.hooks().idle.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn unregistered_task_warns() {
        static SEQ: Sequencer<CountingHooks, 4, 1> = Sequencer::new(CountingHooks::new());
        assert!(!SEQ.is_registered_task(1 << 3));
        SEQ.set_task(1 << 3, 0);
        SEQ.run(ALL_TASKS);

        assert_eq!(SEQ.hooks().warnings.load(Ordering::Relaxed), 1);
        assert!(!SEQ.is_schedulable_task(1 << 3));
    }

    #[test]
    fn wait_evt_runs_other_tasks() {
        static SEQ: Sequencer<NoHooks, 4, 2> = Sequencer::new(NoHooks);
        const EVT: u32 = 1 << 0;

        SEQ.reg_task(1 << 0, || {
            log(10);
            SEQ.wait_evt(EVT);
            log(11);
        });
        SEQ.reg_task(1 << 1, || {
            log(20);
            SEQ.set_evt(EVT);
        });

        SEQ.set_task(1 << 0, 0);
        SEQ.set_task(1 << 1, 1);
        SEQ.run(ALL_TASKS);

        assert_eq!(take_log(), [10, 20, 11]);
        // Consumed by the waiter.
        assert_eq!(SEQ.is_evt_pend(), 0);
    }

    #[test]
    fn evt_pending_only_when_waited() {
        static SEQ: Sequencer<NoHooks, 2, 1> = Sequencer::new(NoHooks);
        SEQ.set_evt(0b100);
        assert_eq!(SEQ.is_evt_pend(), 0);
        SEQ.clr_evt(0b100);
    }

    #[test]
    fn init_clears_everything() {
        static SEQ: Sequencer<NoHooks, 4, 1> = Sequencer::new(NoHooks);
        SEQ.reg_task(1, || log(0));
        SEQ.set_task(1, 0);
        SEQ.pause_task(1);
        SEQ.init();

        assert!(!SEQ.is_registered_task(1));
        assert!(!SEQ.is_pause_task(1));
        assert!(!SEQ.is_schedulable_task(1));
    }
}
