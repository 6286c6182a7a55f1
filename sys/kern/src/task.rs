// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks.
//!
//! The fields of `Task` are private to this module so that we can maintain
//! task invariants, chiefly that a suspended task's posted events are always
//! a subset of its wait mask and that a suspended task never already
//! satisfies its resume condition (it would have been made ready).

use abi::{
    ContextFlags, EventSet, Instant, Priority, SavedContext, SuspendKind,
    TaskDesc, TaskFlags,
};

use crate::stack::StackRegion;

/// Internal representation of a task.
#[repr(C)] // so location of SavedState is predictable
#[derive(Debug)]
pub struct Task {
    /// Saved machine state of the task.
    save: crate::arch::SavedState,
    // NOTE: it is critical that the above field appear first!
    /// Descriptor this task was created from, kept for re-activation of
    /// single-shot tasks.
    desc: TaskDesc,
    /// The task's stack region, painted for reserve measurement.
    stack: StackRegion,
    /// State for tracking the task's two timers.
    timer: TimerState,
    /// Events posted while suspended. Subset of `wait_mask`.
    posted: EventSet,
    /// Which events make this task ready. Nonzero exactly while the task is
    /// suspended.
    wait_mask: EventSet,
    /// Resume predicate selector: all-of versus any-of.
    wait_all: bool,
    /// Events delivered at the most recent resumption; what the context
    /// switch glue hands to a synchronously suspended context.
    wake_signal: EventSet,
    /// Saturating count of deadline overruns.
    overruns: u32,
    /// Set once `init_task` has run for this slot.
    configured: bool,
    /// Remaining ticks of the current round-robin slice.
    #[cfg(feature = "round-robin")]
    slice_left: u32,
}

/// State for a task's timers: the absolute deadline and the relative delay
/// counter. Which of them is live is decided by the wait mask.
#[derive(Debug, Default)]
struct TimerState {
    /// Tick at which the absolute-timer event fires, when armed by the wait
    /// mask.
    deadline: Instant,
    /// Remaining delay ticks; 0 means inactive.
    delay: u32,
}

fn unconfigured_entry(_events: EventSet) -> ! {
    panic!("unconfigured task activated");
}

impl Task {
    /// Creates the placeholder occupying a task slot before `init_task` has
    /// filled it in.
    pub(crate) fn unconfigured() -> Self {
        Task {
            save: crate::arch::SavedState::default(),
            desc: TaskDesc {
                entry: unconfigured_entry,
                priority: Priority(0),
                stack_base: 0,
                stack_size: 0,
                start_events: EventSet::EMPTY,
                start_all: false,
                start_timeout: 0,
                #[cfg(feature = "round-robin")]
                round_robin: 0,
                flags: TaskFlags::empty(),
                stack_slot: 0,
            },
            stack: StackRegion::empty(),
            timer: TimerState::default(),
            posted: EventSet::EMPTY,
            wait_mask: EventSet::EMPTY,
            wait_all: false,
            wake_signal: EventSet::EMPTY,
            overruns: 0,
            configured: false,
            #[cfg(feature = "round-robin")]
            slice_left: 0,
        }
    }

    /// Creates a `Task` in its initial state from `descriptor`: stack
    /// validated and painted, context descriptor constructed so that the
    /// first resume starts the entry function on the fly, initial resume
    /// condition stored.
    ///
    /// Timer fields are loaded according to the start mask. Unlike the
    /// in-flight case there is no call-to-tick jitter to compensate before
    /// the first tick, so the delay counter takes the timeout verbatim.
    pub(crate) fn from_descriptor(descriptor: &TaskDesc) -> Self {
        let stack = StackRegion::new(descriptor.stack_base, descriptor.stack_size);
        stack.paint();

        let mut task = Task {
            save: crate::arch::SavedState::default(),
            desc: *descriptor,
            stack,
            timer: TimerState::default(),
            posted: EventSet::EMPTY,
            wait_mask: descriptor.start_events,
            wait_all: descriptor.start_all,
            wake_signal: EventSet::EMPTY,
            overruns: 0,
            configured: true,
            #[cfg(feature = "round-robin")]
            slice_left: 0,
        };

        if descriptor.start_events.intersects(EventSet::ABSOLUTE_TIMER) {
            task.timer.deadline = Instant(descriptor.start_timeout);
        }
        if descriptor.start_events.intersects(EventSet::DELAY_TIMER) {
            task.timer.delay = descriptor.start_timeout;
        }

        let ctx = task.save.context_mut();
        ctx.suspend = SuspendKind::default();
        ctx.entry = descriptor.entry as usize;
        ctx.initial_stack_pointer = task.stack.top();
        ctx.stack_pointer = task.stack.top();
        ctx.stack_slot = descriptor.stack_slot;
        ctx.flags = ContextFlags::FRESH;
        if descriptor.flags.contains(TaskFlags::PRIVILEGED) {
            ctx.flags |= ContextFlags::PRIVILEGED;
        }

        task
    }

    /// Posts a set of event bits to this suspended task, masked by its wait
    /// mask, and reports whether the resume condition is now satisfied.
    ///
    /// Since a suspended task never already satisfies its condition, a
    /// `true` here always means *newly* satisfied.
    #[must_use]
    pub fn post(&mut self, events: EventSet) -> bool {
        self.posted |= events & self.wait_mask;
        self.resume_condition_met()
    }

    /// Evaluates the resume predicate against the current posted set.
    pub fn resume_condition_met(&self) -> bool {
        kerncore::resume_condition_met(
            self.posted.bits(),
            self.wait_mask.bits(),
            self.wait_all,
            EventSet::TIMERS.bits(),
        )
    }

    /// Checks whether this suspended task is an eligible recipient for a
    /// sync-object grant of `bit`: it must be waiting for the bit and must
    /// not already have been granted it.
    pub(crate) fn wants(&self, bit: EventSet) -> bool {
        self.wait_mask.intersects(bit) && !self.posted.intersects(bit)
    }

    /// Stores a new resume condition. The caller is responsible for arming
    /// whichever timers the mask names.
    pub(crate) fn set_wait_condition(&mut self, mask: EventSet, all: bool) {
        self.wait_mask = mask;
        self.wait_all = all;
        self.posted = EventSet::EMPTY;
    }

    /// Seeds the posted set with events already collected on the wait fast
    /// path (partial sync-object acquisition).
    pub(crate) fn seed_posted(&mut self, events: EventSet) {
        self.posted = events & self.wait_mask;
    }

    /// Advances the absolute deadline by `timeout` and checks it against
    /// `now`. A deadline that is not strictly in the future is an overrun:
    /// the counter is bumped and the task is redelivered one tick out to
    /// bound recovery.
    pub(crate) fn arm_absolute_timer(&mut self, timeout: u32, now: Instant) {
        self.timer.deadline = self.timer.deadline.plus_ticks(timeout);
        if kerncore::deadline_elapsed(now.0, self.timer.deadline.0) {
            self.note_overrun();
            self.timer.deadline = now.plus_ticks(1);
        }
    }

    /// Loads the delay counter, converting call-to-tick jitter into extra
    /// delay rather than a shortfall.
    pub(crate) fn arm_delay_timer(&mut self, timeout: u32) {
        self.timer.delay = kerncore::normalize_delay(timeout);
    }

    /// Processes one system tick for this suspended task: fires whichever
    /// timer events are due and in the wait mask. Returns whether the
    /// resume condition is now satisfied.
    #[must_use]
    pub(crate) fn process_tick(&mut self, now: Instant) -> bool {
        let mut fired = EventSet::EMPTY;
        if self.wait_mask.intersects(EventSet::ABSOLUTE_TIMER)
            && self.timer.deadline == now
        {
            fired |= EventSet::ABSOLUTE_TIMER;
        }
        if self.timer.delay != 0 {
            self.timer.delay -= 1;
            if self.timer.delay == 0 {
                fired |= EventSet::DELAY_TIMER;
            }
        }
        if fired.is_empty() {
            false
        } else {
            self.post(fired)
        }
    }

    /// Consumes the posted events on the way from suspended to ready: the
    /// result is what the task's `wait_for_event` returns, recorded both in
    /// the saved return slots and as the wake signal for the switch glue.
    pub(crate) fn deliver_wake(&mut self) -> EventSet {
        let events = self.posted;
        self.posted = EventSet::EMPTY;
        self.wait_mask = EventSet::EMPTY;
        self.wake_signal = events;
        self.save.set_wait_result(events);
        events
    }

    /// Records a fast-path completion: the caller never suspended, but the
    /// collected events still form its wait result.
    pub(crate) fn deliver_immediate(&mut self, events: EventSet) {
        self.wake_signal = events;
        self.save.set_wait_result(events);
    }

    pub fn wake_signal(&self) -> EventSet {
        self.wake_signal
    }

    /// Reads the saturating overrun counter, optionally clearing it in the
    /// same step. The counter is one machine word wide and sticks at
    /// `u32::MAX` rather than wrapping.
    pub(crate) fn read_overruns(&mut self, reset: bool) -> u32 {
        let count = self.overruns;
        if reset {
            self.overruns = 0;
        }
        count
    }

    pub fn overrun_count(&self) -> u32 {
        self.overruns
    }

    fn note_overrun(&mut self) {
        self.overruns = self.overruns.saturating_add(1);
    }

    /// Reloads the round-robin slice on activation.
    #[cfg(feature = "round-robin")]
    pub(crate) fn reload_slice(&mut self) {
        self.slice_left = self.desc.round_robin;
    }

    /// Burns one tick of the active task's slice; `true` when the slice
    /// just expired. Tasks with no slice configured never expire.
    #[cfg(feature = "round-robin")]
    pub(crate) fn slice_tick(&mut self) -> bool {
        if self.desc.round_robin == 0 || self.slice_left == 0 {
            return false;
        }
        self.slice_left -= 1;
        self.slice_left == 0
    }

    pub fn priority(&self) -> Priority {
        self.desc.priority
    }

    pub fn descriptor(&self) -> &TaskDesc {
        &self.desc
    }

    pub fn stack(&self) -> &StackRegion {
        &self.stack
    }

    pub fn wait_mask(&self) -> EventSet {
        self.wait_mask
    }

    pub fn wait_all(&self) -> bool {
        self.wait_all
    }

    pub fn posted_events(&self) -> EventSet {
        self.posted
    }

    pub(crate) fn is_configured(&self) -> bool {
        self.configured
    }

    pub(crate) fn mark_configured(&mut self) {
        self.configured = true;
    }

    /// Returns a reference to the saved machine state for the task.
    pub fn save(&self) -> &crate::arch::SavedState {
        &self.save
    }

    /// Returns a mutable reference to the saved machine state for the task.
    pub fn save_mut(&mut self) -> &mut crate::arch::SavedState {
        &mut self.save
    }
}

/// Interface that must be implemented by the `arch::SavedState` type. This
/// gives architecture-independent access to task state for the rest of the
/// kernel.
///
/// Architectures need to implement the `argX`/`retX` functions,
/// `syscall_number`, and the context accessors; the rest of the trait (such
/// as the argument proxy types) will just work.
pub trait ArchState: Default {
    /// Borrows the context descriptor embedded in the saved state.
    fn context(&self) -> &SavedContext;
    fn context_mut(&mut self) -> &mut SavedContext;

    /// Reads syscall argument register 0.
    fn arg0(&self) -> u32;
    /// Reads syscall argument register 1.
    fn arg1(&self) -> u32;
    /// Reads syscall argument register 2.
    fn arg2(&self) -> u32;
    /// Reads syscall argument register 3.
    fn arg3(&self) -> u32;
    /// Reads syscall argument register 4.
    fn arg4(&self) -> u32;
    /// Reads syscall argument register 5.
    fn arg5(&self) -> u32;
    /// Reads syscall argument register 6.
    fn arg6(&self) -> u32;

    /// Reads the system-call number.
    fn syscall_number(&self) -> i32;

    /// Writes syscall return slot 0.
    fn ret0(&mut self, _: u32);
    /// Writes syscall return slot 1.
    fn ret1(&mut self, _: u32);

    /// Returns a proxied reference that assigns names and types to the
    /// syscall arguments for `wait_for_event`.
    fn as_wait_args(&self) -> AsWaitArgs<&Self> {
        AsWaitArgs(self)
    }

    /// Returns a proxied reference that assigns names and types to the
    /// syscall arguments for `send_event`.
    fn as_send_args(&self) -> AsSendArgs<&Self> {
        AsSendArgs(self)
    }

    /// Returns a proxied reference that assigns names and types to the
    /// syscall arguments for `task_overrun_count`.
    fn as_overrun_args(&self) -> AsOverrunArgs<&Self> {
        AsOverrunArgs(self)
    }

    /// Returns a proxied reference that assigns names and types to the
    /// syscall arguments for `stack_reserve`.
    fn as_stack_reserve_args(&self) -> AsStackReserveArgs<&Self> {
        AsStackReserveArgs(self)
    }

    /// Sets the event set returned from a wait.
    fn set_wait_result(&mut self, events: EventSet) {
        self.ret0(events.bits());
        self.ret1(0);
    }

    /// Sets the word returned from a counting call.
    fn set_count_result(&mut self, value: u32) {
        self.ret0(value);
        self.ret1(0);
    }

    /// Sets the result of a system-time read.
    fn set_time_result(&mut self, now: Instant) {
        self.ret0(now.into());
        self.ret1(0);
    }
}

/// Reference proxy for wait argument registers.
pub struct AsWaitArgs<T>(T);

impl<T: ArchState> AsWaitArgs<&'_ T> {
    /// Extracts the wait mask.
    pub fn mask(&self) -> EventSet {
        EventSet(self.0.arg0())
    }

    /// Extracts the all-of/any-of predicate selector.
    pub fn wait_all(&self) -> bool {
        self.0.arg1() != 0
    }

    /// Extracts the timeout, in ticks.
    pub fn timeout(&self) -> u32 {
        self.0.arg2()
    }
}

/// Reference proxy for send argument registers.
pub struct AsSendArgs<T>(T);

impl<T: ArchState> AsSendArgs<&'_ T> {
    /// Extracts the set of events being sent.
    pub fn events(&self) -> EventSet {
        EventSet(self.0.arg0())
    }
}

/// Reference proxy for overrun-count argument registers.
pub struct AsOverrunArgs<T>(T);

impl<T: ArchState> AsOverrunArgs<&'_ T> {
    /// Extracts the queried task index.
    pub fn task_index(&self) -> usize {
        self.0.arg0() as usize
    }

    /// Extracts the read-and-clear flag.
    pub fn reset(&self) -> bool {
        self.0.arg1() != 0
    }
}

/// Reference proxy for stack-reserve argument registers.
pub struct AsStackReserveArgs<T>(T);

impl<T: ArchState> AsStackReserveArgs<&'_ T> {
    /// Extracts the queried task index.
    pub fn task_index(&self) -> usize {
        self.0.arg0() as usize
    }
}

/// Return value for operations that can have scheduling implications. This
/// is marked `must_use` because forgetting to actually act on a switch
/// requirement would be Bad.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextContext {
    /// It's fine to keep running whatever context we were just running.
    Same,
    /// We need to switch contexts, but this routine has not concluded which
    /// one should now run.
    Other,
    /// We need to switch contexts, and we already know which one should run
    /// next.
    Specific(usize),
}

impl NextContext {
    pub fn combine(self, other: Self) -> Self {
        use NextContext::*; // shorthand for patterns

        match (self, other) {
            // If both agree, our job is easy.
            (x, y) if x == y => x,
            // Specific recommendations that *don't* agree get downgraded to
            // Other.
            (Specific(_), Specific(_)) => Other,
            // If only *one* is specific, it wins.
            (Specific(x), _) | (_, Specific(x)) => Specific(x),
            // Otherwise, if either suggestion says switch, switch.
            (Other, _) | (_, Other) => Other,
            // All we have left is...
            (Same, Same) => Same,
        }
    }
}
