// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduler core: the task table, the ready and suspended lists, event
//! posting, the tick routine, and priority selection.
//!
//! `Kernel` owns every piece of mutable scheduler state. It is only ever
//! touched from inside a kernel handler with external interrupts masked;
//! the process-wide instance lives behind `startup::with_kernel`.
//!
//! # List discipline
//!
//! Every configured task is, at any instant, in exactly one place: the
//! ready list of its priority class, the suspended list, or the active
//! slot. Position 0 of a ready list is the currently-preferred task of
//! that class; preemption re-inserts the displaced task there, while
//! round-robin expiry re-inserts at the tail. The suspended list is kept
//! sorted by descending priority when synchronization objects are compiled
//! in, so that a released semaphore or mutex goes to the highest-priority
//! longest-waiting eligible task by a plain front-to-back scan.

use abi::{
    ContextFlags, EventSet, Instant, Priority, SuspendKind, TaskDesc,
    TaskFlags, IDLE_TASK, PRIORITY_COUNT, READY_DEPTH, TASK_COUNT,
};

use crate::sync::SyncBank;
use crate::task::{ArchState, NextContext, Task};

type ReadyList = heapless::Vec<u8, READY_DEPTH>;
type SuspendedList = heapless::Vec<u8, TASK_COUNT>;

/// Inserts `value` at `position`, shifting the tail up. Panics when the
/// list is full; capacities are sized by configuration so that cannot
/// happen in a consistent kernel.
fn list_insert<const N: usize>(
    list: &mut heapless::Vec<u8, N>,
    position: usize,
    value: u8,
) {
    uassert!(list.push(value).is_ok());
    list[position..].rotate_right(1);
}

/// Removes and returns the element at `position`, shifting the tail down.
fn list_remove<const N: usize>(
    list: &mut heapless::Vec<u8, N>,
    position: usize,
) -> u8 {
    let value = list[position];
    list[position..].rotate_left(1);
    let _ = list.pop();
    value
}

/// The scheduler and everything it schedules.
#[derive(Debug)]
pub struct Kernel {
    /// All tasks; index `IDLE_TASK` is the idle task.
    tasks: [Task; TASK_COUNT + 1],
    /// Per-priority ordered lists of tasks eligible to run.
    ready: [ReadyList; PRIORITY_COUNT],
    /// Tasks waiting for an event or timer.
    suspended: SuspendedList,
    /// The task currently holding the CPU. Never a member of any list.
    active: usize,
    /// System time in ticks. Wraps, intentionally.
    time: Instant,
    sync: SyncBank,
    /// Shared stack-pointer slots for stack-sharing single-shot tasks,
    /// indexed by `SavedContext::stack_slot - 1`. Zero means unused.
    stack_slots: [usize; TASK_COUNT],
    /// Committed context switches, recorded for the test suite. The real
    /// switches happen in the arch glue.
    #[cfg(not(target_os = "none"))]
    switch_log: std::vec::Vec<crate::arch::SwitchRecord>,
}

impl Kernel {
    pub fn new() -> Self {
        let mut kernel = Self {
            tasks: core::array::from_fn(|_| Task::unconfigured()),
            ready: core::array::from_fn(|_| ReadyList::new()),
            suspended: SuspendedList::new(),
            active: IDLE_TASK,
            time: Instant::ZERO,
            sync: SyncBank::new(),
            stack_slots: [0; TASK_COUNT],
            #[cfg(not(target_os = "none"))]
            switch_log: std::vec::Vec::new(),
        };
        // The idle task inherits the startup context: it is already
        // running, privileged, and can never be fresh.
        let idle = &mut kernel.tasks[IDLE_TASK];
        idle.save_mut().context_mut().flags = ContextFlags::PRIVILEGED;
        idle.mark_configured();
        kernel
    }

    /// Fills in one task slot during the initialization phase.
    ///
    /// # Panics
    ///
    /// On any configuration error: index out of range or reused, priority
    /// out of range, empty or malformed start mask, sync-object bits in
    /// the initial wait (not supported), or stack-slot misuse. Stack
    /// alignment and size violations panic inside the region validation.
    pub fn init_task(&mut self, index: usize, descriptor: &TaskDesc) {
        uassert!(index < TASK_COUNT);
        uassert!(!self.tasks[index].is_configured());
        uassert!(descriptor.priority.index() < PRIORITY_COUNT);

        let mask = descriptor.start_events;
        uassert!(!mask.is_empty());
        uassert!(!mask.intersects(EventSet::sync_objects()));
        uassert!(!mask.contains(EventSet::TIMERS));
        if descriptor.start_all {
            uassert!(mask.intersects(!EventSet::TIMERS));
        }
        if descriptor.stack_slot != 0 {
            uassert!(descriptor.flags.contains(TaskFlags::SINGLE_SHOT));
            uassert!(descriptor.stack_slot as usize <= TASK_COUNT);
        }

        let task = Task::from_descriptor(descriptor);
        if descriptor.stack_slot != 0 {
            // Sharers of a slot must actually share the stack.
            let slot = &mut self.stack_slots[descriptor.stack_slot as usize - 1];
            if *slot == 0 {
                *slot = task.stack().top();
            } else {
                uassert_eq!(*slot, task.stack().top());
            }
        }
        self.tasks[index] = task;
        self.insert_suspended(index);
    }

    /// Loads initial semaphore counts. A no-op beyond the configured
    /// semaphore count.
    #[cfg(feature = "sem")]
    pub fn init_semaphores(&mut self, counts: &[u32]) {
        self.sync.init_counters(counts);
    }

    pub(crate) fn verify_configured(&self) {
        for task in &self.tasks[..TASK_COUNT] {
            uassert!(task.is_configured(), "task not initialized");
        }
    }

    /// Implementation of the `send_event` kernel call.
    ///
    /// `caller` must be the active task (for an interrupt-driven send,
    /// that is the preempted task; see `post_events`). Returns the switch
    /// decision: the caller keeps the CPU unless some newly-ready task
    /// strictly outranks it.
    pub fn send_event(
        &mut self,
        caller: usize,
        events: EventSet,
    ) -> NextContext {
        uassert!(caller == self.active);
        // Timer events are generated by the tick routine, never sent.
        uassert!(!events.intersects(EventSet::TIMERS));

        // Mutex bits: each goes to the best eligible waiter, or back to
        // the bank.
        #[cfg(feature = "mutex")]
        for bit in (events & EventSet::mutexes()).iter() {
            match self.best_waiter_for(bit) {
                Some(index) => {
                    let _ = self.tasks[index].post(bit);
                }
                None => self.sync.return_mutex(bit),
            }
        }

        // Semaphore bits: each bit is one release.
        #[cfg(feature = "sem")]
        for bit in (events & EventSet::semaphores()).iter() {
            match self.best_waiter_for(bit) {
                Some(index) => {
                    let _ = self.tasks[index].post(bit);
                }
                None => self.sync.release_semaphore(bit),
            }
        }

        // Broadcast bits go to every interested waiter at once.
        let broadcast = events & EventSet::broadcasts();
        if !broadcast.is_empty() {
            for i in 0..self.suspended.len() {
                let index = usize::from(self.suspended[i]);
                let _ = self.tasks[index].post(broadcast);
            }
        }

        self.sweep_woken();
        self.maybe_preempt(caller)
    }

    /// Posts events on behalf of an interrupt handler: the nominal caller
    /// is whatever task was preempted.
    pub fn post_events(&mut self, events: EventSet) -> NextContext {
        let caller = self.active;
        self.send_event(caller, events)
    }

    /// Implementation of the `wait_for_event` kernel call.
    ///
    /// Returns `Same` when the fast path satisfied the request (the result
    /// is already in the caller's return slots); otherwise the caller has
    /// been suspended and the returned `Specific` names its replacement.
    pub fn wait_for_event(
        &mut self,
        caller: usize,
        mask: EventSet,
        all: bool,
        timeout: u32,
    ) -> NextContext {
        uassert!(caller == self.active);
        uassert!(caller != IDLE_TASK, "wait_for_event from idle");
        uassert!(!mask.is_empty());
        // At most one of the two timer events may be requested.
        uassert!(!mask.contains(EventSet::TIMERS));
        if all {
            uassert!(mask.intersects(!EventSet::TIMERS));
        }

        // Fast path, only meaningful with sync objects compiled in: take
        // whatever the banks hold right now. Timer bits count as
        // unsatisfied for this test.
        #[cfg(any(feature = "sem", feature = "mutex"))]
        {
            let got = self.sync.try_acquire(mask & EventSet::sync_objects());
            if kerncore::resume_condition_met(
                got.bits(),
                mask.bits(),
                all,
                EventSet::TIMERS.bits(),
            ) {
                self.tasks[caller].deliver_immediate(got);
                return NextContext::Same;
            }
            // Partial acquisitions are kept; they count toward the
            // predicate once the rest arrives.
            self.tasks[caller].set_wait_condition(mask, all);
            self.tasks[caller].seed_posted(got);
        }
        #[cfg(not(any(feature = "sem", feature = "mutex")))]
        self.tasks[caller].set_wait_condition(mask, all);

        let now = self.time;
        if mask.intersects(EventSet::ABSOLUTE_TIMER) {
            self.tasks[caller].arm_absolute_timer(timeout, now);
        }
        if mask.intersects(EventSet::DELAY_TIMER) {
            self.tasks[caller].arm_delay_timer(timeout);
        }

        self.insert_suspended(caller);
        NextContext::Specific(self.select_and_activate())
    }

    /// Implementation of the `terminate` kernel call, issued by the
    /// task-return guard of a single-shot task. The context reverts to
    /// fresh and the task re-arms its start condition; the switch glue
    /// additionally restores the shared stack-pointer slot.
    pub fn terminate(&mut self, caller: usize) -> NextContext {
        uassert!(caller == self.active);
        uassert!(caller != IDLE_TASK);

        let now = self.time;
        let task = &mut self.tasks[caller];
        uassert!(task.descriptor().flags.contains(TaskFlags::SINGLE_SHOT));

        let desc = *task.descriptor();
        task.set_wait_condition(desc.start_events, desc.start_all);
        if desc.start_events.intersects(EventSet::ABSOLUTE_TIMER) {
            task.arm_absolute_timer(desc.start_timeout, now);
        }
        if desc.start_events.intersects(EventSet::DELAY_TIMER) {
            task.arm_delay_timer(desc.start_timeout);
        }

        let ctx = task.save_mut().context_mut();
        ctx.flags |= ContextFlags::FRESH;
        ctx.suspend = SuspendKind::default();

        self.insert_suspended(caller);
        NextContext::Specific(self.select_and_activate())
    }

    /// The system-timer tick: advances time, fires due timers, rotates an
    /// expired round-robin slice, and re-selects the active task.
    pub fn system_tick(&mut self) -> NextContext {
        self.time = self.time.plus_ticks(1);
        let now = self.time;

        // Timer events, observed in suspended-list order, atomically with
        // this tick's transitions.
        for i in 0..self.suspended.len() {
            let index = usize::from(self.suspended[i]);
            let _ = self.tasks[index].process_tick(now);
        }
        self.sweep_woken();

        let previous = self.active;

        #[cfg(feature = "round-robin")]
        if previous != IDLE_TASK && self.tasks[previous].slice_tick() {
            // Slice expired: the active task rotates to the tail of its
            // class and the head takes over (or the same task, if alone).
            self.push_ready_back(previous);
            let next = self.select_and_activate();
            return if next == previous {
                NextContext::Same
            } else {
                NextContext::Specific(next)
            };
        }

        self.maybe_preempt(previous)
    }

    /// Reads (and optionally clears, atomically with the read) the
    /// saturating overrun counter of a regular task.
    pub fn overrun_count(&mut self, index: usize, reset: bool) -> u32 {
        uassert!(index < TASK_COUNT);
        self.tasks[index].read_overruns(reset)
    }

    /// Measures the untouched stack reserve of a regular task.
    pub fn stack_reserve(&self, index: usize) -> usize {
        uassert!(index < TASK_COUNT);
        self.tasks[index].stack().reserve_bytes()
    }

    pub fn now(&self) -> Instant {
        self.time
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn task(&self, index: usize) -> &Task {
        &self.tasks[index]
    }

    pub fn task_mut(&mut self, index: usize) -> &mut Task {
        &mut self.tasks[index]
    }

    /// Current tasks of the given priority class, preferred first. The
    /// active task is not listed.
    pub fn ready_list(&self, priority: Priority) -> &[u8] {
        &self.ready[priority.index()]
    }

    /// Tasks waiting for an event or timer, in scan order.
    pub fn suspended_list(&self) -> &[u8] {
        &self.suspended
    }

    #[cfg(feature = "sem")]
    pub fn semaphore_counter(&self, index: usize) -> u32 {
        self.sync.counter(index)
    }

    #[cfg(feature = "mutex")]
    pub fn free_mutexes(&self) -> EventSet {
        self.sync.free_mutexes()
    }

    /// Records a committed switch. On embedded targets the glue is the
    /// record; the hosted port keeps a log for the test suite.
    pub(crate) fn note_switch(
        &mut self,
        from: usize,
        to: usize,
        action: abi::SwitchAction,
        signal: u32,
    ) {
        #[cfg(not(target_os = "none"))]
        self.switch_log.push(crate::arch::SwitchRecord {
            from,
            to,
            action,
            signal,
        });
        #[cfg(target_os = "none")]
        let _ = (from, to, action, signal);
    }

    /// The committed context switches so far, oldest first.
    #[cfg(not(target_os = "none"))]
    pub fn switch_log(&self) -> &[crate::arch::SwitchRecord] {
        &self.switch_log
    }

    #[cfg(not(target_os = "none"))]
    pub fn clear_switch_log(&mut self) {
        self.switch_log.clear();
    }

    /// Discharges the context-primitive side of a termination: restores
    /// the leaving task's shared stack-pointer slot.
    pub(crate) fn terminate_leaving_context(&mut self, index: usize) {
        crate::arch::terminate_context(
            &mut self.tasks[index],
            &mut self.stack_slots,
        );
    }

    /// Constructs the initial saved state of a fresh context, on the fly,
    /// just before it is resumed.
    pub(crate) fn start_fresh_context(&mut self, index: usize) {
        crate::arch::start_fresh_context(
            &mut self.tasks[index],
            &self.stack_slots,
        );
    }

    // -- internals ---------------------------------------------------------

    /// First suspended task eligible to receive sync-object bit `bit`.
    /// List order makes this the highest-priority longest waiter.
    #[cfg(any(feature = "sem", feature = "mutex"))]
    fn best_waiter_for(&self, bit: EventSet) -> Option<usize> {
        self.suspended
            .iter()
            .map(|&i| usize::from(i))
            .find(|&i| self.tasks[i].wants(bit))
    }

    /// Moves every suspended task whose resume condition has become
    /// satisfied to the ready list of its class, delivering its wake
    /// events on the way.
    fn sweep_woken(&mut self) {
        let mut woken: heapless::Vec<u8, TASK_COUNT> = heapless::Vec::new();
        for &i in &self.suspended {
            if self.tasks[usize::from(i)].resume_condition_met() {
                // capacity matches the suspended list's, cannot overflow
                let _ = woken.push(i);
            }
        }
        for i in woken {
            let index = usize::from(i);
            self.remove_suspended(index);
            let _ = self.tasks[index].deliver_wake();
            self.push_ready_back(index);
        }
    }

    /// Checks whether the best ready task outranks the caller and commits
    /// the preemption if so. The displaced task becomes the preferred task
    /// of its class.
    fn maybe_preempt(&mut self, caller: usize) -> NextContext {
        match self.best_ready_priority() {
            Some(priority) if self.outranks_active(priority) => {
                if caller != IDLE_TASK {
                    self.push_ready_front(caller);
                }
                let next = self.take_ready_head(priority);
                self.activate(next);
                NextContext::Specific(next)
            }
            _ => NextContext::Same,
        }
    }

    fn outranks_active(&self, priority: Priority) -> bool {
        self.active == IDLE_TASK
            || priority.is_more_important_than(self.tasks[self.active].priority())
    }

    /// Highest priority class with a nonempty ready list.
    fn best_ready_priority(&self) -> Option<Priority> {
        (0..PRIORITY_COUNT)
            .rev()
            .find(|&p| !self.ready[p].is_empty())
            .map(|p| Priority(p as u8))
    }

    /// Takes the head of the highest nonempty ready list, falling back to
    /// the idle task, and makes it active.
    fn select_and_activate(&mut self) -> usize {
        let next = match self.best_ready_priority() {
            Some(priority) => self.take_ready_head(priority),
            None => IDLE_TASK,
        };
        self.activate(next);
        next
    }

    fn activate(&mut self, index: usize) {
        self.active = index;
        #[cfg(feature = "round-robin")]
        if index != IDLE_TASK {
            self.tasks[index].reload_slice();
        }
    }

    fn take_ready_head(&mut self, priority: Priority) -> usize {
        usize::from(list_remove(&mut self.ready[priority.index()], 0))
    }

    fn push_ready_front(&mut self, index: usize) {
        let priority = self.tasks[index].priority().index();
        list_insert(&mut self.ready[priority], 0, index as u8);
    }

    fn push_ready_back(&mut self, index: usize) {
        let priority = self.tasks[index].priority().index();
        uassert!(self.ready[priority].push(index as u8).is_ok());
    }

    /// Inserts a task into the suspended list: in descending-priority
    /// order (FIFO within a class) when sync objects are compiled in,
    /// plain tail order otherwise.
    fn insert_suspended(&mut self, index: usize) {
        let position = if cfg!(any(feature = "sem", feature = "mutex")) {
            let newcomer = self.tasks[index].priority();
            kerncore::sorted_insert_index(&self.suspended, |&t| {
                newcomer
                    .is_more_important_than(self.tasks[usize::from(t)].priority())
            })
        } else {
            self.suspended.len()
        };
        list_insert(&mut self.suspended, position, index as u8);
    }

    fn remove_suspended(&mut self, index: usize) {
        let position =
            self.suspended.iter().position(|&t| usize::from(t) == index);
        let Some(position) = position else {
            panic!("task not in suspended list");
        };
        let _ = list_remove(&mut self.suspended, position);
    }

    /// Verifies the structural invariants the scheduler promises to hold
    /// between any two kernel steps. Meant for tests and debugging; it is
    /// not called on any hot path.
    pub fn check_consistency(&self) {
        let mut seen = [0u8; TASK_COUNT + 1];

        for (priority, list) in self.ready.iter().enumerate() {
            for &i in list.iter() {
                let index = usize::from(i);
                uassert!(index != IDLE_TASK);
                uassert!(index != self.active);
                uassert_eq!(self.tasks[index].priority().index(), priority);
                seen[index] += 1;
            }
        }
        for &i in self.suspended.iter() {
            let index = usize::from(i);
            uassert!(index != IDLE_TASK);
            uassert!(index != self.active);
            seen[index] += 1;
        }
        seen[self.active] += 1;

        for (index, task) in self.tasks[..TASK_COUNT].iter().enumerate() {
            if task.is_configured() {
                uassert_eq!(seen[index], 1);
            }
        }

        // The idle task runs only when nothing is ready.
        if let Some(priority) = self.best_ready_priority() {
            uassert!(self.active != IDLE_TASK);
            uassert!(!priority
                .is_more_important_than(self.tasks[self.active].priority()));
        }

        for &i in self.suspended.iter() {
            let task = &self.tasks[usize::from(i)];
            uassert!(!task.wait_mask().is_empty());
            uassert!(task.wait_mask().contains(task.posted_events()));
            uassert!(!task.resume_condition_met());
            if task.wait_all() {
                uassert!(task.wait_mask().intersects(!EventSet::TIMERS));
                uassert!(!task.wait_mask().contains(EventSet::TIMERS));
            }
        }

        if cfg!(any(feature = "sem", feature = "mutex")) {
            for pair in self.suspended.windows(2) {
                let first = self.tasks[usize::from(pair[0])].priority();
                let second = self.tasks[usize::from(pair[1])].priority();
                uassert!(!second.is_more_important_than(first));
            }
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}
