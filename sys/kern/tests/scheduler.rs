// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduler behavior, driven through the hosted port.
//!
//! Each test builds its own `Kernel`, steps it by calling the kernel
//! entry points directly (the hosted "CPU" is the test itself), and
//! checks the structural invariants after every interesting transition.

use abi::{EventSet, Priority, TaskDesc, TaskFlags, IDLE_TASK};
use alacrity_kern::sched::Kernel;
use alacrity_kern::task::NextContext::{Same, Specific};
use proptest::prelude::*;

const STACK_SIZE: usize = 1024;

#[repr(C, align(8))]
struct TestStack([u8; STACK_SIZE]);

fn leak_stack() -> usize {
    Box::leak(Box::new(TestStack([0; STACK_SIZE]))) as *mut TestStack as usize
}

fn entry(_events: EventSet) -> ! {
    unreachable!("hosted tasks never actually run");
}

/// Broadcast event used to start task `index`.
fn start_bit(index: usize) -> EventSet {
    EventSet::single(8 + index as u32)
}

fn desc(priority: u8, start: EventSet, timeout: u32) -> TaskDesc {
    TaskDesc {
        entry,
        priority: Priority(priority),
        stack_base: leak_stack(),
        stack_size: STACK_SIZE,
        start_events: start,
        start_all: false,
        start_timeout: timeout,
        round_robin: 0,
        flags: TaskFlags::empty(),
        stack_slot: 0,
    }
}

/// Kernel with `priorities[i]` tasks started by `start_bit(i)`.
fn kernel_with(priorities: &[u8]) -> Kernel {
    let mut kernel = Kernel::new();
    for (index, &priority) in priorities.iter().enumerate() {
        kernel.init_task(index, &desc(priority, start_bit(index), 0));
    }
    kernel.check_consistency();
    kernel
}

// Scenario: a single periodic task driven by the absolute timer resumes
// exactly once per period, with no overruns.
#[test]
fn single_periodic_task_keeps_exact_cadence() {
    let mut kernel = Kernel::new();
    kernel.init_task(0, &desc(1, EventSet::ABSOLUTE_TIMER, 10));

    let mut resumptions = 0;
    for _ in 1..=100 {
        match kernel.system_tick() {
            Specific(0) => {
                resumptions += 1;
                // The task body is instantaneous; it immediately waits for
                // the next period.
                assert_eq!(
                    kernel.wait_for_event(0, EventSet::ABSOLUTE_TIMER, false, 10),
                    Specific(IDLE_TASK)
                );
            }
            Same => {}
            other => panic!("unexpected switch {other:?}"),
        }
        kernel.check_consistency();
    }
    assert_eq!(resumptions, 10);
    assert_eq!(kernel.overrun_count(0, false), 0);
}

// The delay timer guarantees a *minimum* delay: the in-flight reload is
// normalized to timeout + 1, while the pre-tick initial load is taken
// verbatim.
#[test]
fn delay_timer_start_fires_at_timeout_then_at_timeout_plus_one() {
    let mut kernel = Kernel::new();
    kernel.init_task(0, &desc(1, EventSet::DELAY_TIMER, 10));

    let mut wakes = Vec::new();
    for tick in 1..=25u32 {
        match kernel.system_tick() {
            Specific(0) => {
                wakes.push(tick);
                assert_eq!(kernel.task(0).wake_signal(), EventSet::DELAY_TIMER);
                assert_eq!(
                    kernel.wait_for_event(0, EventSet::DELAY_TIMER, false, 10),
                    Specific(IDLE_TASK)
                );
            }
            Same => {}
            other => panic!("unexpected switch {other:?}"),
        }
    }
    // Initial load fires on tick 10; each rearm adds the +1 jitter guard.
    assert_eq!(wakes, vec![10, 21]);
}

#[test]
fn zero_delay_still_waits_one_tick() {
    let mut kernel = kernel_with(&[1]);
    assert_eq!(kernel.post_events(start_bit(0)), Specific(0));
    assert_eq!(
        kernel.wait_for_event(0, EventSet::DELAY_TIMER, false, 0),
        Specific(IDLE_TASK)
    );
    // The task is not resumed within the same tick interval...
    assert_eq!(kernel.active(), IDLE_TASK);
    // ...but on the very next tick.
    assert_eq!(kernel.system_tick(), Specific(0));
}

// Scenario: an event send immediately preempts the sender when the woken
// task outranks it.
#[test]
fn higher_priority_waiter_preempts_the_sender() {
    let event = EventSet::single(20);
    let mut kernel = kernel_with(&[2, 1]);

    // Bring up the high-priority task first and let it block on `event`.
    assert_eq!(kernel.post_events(start_bit(0)), Specific(0));
    assert_eq!(kernel.post_events(start_bit(1)), Same); // lo is ready, hi active
    assert_eq!(kernel.wait_for_event(0, event, false, 0), Specific(1));
    kernel.check_consistency();

    // The low-priority task sends; the high-priority one takes the CPU at
    // once, and the sender is the preferred ready task of its class.
    assert_eq!(kernel.send_event(1, event), Specific(0));
    assert_eq!(kernel.active(), 0);
    assert_eq!(kernel.task(0).wake_signal(), event);
    assert_eq!(kernel.ready_list(Priority(1)), [1].as_slice());
    kernel.check_consistency();

    // Only when the high task suspends again does the sender resume.
    assert_eq!(kernel.wait_for_event(0, event, false, 0), Specific(1));
    assert_eq!(kernel.active(), 1);
}

#[test]
fn equal_priority_wake_does_not_preempt() {
    let event = EventSet::single(20);
    let mut kernel = kernel_with(&[1, 1]);

    assert_eq!(kernel.post_events(start_bit(0)), Specific(0));
    assert_eq!(kernel.wait_for_event(0, event, false, 0), Specific(IDLE_TASK));
    assert_eq!(kernel.post_events(start_bit(1)), Specific(1));

    // Strict outranking is required for preemption.
    assert_eq!(kernel.send_event(1, event), Same);
    assert_eq!(kernel.active(), 1);
    assert_eq!(kernel.ready_list(Priority(1)), [0].as_slice());
    kernel.check_consistency();
}

// Law: a broadcast send followed by a wait returns exactly the
// intersection of the sent set and the waiter's mask.
#[test]
fn waiter_receives_exactly_the_masked_events() {
    let mask = EventSet::single(8) | EventSet::single(9);
    let mut kernel = kernel_with(&[1, 2]);

    assert_eq!(kernel.post_events(start_bit(1)), Specific(1));
    assert_eq!(kernel.wait_for_event(1, mask, false, 0), Specific(IDLE_TASK));

    // Send a superset; only the masked part arrives.
    let sent = EventSet::single(9) | EventSet::single(21);
    let _ = kernel.post_events(sent);
    assert_eq!(kernel.task(1).wake_signal(), EventSet::single(9));
}

// All-of waits resume on the full non-timer set, or on a requested timer
// as the escape hatch.
#[test]
fn wait_all_requires_every_bit_unless_a_timer_fires() {
    let a = EventSet::single(20);
    let b = EventSet::single(21);
    let mut kernel = kernel_with(&[2, 1]);

    assert_eq!(kernel.post_events(start_bit(0)), Specific(0));
    assert_eq!(kernel.wait_for_event(0, a | b, true, 0), Specific(IDLE_TASK));

    let _ = kernel.post_events(a);
    // Half the conjunction is not enough.
    assert_eq!(kernel.active(), IDLE_TASK);
    kernel.check_consistency();

    let _ = kernel.post_events(b);
    assert_eq!(kernel.active(), 0);
    assert_eq!(kernel.task(0).wake_signal(), a | b);
}

#[test]
fn wait_all_timer_escape_hatch() {
    let a = EventSet::single(20);
    let mut kernel = kernel_with(&[2]);

    assert_eq!(kernel.post_events(start_bit(0)), Specific(0));
    assert_eq!(
        kernel.wait_for_event(0, a | EventSet::DELAY_TIMER, true, 3),
        Specific(IDLE_TASK)
    );

    // The conjunction never completes, but the delay fires: 3 + 1 ticks.
    for _ in 0..3 {
        assert_eq!(kernel.system_tick(), Same);
    }
    assert_eq!(kernel.system_tick(), Specific(0));
    assert_eq!(kernel.task(0).wake_signal(), EventSet::DELAY_TIMER);
}

// Scenario: a released mutex goes to the highest-priority longest-waiting
// eligible task, not to every waiter.
#[cfg(feature = "mutex")]
#[test]
fn released_mutex_goes_to_the_best_waiter() {
    let mutex = EventSet::single(4);
    let park = EventSet::single(20);
    // A: prio 2, B: prio 1, C: prio 3 (initial holder).
    let mut kernel = kernel_with(&[2, 1, 3]);

    // C takes the mutex on the fast path and parks.
    assert_eq!(kernel.post_events(start_bit(2)), Specific(2));
    assert_eq!(kernel.wait_for_event(2, mutex, false, 0), Same);
    assert_eq!(kernel.task(2).wake_signal(), mutex);
    assert!(!kernel.free_mutexes().intersects(mutex));
    assert_eq!(kernel.wait_for_event(2, park, false, 0), Specific(IDLE_TASK));

    // A and B both reach the slow path behind the held mutex.
    assert_eq!(kernel.post_events(start_bit(0)), Specific(0));
    assert_eq!(kernel.wait_for_event(0, mutex, false, 0), Specific(IDLE_TASK));
    assert_eq!(kernel.post_events(start_bit(1)), Specific(1));
    assert_eq!(kernel.wait_for_event(1, mutex, false, 0), Specific(IDLE_TASK));
    kernel.check_consistency();

    // C resumes and releases.
    assert_eq!(kernel.post_events(park), Specific(2));
    assert_eq!(kernel.send_event(2, mutex), Same); // A (prio 2) < C (prio 3)

    // Exactly one grant: A is ready with the mutex, B still waits, and the
    // bank did not get the bit back.
    assert_eq!(kernel.ready_list(Priority(2)), [0].as_slice());
    assert_eq!(kernel.task(0).wake_signal(), mutex);
    assert!(kernel.suspended_list().contains(&1));
    assert_eq!(kernel.task(1).posted_events(), EventSet::EMPTY);
    assert!(!kernel.free_mutexes().intersects(mutex));
    kernel.check_consistency();
}

// Law: acquire-then-release of a mutex leaves the bank unchanged.
#[cfg(feature = "mutex")]
#[test]
fn mutex_acquire_release_roundtrip_restores_the_bank() {
    let mutex = EventSet::single(5);
    let mut kernel = kernel_with(&[1]);

    let before = kernel.free_mutexes();
    assert_eq!(kernel.post_events(start_bit(0)), Specific(0));
    assert_eq!(kernel.wait_for_event(0, mutex, false, 0), Same);
    assert!(!kernel.free_mutexes().intersects(mutex));
    assert_eq!(kernel.send_event(0, mutex), Same);
    assert_eq!(kernel.free_mutexes(), before);
}

#[cfg(feature = "mutex")]
#[test]
#[should_panic(expected = "double release")]
fn double_release_of_a_free_mutex_asserts() {
    let mutex = EventSet::single(4);
    let mut kernel = kernel_with(&[1]);
    assert_eq!(kernel.post_events(start_bit(0)), Specific(0));
    // Never acquired; the release has no owner and no waiter.
    let _ = kernel.send_event(0, mutex);
}

// Scenario: semaphore with two units, three takers; the first two succeed
// immediately, the third blocks until a unit is released.
#[cfg(feature = "sem")]
#[test]
fn semaphore_counts_units_and_grants_the_blocked_taker() {
    let sem = EventSet::single(0);
    let mut kernel = kernel_with(&[1, 1, 1]);
    kernel.init_semaphores(&[2]);

    for index in 0..3 {
        assert_eq!(kernel.post_events(start_bit(index)), Specific(index));
        let next = kernel.wait_for_event(index, sem, false, 0);
        if index < 2 {
            // Fast path; the task then parks so the next one can run.
            assert_eq!(next, Same);
            assert_eq!(kernel.task(index).wake_signal(), sem);
            assert_eq!(
                kernel.wait_for_event(
                    index,
                    EventSet::single(24 + index as u32),
                    false,
                    0
                ),
                Specific(IDLE_TASK)
            );
        } else {
            // Counter exhausted; C suspends.
            assert_eq!(next, Specific(IDLE_TASK));
        }
    }
    assert_eq!(kernel.semaphore_counter(0), 0);
    kernel.check_consistency();

    // One release: goes to C as a direct grant, not to the counter.
    assert_eq!(kernel.post_events(sem), Specific(2));
    assert_eq!(kernel.task(2).wake_signal(), sem);
    assert_eq!(kernel.semaphore_counter(0), 0);
    kernel.check_consistency();
}

// Law: release-then-acquire through a single waiter leaves the counter
// unchanged; without a waiter the counter round-trips through 1.
#[cfg(feature = "sem")]
#[test]
fn semaphore_release_acquire_roundtrip() {
    let sem = EventSet::single(1);
    let mut kernel = kernel_with(&[1]);

    assert_eq!(kernel.post_events(start_bit(0)), Specific(0));
    assert_eq!(kernel.send_event(0, sem), Same);
    assert_eq!(kernel.semaphore_counter(1), 1);
    assert_eq!(kernel.wait_for_event(0, sem, false, 0), Same);
    assert_eq!(kernel.semaphore_counter(1), 0);
}

// Scenario: a task whose body overruns its period accumulates overruns
// monotonically and is redelivered one tick late each cycle.
#[test]
fn overrunning_task_is_counted_and_recovered() {
    let mut kernel = Kernel::new();
    kernel.init_task(0, &desc(1, EventSet::ABSOLUTE_TIMER, 5));

    // First activation at tick 5.
    for _ in 1..=4 {
        assert_eq!(kernel.system_tick(), Same);
    }
    assert_eq!(kernel.system_tick(), Specific(0));

    let mut resume_times = Vec::new();
    for _cycle in 0..3 {
        // The body consumes 7 ticks of a 5-tick period.
        for _ in 0..7 {
            assert_eq!(kernel.system_tick(), Same);
        }
        // The next deadline is already in the past; the scheduler bumps
        // the overrun count and delivers one tick out.
        let _ = kernel.wait_for_event(0, EventSet::ABSOLUTE_TIMER, false, 5);
        assert_eq!(kernel.system_tick(), Specific(0));
        resume_times.push(u32::from(kernel.now()));
        kernel.check_consistency();
    }

    assert_eq!(kernel.overrun_count(0, false), 3);
    // Recovery is always "one past the wait": 12+1, 20+1, 28+1.
    assert_eq!(resume_times, vec![13, 21, 29]);

    // Read-and-clear is atomic with the read.
    assert_eq!(kernel.overrun_count(0, true), 3);
    assert_eq!(kernel.overrun_count(0, false), 0);
}

// Scenario: three equal-priority tasks with 3-tick slices rotate
// A -> B -> C -> A.
#[cfg(feature = "round-robin")]
#[test]
fn round_robin_rotates_each_full_slice() {
    let mut kernel = Kernel::new();
    for index in 0..3 {
        let mut d = desc(1, start_bit(index), 0);
        d.round_robin = 3;
        kernel.init_task(index, &d);
    }

    assert_eq!(kernel.post_events(start_bit(0)), Specific(0));
    assert_eq!(kernel.post_events(start_bit(1)), Same);
    assert_eq!(kernel.post_events(start_bit(2)), Same);
    assert_eq!(kernel.ready_list(Priority(1)), [1, 2].as_slice());

    let mut schedule = Vec::new();
    for _ in 0..18 {
        match kernel.system_tick() {
            Specific(next) => schedule.push(next),
            Same => {}
            other => panic!("unexpected switch {other:?}"),
        }
        kernel.check_consistency();
    }
    // Slices expire on ticks 3, 6, 9, ...; the expired task goes to the
    // tail of its class.
    assert_eq!(schedule, vec![1, 2, 0, 1, 2, 0]);
}

#[cfg(feature = "round-robin")]
#[test]
fn lone_round_robin_task_keeps_running() {
    let mut kernel = Kernel::new();
    let mut d = desc(1, start_bit(0), 0);
    d.round_robin = 2;
    kernel.init_task(0, &d);

    assert_eq!(kernel.post_events(start_bit(0)), Specific(0));
    for _ in 0..6 {
        // Rotation of a single-task class re-selects the same task.
        assert_eq!(kernel.system_tick(), Same);
        assert_eq!(kernel.active(), 0);
    }
}

// A preempted task re-enters its class at position 0 (preferred), ahead
// of equal-priority peers that were already ready.
#[test]
fn preempted_task_becomes_preferred_in_its_class() {
    let event = EventSet::single(20);
    let mut kernel = kernel_with(&[1, 1, 2]);

    assert_eq!(kernel.post_events(start_bit(0)), Specific(0));
    assert_eq!(kernel.post_events(start_bit(1)), Same); // 1 ready
    assert_eq!(kernel.post_events(start_bit(2)), Specific(2)); // preempts 0

    assert_eq!(kernel.ready_list(Priority(1)), [0, 1].as_slice());

    // When the high-priority task leaves, the preempted task resumes
    // before its peer.
    assert_eq!(kernel.wait_for_event(2, event, false, 0), Specific(0));
}

#[test]
fn stack_reserve_probes_from_the_base() {
    let mut kernel = kernel_with(&[1]);
    let base = kernel.task(0).stack().base();

    // Freshly painted: the whole region still holds the pattern.
    assert_eq!(kernel.stack_reserve(0), STACK_SIZE);

    // A scribble 40 bytes up marks the deepest excursion.
    unsafe { ((base + 40) as *mut u32).write(0xdead_beef) };
    assert_eq!(kernel.stack_reserve(0), 40);

    // The measurement is monotonic non-increasing.
    unsafe { ((base + 16) as *mut u32).write(0xdead_beef) };
    assert_eq!(kernel.stack_reserve(0), 16);
}

#[test]
#[should_panic]
fn misaligned_stack_is_a_configuration_error() {
    let mut kernel = Kernel::new();
    let mut d = desc(1, start_bit(0), 0);
    d.stack_base += 4;
    kernel.init_task(0, &d);
}

#[cfg(any(feature = "sem", feature = "mutex"))]
#[test]
#[should_panic]
fn sync_bits_in_the_start_mask_are_rejected() {
    let mut kernel = Kernel::new();
    kernel.init_task(0, &desc(1, EventSet::single(0), 0));
}

#[test]
#[should_panic(expected = "wait_for_event from idle")]
fn wait_from_the_idle_task_is_fatal() {
    let mut kernel = kernel_with(&[1]);
    // All tasks suspended; idle is active and must never wait.
    let _ = kernel.wait_for_event(IDLE_TASK, EventSet::single(20), false, 0);
}

#[test]
#[should_panic]
fn sending_timer_events_is_rejected() {
    let mut kernel = kernel_with(&[1]);
    let _ = kernel.post_events(EventSet::DELAY_TIMER);
}

#[test]
#[should_panic]
fn waiting_on_both_timer_bits_is_rejected() {
    let mut kernel = kernel_with(&[1]);
    assert_eq!(kernel.post_events(start_bit(0)), Specific(0));
    let _ = kernel.wait_for_event(0, EventSet::TIMERS, false, 1);
}

#[test]
#[should_panic]
fn wait_all_on_timers_alone_is_rejected() {
    let mut kernel = kernel_with(&[1]);
    assert_eq!(kernel.post_events(start_bit(0)), Specific(0));
    let _ = kernel.wait_for_event(0, EventSet::DELAY_TIMER, true, 1);
}

// Timer events observed on a tick are atomic with that tick's task-state
// transitions: two tasks due on the same tick both wake before selection.
#[test]
fn same_tick_timer_wakes_are_atomic() {
    let mut kernel = Kernel::new();
    kernel.init_task(0, &desc(1, EventSet::ABSOLUTE_TIMER, 3));
    kernel.init_task(1, &desc(2, EventSet::ABSOLUTE_TIMER, 3));

    for _ in 1..=2 {
        assert_eq!(kernel.system_tick(), Same);
    }
    // Both fire; the higher-priority task is selected.
    assert_eq!(kernel.system_tick(), Specific(1));
    assert_eq!(kernel.ready_list(Priority(1)), [0].as_slice());
    kernel.check_consistency();
}

// The kernel-level contract behind the deadline math: a task is resumed
// exactly `period` ticks after each wait, cycle after cycle, with the
// deadline accumulating rather than re-basing. (Wrap-around ordering
// itself is covered by the kerncore property tests.)
#[test]
fn accumulated_deadlines_are_met_exactly_each_period() {
    let mut kernel = Kernel::new();
    kernel.init_task(0, &desc(1, EventSet::ABSOLUTE_TIMER, 3));

    for _ in 1..=3 {
        let _ = kernel.system_tick();
    }
    // Task 0 is active at time 3.
    for cycle in 0..4 {
        assert_eq!(
            kernel.wait_for_event(0, EventSet::ABSOLUTE_TIMER, false, 3),
            Specific(IDLE_TASK),
            "cycle {cycle}"
        );
        for _ in 0..2 {
            assert_eq!(kernel.system_tick(), Same);
        }
        assert_eq!(kernel.system_tick(), Specific(0));
    }
    assert_eq!(kernel.overrun_count(0, false), 0);
}

// Whatever sequence of ticks, sends, and waits the application produces,
// the structural invariants hold between any two kernel steps.

#[derive(Debug, Clone)]
enum Op {
    Tick,
    Post(u32),
    Wait { mask: u32, all: bool, timeout: u32 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Tick),
        // Broadcast and semaphore events; mutex bits are excluded because
        // a blind release of a free mutex is (correctly) an assertion.
        2 => any::<u32>().prop_map(|bits| Op::Post(
            bits & (EventSet::broadcasts() | EventSet::semaphores()).bits()
        )),
        2 => (any::<u32>(), any::<bool>(), 0u32..20, 0u32..3).prop_map(
            |(bits, all, timeout, timer)| {
                // Always waitable via bit 20, at most one timer bit.
                let base = (bits & !EventSet::TIMERS.bits())
                    | EventSet::single(20).bits();
                let timer = match timer {
                    1 => EventSet::ABSOLUTE_TIMER.bits(),
                    2 => EventSet::DELAY_TIMER.bits(),
                    _ => 0,
                };
                Op::Wait { mask: base | timer, all, timeout }
            }
        ),
    ]
}

proptest! {
    #[test]
    fn random_schedules_preserve_the_invariants(
        ops in proptest::collection::vec(op_strategy(), 1..200),
    ) {
        let mut kernel = kernel_with(&[1, 2, 1, 3]);
        for op in ops {
            match op {
                Op::Tick => {
                    let _ = kernel.system_tick();
                }
                Op::Post(bits) => {
                    let _ = kernel.post_events(EventSet(bits));
                }
                Op::Wait { mask, all, timeout } => {
                    let active = kernel.active();
                    if active != IDLE_TASK {
                        let _ = kernel.wait_for_event(
                            active,
                            EventSet(mask),
                            all,
                            timeout,
                        );
                    }
                }
            }
            kernel.check_consistency();
        }
    }
}
