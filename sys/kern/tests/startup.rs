// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot flow through the process-wide kernel instance: singleton
//! lifecycle, timer installation, interrupt wiring, and interrupt-driven
//! scheduling. One test, because it all shares process-global state.

use abi::{EventSet, Priority, TaskDesc, TaskFlags, IDLE_TASK, TASK_COUNT};
use alacrity_kern::arch;
use alacrity_kern::irq::{
    install_interrupt_handler, interrupt_entry, InterruptDesc,
    InterruptHandler,
};
use alacrity_kern::sched::Kernel;
use alacrity_kern::task::NextContext;
use alacrity_kern::{startup, tick};

const STACK_SIZE: usize = 1024;

#[repr(C, align(8))]
struct TestStack([u8; STACK_SIZE]);

fn leak_stack() -> usize {
    Box::leak(Box::new(TestStack([0; STACK_SIZE]))) as *mut TestStack as usize
}

fn entry(_events: EventSet) -> ! {
    unreachable!("hosted tasks never actually run");
}

fn start_bit(index: usize) -> EventSet {
    EventSet::single(8 + index as u32)
}

fn desc(index: usize) -> TaskDesc {
    TaskDesc {
        entry,
        priority: Priority(1),
        stack_base: leak_stack(),
        stack_size: STACK_SIZE,
        start_events: start_bit(index),
        start_all: false,
        start_timeout: 0,
        round_robin: 0,
        flags: TaskFlags::empty(),
        stack_slot: 0,
    }
}

fn wake_task_zero(kernel: &mut Kernel) -> NextContext {
    kernel.post_events(start_bit(0))
}

static BUTTON_IRQ: InterruptDesc = InterruptDesc {
    vector: 5,
    priority: 3,
    preemptable: false,
    handler: InterruptHandler::Kernel(wake_task_zero),
};

#[cfg(feature = "sem")]
static SEM_COUNTS: [u32; 4] = [1, 1, 1, 1];

#[test]
fn boot_flow_through_the_singleton() {
    arch::clear_substrate_records();
    // Safety: first and only initialization in this process.
    unsafe { startup::init_kernel() };

    for index in 0..TASK_COUNT {
        startup::init_task(index, &desc(index));
    }
    #[cfg(feature = "sem")]
    startup::init_semaphores(&SEM_COUNTS);
    startup::with_kernel(|kernel| kernel.check_consistency());

    // The timer is configured but dormant until explicitly started.
    tick::install_system_timer();
    assert_eq!(arch::tick_sources(), vec![(0, abi::TICK_PERIOD_US)]);
    assert!(!arch::tick_sources_running());

    // Wiring an interrupt reaches the substrate facility with the full
    // description.
    install_interrupt_handler(&BUTTON_IRQ);
    let installed = arch::installed_interrupts();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].vector, 5);
    assert_eq!(installed[0].priority, 3);
    assert!(installed[0].is_kernel);
    assert!(!installed[0].preemptable);

    arch::start_tick_sources();
    assert!(arch::tick_sources_running());

    // An asynchronous kernel interrupt posts events and forces a switch:
    // task 0 preempts idle, started on the fly.
    interrupt_entry(5);
    startup::with_kernel(|kernel| {
        assert_eq!(kernel.active(), 0);
        kernel.check_consistency();
        let log = kernel.switch_log();
        assert_eq!(log.len(), 1);
        assert_eq!((log[0].from, log[0].to), (IDLE_TASK, 0));
        assert_eq!(log[0].signal, start_bit(0).bits());
    });

    // The task blocks on the delay timer; tick entries drive the
    // singleton's clock and resume it.
    startup::with_kernel(|kernel| {
        assert_eq!(
            kernel.wait_for_event(0, EventSet::DELAY_TIMER, false, 1),
            NextContext::Specific(IDLE_TASK)
        );
    });
    tick::tick_entry();
    startup::with_kernel(|kernel| {
        assert_eq!(u32::from(kernel.now()), 1);
        assert_eq!(kernel.active(), IDLE_TASK);
    });
    tick::tick_entry();
    startup::with_kernel(|kernel| {
        assert_eq!(kernel.active(), 0);
        assert_eq!(kernel.task(0).wake_signal(), EventSet::DELAY_TIMER);
        kernel.check_consistency();
    });

    // Safety: no interrupts are live in this harness.
    unsafe { startup::teardown_kernel() };
}
