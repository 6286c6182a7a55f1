// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt entry plumbing.
//!
//! The kernel does not own the interrupt controller; a lower layer exposes
//! an "install interrupt handler" facility (see `arch::enable_interrupt`)
//! and routes installed vectors to `interrupt_entry`. This module keeps the
//! vector-to-handler mapping and implements the common prologue/epilogue.
//!
//! A handler is either *simple* -- it returns nothing and never interacts
//! with the scheduler -- or *kernel* -- it runs with all external
//! interrupts masked, cannot nest, and may request a context switch, which
//! is honored through the same switch-command mechanism as a system call.

use abi::{SuspendKind, SwitchAction, SwitchCommand};

use crate::sched::Kernel;
use crate::task::{ArchState, NextContext};

/// Largest vector index the kernel will track. The substrate may have more
/// vectors; only the ones handed to `install_interrupt_handler` concern us.
pub const MAX_VECTORS: usize = 16;

#[derive(Copy, Clone)]
pub enum InterruptHandler {
    /// No scheduler interaction; may preempt other simple handlers when
    /// installed at a higher priority.
    Simple(fn()),
    /// Runs under the kernel interrupt-disable discipline and may request
    /// a switch.
    Kernel(fn(&mut Kernel) -> NextContext),
}

/// Everything the lower layer needs to wire one interrupt.
pub struct InterruptDesc {
    pub vector: u32,
    pub priority: u8,
    pub preemptable: bool,
    pub handler: InterruptHandler,
}

static mut HANDLERS: [Option<&'static InterruptDesc>; MAX_VECTORS] =
    [None; MAX_VECTORS];

/// Registers a handler and asks the substrate to wire the vector.
pub fn install_interrupt_handler(desc: &'static InterruptDesc) {
    uassert!((desc.vector as usize) < MAX_VECTORS);
    let is_kernel = matches!(desc.handler, InterruptHandler::Kernel(_));

    {
        let _cs = crate::arch::CriticalSection::enter();
        // Safety: writes go through this one function, under the critical
        // section; readers run in interrupt context after installation.
        let table = unsafe { &mut *core::ptr::addr_of_mut!(HANDLERS) };
        table[desc.vector as usize] = Some(desc);
    }

    crate::arch::enable_interrupt(
        desc.vector,
        desc.priority,
        desc.preemptable,
        is_kernel,
    );
}

/// Common entry for asynchronous external interrupts, invoked by the
/// arch/substrate glue after the volatile part of the preempted context has
/// been saved.
pub fn interrupt_entry(vector: u32) {
    crate::profiling::event_isr_enter();

    let desc = {
        let _cs = crate::arch::CriticalSection::enter();
        // Safety: see `install_interrupt_handler`.
        let table = unsafe { &*core::ptr::addr_of!(HANDLERS) };
        table[vector as usize]
    };
    let Some(desc) = desc else {
        panic!("unhandled interrupt");
    };

    match desc.handler {
        InterruptHandler::Simple(handler) => handler(),
        InterruptHandler::Kernel(handler) => run_kernel_handler(handler),
    }

    crate::profiling::event_isr_exit();
}

/// Runs a kernel-interrupt handler against the singleton and honors its
/// switch request. Shared with the system-timer entry.
pub(crate) fn run_kernel_handler(handler: fn(&mut Kernel) -> NextContext) {
    crate::startup::with_kernel(|kernel| {
        let caller = kernel.active();
        // The preempted context resumes by pure state restore.
        kernel.task_mut(caller).save_mut().context_mut().suspend =
            SuspendKind::Interrupt;

        let next = handler(kernel);

        let mut command = SwitchCommand::new();
        let action = crate::syscalls::finalize_switch(
            kernel, caller, next, false, &mut command,
        );
        if action.contains(SwitchAction::SWITCH) {
            crate::arch::pend_switch(&command, action);
        }
    });
}
