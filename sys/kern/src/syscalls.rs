// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent system-call dispatch.
//!
//! Each system call is identified by a signed small integer. Non-negative
//! numbers are "simple" calls: they run with elevated privilege, never
//! change the current task, and return a single word. Negative numbers are
//! "kernel" calls: they may demand a context switch, reported to the
//! arch-specific glue through a `SwitchCommand` record and an additive
//! `SwitchAction` bit-set.
//!
//! Dispatch is a bounds-checked indirection into two dense tables, one per
//! call family. The table entries share a common signature:
//!
//! ```ignore
//! fn kernel_call(kernel: &mut Kernel, caller: usize) -> NextContext;
//! fn simple_call(kernel: &mut Kernel, caller: usize) -> u32;
//! ```
//!
//! Arguments are read from the caller's saved state through the argument
//! proxy types on `task::ArchState`, up to seven machine words.

use abi::{
    ContextFlags, KernelCall, SimpleCall, SuspendKind, SwitchAction,
    SwitchCommand,
};

use crate::sched::Kernel;
use crate::task::{ArchState, NextContext};

pub type KernelCallFn = fn(&mut Kernel, usize) -> NextContext;
pub type SimpleCallFn = fn(&mut Kernel, usize) -> u32;

/// Kernel calls, indexed by `-(number) - 1`.
pub static KERNEL_CALLS: [KernelCallFn; KernelCall::COUNT] =
    [wait_for_event, send_event, terminate];

/// Simple calls, indexed by number.
pub static SIMPLE_CALLS: [SimpleCallFn; SimpleCall::COUNT] =
    [overrun_count, stack_reserve, system_time];

/// Entry point shared by the arch-specific syscall entry sequences.
///
/// Before calling this, the caller's volatile state must have been stored
/// into its `SavedState`. On return, `command` has been filled in whenever
/// the returned action contains `SWITCH`.
pub fn dispatch(
    kernel: &mut Kernel,
    caller: usize,
    nr: i32,
    command: &mut SwitchCommand,
) -> SwitchAction {
    crate::profiling::event_syscall_enter(nr);

    let action = if nr >= 0 {
        let index = nr as usize;
        uassert!(index < SIMPLE_CALLS.len());
        let value = SIMPLE_CALLS[index](kernel, caller);
        kernel.task_mut(caller).save_mut().set_count_result(value);
        SwitchAction::empty()
    } else {
        let index = (-(i64::from(nr)) - 1) as usize;
        uassert!(index < KERNEL_CALLS.len());
        // Record how the caller is leaving the CPU, in case it does.
        kernel.task_mut(caller).save_mut().context_mut().suspend =
            SuspendKind::SystemCall(nr);
        let next = KERNEL_CALLS[index](kernel, caller);
        let terminating = nr == KernelCall::Terminate.number();
        finalize_switch(kernel, caller, next, terminating, command)
    };

    crate::profiling::event_syscall_exit();
    action
}

/// Converts a committed scheduling decision into the switch command the
/// glue consumes.
///
/// The kernel-call implementations have already moved tasks between lists
/// and updated the active slot; this routine only reads the outcome. The
/// `signal` field is meaningful to the glue when the resumed context
/// suspended synchronously; for an interrupt-suspended context it is
/// ignored, since that context resumes by pure state restore.
pub(crate) fn finalize_switch(
    kernel: &mut Kernel,
    caller: usize,
    next: NextContext,
    terminating: bool,
    command: &mut SwitchCommand,
) -> SwitchAction {
    let target = match next {
        NextContext::Same => return SwitchAction::empty(),
        NextContext::Specific(index) => index,
        NextContext::Other => kernel.active(),
    };
    if target == caller {
        return SwitchAction::empty();
    }

    let mut action = SwitchAction::SWITCH;
    if terminating {
        action |= SwitchAction::TERMINATE;
        kernel.terminate_leaving_context(caller);
    }
    if kernel
        .task(target)
        .save()
        .context()
        .flags
        .contains(ContextFlags::FRESH)
    {
        action |= SwitchAction::CREATE;
        kernel.start_fresh_context(target);
    }

    command.signal = kernel.task(target).wake_signal().bits();
    command.suspended =
        kernel.task_mut(caller).save_mut().context_mut() as *mut _;
    command.resumed =
        kernel.task_mut(target).save_mut().context_mut() as *mut _;

    debug_assert!(action.is_well_formed());

    // Safety: `target` names a live entry of the kernel's task table, which
    // has static storage; the recorded pointer outlives this call.
    unsafe {
        crate::arch::set_current_task(kernel.task(target));
    }
    kernel.note_switch(caller, target, action, command.signal);
    crate::profiling::event_context_switch(target);

    action
}

/// `wait_for_event(mask, all, timeout) -> events`.
fn wait_for_event(kernel: &mut Kernel, caller: usize) -> NextContext {
    let args = kernel.task(caller).save().as_wait_args();
    let (mask, all, timeout) = (args.mask(), args.wait_all(), args.timeout());
    kernel.wait_for_event(caller, mask, all, timeout)
}

/// `send_event(mask)`.
fn send_event(kernel: &mut Kernel, caller: usize) -> NextContext {
    let events = kernel.task(caller).save().as_send_args().events();
    kernel.send_event(caller, events)
}

/// Single-shot termination, issued by the task-return guard.
fn terminate(kernel: &mut Kernel, caller: usize) -> NextContext {
    kernel.terminate(caller)
}

/// `task_overrun_count(index, reset) -> count`.
fn overrun_count(kernel: &mut Kernel, caller: usize) -> u32 {
    let args = kernel.task(caller).save().as_overrun_args();
    let (index, reset) = (args.task_index(), args.reset());
    kernel.overrun_count(index, reset)
}

/// `stack_reserve(index) -> bytes`.
fn stack_reserve(kernel: &mut Kernel, caller: usize) -> u32 {
    let index = kernel.task(caller).save().as_stack_reserve_args().task_index();
    kernel.stack_reserve(index) as u32
}

/// `system_time() -> ticks`.
fn system_time(kernel: &mut Kernel, _caller: usize) -> u32 {
    kernel.now().into()
}
