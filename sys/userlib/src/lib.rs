// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User application support library for Alacrity.
//!
//! This contains the system-call stubs and re-exports the contents of the
//! `abi` crate that gets shared with the kernel.
//!
//! # Syscall stub implementation
//!
//! The kernel's syscall ABI deliberately uses registers that survive
//! exception entry: arguments travel in r4-r10, the call number in r11,
//! and results come back in r4-r5. Those registers are callee-saved and
//! partly reserved, so ordinary `asm!` operands cannot reach them; the
//! stub is a naked function that loads the whole register block from an
//! argument record, traps, and moves the results into the ordinary return
//! registers.
//!
//! On non-ARM targets the stubs are compiled as unreachable placeholders;
//! host-side testing drives the kernel's dispatcher directly instead of
//! trapping.

#![no_std]

pub use abi::*;

/// Argument record consumed by the syscall stub. The field order matches
/// the `ldm` in the stub: seven argument words into r4-r10, then the call
/// number into r11.
#[repr(C)]
struct SyscallArgs {
    args: [u32; 7],
    nr: u32,
}

/// Return type for the stub's `(r4, r5)` result pair, passed back in
/// `r0:r1` because struct returns are not register-guaranteed by the C
/// ABI, but a `u64` is.
#[repr(transparent)]
struct RcPair(u64);

impl From<RcPair> for (u32, u32) {
    fn from(s: RcPair) -> Self {
        (s.0 as u32, (s.0 >> 32) as u32)
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        #[unsafe(naked)]
        unsafe extern "C" fn syscall_stub(_args: &SyscallArgs) -> RcPair {
            core::arch::naked_asm!(
                "push {{r4-r11}}",
                // Load the argument block: r4-r10 arguments, r11 number.
                "ldm r0, {{r4-r11}}",
                "svc #0",
                // Results ride in r4-r5; hand them back in r0-r1.
                "mov r0, r4",
                "mov r1, r5",
                "pop {{r4-r11}}",
                "bx lr",
            )
        }
    } else {
        unsafe extern "C" fn syscall_stub(_args: &SyscallArgs) -> RcPair {
            unimplemented!("system calls exist only on embedded targets")
        }
    }
}

#[inline(always)]
fn syscall(nr: i32, args: [u32; 7]) -> (u32, u32) {
    let record = SyscallArgs {
        args,
        nr: nr as u32,
    };
    // Safety: the stub only reads the record and traps; the kernel side
    // validates everything it is handed.
    unsafe { syscall_stub(&record) }.into()
}

/// Sends a set of events: broadcast bits to every interested waiter,
/// semaphore releases and mutex handovers to the best eligible waiter.
///
/// The mask must not contain the timer events; those are generated by the
/// kernel's tick routine only.
#[inline(always)]
pub fn sys_send_event(events: EventSet) {
    let _ = syscall(
        KernelCall::SendEvent.number(),
        [events.bits(), 0, 0, 0, 0, 0, 0],
    );
}

/// Waits until the events in `mask` satisfy the resume predicate (`all` =
/// every non-timer bit, or either requested timer bit; otherwise any bit).
/// Returns the set of events that caused resumption.
///
/// `timeout` loads whichever timer event `mask` names: an absolute
/// deadline increment, or a minimum delay in ticks. Never call this from
/// the idle task.
#[inline(always)]
pub fn sys_wait_for_event(
    mask: EventSet,
    wait_all: bool,
    timeout: u32,
) -> EventSet {
    let (events, _) = syscall(
        KernelCall::WaitForEvent.number(),
        [mask.bits(), wait_all as u32, timeout, 0, 0, 0, 0],
    );
    EventSet(events)
}

/// Suspends the calling task until `delta` ticks past its previous
/// deadline: shorthand for a wait on the absolute timer alone, and the
/// building block for drift-free periodic tasks.
#[inline(always)]
pub fn sys_suspend_task_until(delta: u32) -> EventSet {
    sys_wait_for_event(EventSet::ABSOLUTE_TIMER, false, delta)
}

/// Reads a regular task's saturating overrun counter, optionally clearing
/// it atomically with the read.
#[inline(always)]
pub fn sys_task_overrun_count(index: usize, reset: bool) -> u32 {
    let (count, _) = syscall(
        SimpleCall::OverrunCount.number(),
        [index as u32, reset as u32, 0, 0, 0, 0, 0],
    );
    count
}

/// Measures how many leading bytes of a task's stack still hold the fill
/// pattern -- the stack space never yet touched.
#[inline(always)]
pub fn sys_stack_reserve(index: usize) -> usize {
    let (bytes, _) = syscall(
        SimpleCall::StackReserve.number(),
        [index as u32, 0, 0, 0, 0, 0, 0],
    );
    bytes as usize
}

/// Reads the kernel tick counter. Wraps, intentionally.
#[inline(always)]
pub fn sys_system_time() -> Instant {
    let (ticks, _) = syscall(SimpleCall::SystemTime.number(), [0; 7]);
    Instant(ticks)
}
