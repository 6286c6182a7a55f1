// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted port, used for development and the test suite.
//!
//! There is no CPU state to swap here: "kernel entry" means the test
//! harness loading argument slots and calling the dispatcher, and a
//! context switch is an entry in the kernel's switch log rather than a
//! register exchange. Everything else -- descriptor bookkeeping, shared
//! stack-pointer slots, the substrate facades -- behaves like the real
//! thing so the portable kernel cannot tell the difference.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use abi::{ContextFlags, SavedContext, SwitchAction, SwitchCommand};

use crate::task::{ArchState, Task};

/// Logging is quiet on the hosted port; test failures speak through
/// assertions.
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

/// On "kernel entry" the harness deposits the call number and arguments
/// here; return values travel back the same way.
#[derive(Debug, Default)]
#[repr(C)]
pub struct SavedState {
    ctx: SavedContext,
    nr: i32,
    args: [u32; 7],
    rets: [u32; 2],
}

impl SavedState {
    /// Loads a system call into the argument slots, as the syscall stub
    /// would on a real target.
    pub fn set_syscall(&mut self, nr: i32, args: &[u32]) {
        self.nr = nr;
        self.args = [0; 7];
        self.args[..args.len()].copy_from_slice(args);
    }

    /// Raw return slots, for harness inspection.
    pub fn rets(&self) -> [u32; 2] {
        self.rets
    }
}

impl ArchState for SavedState {
    fn context(&self) -> &SavedContext {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut SavedContext {
        &mut self.ctx
    }

    /// Reads syscall argument register 0.
    fn arg0(&self) -> u32 {
        self.args[0]
    }
    fn arg1(&self) -> u32 {
        self.args[1]
    }
    fn arg2(&self) -> u32 {
        self.args[2]
    }
    fn arg3(&self) -> u32 {
        self.args[3]
    }
    fn arg4(&self) -> u32 {
        self.args[4]
    }
    fn arg5(&self) -> u32 {
        self.args[5]
    }
    fn arg6(&self) -> u32 {
        self.args[6]
    }

    fn syscall_number(&self) -> i32 {
        self.nr
    }

    /// Writes syscall return slot 0.
    fn ret0(&mut self, x: u32) {
        self.rets[0] = x
    }
    fn ret1(&mut self, x: u32) {
        self.rets[1] = x
    }
}

/// One committed context switch, as the glue would have performed it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SwitchRecord {
    pub from: usize,
    pub to: usize,
    pub action: SwitchAction,
    pub signal: u32,
}

/// Constructs the initial saved state of a fresh context from its
/// descriptor fields: stack pointer from the shared slot (or the pristine
/// value), entry and privilege already in place. On hardware this is where
/// the initial frame gets manufactured; here the descriptor update is the
/// whole job.
pub fn start_fresh_context(task: &mut Task, slots: &[usize]) {
    let ctx = task.save_mut().context_mut();
    debug_assert!(ctx.flags.contains(ContextFlags::FRESH));
    ctx.stack_pointer = if ctx.stack_slot != 0 {
        slots[ctx.stack_slot as usize - 1]
    } else {
        ctx.initial_stack_pointer
    };
    ctx.flags.remove(ContextFlags::FRESH);
}

/// Terminates a leaving context: the shared stack-pointer slot reverts to
/// the pristine value so a peer sharing the stack can be resumed with the
/// stack pointer it expects.
pub fn terminate_context(task: &mut Task, slots: &mut [usize]) {
    let ctx = task.save_mut().context_mut();
    if ctx.stack_slot != 0 {
        slots[ctx.stack_slot as usize - 1] = ctx.initial_stack_pointer;
    }
    ctx.stack_pointer = ctx.initial_stack_pointer;
}

/// Records the address of `task` as the current user task.
///
/// # Safety
///
/// The stored pointer aliases `task`; the caller must guarantee it points
/// into the static task table. The hosted port has no register state to
/// hang it on, so this is a no-op.
pub unsafe fn set_current_task(_task: &Task) {}

/// A deferred switch out of an interrupt handler. The switch log already
/// has the record; nothing further to do without real state to swap.
pub fn pend_switch(_command: &SwitchCommand, _action: SwitchAction) {}

/// Critical-section guard with LIFO nesting. The hosted port has no
/// interrupts to mask; the depth counter preserves the nesting contract so
/// misuse shows up in tests.
pub struct CriticalSection {
    _not_send: core::marker::PhantomData<*const ()>,
}

static CS_DEPTH: AtomicU32 = AtomicU32::new(0);

impl CriticalSection {
    pub fn enter() -> Self {
        CS_DEPTH.fetch_add(1, Ordering::Acquire);
        Self {
            _not_send: core::marker::PhantomData,
        }
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        let previous = CS_DEPTH.fetch_sub(1, Ordering::Release);
        assert!(previous > 0, "critical section underflow");
    }
}

/// What `enable_interrupt` was asked to wire, for harness inspection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InstalledInterrupt {
    pub vector: u32,
    pub priority: u8,
    pub preemptable: bool,
    pub is_kernel: bool,
}

static INSTALLED: std::sync::Mutex<Vec<InstalledInterrupt>> =
    std::sync::Mutex::new(Vec::new());

/// Facade over the substrate's "install interrupt handler" facility.
pub fn enable_interrupt(
    vector: u32,
    priority: u8,
    preemptable: bool,
    is_kernel: bool,
) {
    INSTALLED.lock().unwrap().push(InstalledInterrupt {
        vector,
        priority,
        preemptable,
        is_kernel,
    });
}

pub fn installed_interrupts() -> Vec<InstalledInterrupt> {
    INSTALLED.lock().unwrap().clone()
}

static TICK_SOURCES: std::sync::Mutex<Vec<(usize, u32)>> =
    std::sync::Mutex::new(Vec::new());
static TICKING: AtomicBool = AtomicBool::new(false);

/// Records a configured tick source: `(source index, period in µs)`.
pub fn install_tick_source(index: usize, period_us: u32) {
    TICK_SOURCES.lock().unwrap().push((index, period_us));
}

pub fn start_tick_sources() {
    TICKING.store(true, Ordering::Relaxed);
}

pub fn tick_sources() -> Vec<(usize, u32)> {
    TICK_SOURCES.lock().unwrap().clone()
}

pub fn tick_sources_running() -> bool {
    TICKING.load(Ordering::Relaxed)
}

/// Harness aid: forget recorded substrate interactions between tests.
pub fn clear_substrate_records() {
    INSTALLED.lock().unwrap().clear();
    TICK_SOURCES.lock().unwrap().clear();
    TICKING.store(false, Ordering::Relaxed);
}

/// The task-return guard. A task function returning is a policy
/// violation; with `reset-on-return` the system resets, otherwise a
/// single-shot task would report termination -- which the hosted port has
/// no syscall path for, so both flavors end the process loudly.
pub fn task_return_guard() -> ! {
    if cfg!(feature = "reset-on-return") {
        reset()
    } else {
        panic!("task function returned");
    }
}

pub fn reset() -> ! {
    panic!("SYSTEM RESET");
}
