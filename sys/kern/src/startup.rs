// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup and the process-wide kernel instance.
//!
//! The expected boot sequence, driven by the application's `main`:
//!
//! 1. `init_kernel()` -- creates the singleton.
//! 2. One `init_task` per task slot, plus `init_semaphores` if used.
//! 3. `start_kernel(&HOOKS)` -- never returns; the calling context becomes
//!    the idle task.
//!
//! All scheduler state lives in a single `Kernel` value. It is reached
//! exclusively through `with_kernel`, which masks external interrupts for
//! the duration; kernel handlers therefore never observe partial updates.

use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};

use abi::TaskDesc;

use crate::sched::Kernel;

/// Application-supplied callbacks consumed by the startup sequence, in the
/// order they appear here.
pub struct Hooks {
    /// Runs after the kernel data structures are live and the system timer
    /// is installed (but not yet ticking). Interrupt handlers may be
    /// installed from here.
    pub setup_after_kernel_init: fn(),
    /// Runs after the system timer has been enabled.
    pub setup_after_system_timer: fn(),
    /// The idle loop body, invoked repeatedly forever.
    pub idle_loop: fn(),
    /// Optional hooks for enabling application interrupt sources whose
    /// ISRs send preconfigured event bits.
    pub enable_irq_user_00: Option<fn()>,
    pub enable_irq_user_01: Option<fn()>,
}

static mut KERNEL: MaybeUninit<Kernel> = MaybeUninit::uninit();
static KERNEL_READY: AtomicBool = AtomicBool::new(false);

/// Creates the process-wide kernel instance.
///
/// # Safety
///
/// Call exactly once, before any interrupt that could reach the kernel is
/// enabled, and before any `with_kernel` use.
pub unsafe fn init_kernel() {
    // Safety: per the function contract nothing else is looking yet.
    unsafe {
        (*core::ptr::addr_of_mut!(KERNEL)).write(Kernel::new());
    }
    KERNEL_READY.store(true, Ordering::Release);
}

/// Tears the singleton down again. Exists for symmetry and for host-side
/// harnesses; embedded applications never stop the kernel.
///
/// # Safety
///
/// No interrupt may reach the kernel afterwards, and `with_kernel` must
/// not be called again before another `init_kernel`.
pub unsafe fn teardown_kernel() {
    KERNEL_READY.store(false, Ordering::Release);
    // Safety: per the function contract there are no other users left.
    unsafe {
        (*core::ptr::addr_of_mut!(KERNEL)).assume_init_drop();
    }
}

/// Runs `body` against the kernel instance with external interrupts
/// masked.
///
/// This is the only road to the scheduler state. Handlers invoked through
/// it must not recurse into it; the kernel's non-nesting interrupt
/// discipline guarantees that for interrupt and syscall entries.
pub fn with_kernel<R>(body: impl FnOnce(&mut Kernel) -> R) -> R {
    uassert!(KERNEL_READY.load(Ordering::Acquire));
    let _cs = crate::arch::CriticalSection::enter();
    // Safety: READY implies init_kernel ran; the critical section plus the
    // non-nesting discipline make this reference unique.
    body(unsafe { (*core::ptr::addr_of_mut!(KERNEL)).assume_init_mut() })
}

/// Fills in one task during the initialization phase. See
/// `Kernel::init_task` for the precondition list.
pub fn init_task(index: usize, descriptor: &TaskDesc) {
    with_kernel(|kernel| kernel.init_task(index, descriptor));
}

/// Loads initial semaphore counts.
#[cfg(feature = "sem")]
pub fn init_semaphores(counts: &'static [u32]) {
    with_kernel(|kernel| kernel.init_semaphores(counts));
}

/// The main kernel entry point: finishes initialization, starts the system
/// timer, and turns the calling context into the idle task.
///
/// # Safety
///
/// Call exactly once per boot, after `init_kernel` and all `init_task`
/// calls, from the startup context (whose stack the idle task inherits).
pub unsafe fn start_kernel(hooks: &'static Hooks) -> ! {
    klog!("starting: tasks armed");

    with_kernel(|kernel| {
        kernel.verify_configured();
        // The startup context *is* the idle task from here on.
        // Safety: the kernel singleton has static storage.
        unsafe {
            crate::arch::set_current_task(kernel.task(abi::IDLE_TASK));
        }
    });

    crate::tick::install_system_timer();
    (hooks.setup_after_kernel_init)();
    if let Some(enable) = hooks.enable_irq_user_00 {
        enable();
    }
    if let Some(enable) = hooks.enable_irq_user_01 {
        enable();
    }

    crate::arch::start_tick_sources();
    (hooks.setup_after_system_timer)();

    klog!("starting: alacrity");
    loop {
        (hooks.idle_loop)();
    }
}
