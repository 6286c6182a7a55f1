// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7E-M.
//!
//! # Kernel entries
//!
//! Three exception handlers carry the whole kernel:
//!
//! - `SVCall` implements the `SVC` instruction used to make system calls.
//!   It performs the full volatile-state save/restore, because blocking
//!   calls usually do switch contexts.
//! - `SysTick` drives the scheduler tick. Like other interrupts it does
//!   *not* save full state; when the tick decides to switch, it pends
//!   `PendSV`.
//! - `PendSV` performs deferred context switches on behalf of interrupt
//!   handlers, after they (and any chained ISRs) return.
//!
//! The portable kernel has already committed the scheduling decision by
//! the time these sequences run; they only move machine state. The old and
//! new contexts are named either by `CURRENT_TASK_PTR` (syscall path) or
//! by the pending switch command (interrupt path).
//!
//! # Privilege and stacks
//!
//! Tasks run in thread mode on the process stack; the idle task inherits
//! the startup context and stays on the main stack. Both facts are
//! reconstructed from the entered context's descriptor on every switch, in
//! `set_current_task`.

use core::arch::global_asm;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use abi::{ContextFlags, SavedContext, SwitchAction, SwitchCommand};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::task::{ArchState, Task};

/// Log things from kernel context. Two backends exist: semihosting (the
/// `klog-semihosting` feature) and the Instrumentation Trace Macrocell
/// (`klog-itm`). With neither feature enabled, `klog!` is stubbed out.
#[cfg(not(any(feature = "klog-semihosting", feature = "klog-itm")))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

#[cfg(feature = "klog-itm")]
macro_rules! klog {
    ($s:expr) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR).stim[0];
            cortex_m::iprintln!(stim, $s);
        }
    };
    ($s:expr, $($tt:tt)*) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR).stim[0];
            cortex_m::iprintln!(stim, $s, $($tt)*);
        }
    };
}

#[cfg(feature = "klog-semihosting")]
macro_rules! klog {
    ($s:expr) => {
        let _ = cortex_m_semihosting::hprintln!($s);
    };
    ($s:expr, $($tt:tt)*) => {
        let _ = cortex_m_semihosting::hprintln!($s, $($tt)*);
    };
}

/// We have to use a global to record the current task pointer, since we
/// don't have a scratch register.
#[no_mangle]
static CURRENT_TASK_PTR: AtomicPtr<SavedState> =
    AtomicPtr::new(core::ptr::null_mut());

/// Volatile registers that must be saved across context switches, plus the
/// portable context descriptor.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SavedState {
    // NOTE: the following ten fields must be kept contiguous and first --
    // the SVCall/PendSV sequences move them with a single stm/ldm.
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    psp: u32,
    exc_return: u32,
    // NOTE: the above fields must be kept contiguous!
    ctx: SavedContext,
}

// The asm sequences hard-code these positions.
static_assertions::const_assert_eq!(
    core::mem::offset_of!(SavedState, psp),
    32
);
static_assertions::const_assert_eq!(
    core::mem::offset_of!(SavedState, exc_return),
    36
);
static_assertions::const_assert_eq!(
    core::mem::offset_of!(SavedState, ctx),
    40
);

/// Map the volatile registers to (architecture-independent) syscall
/// argument and return slots. The syscall stubs in the user library place
/// arguments in r4-r10 and the call number in r11, because those survive
/// the exception entry.
impl ArchState for SavedState {
    fn context(&self) -> &SavedContext {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut SavedContext {
        &mut self.ctx
    }

    /// Reads syscall argument register 0.
    fn arg0(&self) -> u32 {
        self.r4
    }
    fn arg1(&self) -> u32 {
        self.r5
    }
    fn arg2(&self) -> u32 {
        self.r6
    }
    fn arg3(&self) -> u32 {
        self.r7
    }
    fn arg4(&self) -> u32 {
        self.r8
    }
    fn arg5(&self) -> u32 {
        self.r9
    }
    fn arg6(&self) -> u32 {
        self.r10
    }

    fn syscall_number(&self) -> i32 {
        self.r11 as i32
    }

    /// Writes syscall return slot 0.
    fn ret0(&mut self, x: u32) {
        self.r4 = x
    }
    fn ret1(&mut self, x: u32) {
        self.r5 = x
    }
}

/// Stuff the hardware places on the stack at exception entry.
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Default)]
#[repr(C)]
struct BaseExceptionFrame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

/// Initially we just set the Thumb Mode bit, the minimum required.
const INITIAL_PSR: u32 = 1 << 24;

/// EXC_RETURN into thread mode, process stack, basic frame.
const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// Constructs the initial saved state of a fresh context, on the fly: an
/// exception frame is manufactured at the top of the (possibly shared)
/// stack so that the exception return "resumes" straight into the entry
/// function, with the wake signal as its argument and the return guard as
/// its return address.
pub fn start_fresh_context(task: &mut Task, slots: &[usize]) {
    let signal = task.wake_signal().bits();
    let save = task.save_mut();
    let ctx = &mut save.ctx;
    uassert!(ctx.flags.contains(ContextFlags::FRESH));

    let top = if ctx.stack_slot != 0 {
        slots[ctx.stack_slot as usize - 1]
    } else {
        ctx.initial_stack_pointer
    };
    uassert!(top & 0x7 == 0);

    let frame_addr = top - core::mem::size_of::<BaseExceptionFrame>();
    // Safety: the stack region was validated at task creation, the frame
    // lies within it, and no context is using this stack right now (the
    // context is fresh and any stack-sharing peer has terminated).
    let frame = unsafe { &mut *(frame_addr as *mut BaseExceptionFrame) };
    *frame = BaseExceptionFrame::default();
    frame.r0 = signal;
    frame.pc = (ctx.entry as u32) | 1; // thumb
    frame.lr = task_return_guard as usize as u32 | 1;
    frame.xpsr = INITIAL_PSR;

    ctx.stack_pointer = frame_addr;
    ctx.flags.remove(ContextFlags::FRESH);
    save.psp = frame_addr as u32;
    save.exc_return = EXC_RETURN_THREAD_PSP;
}

/// Terminates a leaving context: the shared stack-pointer slot reverts to
/// the pristine value so a peer sharing the stack finds it as expected.
pub fn terminate_context(task: &mut Task, slots: &mut [usize]) {
    let ctx = task.save_mut().context_mut();
    if ctx.stack_slot != 0 {
        slots[ctx.stack_slot as usize - 1] = ctx.initial_stack_pointer;
    }
    ctx.stack_pointer = ctx.initial_stack_pointer;
}

/// Records the address of `task`'s saved state as the current context, and
/// reconstructs the thread-mode execution environment (privilege, stack
/// selection) from its descriptor.
///
/// # Safety
///
/// This records a pointer that aliases `task`. As long as the `task` being
/// stored is actually in the static task table, you'll be okay.
pub unsafe fn set_current_task(task: &Task) {
    CURRENT_TASK_PTR
        .store(task.save() as *const _ as *mut _, Ordering::Relaxed);

    use cortex_m::register::control::{Npriv, Spsel};
    let mut control = cortex_m::register::control::read();
    control.set_npriv(
        if task.save().ctx.flags.contains(ContextFlags::PRIVILEGED) {
            Npriv::Privileged
        } else {
            Npriv::Unprivileged
        },
    );
    // The idle task inherits the startup (main) stack; everything else
    // runs on the process stack.
    control.set_spsel(if task.stack().is_empty() {
        Spsel::Msp
    } else {
        Spsel::Psp
    });
    // Safety: we are in handler mode; this takes effect on exception
    // return, which is exactly when the entered context resumes.
    unsafe {
        cortex_m::register::control::write(control);
    }
}

/// Saved-state pointers and signal for a switch deferred to `PendSV`.
#[no_mangle]
static PENDING_SUSPENDED: AtomicPtr<SavedState> =
    AtomicPtr::new(core::ptr::null_mut());
#[no_mangle]
static PENDING_RESUMED: AtomicPtr<SavedState> =
    AtomicPtr::new(core::ptr::null_mut());

/// Schedules the context switch described by `command` to happen when the
/// interrupt (and any chained ISRs) return, via `PendSV`.
pub fn pend_switch(command: &SwitchCommand, _action: SwitchAction) {
    let ctx_offset = core::mem::offset_of!(SavedState, ctx);
    // The command names the embedded descriptors; PendSV wants the
    // enclosing register blocks.
    let suspended =
        (command.suspended as usize - ctx_offset) as *mut SavedState;
    let resumed = (command.resumed as usize - ctx_offset) as *mut SavedState;
    PENDING_SUSPENDED.store(suspended, Ordering::Relaxed);
    PENDING_RESUMED.store(resumed, Ordering::Relaxed);
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Rust side of the `SVCall` sequence: volatile state is already in the
/// caller's `SavedState`; dispatch and, when a switch was committed,
/// `CURRENT_TASK_PTR` now names the context the asm tail will restore.
#[no_mangle]
unsafe extern "C" fn syscall_entry(nr: i32) {
    crate::startup::with_kernel(|kernel| {
        let caller = kernel.active();
        let mut command = SwitchCommand::new();
        let _ = crate::syscalls::dispatch(kernel, caller, nr, &mut command);
    });
}

global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    SVCall:
        @ Locate the current task's save area.
        movw r0, #:lower16:CURRENT_TASK_PTR
        movt r0, #:upper16:CURRENT_TASK_PTR
        ldr r1, [r0]
        @ The caller's stack pointer depends on which stack thread mode
        @ was using (the idle task lives on the main stack).
        tst lr, #4
        ite eq
        mrseq r12, MSP
        mrsne r12, PSP
        @ Store volatile registers, plus the SP in r12, plus LR.
        stm r1, {{r4-r12, lr}}

        @ Call number rides in r11.
        movs r0, r11
        bl syscall_entry

        @ We're returning into *some* context, maybe not the same one.
        movw r0, #:lower16:CURRENT_TASK_PTR
        movt r0, #:upper16:CURRENT_TASK_PTR
        ldr r0, [r0]
        ldm r0, {{r4-r12, lr}}
        tst lr, #4
        ite eq
        msreq MSP, r12
        msrne PSP, r12
        bx lr
"}

global_asm! {"
    .section .text.PendSV
    .globl PendSV
    .type PendSV,function
    PendSV:
        @ A switch deferred by an interrupt handler. The portable kernel
        @ left the two save areas in PENDING_SUSPENDED/PENDING_RESUMED.
        movw r0, #:lower16:PENDING_SUSPENDED
        movt r0, #:upper16:PENDING_SUSPENDED
        ldr r1, [r0]
        cbz r1, 1f

        tst lr, #4
        ite eq
        mrseq r12, MSP
        mrsne r12, PSP
        stm r1, {{r4-r12, lr}}
        @ Consume the pending record.
        movs r2, #0
        str r2, [r0]

        movw r0, #:lower16:PENDING_RESUMED
        movt r0, #:upper16:PENDING_RESUMED
        ldr r0, [r0]
        ldm r0, {{r4-r12, lr}}
        tst lr, #4
        ite eq
        msreq MSP, r12
        msrne PSP, r12
    1:
        bx lr
"}

/// Handler that gets linked into the vector table for the System Tick
/// Timer overflow interrupt. (Name is dictated by the `cortex_m` crate.)
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    crate::tick::tick_entry();
}

/// Common veneer the substrate's vector stubs call for kernel-managed
/// external interrupts.
#[no_mangle]
pub unsafe extern "C" fn alacrity_interrupt_entry(vector: u32) {
    crate::irq::interrupt_entry(vector);
}

// The interrupt controller and clock tree belong to a lower layer; the
// kernel only consumes these facilities from it.
extern "Rust" {
    /// Wires `vector` to the kernel's interrupt veneer at `priority`.
    fn alacrity_enable_interrupt(
        vector: u32,
        priority: u8,
        preemptable: bool,
        is_kernel: bool,
    );
    /// Reload value producing one tick of `period_us` on this part.
    fn alacrity_tick_reload_for(period_us: u32) -> u32;
    /// Configures an additional tick source (irregular-timing harness).
    fn alacrity_install_aux_tick_source(index: usize, period_us: u32);
    /// Starts the additional tick sources.
    fn alacrity_start_aux_tick_sources();
}

pub fn enable_interrupt(
    vector: u32,
    priority: u8,
    preemptable: bool,
    is_kernel: bool,
) {
    // Safety: delegating to the substrate facility this function fronts.
    unsafe {
        alacrity_enable_interrupt(vector, priority, preemptable, is_kernel);
    }
}

static AUX_TICK_SOURCES: AtomicUsize = AtomicUsize::new(0);

/// Configures tick source `index`; source 0 is the system tick timer,
/// higher indices are substrate-provided. Sources stay dormant until
/// `start_tick_sources`.
pub fn install_tick_source(index: usize, period_us: u32) {
    if index == 0 {
        // Safety: configuring SysTick while its interrupt is disabled.
        unsafe {
            let syst = &*cortex_m::peripheral::SYST::PTR;
            syst.rvr.write(alacrity_tick_reload_for(period_us) - 1);
            syst.cvr.write(0);
        }
    } else {
        AUX_TICK_SOURCES.fetch_add(1, Ordering::Relaxed);
        // Safety: delegating to the substrate facility.
        unsafe {
            alacrity_install_aux_tick_source(index, period_us);
        }
    }
}

pub fn start_tick_sources() {
    // Safety: enables the counter and its interrupt; the kernel is ready
    // for ticks by the time startup calls this.
    unsafe {
        let syst = &*cortex_m::peripheral::SYST::PTR;
        syst.csr.modify(|v| v | 0b111);
    }
    if AUX_TICK_SOURCES.load(Ordering::Relaxed) != 0 {
        // Safety: delegating to the substrate facility.
        unsafe {
            alacrity_start_aux_tick_sources();
        }
    }
}

/// Critical-section guard: masks external interrupts via PRIMASK, with
/// LIFO nesting by construction (each guard restores what it observed).
pub struct CriticalSection {
    was_active: bool,
    _not_send: core::marker::PhantomData<*const ()>,
}

impl CriticalSection {
    pub fn enter() -> Self {
        let was_active = cortex_m::register::primask::read().is_active();
        cortex_m::interrupt::disable();
        Self {
            was_active,
            _not_send: core::marker::PhantomData,
        }
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        if self.was_active {
            // Safety: restoring the state observed at entry; nesting is
            // LIFO because guards drop in reverse order of creation.
            unsafe { cortex_m::interrupt::enable() }
        }
    }
}

global_asm! {"
    .section .text.task_return_svc
    .globl task_return_svc
    .type task_return_svc,function
    task_return_svc:
        @ Report single-shot termination to the scheduler. r11 = -3.
        mvn r11, #2
        svc #0
        udf #0
"}

extern "C" {
    /// Assembly shim issuing the termination system call; the landing pad
    /// for task-function returns.
    fn task_return_svc() -> !;
}

/// The task-return guard: where control lands when a task function
/// returns. Either resets the system or reports single-shot termination,
/// depending on configuration.
pub fn task_return_guard() -> ! {
    if cfg!(feature = "reset-on-return") {
        reset()
    } else {
        // Safety: the shim traps into the kernel and never returns.
        unsafe { task_return_svc() }
    }
}

pub fn reset() -> ! {
    cortex_m::peripheral::SCB::sys_reset()
}
