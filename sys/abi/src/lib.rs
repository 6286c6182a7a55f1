// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between kernel and applications.
//!
//! Everything in here is either plain data or a layout contract. The context
//! switch glue on real targets reads `SavedContext` and `SwitchCommand`
//! fields by byte offset, so those layouts are pinned by compile-time
//! assertions at the bottom of this file.

#![no_std]

use serde::{Deserialize, Serialize};
use static_assertions::{const_assert, const_assert_eq};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

// Compile-time configuration, generated by build.rs from the ALACRITY_*
// environment variables.
include!(concat!(env!("OUT_DIR"), "/kconfig.rs"));

/// Index of the idle task. The idle task is implicit: it inherits the startup
/// stack, occupies the slot past the regular tasks, and can never suspend.
pub const IDLE_TASK: usize = TASK_COUNT;

// A configuration that cannot hold all tasks in the ready lists is an error
// caught here rather than at run time.
const_assert!(TASK_COUNT >= 1);
const_assert!(TASK_COUNT <= PRIORITY_COUNT * READY_DEPTH);
const_assert!(READY_DEPTH <= TASK_COUNT);
// Task indices travel through u8-element lists.
const_assert!(TASK_COUNT + 1 <= 255);
const_assert!(PRIORITY_COUNT <= 255);

/// Number of event bits occupied by semaphores; zero when semaphores are
/// compiled out.
pub const SEM_BITS: u32 = if cfg!(feature = "sem") {
    SEM_COUNT as u32
} else {
    0
};

/// Number of event bits occupied by mutexes; zero when mutexes are compiled
/// out.
pub const MUTEX_BITS: u32 = if cfg!(feature = "mutex") {
    MUTEX_COUNT as u32
} else {
    0
};

// Semaphore and mutex events must fit below the two timer bits.
const_assert!(SEM_BITS + MUTEX_BITS <= 30);

/// A set of event bits.
///
/// The 32-bit event space is partitioned by convention: the lowest `SEM_BITS`
/// bits are semaphore events, the next `MUTEX_BITS` bits are mutex events,
/// bits 30 and 31 are the absolute-timer and delay-timer events respectively,
/// and everything in between is available for broadcast events.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Default,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct EventSet(pub u32);

impl EventSet {
    pub const EMPTY: Self = Self(0);

    /// Posted by the tick routine when a task's absolute deadline is reached.
    pub const ABSOLUTE_TIMER: Self = Self(1 << 30);

    /// Posted by the tick routine when a task's delay counter runs out.
    pub const DELAY_TIMER: Self = Self(1 << 31);

    /// Both timer events. Application code may *wait* on these but never
    /// *send* them.
    pub const TIMERS: Self = Self(0b11 << 30);

    /// The single event at bit position `bit`.
    pub const fn single(bit: u32) -> Self {
        Self(1 << bit)
    }

    /// All semaphore events. Empty when semaphores are compiled out.
    pub const fn semaphores() -> Self {
        // The u64 detour sidesteps shift-overflow when SEM_BITS is 0 or 32.
        Self(((1u64 << SEM_BITS) - 1) as u32)
    }

    /// All mutex events. Empty when mutexes are compiled out.
    pub const fn mutexes() -> Self {
        Self((((1u64 << MUTEX_BITS) - 1) as u32) << SEM_BITS)
    }

    /// All synchronization-object events.
    pub const fn sync_objects() -> Self {
        Self(Self::semaphores().0 | Self::mutexes().0)
    }

    /// All broadcast events: whatever is left between the sync objects and
    /// the timer bits.
    pub const fn broadcasts() -> Self {
        Self(!(Self::sync_objects().0 | Self::TIMERS.0))
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Checks whether `self` and `other` share at least one bit.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Checks whether every bit of `other` is present in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Bit position of the lowest set bit. Meaningful for single-bit sets,
    /// which is how semaphore and mutex events are processed.
    pub const fn position(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Decomposes `self` into its single-bit members, lowest first.
    pub fn iter(self) -> impl Iterator<Item = EventSet> {
        (0..u32::BITS)
            .map(move |b| Self(self.0 & (1 << b)))
            .filter(|e| !e.is_empty())
    }
}

impl core::ops::BitOr for EventSet {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for EventSet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl core::ops::BitAnd for EventSet {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl core::ops::Not for EventSet {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0)
    }
}

/// Indicates priority of a task.
///
/// Priorities are small numbers; numerically *higher* priorities are more
/// important. The range is `[0, PRIORITY_COUNT)`.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means numerically
/// greater / more important, or less important / numerically smaller.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Default,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since the direction of the comparison carries meaning.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }

    /// Index of this priority's ready list.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// In-kernel timestamp representation: the system tick counter.
///
/// The counter wraps on overflow, intentionally. Deadline comparisons use
/// the signed difference, so deadlines within half the counter period of the
/// current time are ordered correctly across the wrap.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Default,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Instant(pub u32);

impl Instant {
    pub const ZERO: Self = Self(0);

    pub fn plus_ticks(self, ticks: u32) -> Self {
        Self(self.0.wrapping_add(ticks))
    }
}

impl From<u32> for Instant {
    fn from(v: u32) -> Self {
        Instant(v)
    }
}

impl From<Instant> for u32 {
    fn from(v: Instant) -> Self {
        v.0
    }
}

/// How a context was last suspended. The resume glue needs to know, because
/// the two suspension paths leave different amounts of state on the stack.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(C, i32)]
pub enum SuspendKind {
    /// Preempted by an asynchronous interrupt; the full volatile frame is on
    /// its stack.
    Interrupt,
    /// Trapped synchronously; carries the system-call number, and resumes by
    /// materializing the call's return values.
    SystemCall(i32),
}

impl Default for SuspendKind {
    fn default() -> Self {
        // A fresh context is resumed as if returning from a wait.
        Self::SystemCall(KernelCall::WaitForEvent.number())
    }
}

bitflags::bitflags! {
    /// Properties of a saved context.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    #[repr(transparent)]
    pub struct ContextFlags: u32 {
        /// Context runs in privileged mode.
        const PRIVILEGED = 1 << 0;
        /// Context has no saved frame yet; the next resume must manufacture
        /// one from the descriptor's entry/stack fields ("on the fly").
        const FRESH = 1 << 1;
    }
}

/// Saved context descriptor.
///
/// This is the handshake between the portable kernel and the context switch
/// glue: the glue reads and writes these fields by offset, so the layout is
/// pinned below.
#[derive(Debug, Default)]
#[repr(C)]
pub struct SavedContext {
    /// How the context last left the CPU.
    pub suspend: SuspendKind,
    /// Stack pointer at suspension. Not meaningful while `FRESH` is set.
    pub stack_pointer: usize,
    /// Entry function address, used for on-the-fly starts.
    pub entry: usize,
    /// Pristine stack pointer from creation time, restored on termination so
    /// a peer sharing the stack finds it where expected.
    pub initial_stack_pointer: usize,
    /// 1-based index of the shared stack-pointer slot, or 0 when the context
    /// owns its stack outright.
    pub stack_slot: u32,
    pub flags: ContextFlags,
}

bitflags::bitflags! {
    /// Return code from a kernel-relevant handler: what the context switch
    /// glue should do on the way out.
    ///
    /// `empty()` means "no switch" and is mutually exclusive with the rest;
    /// `TERMINATE` and `CREATE` are modifiers of `SWITCH`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    #[repr(transparent)]
    pub struct SwitchAction: u32 {
        /// Swap to the context named by the switch command.
        const SWITCH = 1 << 0;
        /// The leaving context terminates; restore its shared stack pointer
        /// slot to the pristine value.
        const TERMINATE = 1 << 1;
        /// The entered context is `FRESH`; construct its initial saved state
        /// on the fly before resuming it.
        const CREATE = 1 << 2;
    }
}

impl SwitchAction {
    /// The modifier bits only make sense together with `SWITCH`.
    pub fn is_well_formed(self) -> bool {
        self.contains(Self::SWITCH) || self.is_empty()
    }
}

/// Command record handed to the context switch glue when a kernel handler
/// requests a switch.
#[derive(Debug)]
#[repr(C)]
pub struct SwitchCommand {
    /// Value the resumed context receives, when it suspended synchronously:
    /// the set of events that caused its resumption.
    pub signal: u32,
    /// Descriptor of the context being left.
    pub suspended: *mut SavedContext,
    /// Descriptor of the context being entered.
    pub resumed: *mut SavedContext,
}

impl SwitchCommand {
    pub const fn new() -> Self {
        Self {
            signal: 0,
            suspended: core::ptr::null_mut(),
            resumed: core::ptr::null_mut(),
        }
    }
}

impl Default for SwitchCommand {
    fn default() -> Self {
        Self::new()
    }
}

/// Numbering for kernel system calls: synchronous traps that receive the
/// switch command and may demand a context switch. Kernel calls use negative
/// numbers; the dispatch table index is `-(number) - 1`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernelCall {
    WaitForEvent,
    SendEvent,
    /// Single-shot termination, issued by the task-return guard.
    Terminate,
}

impl KernelCall {
    pub const COUNT: usize = 3;

    pub const fn number(self) -> i32 {
        match self {
            Self::WaitForEvent => -1,
            Self::SendEvent => -2,
            Self::Terminate => -3,
        }
    }

    pub fn from_number(n: i32) -> Option<Self> {
        match n {
            -1 => Some(Self::WaitForEvent),
            -2 => Some(Self::SendEvent),
            -3 => Some(Self::Terminate),
            _ => None,
        }
    }
}

/// Numbering for simple system calls: they run with elevated privilege, do
/// not change the current task, and cannot demand a context switch.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SimpleCall {
    OverrunCount = 0,
    StackReserve = 1,
    SystemTime = 2,
}

impl SimpleCall {
    pub const COUNT: usize = 3;

    pub const fn number(self) -> i32 {
        self as i32
    }

    pub fn from_number(n: i32) -> Option<Self> {
        match n {
            0 => Some(Self::OverrunCount),
            1 => Some(Self::StackReserve),
            2 => Some(Self::SystemTime),
            _ => None,
        }
    }
}

/// A task's entry function. Receives the set of events that satisfied the
/// task's start condition. Returning is a policy violation; the context
/// framework arranges for returns to land in a guard.
pub type TaskEntry = fn(EventSet) -> !;

bitflags::bitflags! {
    /// Collection of boolean flags controlling task behavior.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    #[repr(transparent)]
    pub struct TaskFlags: u8 {
        /// Task runs in privileged mode.
        const PRIVILEGED = 1 << 0;
        /// Task runs to completion and terminates through the return guard;
        /// eligible for stack sharing.
        const SINGLE_SHOT = 1 << 1;
    }
}

/// Record describing a single task, passed to `init_task` during the
/// initialization phase.
#[derive(Copy, Clone, Debug)]
pub struct TaskDesc {
    /// Entry point, used only at (re)activation of a fresh context.
    pub entry: TaskEntry,
    /// Static priority class.
    pub priority: Priority,
    /// Base address of the preallocated stack region. Must be 8-byte
    /// aligned.
    pub stack_base: usize,
    /// Stack size in bytes; a multiple of 8, at least the configured
    /// minimum.
    pub stack_size: usize,
    /// Events that satisfy the initial resume condition. Must be nonzero and
    /// must not name synchronization objects.
    pub start_events: EventSet,
    /// Whether the start condition requires all of `start_events`.
    pub start_all: bool,
    /// Timeout loaded into whichever timer `start_events` names.
    pub start_timeout: u32,
    /// Round-robin time slice in ticks; 0 disables rotation for this task.
    #[cfg(feature = "round-robin")]
    pub round_robin: u32,
    pub flags: TaskFlags,
    /// 1-based shared stack-pointer slot for stack-sharing single-shot
    /// tasks, or 0 for a privately owned stack.
    pub stack_slot: u32,
}

// Layout contracts. SuspendKind is tag-plus-payload with a 32-bit tag.
const_assert_eq!(core::mem::size_of::<SuspendKind>(), 8);

// The context switch glue exists only on 32-bit targets; that is where the
// byte offsets below are load-bearing.
#[cfg(target_pointer_width = "32")]
mod layout {
    use super::*;
    use static_assertions::const_assert_eq;

    const_assert_eq!(core::mem::offset_of!(SavedContext, suspend), 0);
    const_assert_eq!(core::mem::offset_of!(SavedContext, stack_pointer), 8);
    const_assert_eq!(core::mem::offset_of!(SavedContext, entry), 12);
    const_assert_eq!(
        core::mem::offset_of!(SavedContext, initial_stack_pointer),
        16
    );
    const_assert_eq!(core::mem::offset_of!(SavedContext, stack_slot), 20);
    const_assert_eq!(core::mem::offset_of!(SavedContext, flags), 24);
    const_assert_eq!(core::mem::size_of::<SavedContext>(), 28);

    const_assert_eq!(core::mem::offset_of!(SwitchCommand, signal), 0);
    const_assert_eq!(core::mem::offset_of!(SwitchCommand, suspended), 4);
    const_assert_eq!(core::mem::offset_of!(SwitchCommand, resumed), 8);
    const_assert_eq!(core::mem::size_of::<SwitchCommand>(), 12);
}
