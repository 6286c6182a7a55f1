// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel online profiling support.
//!
//! This is intended to help measure the timing of kernel events, duration
//! of system calls, and the like, as an aid to debugging or optimization
//! work.
//!
//! The kernel does not assume any particular way of getting profiling
//! information out. A target that wants profiling populates an
//! `EventsTable` and hands it to `configure_events_table` from its startup
//! routine. A typical implementation sets and clears GPIOs where a logic
//! analyzer can see them; counting dispatches per call number is another.
//! Whatever the handlers do, keep them fast -- they run on every kernel
//! entry.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Hooks provided by the board setup code if it wants kernel profiling.
///
/// If you provide an `EventsTable`, you have to provide every hook; stub
/// the ones you don't care about with `|| ()`. This eliminates a null
/// check per *implemented* event, and we expect those to be the majority.
pub struct EventsTable {
    /// Called on entry to the system-call dispatcher, with the call
    /// number.
    pub syscall_enter: fn(i32),
    /// Called on exit from the system-call dispatcher.
    pub syscall_exit: fn(),
    /// Called on entry to any kernel-managed interrupt service routine.
    pub isr_enter: fn(),
    /// Called on exit from any kernel-managed interrupt service routine.
    pub isr_exit: fn(),
    /// Called on entry to the system-timer tick handler.
    pub timer_isr_enter: fn(),
    /// Called on exit from the system-timer tick handler.
    pub timer_isr_exit: fn(),
    /// Called whenever the active task changes, with the index of the
    /// entered task.
    pub context_switch: fn(usize),
}

/// Supplies the kernel with an events table.
///
/// You can call this more than once if you need to, though that seems odd
/// at first glance.
pub fn configure_events_table(table: &'static EventsTable) {
    EVENTS_TABLE.store(table as *const _ as *mut _, Ordering::Relaxed);
}

/// Internal pointer written by `configure_events_table`. If this is null,
/// no event table has been provided.
///
/// Note: all accesses use `Relaxed` ordering, because we expect it to be
/// written once at startup and read many times, and memory barriers have
/// non-zero cost.
static EVENTS_TABLE: AtomicPtr<EventsTable> =
    AtomicPtr::new(core::ptr::null_mut());

fn table() -> Option<&'static EventsTable> {
    let p = EVENTS_TABLE.load(Ordering::Relaxed);
    if p.is_null() {
        None
    } else {
        // We only write this pointer from a valid `&'static`, and we're
        // handing out a shared reference, so this should be ok...
        unsafe { Some(&*p) }
    }
}

pub(crate) fn event_syscall_enter(nr: i32) {
    if let Some(t) = table() {
        (t.syscall_enter)(nr)
    }
}

pub(crate) fn event_syscall_exit() {
    if let Some(t) = table() {
        (t.syscall_exit)()
    }
}

/// Signals entry to an ISR. This is `pub` in case you write your own
/// non-kernel-managed ISR but you'd like to include it in ISR statistics.
pub fn event_isr_enter() {
    if let Some(t) = table() {
        (t.isr_enter)()
    }
}

/// Signals exit from an ISR. This is `pub` in case you write your own
/// non-kernel-managed ISR but you'd like to include it in ISR statistics.
pub fn event_isr_exit() {
    if let Some(t) = table() {
        (t.isr_exit)()
    }
}

pub(crate) fn event_timer_isr_enter() {
    if let Some(t) = table() {
        (t.timer_isr_enter)()
    }
}

pub(crate) fn event_timer_isr_exit() {
    if let Some(t) = table() {
        (t.timer_isr_exit)()
    }
}

pub(crate) fn event_context_switch(index: usize) {
    if let Some(t) = table() {
        (t.context_switch)(index)
    }
}
