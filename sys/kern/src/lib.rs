// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Alacrity kernel.
//!
//! This is the application-independent portion of the operating system: a
//! preemptive, priority-based scheduler for a fixed set of tasks on a
//! single core, coordinated through a compact family of events (broadcast
//! events, semaphores, mutexes, and two timer events per task).
//!
//! The code outside of the `arch` module is portable; the `arch` module
//! supplies the context primitive that actually saves, restores, creates,
//! and terminates execution contexts, selected per target. The `hosted`
//! port backs the test suite.
//!
//! # Design principles
//!
//! 1. Static configuration. The system takes a single shape specified at
//!    compile time; nothing is allocated after startup.
//! 2. Scheduler state is mutated only inside kernel handlers with external
//!    interrupts masked; application code reads none of it directly.
//! 3. A strong preference for safe code where reasonable.
//! 4. A preference for simple and clear algorithms over fast and clever
//!    algorithms.

#![cfg_attr(target_os = "none", no_std)]

/// Kernel assertion. Application-protocol and configuration violations land
/// here; there is no `Result`-shaped error path to the application.
macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
    ($cond:expr, $msg:expr) => {
        if !$cond {
            panic!($msg);
        }
    };
}

macro_rules! uassert_eq {
    ($left:expr, $right:expr) => {
        if !($left == $right) {
            panic!("Assertion failed!");
        }
    };
}

#[macro_use]
pub mod arch;

pub mod fail;
pub mod irq;
pub mod profiling;
pub mod sched;
pub mod stack;
pub mod startup;
pub mod sync;
pub mod syscalls;
pub mod task;
pub mod tick;
