// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support: the context primitive.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here
//! in the `arch` module, magically tailored for the current target. For
//! this to work, each architecture support module must define the same set
//! of names:
//!
//! - `SavedState`, implementing `task::ArchState`
//! - `start_fresh_context` / `terminate_context` -- on-the-fly creation
//!   and termination of contexts
//! - `set_current_task`, `pend_switch` -- the switch plumbing
//! - `CriticalSection` -- interrupt masking with LIFO nesting
//! - `enable_interrupt`, `install_tick_source`, `start_tick_sources` --
//!   facades over the substrate's interrupt and timer facilities
//! - `task_return_guard`, `reset`
//! - the `klog!` macro
//!
//! Builds for `target_os = "none"` get the real port; everything else gets
//! the hosted port, which backs the test suite by recording what the real
//! glue would have done.

cfg_if::cfg_if! {
    // Note: cfg_if! is slightly touchy about ordering and expression
    // complexity; this chain seems to be the best compromise.

    if #[cfg(target_arch = "arm")] {
        #[macro_use]
        pub mod arm_m;
        pub use arm_m::*;
    } else if #[cfg(target_os = "none")] {
        compile_error!("support for this architecture not implemented");
    } else {
        #[macro_use]
        pub mod hosted;
        pub use hosted::*;
    }
}
