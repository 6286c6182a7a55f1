// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stack regions and the paint-and-probe reserve measurement.
//!
//! Each task's unused stack area is filled with a known pattern at
//! initialization. `reserve_bytes` later walks the region from the base
//! toward the top and counts how many words still hold the pattern; the
//! first word that doesn't marks the deepest excursion seen so far.
//!
//! The measurement is a diagnostic, not a guarantee: a task that pushes the
//! pattern value onto its own stack extends the apparent reserve, and a
//! preemption that has not yet been taken is invisible to it.

/// Word written into unused stack space.
pub const STACK_FILL_PATTERN: u32 = 0xA5A5_A5A5;

/// Required alignment of stack base and size, in bytes.
pub const STACK_ALIGN: usize = 8;

/// Smallest acceptable stack: enough for the worst-case preemption chain on
/// the supported targets, rounded up.
pub const MIN_STACK_SIZE: usize = 256;

/// A validated stack region. Construction checks the alignment and size
/// rules once; afterwards the region can be accessed without further
/// ceremony.
#[derive(Copy, Clone, Debug, Default)]
pub struct StackRegion {
    base: usize,
    size: usize,
}

impl StackRegion {
    /// The empty region, used for the idle task (whose stack belongs to the
    /// startup environment) and unconfigured slots.
    pub(crate) const fn empty() -> Self {
        Self { base: 0, size: 0 }
    }

    /// Validates and adopts a stack region.
    ///
    /// # Panics
    ///
    /// If the base or size is not 8-byte aligned, or the size is below the
    /// configured minimum. These are configuration errors; they cannot be
    /// recovered from at run time.
    pub(crate) fn new(base: usize, size: usize) -> Self {
        uassert!(base % STACK_ALIGN == 0);
        uassert!(size % STACK_ALIGN == 0);
        uassert!(size >= MIN_STACK_SIZE);
        Self { base, size }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Address one past the highest byte; the initial stack pointer for a
    /// full-descending stack.
    pub fn top(&self) -> usize {
        self.base + self.size
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn words(&self) -> &[u32] {
        // Safety: the region was validated at construction, is owned by
        // exactly one task, and this runs only inside kernel handlers with
        // interrupts masked, so nothing mutates it concurrently.
        unsafe {
            core::slice::from_raw_parts(self.base as *const u32, self.size / 4)
        }
    }

    /// Fills the whole region with the fill pattern. Called once, before
    /// the task's context has ever run; the first activation builds its
    /// frame on top of the paint.
    pub(crate) fn paint(&self) {
        if self.is_empty() {
            return;
        }
        // Safety: same argument as `words`, and at paint time the region
        // has never been handed to a running context.
        let words = unsafe {
            core::slice::from_raw_parts_mut(
                self.base as *mut u32,
                self.size / 4,
            )
        };
        for word in words.iter_mut() {
            *word = STACK_FILL_PATTERN;
        }
    }

    /// Counts the leading bytes still holding the fill pattern, from the
    /// base toward the top.
    pub fn reserve_bytes(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        kerncore::pattern_prefix_len(self.words(), STACK_FILL_PATTERN) * 4
    }
}
