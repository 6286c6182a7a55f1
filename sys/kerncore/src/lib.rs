// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Allow std-y things to be used in test. Note that this attribute is a bit of
// a trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]

//! Portable scheduling algorithms, factored out of the kernel so they can be
//! exercised exhaustively on the host.
//!
//! Everything here operates on plain integers and closures; the kernel's own
//! types (event sets, instants, task records) wrap these functions rather
//! than reimplementing them.

/// Decides whether a suspended task's resume condition is satisfied.
///
/// `posted` is the task's accumulated event bits, `mask` its wait mask, and
/// `timer_mask` the subset of the event space reserved for timer events.
///
/// With `all` unset the task resumes on any posted bit. With `all` set it
/// resumes when every requested *non-timer* bit has been posted -- or when
/// either requested timer bit fires, which acts as an escape hatch for the
/// whole conjunction.
///
/// # Preconditions
///
/// `posted` must be a subset of `mask`; the kernel maintains this when
/// posting. The result is unspecified (but not unsafe) otherwise.
pub const fn resume_condition_met(
    posted: u32,
    mask: u32,
    all: bool,
    timer_mask: u32,
) -> bool {
    if !all {
        posted != 0
    } else {
        (posted ^ mask) & !timer_mask == 0 || posted & mask & timer_mask != 0
    }
}

/// Checks whether `deadline` is *not* strictly in the future of `now`, on a
/// wrapping 32-bit clock.
///
/// The comparison uses the signed difference, so it is correct for deadlines
/// within one half-cycle (2^31 ticks) of `now` in either direction.
pub const fn deadline_elapsed(now: u32, deadline: u32) -> bool {
    deadline.wrapping_sub(now) as i32 <= 0
}

/// Converts a requested delay into the counter value to load.
///
/// A delay request arrives at an arbitrary point between two ticks. Loading
/// `timeout + 1` turns that call-to-tick jitter into additional delay rather
/// than a potential shortfall; in particular a request of 0 still yields a
/// one-tick minimum. Saturates instead of wrapping at the type limit.
pub const fn normalize_delay(timeout: u32) -> u32 {
    match timeout.checked_add(1) {
        Some(v) => v,
        None => u32::MAX,
    }
}

/// Finds the position at which a new element belongs in an ordered list,
/// given a predicate telling whether an existing element ranks strictly
/// below the newcomer.
///
/// Returns the index of the first element for which `outranked` holds, or
/// `list.len()` when none does. Inserting at the returned position keeps
/// equal-rank elements in arrival order, which is what makes "longest
/// waiting" deterministic for the suspended list.
pub fn sorted_insert_index<T>(
    list: &[T],
    outranked: impl Fn(&T) -> bool,
) -> usize {
    list.iter()
        .position(outranked)
        .unwrap_or(list.len())
}

/// Counts the leading words of `words` still equal to `pattern`.
///
/// This is the probe half of the stack paint-and-probe measurement: the
/// first word that no longer holds the fill pattern marks the deepest stack
/// excursion seen so far. A task that happens to push the pattern value onto
/// its own stack can inflate the result; the measurement is a diagnostic,
/// not a guarantee.
pub fn pattern_prefix_len(words: &[u32], pattern: u32) -> usize {
    words
        .iter()
        .position(|&w| w != pattern)
        .unwrap_or(words.len())
}
