// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronization objects: the semaphore counter bank and the mutex bit
//! bank.
//!
//! Both banks are addressed by event bit position. A semaphore counter is
//! decremented on successful acquire and incremented on release; a mutex is
//! a single bit, set meaning "free". Deterministic handoff to waiting tasks
//! happens in the scheduler; the banks only hold whatever was not handed to
//! anyone.

use abi::EventSet;

#[derive(Debug)]
pub(crate) struct SyncBank {
    /// One counter per semaphore event, indexed by bit position.
    #[cfg(feature = "sem")]
    counters: [u32; abi::SEM_COUNT],
    /// One bit per mutex event, aligned with the event-space positions. Set
    /// means free.
    #[cfg(feature = "mutex")]
    free: EventSet,
}

impl SyncBank {
    pub(crate) fn new() -> Self {
        Self {
            #[cfg(feature = "sem")]
            counters: [0; abi::SEM_COUNT],
            #[cfg(feature = "mutex")]
            free: EventSet::mutexes(),
        }
    }

    /// Loads initial semaphore counts. Entries beyond the configured
    /// semaphore count are ignored.
    #[cfg(feature = "sem")]
    pub(crate) fn init_counters(&mut self, counts: &[u32]) {
        for (counter, &count) in self.counters.iter_mut().zip(counts) {
            *counter = count;
        }
    }

    /// Fast-path acquisition: takes every requested mutex bit that is free
    /// in the bank and one unit per requested semaphore with a nonzero
    /// counter. Returns the collected bits.
    pub(crate) fn try_acquire(&mut self, request: EventSet) -> EventSet {
        let mut got = EventSet::EMPTY;

        #[cfg(feature = "mutex")]
        {
            let granted = self.free & request;
            self.free = self.free & !granted;
            got |= granted;
        }

        #[cfg(feature = "sem")]
        for bit in (request & EventSet::semaphores()).iter() {
            let counter = &mut self.counters[bit.position() as usize];
            if *counter > 0 {
                *counter -= 1;
                got |= bit;
            }
        }

        let _ = request;
        got
    }

    /// Returns a released mutex bit that no waiter claimed to the bank.
    ///
    /// Releasing a mutex that is already free is an application error;
    /// debug builds assert, production builds leave the bit set.
    #[cfg(feature = "mutex")]
    pub(crate) fn return_mutex(&mut self, bit: EventSet) {
        debug_assert!(
            !self.free.intersects(bit),
            "double release of a free mutex"
        );
        self.free |= bit;
    }

    /// Credits a semaphore release that no waiter consumed.
    ///
    /// Counter overflow is an application error (more releases than the
    /// counter can represent); debug builds assert, production builds
    /// saturate.
    #[cfg(feature = "sem")]
    pub(crate) fn release_semaphore(&mut self, bit: EventSet) {
        let counter = &mut self.counters[bit.position() as usize];
        debug_assert!(*counter < u32::MAX, "semaphore counter overflow");
        *counter = counter.saturating_add(1);
    }

    #[cfg(feature = "sem")]
    pub(crate) fn counter(&self, index: usize) -> u32 {
        self.counters[index]
    }

    #[cfg(feature = "mutex")]
    pub(crate) fn free_mutexes(&self) -> EventSet {
        self.free
    }
}
