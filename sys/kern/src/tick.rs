// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! System-timer installation and the tick entry.
//!
//! The default build drives the scheduler from a single periodic source.
//! With the `irregular-timing` feature the same tick entry is fed from
//! three sources whose periods are mutually prime, at the same nominal
//! average rate; the shifting phase relations between the sources and the
//! tasks make a good stress harness for timing assumptions. It is not a
//! production configuration.

use abi::TICK_PERIOD_US;

use crate::sched::Kernel;
use crate::task::NextContext;

/// The tick handler proper, usable directly against a `Kernel` (the test
/// suite does) or through `tick_entry` via the singleton.
pub fn tick_handler(kernel: &mut Kernel) -> NextContext {
    crate::profiling::event_timer_isr_enter();
    let next = kernel.system_tick();
    crate::profiling::event_timer_isr_exit();
    next
}

/// Entry invoked by the timer ISR glue on every tick source.
pub fn tick_entry() {
    crate::irq::run_kernel_handler(tick_handler);
}

/// Configures the tick source(s). They stay dormant until
/// `arch::start_tick_sources` runs, so that tasks cannot be resumed before
/// initialization has finished.
pub fn install_system_timer() {
    #[cfg(not(feature = "irregular-timing"))]
    crate::arch::install_tick_source(0, TICK_PERIOD_US);

    #[cfg(feature = "irregular-timing")]
    for (index, period) in irregular_periods().into_iter().enumerate() {
        crate::arch::install_tick_source(index, period);
    }
}

/// Three mutually-prime tick periods averaging the nominal rate: each
/// source runs near a third of the rate, and the small offsets keep the
/// periods pairwise coprime so the phase pattern only repeats after the
/// product of all three.
#[cfg(feature = "irregular-timing")]
pub fn irregular_periods() -> [u32; 3] {
    let nominal = TICK_PERIOD_US;
    let periods = [
        3 * nominal - 5,
        3 * nominal + 1,
        3 * nominal + 7,
    ];
    debug_assert!(gcd(periods[0], periods[1]) == 1);
    debug_assert!(gcd(periods[0], periods[2]) == 1);
    debug_assert!(gcd(periods[1], periods[2]) == 1);
    periods
}

#[cfg(feature = "irregular-timing")]
fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

#[cfg(all(test, feature = "irregular-timing"))]
mod tests {
    use super::*;

    #[test]
    fn irregular_periods_are_pairwise_coprime() {
        let [a, b, c] = irregular_periods();
        assert_eq!(gcd(a, b), 1);
        assert_eq!(gcd(a, c), 1);
        assert_eq!(gcd(b, c), 1);
    }

    #[test]
    fn irregular_rates_sum_near_the_nominal_rate() {
        let nominal = f64::from(TICK_PERIOD_US);
        let rate: f64 =
            irregular_periods().iter().map(|&p| 1.0 / f64::from(p)).sum();
        let error = (rate * nominal - 1.0).abs();
        assert!(error < 0.01, "aggregate rate off by {error}");
    }
}
