//! Per-tick population planning.
//!
//! Pure functions; the scheduler feeds them the live count and the shape's
//! decision and applies whatever they return.
//!
//! # Spawn allowance
//! A spawn rate is continuous (users per second) but users are spawned in
//! whole numbers once per tick. The allowance for one tick is
//!
//! ```text
//! add_f     = spawn_rate * tick_seconds
//! allowance = floor(add_f + carry)
//! carry     = (add_f + carry) - allowance
//! ```
//!
//! so a rate of 5/s on a 100ms tick spawns one user every other tick instead of
//! none at all, and the long-term average matches the configured rate.
use std::{cmp::Ordering, time::Duration};

/// What the scheduler should do this tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TickPlan {
    pub spawn: usize,
    pub retire: usize,
    /// Fractional spawn allowance carried into the next tick.
    pub carry: f64,
}

/// Users that may be spawned this tick, and the carry for the next one.
///
/// Returns `(allowance, next_carry)`.
pub fn spawn_allowance(spawn_rate: usize, tick: Duration, carry: f64) -> (usize, f64) {
    let add_f = spawn_rate as f64 * tick.as_secs_f64();
    let total_f = (add_f + carry).floor();
    let carry = (add_f + carry) - total_f;

    let allowance = if total_f >= usize::MAX as f64 {
        usize::MAX
    } else if total_f < 0.0 {
        0
    } else {
        total_f as usize
    };
    (allowance, carry)
}

/// Reconcile `live` against `target`.
///
/// Ramping up is bounded by the spawn allowance; ramping down retires the whole
/// excess at once. The carry is only kept while ramping up.
pub fn plan_tick(
    live: usize,
    target: usize,
    spawn_rate: usize,
    tick: Duration,
    carry: f64,
) -> TickPlan {
    match target.cmp(&live) {
        Ordering::Greater => {
            let (allowance, carry) = spawn_allowance(spawn_rate, tick, carry);
            TickPlan {
                spawn: (target - live).min(allowance),
                retire: 0,
                carry,
            }
        }
        Ordering::Less => TickPlan {
            spawn: 0,
            retire: live - target,
            carry: 0.0,
        },
        Ordering::Equal => TickPlan {
            spawn: 0,
            retire: 0,
            carry: 0.0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    mod spawn_allowance {
        use super::*;

        #[test]
        fn whole_seconds_spawn_the_rate() {
            assert_eq!(spawn_allowance(5, Duration::from_secs(1), 0.0), (5, 0.0));
            assert_eq!(spawn_allowance(10, Duration::from_secs(2), 0.0), (20, 0.0));
        }

        #[test]
        fn fractional_accumulation() {
            let mut carry = 0.0;
            let expected = [(0, 0.25), (0, 0.5), (0, 0.75), (1, 0.0)];
            for i in 0..8 {
                let (allowance, c) = spawn_allowance(1, Duration::from_millis(250), carry);
                carry = c;
                assert_eq!((allowance, carry), expected[i % 4]);
            }
        }

        #[test]
        fn extreme_rate_saturates() {
            let (allowance, _) = spawn_allowance(usize::MAX, Duration::from_secs(10), 0.0);
            assert_eq!(allowance, usize::MAX);
        }
    }

    #[test]
    fn ramp_up_is_bounded_by_rate() {
        let tick = Duration::from_secs(1);
        let plan = plan_tick(0, 10, 5, tick, 0.0);
        assert_eq!((plan.spawn, plan.retire), (5, 0));
        let plan = plan_tick(5, 10, 5, tick, plan.carry);
        assert_eq!((plan.spawn, plan.retire), (5, 0));
        let plan = plan_tick(10, 10, 5, tick, plan.carry);
        assert_eq!((plan.spawn, plan.retire), (0, 0));
    }

    #[test]
    fn ramp_up_never_overshoots_target() {
        let plan = plan_tick(98, 100, 50, Duration::from_secs(1), 0.0);
        assert_eq!(plan.spawn, 2);
    }

    #[test]
    fn ramp_down_retires_excess_at_once() {
        let plan = plan_tick(2000, 100, 10, Duration::from_secs(1), 0.7);
        assert_eq!(
            plan,
            TickPlan {
                spawn: 0,
                retire: 1900,
                carry: 0.0
            }
        );
    }

    #[test]
    fn spike_from_100_to_2000_takes_rate_limited_ticks() {
        let tick = Duration::from_secs(1);
        let mut live = 100;
        let mut carry = 0.0;
        let mut ticks = 0;
        while live < 2000 {
            let plan = plan_tick(live, 2000, 100, tick, carry);
            carry = plan.carry;
            live += plan.spawn;
            ticks += 1;
        }
        assert_eq!(ticks, 19);
    }

    proptest! {
        #[test]
        fn live_never_exceeds_target_plus_one_tick_of_spawns(
            steps in prop::collection::vec((0usize..3000, 1usize..200), 1..60),
            tick_ms in 50u64..2000,
            initial in 0usize..3000,
        ) {
            let tick = Duration::from_millis(tick_ms);
            let mut live = initial;
            let mut carry = 0.0;
            for (target, rate) in steps {
                let plan = plan_tick(live, target, rate, tick, carry);
                prop_assert!(plan.spawn == 0 || plan.retire == 0);
                prop_assert!(plan.retire <= live);
                live = live + plan.spawn - plan.retire;
                carry = plan.carry;

                let bound = target as f64 + rate as f64 * tick.as_secs_f64();
                prop_assert!(live as f64 <= bound, "live {} > bound {}", live, bound);
                prop_assert!((0.0..1.0).contains(&carry));
            }
        }

        #[test]
        fn held_target_is_reached(
            target in 0usize..2500,
            rate in 1usize..200,
            initial in 0usize..2500,
        ) {
            let tick = Duration::from_secs(1);
            let mut live = initial;
            let mut carry = 0.0;
            let needed = target.saturating_sub(initial).div_ceil(rate) + 1;
            for _ in 0..needed {
                let plan = plan_tick(live, target, rate, tick, carry);
                live = live + plan.spawn - plan.retire;
                carry = plan.carry;
            }
            prop_assert_eq!(live, target);
        }

        #[test]
        fn spawns_track_the_configured_rate(
            rate in 1usize..50,
            tick_ms in 50u64..1000,
            ticks in 1usize..200,
        ) {
            let tick = Duration::from_millis(tick_ms);
            let mut carry = 0.0;
            let mut spawned = 0usize;
            for _ in 0..ticks {
                let (allowance, c) = spawn_allowance(rate, tick, carry);
                carry = c;
                spawned += allowance;
            }
            let ideal = rate as f64 * tick.as_secs_f64() * ticks as f64;
            prop_assert!((spawned as f64 - ideal).abs() < 1.0 + 1e-6);
        }
    }
}
