//! Threshold policy.

use std::time::Duration;

/// Thresholds, step sizes and bounds for one fleet.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    /// Scale in when the metric is above this.
    pub threshold_in: f64,

    /// Scale out when the metric is below this.
    pub threshold_out: f64,

    /// Capacity removed per scale-in (and per drain step).
    pub scale_in_amount: u32,

    /// Capacity added per scale-out.
    pub scale_out_amount: u32,

    pub min_weight: u32,
    pub max_weight: u32,

    /// Minimum time between two mutations.
    pub cooldown: Duration,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            threshold_in: 7.0,
            threshold_out: 2.0,
            scale_in_amount: 1,
            scale_out_amount: 2,
            min_weight: 1,
            max_weight: 10,
            cooldown: Duration::from_secs(300),
        }
    }
}

impl ScalingPolicy {
    /// Capacity delta called for by `metric`, or `None` inside the band.
    ///
    /// A metric above `threshold_in` means there is more spare capacity than
    /// needed, so the fleet shrinks; below `threshold_out` it grows. The
    /// scale-in rule is evaluated first.
    pub fn decide(&self, metric: f64) -> Option<i64> {
        if metric > self.threshold_in {
            Some(-i64::from(self.scale_in_amount))
        } else if metric < self.threshold_out {
            Some(i64::from(self.scale_out_amount))
        } else {
            None
        }
    }

    /// `current + delta` bounded to `[min_weight, max_weight]`.
    pub fn clamp_target(&self, current: u32, delta: i64) -> u32 {
        clamp_target(current, delta, self.min_weight, self.max_weight)
    }
}

/// `current + delta` bounded to `[min, max]`.
///
/// `max` wins if the bounds are inverted.
pub fn clamp_target(current: u32, delta: i64, min: u32, max: u32) -> u32 {
    let target = i64::from(current).saturating_add(delta);
    let bounded = target.max(i64::from(min)).min(i64::from(max));
    u32::try_from(bounded.max(0)).unwrap_or(max)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(8.0, Some(-1))]
    #[case(1.0, Some(2))]
    #[case(4.0, None)]
    #[case(7.0, None)]
    #[case(2.0, None)]
    fn test_decide_with_default_thresholds(#[case] metric: f64, #[case] expected: Option<i64>) {
        assert_eq!(ScalingPolicy::default().decide(metric), expected);
    }

    #[test]
    fn test_scale_in_rule_wins_when_bands_overlap() {
        let policy = ScalingPolicy {
            threshold_in: 2.0,
            threshold_out: 7.0,
            ..ScalingPolicy::default()
        };
        assert_eq!(policy.decide(4.0), Some(-1));
    }

    #[rstest]
    #[case(5, -1, 4)]
    #[case(1, -1, 1)]
    #[case(9, 2, 10)]
    #[case(0, 2, 2)]
    #[case(20, -1, 10)]
    fn test_clamp_target(#[case] current: u32, #[case] delta: i64, #[case] expected: u32) {
        assert_eq!(ScalingPolicy::default().clamp_target(current, delta), expected);
    }

    proptest! {
        #[test]
        fn prop_decide_matches_band(
            metric in -100.0f64..100.0,
            out in -50.0f64..50.0,
            gap in 0.0f64..50.0,
            down in 1u32..10,
            up in 1u32..10,
        ) {
            let policy = ScalingPolicy {
                threshold_in: out + gap,
                threshold_out: out,
                scale_in_amount: down,
                scale_out_amount: up,
                ..ScalingPolicy::default()
            };

            let decision = policy.decide(metric);
            if metric > policy.threshold_in {
                prop_assert_eq!(decision, Some(-i64::from(down)));
            } else if metric < policy.threshold_out {
                prop_assert_eq!(decision, Some(i64::from(up)));
            } else {
                prop_assert_eq!(decision, None);
            }
        }

        #[test]
        fn prop_clamped_target_within_bounds(
            current in 0u32..1000,
            delta in -1000i64..1000,
            min in 0u32..100,
            span in 0u32..100,
        ) {
            let max = min + span;
            let target = clamp_target(current, delta, min, max);
            prop_assert!(target >= min && target <= max);
        }
    }
}
