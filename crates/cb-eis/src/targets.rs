//! Checkpoint schedule: the ascending list of target SOCs at which charging
//! pauses for an impedance capture.

use crate::error::{EisError, EisResult};

/// Default bound on checkpoints appended beyond 100% SOC.
pub const MAX_DYNAMIC_TARGETS: usize = 8;

/// Ascending target-SOC list seeded with `{0, i, 2i, …, 100}`.
///
/// 0 and 100 are always present. Visiting is strictly in order; extension past
/// 100% appends `last + interval` and is bounded so a runaway capacity
/// estimate cannot grow the schedule without limit.
#[derive(Debug, Clone)]
pub struct TargetSchedule {
    targets_pct: Vec<f64>,
    next: usize,
    interval_pct: f64,
    max_dynamic: usize,
    dynamic_count: usize,
}

impl TargetSchedule {
    pub fn new(interval_pct: f64, max_dynamic: usize) -> EisResult<Self> {
        if !interval_pct.is_finite() || interval_pct <= 0.0 || interval_pct > 100.0 {
            return Err(EisError::InvalidArg {
                what: "interval_pct must be in (0, 100]",
            });
        }
        let mut targets_pct = Vec::new();
        let mut k = 0u32;
        loop {
            // Multiply rather than accumulate so the steps carry no float drift.
            let target = f64::from(k) * interval_pct;
            if target >= 100.0 {
                break;
            }
            targets_pct.push(target);
            k += 1;
        }
        targets_pct.push(100.0);
        Ok(Self {
            targets_pct,
            next: 0,
            interval_pct,
            max_dynamic,
            dynamic_count: 0,
        })
    }

    /// Next unvisited checkpoint, if any remain.
    pub fn next_target(&self) -> Option<f64> {
        self.targets_pct.get(self.next).copied()
    }

    /// Mark the current checkpoint visited.
    pub fn advance(&mut self) {
        if self.next < self.targets_pct.len() {
            self.next += 1;
        }
    }

    pub fn can_extend(&self) -> bool {
        self.dynamic_count < self.max_dynamic
    }

    /// Append one checkpoint at `last + interval`, past 100% SOC.
    ///
    /// Returns the new target, or [`EisError::CapacityExceeded`] once the
    /// dynamic bound is reached.
    pub fn extend_beyond_full(&mut self) -> EisResult<f64> {
        if self.dynamic_count >= self.max_dynamic {
            return Err(EisError::CapacityExceeded {
                what: "dynamic checkpoints",
                limit: self.max_dynamic,
            });
        }
        let target = self.targets_pct.last().copied().unwrap_or(100.0) + self.interval_pct;
        self.targets_pct.push(target);
        self.dynamic_count += 1;
        Ok(target)
    }

    /// Checkpoints appended beyond 100% so far.
    pub fn dynamic_count(&self) -> usize {
        self.dynamic_count
    }

    pub fn max_dynamic(&self) -> usize {
        self.max_dynamic
    }

    /// Full target list, visited and pending.
    pub fn targets_pct(&self) -> &[f64] {
        &self.targets_pct
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn seeds_cover_zero_to_full_at_the_interval() {
        let schedule = TargetSchedule::new(25.0, MAX_DYNAMIC_TARGETS).unwrap();
        assert_eq!(schedule.targets_pct(), [0.0, 25.0, 50.0, 75.0, 100.0]);
    }

    #[test]
    fn non_dividing_interval_still_ends_at_full() {
        let schedule = TargetSchedule::new(30.0, MAX_DYNAMIC_TARGETS).unwrap();
        assert_eq!(schedule.targets_pct(), [0.0, 30.0, 60.0, 90.0, 100.0]);
    }

    #[test]
    fn full_interval_gives_endpoints_only() {
        let schedule = TargetSchedule::new(100.0, MAX_DYNAMIC_TARGETS).unwrap();
        assert_eq!(schedule.targets_pct(), [0.0, 100.0]);
    }

    #[test]
    fn rejects_out_of_range_intervals() {
        assert!(TargetSchedule::new(0.0, 8).is_err());
        assert!(TargetSchedule::new(-5.0, 8).is_err());
        assert!(TargetSchedule::new(150.0, 8).is_err());
        assert!(TargetSchedule::new(f64::NAN, 8).is_err());
    }

    #[test]
    fn advance_walks_the_schedule_in_order() {
        let mut schedule = TargetSchedule::new(50.0, 8).unwrap();
        assert_eq!(schedule.next_target(), Some(0.0));
        schedule.advance();
        assert_eq!(schedule.next_target(), Some(50.0));
        schedule.advance();
        assert_eq!(schedule.next_target(), Some(100.0));
        schedule.advance();
        assert_eq!(schedule.next_target(), None);
        schedule.advance();
        assert_eq!(schedule.next_target(), None);
    }

    #[test]
    fn extension_appends_one_interval_past_the_end() {
        let mut schedule = TargetSchedule::new(25.0, 2).unwrap();
        assert!(schedule.can_extend());
        assert_eq!(schedule.extend_beyond_full().unwrap(), 125.0);
        assert_eq!(schedule.extend_beyond_full().unwrap(), 150.0);
        assert_eq!(schedule.dynamic_count(), 2);
        assert!(!schedule.can_extend());
        assert!(matches!(
            schedule.extend_beyond_full(),
            Err(EisError::CapacityExceeded { .. })
        ));
        // The bound leaves the list itself intact.
        assert_eq!(
            schedule.targets_pct(),
            [0.0, 25.0, 50.0, 75.0, 100.0, 125.0, 150.0]
        );
    }

    proptest! {
        #[test]
        fn schedule_is_ascending_with_endpoints(interval in 0.5f64..100.0) {
            let schedule = TargetSchedule::new(interval, MAX_DYNAMIC_TARGETS).unwrap();
            let targets = schedule.targets_pct();
            prop_assert_eq!(targets.first().copied(), Some(0.0));
            prop_assert_eq!(targets.last().copied(), Some(100.0));
            prop_assert!(targets.windows(2).all(|w| w[0] < w[1]));
        }

        #[test]
        fn extension_preserves_ascending_order(
            interval in 1.0f64..100.0,
            extensions in 0usize..MAX_DYNAMIC_TARGETS,
        ) {
            let mut schedule = TargetSchedule::new(interval, MAX_DYNAMIC_TARGETS).unwrap();
            for _ in 0..extensions {
                schedule.extend_beyond_full().unwrap();
            }
            prop_assert_eq!(schedule.dynamic_count(), extensions);
            let targets = schedule.targets_pct();
            prop_assert!(targets.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
