use crate::Error;

/// Upper bound on samples per query enforced by the time-series backend.
pub const DEFAULT_MAX_SAMPLES: u64 = 11_000;

/// Pre-flight guard mirroring the backend's per-query sample limit, so
/// requests that would be rejected upstream are never sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleBudget {
    pub max_samples: u64,
}

impl Default for SampleBudget {
    fn default() -> Self {
        SampleBudget {
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }
}

impl SampleBudget {
    pub const fn new(max_samples: u64) -> Self {
        SampleBudget { max_samples }
    }

    /// Returns the number of samples the query would produce, or
    /// [`Error::BudgetExceeded`] when it reaches `max_samples`.
    pub fn check(&self, time_range_ms: u64, interval_ms: u64) -> Result<u64, Error> {
        if interval_ms == 0 {
            return Err(Error::BudgetExceeded {
                samples: u64::MAX,
                max: self.max_samples,
            });
        }
        let samples = time_range_ms / interval_ms;
        if samples >= self.max_samples {
            return Err(Error::BudgetExceeded {
                samples,
                max: self.max_samples,
            });
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: u64 = 60 * 1000;
    const DAY: u64 = 24 * 60 * MINUTE;

    #[test]
    fn test_accepts_default_dashboard_window() {
        let budget = SampleBudget::default();
        assert_eq!(budget.check(15 * MINUTE, 10 * 1000).unwrap(), 90);
    }

    #[test]
    fn test_rejects_two_weeks_at_one_second() {
        let budget = SampleBudget::default();
        let err = budget.check(14 * DAY, 1000).unwrap_err();
        assert!(matches!(
            err,
            Error::BudgetExceeded {
                samples: 1_209_600,
                max: 11_000
            }
        ));
    }

    #[test]
    fn test_limit_is_exclusive() {
        let budget = SampleBudget::new(10);
        assert!(budget.check(9_999, 1000).is_ok());
        assert!(budget.check(10_000, 1000).is_err());
        assert!(budget.check(10_999, 1000).is_err());
    }

    #[test]
    fn test_zero_interval_rejects() {
        assert!(SampleBudget::default().check(1000, 0).is_err());
    }
}
