//! Remaining-time projection for long sweeps.

use std::time::Duration;

/// Projects remaining wall-clock time from the durations of completed steps.
#[derive(Debug, Clone, Default)]
pub struct RemainingTimeEstimator {
    durations: Vec<Duration>,
}

impl RemainingTimeEstimator {
    /// Empty estimator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the duration of one completed step.
    pub fn record(&mut self, elapsed: Duration) {
        self.durations.push(elapsed);
    }

    /// Steps recorded so far.
    pub fn completed(&self) -> usize {
        self.durations.len()
    }

    /// Mean step duration, if any step has completed.
    pub fn average(&self) -> Option<Duration> {
        let count = u32::try_from(self.durations.len()).ok().filter(|n| *n > 0)?;
        Some(self.durations.iter().sum::<Duration>() / count)
    }

    /// `average × remaining`, if any step has completed.
    pub fn estimate(&self, remaining: usize) -> Option<Duration> {
        let average = self.average()?;
        Some(average.mul_f64(remaining as f64))
    }
}

/// Format a duration as `H:MM:SS`, truncating sub-second parts.
pub fn format_hms(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_is_average_times_remaining() {
        let mut eta = RemainingTimeEstimator::new();
        assert_eq!(eta.estimate(10), None);

        eta.record(Duration::from_secs(10));
        eta.record(Duration::from_secs(20));
        assert_eq!(eta.completed(), 2);
        assert_eq!(eta.average(), Some(Duration::from_secs(15)));
        assert_eq!(eta.estimate(4), Some(Duration::from_secs(60)));
        assert_eq!(eta.estimate(0), Some(Duration::ZERO));
    }

    #[test]
    fn test_format_hms() {
        assert_eq!(format_hms(Duration::from_secs(0)), "0:00:00");
        assert_eq!(format_hms(Duration::from_millis(61_900)), "0:01:01");
        assert_eq!(format_hms(Duration::from_secs(3 * 3600 + 5 * 60 + 9)), "3:05:09");
        assert_eq!(format_hms(Duration::from_secs(27 * 3600)), "27:00:00");
    }
}
