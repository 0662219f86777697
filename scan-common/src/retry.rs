use std::time;

/// Backoff used to schedule the redelivery of a message that failed transiently.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: time::Duration,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: time::Duration,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Time until a message is handed out again after its `attempt`-th delivery failed.
    /// `attempt` starts at 1.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let exponent = attempt.saturating_sub(1);

        self.backoff_coefficient
            .checked_pow(exponent)
            .and_then(|factor| self.initial_interval.checked_mul(factor))
            .map_or(self.maximum_interval, |interval| {
                interval.min(self.maximum_interval)
            })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: time::Duration::from_secs(10 * 60),
        }
    }
}
