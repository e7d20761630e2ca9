//! How long a runner listens before a planned stop.
//!
//! A random fuzz is added to the base runtime so runners started at the same moment (for
//! example by cron) do not all stop at the same moment.
//!
//! # Example
//!
//! ```
//! # use asyncworker::budget::RunBudget;
//! # use std::time::Duration;
//! let budget = RunBudget::new(Duration::from_secs(3600), Duration::from_secs(600));
//!
//! let sampled = budget.sample();
//! assert!(sampled >= Duration::from_secs(3600));
//! assert!(sampled <= Duration::from_secs(4200));
//! ```
use std::time::Duration;

use rand::Rng;

use crate::config::RunnerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunBudget {
    runtime: Duration,
    fuzz: Duration,
}

impl RunBudget {
    pub const fn new(runtime: Duration, fuzz: Duration) -> Self {
        Self { runtime, fuzz }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(
            Duration::from_secs(config.runtime),
            Duration::from_secs(config.fuzz),
        )
    }

    /// The base runtime plus a uniformly random fuzz in `0..=fuzz` whole seconds.
    pub fn sample(&self) -> Duration {
        let fuzz = rand::thread_rng().gen_range(0..=self.fuzz.as_secs());
        self.runtime.saturating_add(Duration::from_secs(fuzz))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn without_fuzz_is_exact() {
        let budget = RunBudget::new(Duration::from_secs(5), Duration::ZERO);

        assert_eq!(budget.sample(), Duration::from_secs(5));
    }

    #[test]
    fn saturates_instead_of_overflowing() {
        let budget = RunBudget::new(Duration::MAX, Duration::from_secs(600));

        assert_eq!(budget.sample(), Duration::MAX);
    }

    #[test]
    fn stays_within_fuzz_window() {
        let budget = RunBudget::from_config(&RunnerConfig::default());

        for _ in 0..100 {
            let sampled = budget.sample();
            assert!(sampled >= Duration::from_secs(3600));
            assert!(sampled <= Duration::from_secs(4200));
        }
    }
}
