//! The persisted record of a runner and its lifecycle state machine.
//!
//! ```text
//! New/Stopped --start--> Listening --stop/shutdown--> Stopped
//!                            |
//!                            +----run timeout elapsed----> Timeout --reset--> Stopped
//! ```
//!
//! The run scoped fields (`run_*`) are set while the runner is listening and cleared by
//! [`Runner::reset`].
use std::{collections::BTreeMap, fmt::Display, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{job::JobId, ConfigurationError};

pub mod run_loop;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunnerId(String);

impl RunnerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RunnerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RunnerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl std::ops::Deref for RunnerId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for RunnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    #[default]
    New,
    Listening,
    Stopped,
    Timeout,
}

/// Lifetime counters of a runner. These survive [`Runner::reset`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Counters {
    /// Jobs claimed and processed.
    pub jobs: u64,
    /// Listen loops started.
    pub starts: u64,
    /// Planned stops after the run budget was used up.
    pub stops: u64,
    pub timeouts: u64,
    /// Stops caused by a shutdown signal.
    pub shutdowns: u64,
    /// Resets performed automatically after a timeout.
    pub autorecover: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runner {
    pub id: RunnerId,
    #[serde(default)]
    pub state: RunnerState,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub counters: Counters,
    pub run_pid: Option<u32>,
    pub run_started: Option<DateTime<Utc>>,
    /// The runner is considered dead once this deadline passed while it is listening.
    pub run_timeout: Option<DateTime<Utc>>,
    /// A pending request to stop.
    pub run_shutdown: Option<DateTime<Utc>>,
    /// The jobs currently claimed by this runner along with the time they were claimed.
    #[serde(default)]
    pub run_job_ids: BTreeMap<JobId, DateTime<Utc>>,
}

impl Runner {
    pub fn new(id: RunnerId) -> Self {
        Self {
            id,
            state: RunnerState::New,
            created: Utc::now(),
            counters: Counters::default(),
            run_pid: None,
            run_started: None,
            run_timeout: None,
            run_shutdown: None,
            run_job_ids: BTreeMap::new(),
        }
    }

    pub fn is_listening(&self) -> bool {
        self.state == RunnerState::Listening
    }

    pub fn is_busy(&self) -> bool {
        !self.run_job_ids.is_empty()
    }

    pub fn is_timed_out(&self) -> bool {
        self.run_timeout
            .is_some_and(|run_timeout| Utc::now() > run_timeout)
    }

    pub fn has_shutdown_signal(&self) -> bool {
        self.run_shutdown.is_some()
    }

    /// Moves the runner to [`RunnerState::Listening`] for a run of `budget`.
    ///
    /// The run times out after `budget * timeout_multiplier`. The runner is left untouched if
    /// that timeout is negative or not representable.
    pub fn start(
        &mut self,
        budget: Duration,
        timeout_multiplier: f64,
    ) -> Result<(), ConfigurationError> {
        let now = Utc::now();
        let run_timeout = run_timeout(now, budget, timeout_multiplier).ok_or(
            ConfigurationError::RunOutOfRange {
                budget,
                multiplier: timeout_multiplier,
            },
        )?;
        self.counters.starts += 1;
        self.run_pid = Some(std::process::id());
        self.run_started = Some(now);
        self.run_timeout = Some(run_timeout);
        self.run_shutdown = None;
        self.state = RunnerState::Listening;
        Ok(())
    }

    /// Clears all run scoped fields and stops the runner.
    pub fn reset(&mut self) {
        self.run_pid = None;
        self.run_started = None;
        self.run_timeout = None;
        self.run_shutdown = None;
        self.run_job_ids.clear();
        self.state = RunnerState::Stopped;
    }

    pub fn reset_counters(&mut self) {
        self.counters = Counters::default();
    }

    pub fn time_out(&mut self) {
        self.counters.timeouts += 1;
        self.state = RunnerState::Timeout;
    }

    pub fn send_shutdown_signal(&mut self) {
        self.run_shutdown = Some(Utc::now());
    }

    pub fn add_job_id(&mut self, job_id: &JobId) {
        self.run_job_ids.insert(job_id.clone(), Utc::now());
    }

    pub fn remove_job_id(&mut self, job_id: &JobId) {
        self.run_job_ids.remove(job_id);
    }

    pub(crate) fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub(crate) fn decode(record: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(record)
    }
}

fn run_timeout(
    started: DateTime<Utc>,
    budget: Duration,
    timeout_multiplier: f64,
) -> Option<DateTime<Utc>> {
    let timeout_ms = budget.as_secs_f64() * timeout_multiplier * 1000.0;
    if !timeout_ms.is_finite() || timeout_ms < 0.0 || timeout_ms >= i64::MAX as f64 {
        return None;
    }
    TimeDelta::try_milliseconds(timeout_ms as i64)
        .and_then(|timeout| started.checked_add_signed(timeout))
}
