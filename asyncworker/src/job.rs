use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::runner::RunnerId;

pub mod builder;

use builder::JobBuilder;

/// The opaque payload handed to an executor.
pub type Payload = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generates a fresh, never before used id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    New,
    Running,
    Failed,
    Expired,
    Cancelled,
    /// Held back manually. Parked jobs are only queued by an explicit redispatch.
    Parked,
}

/// A unit of work as persisted in the store.
///
/// Jobs are plain data. All transitions between queues and states are performed by the
/// [`crate::messenger::Messenger`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// The name of the executor responsible for this job.
    pub executor: String,
    pub priority: String,
    /// Pins the job to the private queues of one runner.
    pub runner_desired: Option<RunnerId>,
    /// The runner which claimed the job.
    pub runner_executing: Option<RunnerId>,
    #[serde(default)]
    pub state: JobState,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    /// The job is not eligible for execution before this time.
    pub delayed: Option<DateTime<Utc>>,
    /// The job is discarded as expired if it is still waiting at this time.
    pub expires: Option<DateTime<Utc>>,
    pub cancelled: Option<DateTime<Utc>>,
    /// Overrides the configured recipient of notifications.
    pub email: Option<String>,
    /// Free text note for operators.
    pub message: Option<String>,
    #[serde(default = "inform_by_default")]
    pub inform: bool,
    #[serde(default)]
    pub payload: Payload,
}

fn inform_by_default() -> bool {
    true
}

impl Job {
    pub fn new(executor: impl Into<String>, priority: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            executor: executor.into(),
            priority: priority.into(),
            runner_desired: None,
            runner_executing: None,
            state: JobState::New,
            created: Utc::now(),
            started: None,
            delayed: None,
            expires: None,
            cancelled: None,
            email: None,
            message: None,
            inform: true,
            payload: Payload::new(),
        }
    }

    pub fn builder(executor: impl Into<String>, priority: impl Into<String>) -> JobBuilder {
        JobBuilder::new(executor, priority)
    }

    /// A copy of this job under a fresh id.
    pub fn duplicate(&self) -> Self {
        Self {
            id: JobId::new(),
            ..self.clone()
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_some() || self.state == JobState::Cancelled
    }

    /// Decodes the payload into the executor's own data type.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(self.payload.clone()))
    }

    pub fn payload_value<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, serde_json::Error> {
        self.payload
            .get(key)
            .cloned()
            .map(serde_json::from_value)
            .transpose()
    }

    pub(crate) fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub(crate) fn decode(record: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(record)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use serde_json::json;

    use super::*;

    #[test]
    fn new_job_defaults() {
        let job = Job::new("report", "normal");

        assert_eq!(job.state, JobState::New);
        assert!(job.inform);
        assert!(!job.is_cancelled());
        assert!(job.payload.is_empty());
        assert_eq!(job.runner_desired, None);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }

    #[test]
    fn duplicate_assigns_fresh_id() {
        let job = Job::builder("report", "high")
            .with_payload_value("user", 42)
            .build();

        let copy = job.duplicate();

        assert_ne!(copy.id, job.id);
        assert_eq!(copy.payload, job.payload);
        assert_eq!(copy.priority, job.priority);
    }

    #[test]
    fn record_round_trip() {
        let job = Job::builder("report", "low")
            .for_runner("john")
            .delay_for(TimeDelta::minutes(5))
            .expires_in(TimeDelta::hours(1))
            .with_email("ops@example.com")
            .without_inform()
            .with_payload_value("user", 42)
            .build();

        let decoded = Job::decode(&job.encode().unwrap()).unwrap();

        assert_eq!(decoded, job);
    }

    #[test]
    fn decoding_fills_defaults() {
        let record = json!({
            "id": "abc",
            "executor": "report",
            "priority": "normal",
            "runner_desired": null,
            "runner_executing": null,
            "created": "2024-04-01T12:00:00Z",
            "started": null,
            "delayed": null,
            "expires": null,
            "cancelled": null,
            "email": null,
            "message": null,
        });

        let job = Job::decode(&record.to_string()).unwrap();

        assert_eq!(job.id, JobId::from("abc"));
        assert_eq!(job.state, JobState::New);
        assert!(job.inform);
    }

    #[test]
    fn state_is_stored_lowercase() {
        assert_eq!(
            serde_json::to_value(JobState::Parked).unwrap(),
            json!("parked")
        );
    }

    #[test]
    fn typed_payload() {
        #[derive(Debug, PartialEq, Deserialize)]
        struct Newsletter {
            issue: u32,
        }

        let job = Job::builder("newsletter", "normal")
            .with_payload_value("issue", 7)
            .build();

        assert_eq!(job.data::<Newsletter>().unwrap(), Newsletter { issue: 7 });
        assert_eq!(job.payload_value::<u32>("issue").unwrap(), Some(7));
        assert_eq!(job.payload_value::<u32>("missing").unwrap(), None);
        assert!(job.payload_value::<String>("issue").is_err());
    }
}
