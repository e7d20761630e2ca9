use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::{messenger::Messenger, runner::RunnerId, store::Store, Error};

use super::{Job, JobId, JobState, Payload};

pub struct JobBuilder {
    executor: String,
    priority: String,
    runner_desired: Option<RunnerId>,
    delayed: Option<DateTime<Utc>>,
    expires: Option<DateTime<Utc>>,
    parked: bool,
    email: Option<String>,
    message: Option<String>,
    inform: bool,
    payload: Payload,
}

impl JobBuilder {
    pub(crate) fn new(executor: impl Into<String>, priority: impl Into<String>) -> Self {
        Self {
            executor: executor.into(),
            priority: priority.into(),
            runner_desired: None,
            delayed: None,
            expires: None,
            parked: false,
            email: None,
            message: None,
            inform: true,
            payload: Payload::new(),
        }
    }

    pub fn for_runner(self, runner: impl Into<RunnerId>) -> Self {
        Self {
            runner_desired: Some(runner.into()),
            ..self
        }
    }

    pub fn delay_until(self, delay_until: DateTime<Utc>) -> Self {
        Self {
            delayed: Some(delay_until),
            ..self
        }
    }

    pub fn delay_for(self, delay_for: TimeDelta) -> Self {
        Self {
            delayed: Some(Utc::now() + delay_for),
            ..self
        }
    }

    pub fn expires_at(self, expires_at: DateTime<Utc>) -> Self {
        Self {
            expires: Some(expires_at),
            ..self
        }
    }

    pub fn expires_in(self, expires_in: TimeDelta) -> Self {
        Self {
            expires: Some(Utc::now() + expires_in),
            ..self
        }
    }

    /// The job is stored but not queued until it is redispatched.
    pub fn parked(self) -> Self {
        Self {
            parked: true,
            ..self
        }
    }

    pub fn with_email(self, email: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            ..self
        }
    }

    pub fn with_message(self, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..self
        }
    }

    pub fn without_inform(self) -> Self {
        Self {
            inform: false,
            ..self
        }
    }

    pub fn with_payload_value(
        self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        let mut payload = self.payload;
        payload.insert(key.into(), value.into());
        Self { payload, ..self }
    }

    /// Replaces the payload with `data`, which must serialize to a JSON object.
    pub fn with_payload<T: Serialize>(self, data: &T) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(data)? {
            serde_json::Value::Object(payload) => Ok(Self { payload, ..self }),
            _ => Err(serde::ser::Error::custom(
                "job payload must serialize to a JSON object",
            )),
        }
    }

    pub fn build(self) -> Job {
        Job {
            runner_desired: self.runner_desired,
            delayed: self.delayed,
            expires: self.expires,
            state: if self.parked {
                JobState::Parked
            } else {
                JobState::New
            },
            email: self.email,
            message: self.message,
            inform: self.inform,
            payload: self.payload,
            ..Job::new(self.executor, self.priority)
        }
    }

    pub async fn dispatch<S: Store>(self, messenger: &Messenger<S>) -> Result<JobId, Error> {
        let job = self.build();
        messenger.dispatch_job(&job).await?;
        Ok(job.id)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::{config::Config, store::memory::InMemoryStore, ConfigurationError};

    #[test]
    fn builds_job() {
        let delay = Utc::now() + TimeDelta::minutes(1);
        let job = Job::builder("report", "high")
            .for_runner("john")
            .delay_until(delay)
            .with_message("monthly report")
            .build();

        assert_eq!(job.executor, "report");
        assert_eq!(job.priority, "high");
        assert_eq!(job.runner_desired, Some(RunnerId::from("john")));
        assert_eq!(job.delayed, Some(delay));
        assert_eq!(job.message.as_deref(), Some("monthly report"));
        assert_eq!(job.state, JobState::New);
    }

    #[test]
    fn builds_parked_job() {
        let job = Job::builder("report", "high").parked().build();

        assert_eq!(job.state, JobState::Parked);
    }

    #[test]
    fn typed_payload_must_be_an_object() {
        #[derive(Serialize)]
        struct Data {
            user: u32,
        }

        let job = Job::builder("report", "low")
            .with_payload(&Data { user: 3 })
            .unwrap()
            .build();
        assert_eq!(job.payload.get("user"), Some(&json!(3)));

        assert!(Job::builder("report", "low").with_payload(&3).is_err());
    }

    #[tokio::test]
    async fn dispatch() {
        let messenger = Messenger::new(InMemoryStore::new(), &Config::default());

        let job_id = Job::builder("report", "normal")
            .dispatch(&messenger)
            .await
            .unwrap();

        let job = messenger.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.priority, "normal");
        assert_eq!(messenger.count_jobs_queued(None, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_priority() {
        let messenger = Messenger::new(InMemoryStore::new(), &Config::default());

        let result = Job::builder("report", "urgent").dispatch(&messenger).await;

        assert_matches!(
            result,
            Err(Error::Configuration(ConfigurationError::InvalidPriority { .. }))
        );
        assert_eq!(messenger.count_jobs().await.unwrap(), 0);
    }
}
