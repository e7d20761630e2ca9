//! Maps priorities and runner affinity to queue keys.
use crate::{config::QueueConfig, job::Job, runner::RunnerId, ConfigurationError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRouter {
    prefix: String,
    priorities: Vec<String>,
}

impl QueueRouter {
    /// `priorities` are ordered from highest to lowest.
    pub fn new(prefix: impl Into<String>, priorities: Vec<String>) -> Self {
        Self {
            prefix: prefix.into(),
            priorities,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.prefix.clone(), config.priorities.clone())
    }

    pub fn priorities(&self) -> &[String] {
        &self.priorities
    }

    pub fn build_queue_name(&self, priority: &str, runner: Option<&RunnerId>) -> String {
        match runner {
            Some(runner) => format!("{}{priority}.{runner}", self.prefix),
            None => format!("{}{priority}", self.prefix),
        }
    }

    /// The queues a runner polls, in order: its own queues by priority followed by the shared
    /// queues by priority.
    pub fn queues_for_runner(&self, runner: &RunnerId) -> Vec<String> {
        let own = self
            .priorities
            .iter()
            .map(|priority| self.build_queue_name(priority, Some(runner)));
        let shared = self
            .priorities
            .iter()
            .map(|priority| self.build_queue_name(priority, None));
        own.chain(shared).collect()
    }

    pub fn queue_for_job(&self, job: &Job) -> String {
        self.build_queue_name(&job.priority, job.runner_desired.as_ref())
    }

    pub fn validate_priority(&self, priority: &str) -> Result<(), ConfigurationError> {
        if self.priorities.iter().any(|allowed| allowed == priority) {
            Ok(())
        } else {
            Err(ConfigurationError::InvalidPriority {
                priority: priority.to_owned(),
                allowed: self.priorities.clone(),
            })
        }
    }
}
