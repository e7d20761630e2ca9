//! Configuration consumed by the queue and the runners.
//!
//! Loading configuration (files, environment, command line) is left to the embedding
//! application. [`Config`] implements [`serde::Deserialize`] so it can be read from any format,
//! and every section falls back to the defaults listed on its fields.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::informer::MailConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queue: QueueConfig,
    pub runner: RunnerConfig,
    pub mail: MailConfig,
}

impl Config {
    pub fn with_priorities(mut self, priorities: Vec<impl Into<String>>) -> Self {
        self.queue.priorities = priorities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue.prefix = prefix.into();
        self
    }

    pub fn with_runner_ids(mut self, ids: Vec<impl Into<String>>) -> Self {
        self.runner.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_runner(mut self, runner: RunnerConfig) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_mail(mut self, mail: MailConfig) -> Self {
        self.mail = mail;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Priority names from highest to lowest. Default: `["high", "normal", "low"]`.
    pub priorities: Vec<String>,
    /// Prepended to every queue key. Default: `"queue."`.
    pub prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            priorities: vec!["high".to_owned(), "normal".to_owned(), "low".to_owned()],
            prefix: "queue.".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// The runner ids allowed to connect. Default: `["main"]`.
    pub ids: Vec<String>,
    /// Seconds a runner listens for jobs before a planned stop (minimum). Default: 3600.
    pub runtime: u64,
    /// Up to this many seconds are randomly added to the runtime, so runners started together
    /// do not all stop together. Default: 600.
    pub fuzz: u64,
    /// A listening runner is considered timed out after this multiple of its runtime budget.
    /// Default: 2.0.
    pub timeout: f64,
    /// Seconds a runner blocks waiting on empty queues per attempt. Default: 10.
    pub block: u64,
    /// Reset timed out runners on the next start instead of refusing to start. Default: false.
    pub autorecover: bool,
    /// Echo job output to stdout while it is buffered. Default: false.
    pub passthru: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            ids: vec!["main".to_owned()],
            runtime: 3600,
            fuzz: 600,
            timeout: 2.0,
            block: 10,
            autorecover: false,
            passthru: false,
        }
    }
}

impl RunnerConfig {
    pub fn with_runtime(self, runtime: u64) -> Self {
        Self { runtime, ..self }
    }

    pub fn with_fuzz(self, fuzz: u64) -> Self {
        Self { fuzz, ..self }
    }

    pub fn with_timeout(self, timeout: f64) -> Self {
        Self { timeout, ..self }
    }

    pub fn with_block(self, block: u64) -> Self {
        Self { block, ..self }
    }

    pub fn with_autorecover(self, autorecover: bool) -> Self {
        Self {
            autorecover,
            ..self
        }
    }

    pub fn with_passthru(self, passthru: bool) -> Self {
        Self { passthru, ..self }
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_secs(self.block)
    }
}
