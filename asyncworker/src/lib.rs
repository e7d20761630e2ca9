//! A distributed job queue and runner supervision engine built on a shared key-value store.
//!
//! Producers hand [`job::Job`]s to the [`messenger::Messenger`], which places them on priority
//! queues, in the delayed set, or parks them. Independent runner processes each drive a
//! [`runner::run_loop::RunnerLoop`] that claims jobs, hands them to an
//! [`executor::Executor`], accounts for the outcome, and sweeps due and expired jobs.
//!
//! ```no_run
//! use asyncworker::prelude::*;
//! use asyncworker::store::memory::InMemoryStore;
//!
//! # async fn run() -> Result<(), asyncworker::Error> {
//! let config = Config::default();
//! let messenger = Messenger::new(InMemoryStore::new(), &config);
//!
//! let job = Job::builder("send_newsletter", "normal").for_runner("main").build();
//! messenger.dispatch_job(&job).await?;
//! # Ok(())
//! # }
//! ```
use std::time::Duration;

use thiserror::Error;

pub mod budget;
pub mod cleaner;
pub mod config;
pub mod executor;
pub mod informer;
pub mod job;
pub mod messenger;
pub mod prelude;
pub mod router;
pub mod runner;
pub mod store;

use store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("Error communicating with the store")]
    Store(#[from] StoreError),
    #[error("Error encoding or decoding value")]
    Encode(#[from] serde_json::Error),
    #[error("No free slot in the delayed set after {probes} probes starting at {score}")]
    DelaySlotsExhausted { score: i64, probes: u32 },
}

/// Invalid input relative to the configuration. Fatal to the call, never retried.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigurationError {
    #[error("Priority {priority:?} is invalid. Use one of the following: {allowed:?}")]
    InvalidPriority {
        priority: String,
        allowed: Vec<String>,
    },
    #[error("Runner ID {runner_id:?} is invalid. Use one of the following: {allowed:?}")]
    InvalidRunnerId {
        runner_id: String,
        allowed: Vec<String>,
    },
    #[error("No executor registered for {0:?}")]
    UnknownExecutor(String),
    #[error("A run of {budget:?} with timeout multiplier {multiplier} is out of range")]
    RunOutOfRange { budget: Duration, multiplier: f64 },
}
