//! The purpose of this module is to alleviate the need to import many of the `[asyncworker]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use asyncworker::prelude::*;
//! ```
pub use crate::budget::RunBudget;
pub use crate::cleaner::{Cleaner, NoopCleaner};
pub use crate::config::{Config, QueueConfig, RunnerConfig};
pub use crate::executor::{
    ExecutionError, Executor, ExecutorRegistry, NamedExecutor, Outcome, Output, Report,
    ReturnData,
};
pub use crate::informer::{Informer, MailConfig, MailInformer, Mailer, NoopInformer};
pub use crate::job::builder::JobBuilder;
pub use crate::job::{Job, JobId, JobState};
pub use crate::messenger::{Messenger, QueueUpdate};
pub use crate::runner::run_loop::{ListenOutcome, RunnerLoop, SingleOutcome};
pub use crate::runner::{Runner, RunnerId, RunnerState};
pub use crate::store::Store;
pub use crate::{ConfigurationError, Error};
