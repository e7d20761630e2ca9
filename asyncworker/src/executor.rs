//! Executors perform the work a job describes.
//!
//! A job names its executor through [`Job::executor`]. The [`ExecutorRegistry`] maps that name
//! to a factory building the executor from the [`Config`], so no executor is constructed
//! before a job needs it.
//!
//! ```
//! use asyncworker::prelude::*;
//! use async_trait::async_trait;
//! use std::fmt::Write;
//!
//! struct Greeter;
//!
//! #[async_trait]
//! impl Executor for Greeter {
//!     async fn execute(
//!         &self,
//!         job: &Job,
//!         output: &mut Output,
//!         report: &mut Report,
//!     ) -> Result<(), ExecutionError> {
//!         let name: Option<String> = job.payload_value("name").map_err(ExecutionError::other)?;
//!         let _ = writeln!(output, "Hello {}", name.as_deref().unwrap_or("world"));
//!         report.succeed();
//!         Ok(())
//!     }
//! }
//!
//! impl NamedExecutor for Greeter {
//!     const NAME: &'static str = "greeter";
//!
//!     fn build(_config: &Config) -> Self {
//!         Greeter
//!     }
//! }
//!
//! let registry = ExecutorRegistry::new().with_executor::<Greeter>();
//! let job = Greeter::builder("normal").with_payload_value("name", "John").build();
//! assert!(registry.resolve(&job, &Config::default()).is_ok());
//! ```
use std::{collections::HashMap, fmt, io::Write};

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinError;

use crate::{
    config::Config,
    job::{builder::JobBuilder, Job},
    ConfigurationError,
};

const ERROR_TYPE_PANIC: &str = "panic";

/// Opaque data produced by an executor and forwarded to the [`crate::informer::Informer`].
pub type ReturnData = serde_json::Map<String, serde_json::Value>;

/// The work behind one kind of job.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs `job`, writing progress to `output` and the result to `report`.
    ///
    /// An error marks the job as failed. Otherwise the job is discarded. A panic is caught and
    /// treated as an error.
    async fn execute(
        &self,
        job: &Job,
        output: &mut Output,
        report: &mut Report,
    ) -> Result<(), ExecutionError>;
}

/// An [`Executor`] that can be registered under a fixed name.
pub trait NamedExecutor: Executor + Sized + 'static {
    /// The name jobs use to refer to this executor.
    ///
    /// This is stored with every job, so renaming the rust type does not affect queued jobs.
    const NAME: &'static str;

    fn build(config: &Config) -> Self;

    fn builder(priority: impl Into<String>) -> JobBuilder {
        Job::builder(Self::NAME, priority)
    }
}

type ExecutorFactory = Box<dyn Fn(&Config) -> Box<dyn Executor> + Send + Sync>;

#[derive(Default)]
pub struct ExecutorRegistry {
    factories: HashMap<String, ExecutorFactory>,
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_executor<E: NamedExecutor>(self) -> Self {
        self.register(E::NAME, |config| Box::new(E::build(config)))
    }

    /// Registers `factory` under `name`, replacing any earlier registration.
    pub fn register<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Config) -> Box<dyn Executor> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn resolve(
        &self,
        job: &Job,
        config: &Config,
    ) -> Result<Box<dyn Executor>, ConfigurationError> {
        self.factories
            .get(&job.executor)
            .map(|factory| factory(config))
            .ok_or_else(|| ConfigurationError::UnknownExecutor(job.executor.clone()))
    }
}

/// How an execution ended, derived from [`Report::return_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No return code was set, the job never ran properly.
    Invalid,
    Successful,
    Erroneous,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    /// `None` for invalid, `0` for success, anything else for failure.
    pub return_code: Option<i32>,
    pub return_data: ReturnData,
}

impl Report {
    /// An empty report whose return data refers to `job` under the key `"job"`.
    pub fn for_job(job: &Job) -> Self {
        let mut return_data = ReturnData::new();
        return_data.insert(
            "job".to_owned(),
            serde_json::to_value(job).unwrap_or_default(),
        );
        Self {
            return_code: None,
            return_data,
        }
    }

    pub fn succeed(&mut self) {
        self.return_code = Some(0);
    }

    pub fn fail(&mut self, return_code: i32) {
        self.return_code = Some(return_code);
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.return_data.insert(key.into(), value.into());
    }

    pub fn outcome(&self) -> Outcome {
        match self.return_code {
            None => Outcome::Invalid,
            Some(0) => Outcome::Successful,
            Some(_) => Outcome::Erroneous,
        }
    }
}

/// Buffers the output of a job, optionally echoing it to stdout as it is written.
#[derive(Debug, Default)]
pub struct Output {
    buffer: String,
    passthru: bool,
}

impl Output {
    pub fn new(passthru: bool) -> Self {
        Self {
            buffer: String::new(),
            passthru,
        }
    }

    pub fn write(&mut self, text: &str) {
        if self.passthru {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(text.as_bytes()).and_then(|_| stdout.flush());
        }
        self.buffer.push_str(text);
    }

    pub fn contents(&self) -> &str {
        &self.buffer
    }

    /// Empties the buffer, returning what was written.
    pub fn fetch(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }
}

impl fmt::Write for Output {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write(s);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Job for executor {found:?} handed to executor {expected:?}")]
    WrongJobType { expected: String, found: String },
    #[error("Job failed: {message}")]
    Failed { message: String },
    #[error("Job panicked: {0}")]
    Panic(String),
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl ExecutionError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn other(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(Box::new(error))
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::WrongJobType { .. } => "wrong_job_type",
            Self::Failed { .. } => "failed",
            Self::Panic(_) => ERROR_TYPE_PANIC,
            Self::Other(_) => "other",
        }
    }
}

impl From<JoinError> for ExecutionError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self::Panic(message)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::fmt::Write as _;

    use assert_matches::assert_matches;
    use serde::{Deserialize, Serialize};

    use super::*;

    /// Behaves as the job's payload tells it to.
    pub(crate) struct MockExecutor;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "behaviour", rename_all = "snake_case")]
    pub(crate) enum MockBehaviour {
        Succeed,
        ReturnCode { code: i32 },
        Error { message: String },
        Panic,
        NoReport,
    }

    pub(crate) fn mock_job(priority: &str, behaviour: MockBehaviour) -> Job {
        MockExecutor::builder(priority)
            .with_payload(&behaviour)
            .unwrap()
            .build()
    }

    #[async_trait]
    impl Executor for MockExecutor {
        async fn execute(
            &self,
            job: &Job,
            output: &mut Output,
            report: &mut Report,
        ) -> Result<(), ExecutionError> {
            if job.executor != Self::NAME {
                return Err(ExecutionError::WrongJobType {
                    expected: Self::NAME.to_owned(),
                    found: job.executor.clone(),
                });
            }
            let behaviour: MockBehaviour = job.data().map_err(ExecutionError::other)?;
            let _ = writeln!(output, "running {:?}", behaviour);
            match behaviour {
                MockBehaviour::Succeed => report.succeed(),
                MockBehaviour::ReturnCode { code } => report.fail(code),
                MockBehaviour::Error { message } => {
                    report.fail(1);
                    return Err(ExecutionError::failed(message));
                }
                MockBehaviour::Panic => panic!("job panicked"),
                MockBehaviour::NoReport => {}
            }
            report.insert("done", true);
            Ok(())
        }
    }

    impl NamedExecutor for MockExecutor {
        const NAME: &'static str = "mock_executor";

        fn build(_config: &Config) -> Self {
            MockExecutor
        }
    }

    #[test]
    fn resolves_registered_executor() {
        let registry = ExecutorRegistry::new().with_executor::<MockExecutor>();
        let job = mock_job("normal", MockBehaviour::Succeed);

        assert!(registry.contains(MockExecutor::NAME));
        assert!(registry.resolve(&job, &Config::default()).is_ok());
    }

    #[test]
    fn unknown_executor() {
        let registry = ExecutorRegistry::new().with_executor::<MockExecutor>();
        let job = Job::new("unknown", "normal");

        assert_matches!(
            registry.resolve(&job, &Config::default()).err(),
            Some(ConfigurationError::UnknownExecutor(name)) if name == "unknown"
        );
    }

    #[test]
    fn factories_receive_config() {
        let registry = ExecutorRegistry::new().register("configured", |config: &Config| {
            assert_eq!(config.queue.prefix, "custom.");
            Box::new(MockExecutor) as Box<dyn Executor>
        });
        let config = Config::default().with_prefix("custom.");

        assert!(registry
            .resolve(&Job::new("configured", "normal"), &config)
            .is_ok());
    }

    #[tokio::test]
    async fn executes_job() {
        let job = mock_job("normal", MockBehaviour::Succeed);
        let mut output = Output::new(false);
        let mut report = Report::for_job(&job);

        MockExecutor
            .execute(&job, &mut output, &mut report)
            .await
            .unwrap();

        assert_eq!(report.outcome(), Outcome::Successful);
        assert_eq!(report.return_data.get("done"), Some(&serde_json::json!(true)));
        assert!(output.fetch().starts_with("running Succeed"));
        assert!(output.contents().is_empty());
    }

    #[tokio::test]
    async fn rejects_foreign_job() {
        let job = Job::new("other", "normal");

        let result = MockExecutor
            .execute(&job, &mut Output::default(), &mut Report::for_job(&job))
            .await;

        assert_matches!(result, Err(ExecutionError::WrongJobType { .. }));
    }

    #[test]
    fn report_refers_to_job() {
        let job = Job::new("report", "normal");

        let report = Report::for_job(&job);

        assert_eq!(report.outcome(), Outcome::Invalid);
        assert_eq!(
            report.return_data["job"]["id"],
            serde_json::json!(job.id.as_str())
        );
    }

    #[test]
    fn outcome_from_return_code() {
        let mut report = Report::default();
        assert_eq!(report.outcome(), Outcome::Invalid);

        report.succeed();
        assert_eq!(report.outcome(), Outcome::Successful);

        report.fail(2);
        assert_eq!(report.outcome(), Outcome::Erroneous);
    }

    #[tokio::test]
    async fn panics_become_execution_errors() {
        let error = tokio::spawn(async { panic!("boom") }).await.unwrap_err();

        let error = ExecutionError::from(error);

        assert_matches!(&error, ExecutionError::Panic(message) if message == "boom");
        assert_eq!(error.error_type(), "panic");
    }
}
