//! The control loop of a runner process.
//!
//! One [`RunnerLoop`] runs per process and handles one job at a time. Runners coordinate
//! exclusively through the store: claiming a job is an atomic pop, and shutdown requests are
//! persisted on the runner record and checked once per iteration.
use tracing::{instrument, Instrument};

use crate::{
    budget::RunBudget,
    cleaner::{Cleaner, NoopCleaner},
    config::Config,
    executor::{ExecutionError, ExecutorRegistry, Outcome, Output, Report},
    informer::{Informer, NoopInformer},
    job::Job,
    messenger::Messenger,
    runner::{Runner, RunnerId},
    store::Store,
    ConfigurationError, Error,
};

/// Why [`RunnerLoop::listen`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOutcome {
    /// Nothing was done.
    StoreUnavailable,
    /// The previous run exceeded its timeout and autorecover is off. The runner stays in
    /// [`crate::runner::RunnerState::Timeout`] until it is reset.
    TimedOut,
    /// The runner record says another process is listening.
    AlreadyListening,
    ShutdownRequested,
    /// The run budget was used up.
    Stopped,
}

/// Why [`RunnerLoop::single`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleOutcome {
    StoreUnavailable,
    Listening,
    Busy,
    /// Whether a job was executed.
    Executed(bool),
}

pub struct RunnerLoop<S, I = NoopInformer, C = NoopCleaner> {
    runner_id: RunnerId,
    messenger: Messenger<S>,
    registry: ExecutorRegistry,
    informer: I,
    cleaner: C,
    config: Config,
    force: bool,
}

impl<S: Store> RunnerLoop<S> {
    pub fn new(
        runner_id: impl Into<RunnerId>,
        store: S,
        registry: ExecutorRegistry,
        config: Config,
    ) -> Self {
        Self {
            runner_id: runner_id.into(),
            messenger: Messenger::new(store, &config),
            registry,
            informer: NoopInformer,
            cleaner: NoopCleaner,
            config,
            force: false,
        }
    }
}

impl<S, I, C> RunnerLoop<S, I, C>
where
    S: Store,
    I: Informer,
    C: Cleaner,
{
    pub fn with_informer<T: Informer>(self, informer: T) -> RunnerLoop<S, T, C> {
        RunnerLoop {
            runner_id: self.runner_id,
            messenger: self.messenger,
            registry: self.registry,
            informer,
            cleaner: self.cleaner,
            config: self.config,
            force: self.force,
        }
    }

    pub fn with_cleaner<T: Cleaner>(self, cleaner: T) -> RunnerLoop<S, I, T> {
        RunnerLoop {
            runner_id: self.runner_id,
            messenger: self.messenger,
            registry: self.registry,
            informer: self.informer,
            cleaner,
            config: self.config,
            force: self.force,
        }
    }

    /// Ignore the listening and busy guards, e.g. after a process died without cleaning up.
    pub fn force(self, force: bool) -> Self {
        Self { force, ..self }
    }

    pub fn runner_id(&self) -> &RunnerId {
        &self.runner_id
    }

    pub fn messenger(&self) -> &Messenger<S> {
        &self.messenger
    }

    /// Listens for jobs until the run budget is used up or a shutdown is requested.
    ///
    /// Job failures never end the loop. Store errors do, and are returned.
    #[instrument(skip(self), fields(runner_id = %self.runner_id))]
    pub async fn listen(&self) -> Result<ListenOutcome, Error> {
        if !self.messenger.is_available().await {
            tracing::error!("Store is not available");
            return Ok(ListenOutcome::StoreUnavailable);
        }

        let mut runner = self.runner().await?;
        if runner.is_timed_out() {
            if self.config.runner.autorecover {
                tracing::info!("Autorecover runner after timeout");
                runner.counters.autorecover += 1;
                runner.reset();
                self.messenger.update_runner(&runner).await?;
            } else {
                tracing::error!("Runner has timed out");
                runner.time_out();
                self.messenger.update_runner(&runner).await?;
                return Ok(ListenOutcome::TimedOut);
            }
        }

        if runner.is_listening() && !self.force {
            tracing::debug!("Runner is already listening");
            return Ok(ListenOutcome::AlreadyListening);
        }

        if self.handle_shutdown_signal(&mut runner).await? {
            return Ok(ListenOutcome::ShutdownRequested);
        }

        let budget = RunBudget::from_config(&self.config.runner).sample();
        let out_of_range = || ConfigurationError::RunOutOfRange {
            budget,
            multiplier: self.config.runner.timeout,
        };
        let deadline = tokio::time::Instant::now()
            .checked_add(budget)
            .ok_or_else(out_of_range)
            .inspect_err(|error| tracing::error!(%error, "Refusing to start runner"))?;
        runner
            .start(budget, self.config.runner.timeout)
            .inspect_err(|error| tracing::error!(%error, "Refusing to start runner"))?;
        self.messenger.update_runner(&runner).await?;
        tracing::info!(
            budget_secs = budget.as_secs(),
            "Runner started, listening for jobs"
        );

        while tokio::time::Instant::now() < deadline {
            if self.execute_one().await? {
                self.cleaner.clean_up();
            }

            let mut runner = self.runner().await?;
            if self.handle_shutdown_signal(&mut runner).await? {
                return Ok(ListenOutcome::ShutdownRequested);
            }

            self.messenger.update_queues().await?;
        }

        let mut runner = self.runner().await?;
        runner.counters.stops += 1;
        runner.reset();
        self.messenger.update_runner(&runner).await?;
        tracing::info!("Planned shutdown, waiting for restart");
        Ok(ListenOutcome::Stopped)
    }

    /// Executes at most one job, unless the runner is listening or busy elsewhere.
    #[instrument(skip(self), fields(runner_id = %self.runner_id))]
    pub async fn single(&self) -> Result<SingleOutcome, Error> {
        if !self.messenger.is_available().await {
            tracing::error!("Store is not available");
            return Ok(SingleOutcome::StoreUnavailable);
        }

        let runner = self.runner().await?;
        if !self.force && runner.is_listening() {
            tracing::info!("Runner is currently listening");
            return Ok(SingleOutcome::Listening);
        }
        if !self.force && runner.is_busy() {
            tracing::info!("Runner is currently busy");
            return Ok(SingleOutcome::Busy);
        }

        tracing::info!("Running a single job");
        let executed = self.execute_one().await?;
        if executed {
            self.cleaner.clean_up();
        }
        Ok(SingleOutcome::Executed(executed))
    }

    /// Claims and executes one job, blocking up to the configured block time for one to arrive.
    ///
    /// Returns whether a job was executed. Missing and cancelled jobs are discarded without
    /// execution.
    #[instrument(skip(self), fields(runner_id = %self.runner_id, job_id))]
    pub async fn execute_one(&self) -> Result<bool, Error> {
        let Some(popped) = self
            .messenger
            .pop_job_id(&self.runner_id, self.config.runner.block_timeout())
            .await?
        else {
            return Ok(false);
        };
        let job_id = popped.job_id;
        tracing::Span::current().record("job_id", tracing::field::display(&job_id));

        let Some(mut job) = self.messenger.get_job(&job_id).await? else {
            tracing::info!("Job discarded (missing)");
            return Ok(false);
        };

        if job.is_cancelled() {
            self.messenger.discard_job(&job).await?;
            tracing::info!("Job discarded (cancelled)");
            return Ok(false);
        }

        tracing::info!(queue = %popped.queue, "Job found in queue {}", popped.queue);
        let mut runner = self.runner().await?;
        runner.add_job_id(&job_id);
        self.messenger.update_runner(&runner).await?;

        let Some(report) = self.execute(&mut job).await? else {
            let mut runner = self.runner().await?;
            runner.remove_job_id(&job_id);
            self.messenger.update_runner(&runner).await?;
            return Ok(false);
        };

        self.informer
            .inform_about_job(&job, &report.return_data)
            .await;

        match report.outcome() {
            Outcome::Invalid => tracing::error!("Job invalid"),
            Outcome::Successful => tracing::info!("Job successful"),
            Outcome::Erroneous => tracing::error!("Job erroneous"),
        }

        let mut runner = self.runner().await?;
        runner.counters.jobs += 1;
        runner.remove_job_id(&job_id);
        self.messenger.update_runner(&runner).await?;

        Ok(true)
    }

    // The job is marked as running before the executor is invoked. A crash during execution
    // leaves a running record behind instead of executing the job twice.
    //
    // `None` means the job vanished before it could be claimed and was not executed.
    async fn execute(&self, job: &mut Job) -> Result<Option<Report>, Error> {
        let executor = match self.registry.resolve(job, &self.config) {
            Ok(executor) => executor,
            Err(error) => {
                tracing::error!(%error, "Job failed: {error}");
                self.messenger.mark_job_as_failed(job).await?;
                return Ok(Some(Report::for_job(job)));
            }
        };

        if !self.messenger.mark_job_as_running(job, &self.runner_id).await? {
            tracing::info!("Job discarded (vanished before execution)");
            return Ok(None);
        }

        let handle = tokio::spawn({
            let job = job.clone();
            let mut output = Output::new(self.config.runner.passthru);
            let mut report = Report::for_job(&job);
            async move {
                let result = executor.execute(&job, &mut output, &mut report).await;
                (output, report, result)
            }
            .in_current_span()
        });

        let (report, result) = match handle.await {
            Ok((mut output, report, result)) => {
                tracing::debug!(output = %output.fetch(), "Job output");
                (report, result)
            }
            Err(error) => (Report::for_job(job), Err(ExecutionError::from(error))),
        };

        match result {
            Ok(()) => {
                self.messenger.discard_job(job).await?;
            }
            Err(error) => {
                tracing::error!(
                    error_type = error.error_type(),
                    ?error,
                    "Job failed: {error}"
                );
                self.messenger.mark_job_as_failed(job).await?;
            }
        }
        Ok(Some(report))
    }

    async fn runner(&self) -> Result<Runner, Error> {
        self.messenger.get_runner(&self.runner_id).await
    }

    async fn handle_shutdown_signal(&self, runner: &mut Runner) -> Result<bool, Error> {
        if !runner.has_shutdown_signal() {
            return Ok(false);
        }
        tracing::info!("Shutdown request detected, shutting down");
        runner.counters.shutdowns += 1;
        runner.reset();
        self.messenger.update_runner(runner).await?;
        Ok(true)
    }
}
