//! The broker protocol on top of a [`Store`].
//!
//! # Key space
//!
//! | key              | type       | content                                      |
//! |------------------|------------|----------------------------------------------|
//! | `jobs`           | hash       | job id → job record                          |
//! | `runner`         | hash       | runner id → runner record                    |
//! | `jobs.delayed`   | sorted set | job ids scored by the epoch they become due  |
//! | `jobs.expiring`  | sorted set | waiting job ids scored by their expiry epoch |
//! | `jobs.running`   | hash       | marker: job id → `1`                         |
//! | `jobs.failed`    | hash       | marker                                       |
//! | `jobs.expired`   | hash       | marker                                       |
//! | `jobs.parked`    | hash       | marker                                       |
//! | `jobs.cancelled` | hash       | marker                                       |
//! | `<prefix><priority>[.<runner>]` | list | queued job ids in FIFO order    |
//!
//! Markers only serve membership checks and counts. The job record is the source of truth.
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tracing::instrument;

use crate::{
    config::Config,
    job::{Job, JobId, JobState},
    router::QueueRouter,
    runner::{Runner, RunnerId},
    store::{Op, Store},
    ConfigurationError, Error,
};

type Result<T> = std::result::Result<T, Error>;

const HASH_JOBS: &str = "jobs";
const HASH_RUNNERS: &str = "runner";
const SET_JOBS_DELAYED: &str = "jobs.delayed";
const SET_JOBS_EXPIRING: &str = "jobs.expiring";
const HASH_JOBS_RUNNING: &str = "jobs.running";
const HASH_JOBS_FAILED: &str = "jobs.failed";
const HASH_JOBS_EXPIRED: &str = "jobs.expired";
const HASH_JOBS_PARKED: &str = "jobs.parked";
const HASH_JOBS_CANCELLED: &str = "jobs.cancelled";

const MARKERS: [&str; 5] = [
    HASH_JOBS_RUNNING,
    HASH_JOBS_FAILED,
    HASH_JOBS_EXPIRED,
    HASH_JOBS_PARKED,
    HASH_JOBS_CANCELLED,
];
const MARKER: &str = "1";

/// The number of consecutive scores tried when placing a job in the delayed set before giving
/// up.
pub const MAX_DELAY_PROBES: u32 = 10_000;

/// A job id claimed from one of the queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoppedJob {
    pub queue: String,
    pub job_id: JobId,
}

/// The result of a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueUpdate {
    /// Delayed jobs moved to their queue because they became due.
    pub delayed: usize,
    /// Waiting jobs marked as expired.
    pub expired: usize,
}

#[derive(Debug, Clone)]
pub struct Messenger<S> {
    store: S,
    router: QueueRouter,
    runner_ids: Vec<RunnerId>,
}

impl<S: Store> Messenger<S> {
    pub fn new(store: S, config: &Config) -> Self {
        Self {
            store,
            router: QueueRouter::from_config(&config.queue),
            runner_ids: config
                .runner
                .ids
                .iter()
                .map(|id| RunnerId::from(id.as_str()))
                .collect(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn router(&self) -> &QueueRouter {
        &self.router
    }

    pub fn runner_ids(&self) -> &[RunnerId] {
        &self.runner_ids
    }

    pub async fn is_available(&self) -> bool {
        self.store
            .ping()
            .await
            .inspect_err(|error| tracing::warn!(?error, "Store is not available: {error}"))
            .is_ok()
    }

    /// Removes every job, runner and queue.
    pub async fn purge(&self) -> Result<()> {
        self.store.purge().await?;
        Ok(())
    }

    /// Blocks up to `timeout` for a job id on the queues of `runner`.
    ///
    /// Each queued id is handed to exactly one caller, even across processes.
    pub async fn pop_job_id(
        &self,
        runner: &RunnerId,
        timeout: Duration,
    ) -> Result<Option<PoppedJob>> {
        self.validate_runner_id(runner)?;
        let queues = self.router.queues_for_runner(runner);
        Ok(self
            .store
            .blpop(&queues, timeout)
            .await?
            .map(|(queue, job_id)| PoppedJob {
                queue,
                job_id: job_id.into(),
            }))
    }

    /// Persists `job` and places it in the delayed set, on its queue, or parks it.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn dispatch_job(&self, job: &Job) -> Result<()> {
        self.router
            .validate_priority(&job.priority)
            .inspect_err(|error| tracing::warn!(%error, "Refusing to dispatch job"))?;
        if let Some(runner) = &job.runner_desired {
            self.validate_runner_id(runner)
                .inspect_err(|error| tracing::warn!(%error, "Refusing to dispatch job"))?;
        }

        let id = job.id.as_str();
        self.store.hset(HASH_JOBS, id, &job.encode()?).await?;

        if let Some(expires) = job.expires {
            self.store
                .zadd(SET_JOBS_EXPIRING, id, score(expires))
                .await?;
        }

        if job.state == JobState::Parked {
            self.store.hset(HASH_JOBS_PARKED, id, MARKER).await?;
            tracing::debug!("Job parked");
            return Ok(());
        }

        match job.delayed {
            Some(delayed) => self.delay_job(job, score(delayed)).await,
            None => self.enqueue_job(job).await,
        }
    }

    /// Resets `job` to [`JobState::New`] and dispatches it again.
    ///
    /// Used to retry failed, expired, cancelled or parked jobs.
    pub async fn redispatch_job(&self, job: &mut Job) -> Result<()> {
        self.store.exec(self.reset_ops(job)).await?;
        job.state = JobState::New;
        job.started = None;
        job.runner_executing = None;
        job.cancelled = None;
        self.dispatch_job(job).await
    }

    pub async fn requeue_job_by_id(&self, job_id: &JobId) -> Result<bool> {
        match self.get_job(job_id).await? {
            Some(mut job) => self.redispatch_job(&mut job).await.map(|_| true),
            None => Ok(false),
        }
    }

    // Scores in the delayed set are unique. On collision the next free second is used, which
    // keeps the relative order of due times.
    async fn delay_job(&self, job: &Job, score: i64) -> Result<()> {
        for probe in 0..MAX_DELAY_PROBES {
            let candidate = score + i64::from(probe);
            if self
                .store
                .zadd_if_score_free(SET_JOBS_DELAYED, job.id.as_str(), candidate)
                .await?
            {
                tracing::debug!(score = candidate, "Job delayed");
                return Ok(());
            }
        }
        tracing::error!(score, "No free slot in the delayed set");
        Err(Error::DelaySlotsExhausted {
            score,
            probes: MAX_DELAY_PROBES,
        })
    }

    async fn enqueue_job(&self, job: &Job) -> Result<()> {
        let queue = self.router.queue_for_job(job);
        self.store
            .exec(vec![
                Op::zrem(SET_JOBS_DELAYED, job.id.as_str()),
                Op::rpush(&queue, job.id.as_str()),
            ])
            .await?;
        tracing::debug!(job_id = %job.id, %queue, "Job enqueued");
        Ok(())
    }

    /// Removes every scheduling trace of `job` and deletes its record.
    ///
    /// Returns `false` if there was no record, so discarding twice is harmless.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn discard_job(&self, job: &Job) -> Result<bool> {
        self.store.exec(self.reset_ops(job)).await?;
        Ok(self.store.hdel(HASH_JOBS, job.id.as_str()).await?)
    }

    pub async fn discard_job_by_id(&self, job_id: &JobId) -> Result<bool> {
        match self.get_job(job_id).await? {
            Some(job) => self.discard_job(&job).await,
            None => Ok(false),
        }
    }

    /// Moves a delayed job straight to its queue. Returns `false` if the job is not delayed.
    pub async fn expedite_job(&self, job: &Job) -> Result<bool> {
        if self
            .store
            .zrank(SET_JOBS_DELAYED, job.id.as_str())
            .await?
            .is_none()
        {
            return Ok(false);
        }
        self.enqueue_job(job).await?;
        Ok(true)
    }

    pub async fn expedite_job_by_id(&self, job_id: &JobId) -> Result<bool> {
        match self.get_job(job_id).await? {
            Some(job) => self.expedite_job(&job).await,
            None => Ok(false),
        }
    }

    /// Enqueues due delayed jobs and expires overdue waiting jobs.
    pub async fn update_queues(&self) -> Result<QueueUpdate> {
        let delayed = self.enqueue_delayed_jobs().await?;
        let expired = self.expire_jobs().await?;
        if delayed > 0 || expired > 0 {
            tracing::debug!(delayed, expired, "Queues updated");
        }
        Ok(QueueUpdate { delayed, expired })
    }

    pub async fn enqueue_delayed_jobs(&self) -> Result<usize> {
        let due = self
            .store
            .take_by_score(SET_JOBS_DELAYED, Utc::now().timestamp())
            .await?;
        let jobs = self.get_jobs_by_id(&due).await?;
        for job in &jobs {
            self.enqueue_job(job).await?;
        }
        Ok(jobs.len())
    }

    /// Marks overdue waiting jobs as expired. Overdue jobs that were cancelled are discarded.
    pub async fn expire_jobs(&self) -> Result<usize> {
        let overdue = self
            .store
            .take_by_score(SET_JOBS_EXPIRING, Utc::now().timestamp())
            .await?;
        let mut expired = 0;
        for mut job in self.get_jobs_by_id(&overdue).await? {
            if job.is_cancelled() {
                self.discard_job(&job).await?;
                tracing::info!(job_id = %job.id, "Job discarded (cancelled and expired)");
            } else {
                self.mark_job_as_expired(&mut job).await?;
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Claims `job` for `runner`: the job becomes [`JobState::Running`] and is removed from every
    /// queue and sorted set, so no pop or sweep can return it again.
    ///
    /// Returns `false` if the record vanished in the meantime, in which case the job must not be
    /// executed.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn mark_job_as_running(&self, job: &mut Job, runner: &RunnerId) -> Result<bool> {
        job.started = Some(Utc::now());
        job.state = JobState::Running;
        job.runner_executing = Some(runner.clone());
        self.transition(job, HASH_JOBS_RUNNING).await
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn mark_job_as_failed(&self, job: &mut Job) -> Result<bool> {
        job.state = JobState::Failed;
        self.transition(job, HASH_JOBS_FAILED).await
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn mark_job_as_expired(&self, job: &mut Job) -> Result<bool> {
        job.state = JobState::Expired;
        self.transition(job, HASH_JOBS_EXPIRED).await
    }

    /// Flags a job as cancelled. A waiting job keeps its place and is discarded by the runner that
    /// claims it. A failed, expired or parked job moves to the cancelled set.
    ///
    /// `job` is refreshed from the store. A running job ignores the cancellation and `false` is
    /// returned, as it is when the job no longer exists.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn mark_job_as_cancelled(&self, job: &mut Job) -> Result<bool> {
        let Some(current) = self.get_job(&job.id).await? else {
            return Ok(false);
        };
        if current.state == JobState::Running {
            tracing::info!("Job is running, ignoring cancellation");
            *job = current;
            return Ok(false);
        }

        *job = Job {
            state: JobState::Cancelled,
            cancelled: Some(Utc::now()),
            ..current
        };
        if !self.update_job(job).await? {
            return Ok(false);
        }
        let id = job.id.as_str();
        let ops = MARKERS
            .iter()
            .filter(|marker| **marker != HASH_JOBS_CANCELLED)
            .map(|marker| Op::hdel(*marker, id))
            .chain([Op::hset(HASH_JOBS_CANCELLED, id, MARKER)])
            .collect();
        self.store.exec(ops).await?;
        Ok(true)
    }

    pub async fn mark_job_as_cancelled_by_id(&self, job_id: &JobId) -> Result<bool> {
        match self.get_job(job_id).await? {
            Some(mut job) => self.mark_job_as_cancelled(&mut job).await,
            None => Ok(false),
        }
    }

    async fn transition(&self, job: &Job, marker: &str) -> Result<bool> {
        let persisted = self.update_job(job).await?;
        let mut ops = self.reset_ops(job);
        if persisted {
            ops.push(Op::hset(marker, job.id.as_str(), MARKER));
        }
        self.store.exec(ops).await?;
        Ok(persisted)
    }

    // Never resurrects a record that vanished concurrently, e.g. because another process
    // discarded the job.
    async fn update_job(&self, job: &Job) -> Result<bool> {
        let id = job.id.as_str();
        let created = self.store.hset(HASH_JOBS, id, &job.encode()?).await?;
        if created {
            self.store.hdel(HASH_JOBS, id).await?;
            tracing::info!(job_id = %job.id, "Job record vanished during update, not restoring it");
        }
        Ok(!created)
    }

    fn reset_ops(&self, job: &Job) -> Vec<Op> {
        let id = job.id.as_str();
        MARKERS
            .iter()
            .map(|marker| Op::hdel(*marker, id))
            .chain([
                Op::lrem(self.router.queue_for_job(job), id),
                Op::zrem(SET_JOBS_DELAYED, id),
                Op::zrem(SET_JOBS_EXPIRING, id),
            ])
            .collect()
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        Ok(self
            .store
            .hget(HASH_JOBS, job_id.as_str())
            .await?
            .and_then(|record| decode_job(&record)))
    }

    pub async fn get_jobs(&self) -> Result<Vec<Job>> {
        Ok(self
            .store
            .hgetall(HASH_JOBS)
            .await?
            .values()
            .filter_map(|record| decode_job(record))
            .collect())
    }

    pub async fn count_jobs(&self) -> Result<usize> {
        Ok(self.store.hlen(HASH_JOBS).await?)
    }

    async fn get_jobs_by_id(&self, job_ids: &[String]) -> Result<Vec<Job>> {
        if job_ids.is_empty() {
            return Ok(vec![]);
        }
        Ok(self
            .store
            .hmget(HASH_JOBS, job_ids)
            .await?
            .into_iter()
            .flatten()
            .filter_map(|record| decode_job(&record))
            .collect())
    }

    async fn get_marked_jobs(&self, marker: &str) -> Result<Vec<Job>> {
        let job_ids = self.store.hkeys(marker).await?;
        self.get_jobs_by_id(&job_ids).await
    }

    pub async fn get_jobs_running(&self) -> Result<Vec<Job>> {
        self.get_marked_jobs(HASH_JOBS_RUNNING).await
    }

    pub async fn count_jobs_running(&self) -> Result<usize> {
        Ok(self.store.hlen(HASH_JOBS_RUNNING).await?)
    }

    pub async fn get_jobs_failed(&self) -> Result<Vec<Job>> {
        self.get_marked_jobs(HASH_JOBS_FAILED).await
    }

    pub async fn count_jobs_failed(&self) -> Result<usize> {
        Ok(self.store.hlen(HASH_JOBS_FAILED).await?)
    }

    pub async fn get_jobs_expired(&self) -> Result<Vec<Job>> {
        self.get_marked_jobs(HASH_JOBS_EXPIRED).await
    }

    pub async fn count_jobs_expired(&self) -> Result<usize> {
        Ok(self.store.hlen(HASH_JOBS_EXPIRED).await?)
    }

    pub async fn get_jobs_parked(&self) -> Result<Vec<Job>> {
        self.get_marked_jobs(HASH_JOBS_PARKED).await
    }

    pub async fn count_jobs_parked(&self) -> Result<usize> {
        Ok(self.store.hlen(HASH_JOBS_PARKED).await?)
    }

    pub async fn get_jobs_cancelled(&self) -> Result<Vec<Job>> {
        self.get_marked_jobs(HASH_JOBS_CANCELLED).await
    }

    pub async fn count_jobs_cancelled(&self) -> Result<usize> {
        Ok(self.store.hlen(HASH_JOBS_CANCELLED).await?)
    }

    /// Delayed jobs ordered by due time.
    pub async fn get_jobs_delayed(&self) -> Result<Vec<Job>> {
        let job_ids = self.store.zrange(SET_JOBS_DELAYED).await?;
        self.get_jobs_by_id(&job_ids).await
    }

    pub async fn count_jobs_delayed(&self) -> Result<usize> {
        Ok(self.store.zcard(SET_JOBS_DELAYED).await?)
    }

    /// Waiting jobs with an expiry ordered by expiry.
    pub async fn get_jobs_expiring(&self) -> Result<Vec<Job>> {
        let job_ids = self.store.zrange(SET_JOBS_EXPIRING).await?;
        self.get_jobs_by_id(&job_ids).await
    }

    pub async fn count_jobs_expiring(&self) -> Result<usize> {
        Ok(self.store.zcard(SET_JOBS_EXPIRING).await?)
    }

    pub async fn get_jobs_queued(
        &self,
        priority: &str,
        runner: Option<&RunnerId>,
    ) -> Result<Vec<Job>> {
        let queue = self.router.build_queue_name(priority, runner);
        let job_ids = self.store.lrange(&queue).await?;
        self.get_jobs_by_id(&job_ids).await
    }

    /// Counts the shared queues and the runner queues of the given priorities and runners.
    ///
    /// `None` stands for all configured priorities or runners.
    pub async fn count_jobs_queued(
        &self,
        priorities: Option<&[String]>,
        runners: Option<&[RunnerId]>,
    ) -> Result<usize> {
        let priorities = priorities.unwrap_or(self.router.priorities());
        let runners = runners.unwrap_or(&self.runner_ids);

        let mut count = 0;
        for priority in priorities {
            count += self
                .store
                .llen(&self.router.build_queue_name(priority, None))
                .await?;
            for runner in runners {
                count += self
                    .store
                    .llen(&self.router.build_queue_name(priority, Some(runner)))
                    .await?;
            }
        }
        Ok(count)
    }

    pub fn validate_runner_id(
        &self,
        runner_id: &RunnerId,
    ) -> std::result::Result<(), ConfigurationError> {
        if self.runner_ids.contains(runner_id) {
            Ok(())
        } else {
            Err(ConfigurationError::InvalidRunnerId {
                runner_id: runner_id.to_string(),
                allowed: self.runner_ids.iter().map(ToString::to_string).collect(),
            })
        }
    }

    pub async fn update_runner(&self, runner: &Runner) -> Result<()> {
        self.store
            .hset(HASH_RUNNERS, runner.id.as_str(), &runner.encode()?)
            .await?;
        Ok(())
    }

    /// Loads a runner, or a fresh one if none is stored yet.
    ///
    /// A stored record that cannot be decoded is dropped and replaced by a fresh runner.
    pub async fn get_runner(&self, runner_id: &RunnerId) -> Result<Runner> {
        self.validate_runner_id(runner_id)
            .inspect_err(|error| tracing::warn!(%error, "Refusing to load runner"))?;

        match self
            .store
            .hget(HASH_RUNNERS, runner_id.as_str())
            .await?
            .map(|record| Runner::decode(&record))
        {
            Some(Ok(runner)) => Ok(runner),
            Some(Err(error)) => {
                tracing::warn!(%runner_id, ?error, "Dropping invalid runner record: {error}");
                self.store.hdel(HASH_RUNNERS, runner_id.as_str()).await?;
                Ok(Runner::new(runner_id.clone()))
            }
            None => Ok(Runner::new(runner_id.clone())),
        }
    }

    pub async fn get_runners(&self) -> Result<Vec<Runner>> {
        self.get_runners_by_id(&self.runner_ids).await
    }

    pub async fn get_runners_by_id(&self, runner_ids: &[RunnerId]) -> Result<Vec<Runner>> {
        try_join_all(runner_ids.iter().map(|runner_id| self.get_runner(runner_id))).await
    }

    /// Asks the given runners, or all configured runners, to stop after their current job.
    pub async fn send_shutdown_signal(
        &self,
        runner_ids: Option<&[RunnerId]>,
    ) -> Result<Vec<Runner>> {
        let runner_ids = runner_ids.unwrap_or(&self.runner_ids);
        try_join_all(runner_ids.iter().map(|runner_id| async move {
            let mut runner = self.get_runner(runner_id).await?;
            runner.send_shutdown_signal();
            self.update_runner(&runner).await?;
            tracing::info!(%runner_id, "Shutdown signal sent");
            Ok::<_, Error>(runner)
        }))
        .await
    }

    /// Resets a runner regardless of its state, e.g. to recover it from [`RunnerState::Timeout`].
    ///
    /// [`RunnerState::Timeout`]: crate::runner::RunnerState::Timeout
    pub async fn reset_runner(&self, runner_id: &RunnerId) -> Result<Runner> {
        let mut runner = self.get_runner(runner_id).await?;
        runner.reset();
        self.update_runner(&runner).await?;
        tracing::info!(%runner_id, "Runner reset");
        Ok(runner)
    }
}

/// The sorted set score of `at`: whole seconds, rounded up so a sweep at `Utc::now()` never takes
/// a member before `at`.
fn score(at: DateTime<Utc>) -> i64 {
    at.timestamp() + i64::from(at.timestamp_subsec_nanos() > 0)
}

fn decode_job(record: &str) -> Option<Job> {
    Job::decode(record)
        .inspect_err(|error| tracing::warn!(?error, "Skipping undecodable job record: {error}"))
        .ok()
}
