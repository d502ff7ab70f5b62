//! Background job engine
//!
//! Provides:
//! - [`BackgroundJob`]: a job's log, stage timings, result URLs and outcome
//! - [`JobManager`]: a fixed number of workers, a bounded history keyed by
//!   opaque id and an optional external [`JobInfoStore`]
//!
//! Job state lives behind a mutex so workers, pollers and the refresh loop
//! can share a job through an `Arc`.

use crate::config::PromoteConfig;
use crate::error::{cause_chain, PromoteError, PromoteResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use uuid::Uuid;

/// Timing key of the stage before the first `log_with_timing`
const INITIAL_STAGE: &str = "init";

/// Lifecycle of a submitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Queued or running
    Pending,
    /// Finished without a captured error
    Done,
    /// An error was captured
    Failed,
    /// Cancelled before finishing
    Cancelled,
}

/// What a job does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    /// Create a test
    TestCreation,
    /// Edit a test
    TestEdit,
    /// Delete a test
    TestDeletion,
    /// Promote a test
    TestPromotion,
    /// Edit a test and promote it to QA and production
    TestEditPromotion,
    /// Clean working directories
    WorkingDirectoryCleaning,
    /// Diagnostic job
    JobTest,
    /// Anything else
    Unknown,
    /// Create a test and promote it to QA and production
    TestCreationPromotion,
    /// Create a test and promote it to QA
    TestCreationPromotionQa,
    /// Edit a test and promote it to QA
    TestEditPromotionQa,
}

impl JobType {
    /// Wire name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::TestCreation => "test-creation",
            Self::TestEdit => "test-edit",
            Self::TestDeletion => "test-deletion",
            Self::TestPromotion => "test-promotion",
            Self::TestEditPromotion => "test-edit-promotion",
            Self::WorkingDirectoryCleaning => "working-directory-cleaning",
            Self::JobTest => "job-test",
            Self::Unknown => "unknown",
            Self::TestCreationPromotion => "test-creation-promotion",
            Self::TestCreationPromotionQa => "test-creation-promotion-qa",
            Self::TestEditPromotionQa => "test-edit-promotion-qa",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Link shown to the user once a job finishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultUrl {
    /// Target
    pub href: String,
    /// Link text
    pub text: String,
    /// HTML target, usually empty
    pub target: String,
}

/// Snapshot of a job for pollers and external stores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    /// Opaque id
    pub job_id: Uuid,
    /// Resolved status
    pub status: JobStatus,
    /// Full job log
    pub log: String,
    /// Title
    pub title: String,
    /// Requesting user
    pub username: String,
    /// Still queued or executing
    pub running: bool,
    /// Result links
    pub urls: Vec<ResultUrl>,
    /// Final message for the user
    pub end_message: String,
}

#[derive(Debug)]
struct JobTiming {
    started: Instant,
    stage_timings: IndexMap<String, u64>,
    ongoing: String,
    last_tick: u64,
}

impl JobTiming {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            stage_timings: IndexMap::new(),
            ongoing: INITIAL_STAGE.to_string(),
            last_tick: 0,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Close the ongoing stage and start `key`
    fn notify_start(&mut self, key: &str) {
        let now = self.elapsed_ms();
        let previous = std::mem::replace(&mut self.ongoing, key.to_string());
        self.stage_timings.insert(previous, now.saturating_sub(self.last_tick));
        self.last_tick = now;
    }
}

#[derive(Debug)]
struct JobState {
    id: Option<u64>,
    uuid: Option<Uuid>,
    status: JobStatus,
    log: String,
    timing: JobTiming,
    urls: Vec<ResultUrl>,
    end_message: String,
    error: Option<String>,
    submitted: bool,
    execute_finished: bool,
    done: bool,
    cancelled: bool,
}

/// One unit of asynchronous work with a user-visible log
#[derive(Debug)]
pub struct BackgroundJob {
    title: String,
    username: String,
    job_type: JobType,
    created_at: DateTime<Utc>,
    state: Mutex<JobState>,
}

impl BackgroundJob {
    /// Create an unsubmitted job
    #[must_use]
    pub fn new(title: impl Into<String>, username: impl Into<String>, job_type: JobType) -> Self {
        Self {
            title: title.into(),
            username: username.into(),
            job_type,
            created_at: Utc::now(),
            state: Mutex::new(JobState {
                id: None,
                uuid: None,
                status: JobStatus::Pending,
                log: String::new(),
                timing: JobTiming::new(),
                urls: Vec::new(),
                end_message: String::new(),
                error: None,
                submitted: false,
                execute_finished: false,
                done: false,
                cancelled: false,
            }),
        }
    }

    /// Title
    #[inline]
    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Requesting user
    #[inline]
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Job type
    #[inline]
    #[must_use]
    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    /// Creation time
    #[inline]
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Monotonic id, assigned on submit
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        self.state.lock().id
    }

    /// Opaque id, assigned on submit
    #[must_use]
    pub fn uuid(&self) -> Option<Uuid> {
        self.state.lock().uuid
    }

    /// Append a line to the job log
    pub fn log(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        {
            let mut state = self.state.lock();
            state.log.push_str(message);
            state.log.push('\n');
        }
        tracing::debug!(job = %self.title, "{message}");
    }

    /// Append a line and start timing the stage `timing_key`
    pub fn log_with_timing(&self, message: impl AsRef<str>, timing_key: &str) {
        let message = message.as_ref();
        let elapsed = {
            let mut state = self.state.lock();
            let elapsed = state.timing.elapsed_ms();
            state.log.push_str(message);
            state.log.push('\n');
            state.timing.notify_start(timing_key);
            elapsed
        };
        tracing::info!("{elapsed:>5}ms {message} for job {}", self.title);
    }

    /// Mark the final stage
    pub fn log_complete(&self) {
        self.log_with_timing("COMPLETE", "end");
    }

    /// Log `error` with its cause chain and capture it unless the job was
    /// cancelled or had already finished executing
    pub fn log_failed_job(&self, error: &(dyn std::error::Error + 'static)) {
        self.log_with_timing("Failed:", "Failed");
        for (depth, line) in cause_chain(error).into_iter().enumerate() {
            self.log(format!("{}{line}", "-- ".repeat(depth)));
        }
        let mut state = self.state.lock();
        if !state.cancelled && !state.execute_finished {
            state.error = Some(error.to_string());
        }
    }

    /// Full log so far
    #[must_use]
    pub fn log_text(&self) -> String {
        self.state.lock().log.clone()
    }

    /// Milliseconds spent per completed stage, in stage order
    #[must_use]
    pub fn timings(&self) -> IndexMap<String, u64> {
        self.state.lock().timing.stage_timings.clone()
    }

    /// Add a result link
    pub fn add_url(&self, href: impl Into<String>, text: impl Into<String>) {
        self.add_url_with_target(href, text, "");
    }

    /// Add a result link with an HTML target
    pub fn add_url_with_target(&self, href: impl Into<String>, text: impl Into<String>, target: impl Into<String>) {
        self.state.lock().urls.push(ResultUrl {
            href: href.into(),
            text: text.into(),
            target: target.into(),
        });
    }

    /// Result links
    #[must_use]
    pub fn urls(&self) -> Vec<ResultUrl> {
        self.state.lock().urls.clone()
    }

    /// Set the final message
    pub fn set_end_message(&self, message: impl Into<String>) {
        self.state.lock().end_message = message.into();
    }

    /// Final message
    #[must_use]
    pub fn end_message(&self) -> String {
        self.state.lock().end_message.clone()
    }

    /// Captured error message
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    /// Resolve and return the status.
    ///
    /// A pending submitted job becomes cancelled, failed or done, checked in
    /// that order.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        let mut state = self.state.lock();
        if state.submitted && state.status == JobStatus::Pending {
            if state.cancelled {
                state.status = JobStatus::Cancelled;
            } else if state.error.is_some() {
                state.status = JobStatus::Failed;
            } else if state.execute_finished {
                state.status = JobStatus::Done;
            }
        }
        state.status
    }

    /// Queued or executing
    #[must_use]
    pub fn is_running(&self) -> bool {
        let state = self.state.lock();
        !state.submitted || (!state.done && !state.cancelled)
    }

    /// Whether `cancel` was called in time
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Request cancellation; false if the job already finished.
    ///
    /// A queued job never starts. A running job is not interrupted: it runs
    /// to completion, but its status stays cancelled and a failure it
    /// returns afterwards is not recorded.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        if state.done || state.cancelled {
            return false;
        }
        state.cancelled = true;
        true
    }

    /// Snapshot for pollers
    #[must_use]
    pub fn job_info(&self) -> JobInfo {
        let status = self.status();
        let running = self.is_running();
        let state = self.state.lock();
        JobInfo {
            job_id: state.uuid.unwrap_or_else(Uuid::nil),
            status,
            log: state.log.clone(),
            title: self.title.clone(),
            username: self.username.clone(),
            running,
            urls: state.urls.clone(),
            end_message: state.end_message.clone(),
        }
    }

    fn assign(&self, id: u64, uuid: Uuid) {
        let mut state = self.state.lock();
        state.id = Some(id);
        state.uuid = Some(uuid);
        state.submitted = true;
    }

    fn mark_execute_finished(&self) {
        self.state.lock().execute_finished = true;
    }

    fn mark_done(&self) {
        self.state.lock().done = true;
    }
}

impl fmt::Display for BackgroundJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{id}: {:?}", self.status()),
            None => write!(f, "unsubmitted: {:?}", self.status()),
        }
    }
}

/// Work executed for a job
pub type JobTask = Box<dyn FnOnce(Arc<BackgroundJob>) -> BoxFuture<'static, PromoteResult<()>> + Send>;

/// External store making job info visible across processes
#[cfg_attr(test, mockall::automock)]
pub trait JobInfoStore: Send + Sync {
    /// Whether `job`'s stored snapshot is stale
    fn should_update_job_info(&self, job: &BackgroundJob) -> bool;

    /// Replace the stored snapshot
    fn update_job_info(&self, job_id: Uuid, info: JobInfo);

    /// Stored snapshot, if any
    fn get_job_info(&self, job_id: Uuid) -> Option<JobInfo>;
}

/// Runs around every job's work
pub trait JobExecutionHook: Send + Sync {
    /// Before the work; an error fails the job without running it
    fn before_execute(&self, _job: &BackgroundJob) -> PromoteResult<()> {
        Ok(())
    }

    /// After the work; an error is logged but does not fail the job
    fn after_execute(&self, _job: &BackgroundJob) -> PromoteResult<()> {
        Ok(())
    }
}

/// Submits jobs to a fixed number of workers and remembers recent ones
pub struct JobManager {
    workers: Arc<Semaphore>,
    history: Mutex<IndexMap<Uuid, Arc<BackgroundJob>>>,
    active: Arc<DashMap<Uuid, Arc<BackgroundJob>>>,
    history_max_size: usize,
    refresh_interval: Duration,
    last_id: AtomicU64,
    job_info_store: Option<Arc<dyn JobInfoStore>>,
    hooks: Arc<Vec<Arc<dyn JobExecutionHook>>>,
}

impl fmt::Debug for JobManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobManager")
            .field("history", &self.history.lock().len())
            .field("active", &self.active.len())
            .field("history_max_size", &self.history_max_size)
            .field("has_job_info_store", &self.job_info_store.is_some())
            .finish_non_exhaustive()
    }
}

impl JobManager {
    /// Create manager sized by `config`
    #[must_use]
    pub fn new(config: &PromoteConfig) -> Self {
        let history_max_size = config.job_history_max_size.max(1);
        Self {
            workers: Arc::new(Semaphore::new(config.worker_threads.max(1))),
            history: Mutex::new(IndexMap::with_capacity(history_max_size + 1)),
            active: Arc::new(DashMap::new()),
            history_max_size,
            refresh_interval: config.job_refresh_interval(),
            last_id: AtomicU64::new(0),
            job_info_store: None,
            hooks: Arc::new(Vec::new()),
        }
    }

    /// With external job-info store
    #[must_use]
    pub fn with_job_info_store(mut self, store: Arc<dyn JobInfoStore>) -> Self {
        self.job_info_store = Some(store);
        self
    }

    /// With a hook run around every job
    #[must_use]
    pub fn with_execution_hook(mut self, hook: Arc<dyn JobExecutionHook>) -> Self {
        Arc::make_mut(&mut self.hooks).push(hook);
        self
    }

    /// Assign ids, record the job and hand it to a worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, job: Arc<BackgroundJob>, task: JobTask) -> Uuid {
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let uuid = Uuid::new_v4();
        job.assign(id, uuid);

        self.active.insert(uuid, Arc::clone(&job));
        {
            let mut history = self.history.lock();
            history.insert(uuid, Arc::clone(&job));
            while history.len() > self.history_max_size {
                history.shift_remove_index(0);
            }
        }
        if let Some(store) = &self.job_info_store {
            store.update_job_info(uuid, job.job_info());
        }

        tracing::info!(id, %uuid, title = job.title(), "a background job was submitted");
        metrics::counter!("proctor_jobs_submitted_total").increment(1);
        self.record_active();

        let runner = JobRunner {
            workers: Arc::clone(&self.workers),
            active: Arc::clone(&self.active),
            hooks: Arc::clone(&self.hooks),
        };
        tokio::spawn(runner.run(job, task));
        uuid
    }

    /// Job by opaque id, if still in history
    #[must_use]
    pub fn get_job_for_id(&self, job_id: Uuid) -> Option<Arc<BackgroundJob>> {
        self.history.lock().get(&job_id).cloned()
    }

    /// Snapshot of a job from history, falling back to the external store
    #[must_use]
    pub fn get_job_info(&self, job_id: Uuid) -> Option<JobInfo> {
        if let Some(job) = self.get_job_for_id(job_id) {
            return Some(job.job_info());
        }
        self.job_info_store.as_ref().and_then(|store| store.get_job_info(job_id))
    }

    /// History plus still-running jobs already evicted from it, oldest first
    #[must_use]
    pub fn recent_jobs(&self) -> Vec<Arc<BackgroundJob>> {
        let mut jobs: IndexMap<Uuid, Arc<BackgroundJob>> = self.history.lock().clone();
        for entry in self.active.iter() {
            jobs.entry(*entry.key()).or_insert_with(|| Arc::clone(entry.value()));
        }
        let mut jobs: Vec<_> = jobs.into_values().collect();
        jobs.sort_by_key(|job| job.id());
        jobs
    }

    /// Push stale snapshots to the external store; returns how many were pushed
    pub fn refresh_job_infos(&self) -> usize {
        let Some(store) = &self.job_info_store else {
            return 0;
        };
        let entries: Vec<(Uuid, Arc<BackgroundJob>)> = self
            .history
            .lock()
            .iter()
            .map(|(uuid, job)| (*uuid, Arc::clone(job)))
            .collect();

        let mut updated = 0;
        for (uuid, job) in entries {
            if store.should_update_job_info(&job) {
                store.update_job_info(uuid, job.job_info());
                updated += 1;
            }
        }
        updated
    }

    /// Refresh job infos every configured interval until `shutdown_rx` flips to true
    pub fn spawn_refresher(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.refresh_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("Job info refresher shutting down");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let updated = manager.refresh_job_infos();
                        if updated > 0 {
                            tracing::debug!(updated, "Refreshed job infos");
                        }
                    }
                }
            }
        })
    }

    /// Jobs submitted but not yet finished
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Jobs resolvable by id
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    /// Stop starting queued jobs; running jobs finish
    pub fn close(&self) {
        self.workers.close();
    }

    fn record_active(&self) {
        metrics::gauge!("proctor_jobs_active").set(self.active.len() as f64);
    }
}

struct JobRunner {
    workers: Arc<Semaphore>,
    active: Arc<DashMap<Uuid, Arc<BackgroundJob>>>,
    hooks: Arc<Vec<Arc<dyn JobExecutionHook>>>,
}

impl JobRunner {
    async fn run(self, job: Arc<BackgroundJob>, task: JobTask) {
        match Arc::clone(&self.workers).acquire_owned().await {
            Ok(_permit) => {
                if !job.is_cancelled() {
                    self.execute(&job, task).await;
                }
            }
            Err(_) => {
                let error = PromoteError::Config("job manager is closed".into());
                tracing::warn!(job = job.title(), "Job dropped, manager closed");
                job.log_failed_job(&error);
            }
        }
        job.mark_execute_finished();
        job.mark_done();
        if let Some(uuid) = job.uuid() {
            self.active.remove(&uuid);
        }
        metrics::gauge!("proctor_jobs_active").set(self.active.len() as f64);
    }

    async fn execute(&self, job: &Arc<BackgroundJob>, task: JobTask) {
        for hook in self.hooks.iter() {
            if let Err(e) = hook.before_execute(job) {
                tracing::error!(job = job.title(), error = %e, "Before job execute hook failed");
                job.log_failed_job(&e);
                return;
            }
        }

        let work_job = Arc::clone(job);
        let outcome = AssertUnwindSafe(async move { task(work_job).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) if job.is_cancelled() => {
                tracing::info!(job = job.title(), "Cancelled job finished with an error, not recorded");
            }
            Ok(Err(e)) => {
                if e.is_expected() {
                    tracing::info!(job = job.title(), error = %e, "Background job failed");
                } else {
                    tracing::error!(job = job.title(), error = %e, "Background job failed");
                }
                job.log_failed_job(&e);
            }
            Err(panic) => {
                let e = PromoteError::Panicked(panic_message(panic.as_ref()));
                tracing::error!(job = job.title(), error = %e, "Background job panicked");
                job.log_failed_job(&e);
            }
        }
        job.mark_execute_finished();

        for hook in self.hooks.iter() {
            if let Err(e) = hook.after_execute(job) {
                tracing::error!(job = job.title(), error = %e, "After job execute hook failed");
                job.log_failed_job(&e);
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
