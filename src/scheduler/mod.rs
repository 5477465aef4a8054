//! Per-source recurring fetch scheduling.
//!
//! Each active source owns at most one one-shot obligation in the
//! [`JobFacility`]. When it fires the scheduler fetches the source and
//! registers the next obligation from the updated `last_fetched`.
//!
//! Per source: `Unscheduled -> Scheduled -> Running -> Scheduled`, back to
//! `Unscheduled` on deactivation or deletion.

mod jobs;

pub use jobs::{FiredJob, JobError, JobFacility, JobPayload, ManualJobs, ObligationKey, TokioJobs};

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::feed::{FetchError, FetchOutcome, Fetcher};
use crate::registry::{SourceEvent, SourceListener};
use crate::storage::{DatabaseError, Source, SourceId, SourceStore, DEFAULT_REFRESH_INTERVAL_SECS};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Jobs(#[from] JobError),
    #[error(transparent)]
    Store(#[from] DatabaseError),
    #[error("Source {0} not found")]
    NotFound(SourceId),
}

/// Where a source currently is in its schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Unscheduled,
    Scheduled,
    Running,
}

/// How a manual refresh was carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshDispatch {
    /// Handed to the job facility
    Enqueued,
    /// The facility was unavailable, so the fetch ran before returning
    RanInline,
}

/// Deterministic offset in `[0, window)` spreading sources that are due at once
pub fn stagger_offset(source_id: SourceId, window: Duration) -> Duration {
    let window_ms = window.as_millis() as u64;
    if window_ms == 0 {
        return Duration::ZERO;
    }
    // Knuth multiplicative hash so consecutive IDs land far apart
    let spread = (source_id as u64).wrapping_mul(2_654_435_761);
    Duration::from_millis(spread % window_ms)
}

/// Next run time for a source.
///
/// `last_fetched + refresh_interval` when that is still in the future,
/// otherwise `now` plus the source's stagger offset. A non-positive interval
/// (only reachable by writing the row directly) counts as the default.
pub fn compute_next_run(source: &Source, now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let interval = if source.refresh_interval > 0 {
        source.refresh_interval
    } else {
        DEFAULT_REFRESH_INTERVAL_SECS
    };
    let due = source.last_fetched.saturating_add(interval);
    if due > now.timestamp() {
        if let Some(at) = Utc.timestamp_opt(due, 0).single() {
            return at;
        }
    }
    let offset = chrono::Duration::from_std(stagger_offset(source.id, window))
        .unwrap_or_else(|_| chrono::Duration::zero());
    now + offset
}

#[derive(Default)]
struct RunState {
    running: HashSet<SourceId>,
    /// Sources that were triggered again mid-fetch
    rerun: HashSet<SourceId>,
}

pub struct Scheduler {
    sources: Arc<dyn SourceStore>,
    fetcher: Arc<Fetcher>,
    jobs: Arc<dyn JobFacility>,
    stagger_window: Duration,
    state: Mutex<RunState>,
}

impl Scheduler {
    pub fn new(
        sources: Arc<dyn SourceStore>,
        fetcher: Arc<Fetcher>,
        jobs: Arc<dyn JobFacility>,
        stagger_window: Duration,
    ) -> Self {
        Self {
            sources,
            fetcher,
            jobs,
            stagger_window,
            state: Mutex::new(RunState::default()),
        }
    }

    /// Register an obligation for every active source (process start)
    pub async fn schedule_all(&self) -> Result<usize, ScheduleError> {
        let sources = self.sources.list_active().await?;
        let mut scheduled = 0;
        for source in &sources {
            match self.schedule_source(source).await {
                Ok(_) => scheduled += 1,
                Err(e) => tracing::warn!(source_id = source.id, error = %e, "Failed to schedule source"),
            }
        }
        tracing::info!(scheduled, "Scheduled active sources");
        Ok(scheduled)
    }

    /// Recompute and register the obligation of one source.
    ///
    /// Inactive sources are unscheduled instead. Returns the run time, or
    /// `None` if the source is inactive.
    pub async fn schedule(&self, source_id: SourceId) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let source = self
            .sources
            .get(source_id)
            .await?
            .ok_or(ScheduleError::NotFound(source_id))?;
        if !source.is_active() {
            self.unschedule(source_id).await?;
            return Ok(None);
        }
        self.schedule_source(&source).await.map(Some)
    }

    async fn schedule_source(&self, source: &Source) -> Result<DateTime<Utc>, ScheduleError> {
        let key = ObligationKey::for_source(source.id);
        let at = compute_next_run(source, Utc::now(), self.stagger_window);

        self.jobs.cancel(&key).await?;
        self.jobs
            .schedule_at(at, &key, JobPayload { source_id: source.id })
            .await?;

        tracing::debug!(source_id = source.id, run_at = %at, "Fetch scheduled");
        Ok(at)
    }

    pub async fn unschedule(&self, source_id: SourceId) -> Result<bool, ScheduleError> {
        let removed = self.jobs.cancel(&ObligationKey::for_source(source_id)).await?;
        if removed {
            tracing::debug!(source_id, "Fetch unscheduled");
        }
        Ok(removed)
    }

    /// Fetch a source as soon as possible, bypassing its stagger.
    ///
    /// When the job facility is unavailable the fetch runs before this returns.
    pub async fn refresh_now(&self, source_id: SourceId) -> Result<RefreshDispatch, ScheduleError> {
        let key = ObligationKey::for_source(source_id);
        let payload = JobPayload { source_id };

        let enqueued = match self.jobs.cancel(&key).await {
            Ok(_) => self.jobs.enqueue_now(&key, payload).await,
            Err(e) => Err(e),
        };

        match enqueued {
            Ok(()) => Ok(RefreshDispatch::Enqueued),
            Err(JobError::Unavailable) => {
                tracing::warn!(source_id, "Job facility unavailable, fetching inline");
                self.on_fired(FiredJob { key, payload }).await;
                Ok(RefreshDispatch::RanInline)
            }
        }
    }

    /// Handle a fired obligation or manual refresh.
    pub async fn on_fired(&self, job: FiredJob) {
        self.run_now(job.payload.source_id).await;
    }

    /// Fetch a source right away, then register its next obligation.
    ///
    /// At most one fetch per source runs at a time; triggers that arrive while
    /// one is running collapse into a single follow-up run. Returns `None`
    /// when nothing was fetched on this call, either because the trigger was
    /// coalesced into a running fetch or because the source is gone or
    /// inactive. Otherwise returns the result of the first fetch.
    pub async fn run_now(&self, source_id: SourceId) -> Option<Result<FetchOutcome, FetchError>> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !state.running.insert(source_id) {
                state.rerun.insert(source_id);
                tracing::debug!(source_id, "Fetch already running, coalescing trigger");
                return None;
            }
        }

        let result = self.run_and_reschedule(source_id).await;
        while self.take_rerun(source_id) {
            tracing::debug!(source_id, "Running coalesced follow-up fetch");
            self.run_and_reschedule(source_id).await;
        }
        result
    }

    /// Clear a pending follow-up, or release the source when there is none
    fn take_rerun(&self, source_id: SourceId) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let again = state.rerun.remove(&source_id);
        if !again {
            state.running.remove(&source_id);
        }
        again
    }

    async fn run_and_reschedule(&self, source_id: SourceId) -> Option<Result<FetchOutcome, FetchError>> {
        match self.sources.get(source_id).await {
            Ok(Some(source)) if source.is_active() => {}
            Ok(Some(_)) => {
                tracing::debug!(source_id, "Source inactive, not fetching");
                return None;
            }
            Ok(None) => {
                tracing::debug!(source_id, "Source gone, not fetching");
                return None;
            }
            Err(e) => {
                tracing::warn!(source_id, error = %e, "Could not load source before fetching");
                return Some(Err(FetchError::StoreReadFailed(e.to_string())));
            }
        }

        let result = self.fetcher.fetch(source_id).await;
        match &result {
            Ok(_) | Err(FetchError::FetchFailed(_)) | Err(FetchError::StoreWriteFailed(_)) => {}
            Err(FetchError::NoUrl) => {
                tracing::info!(source_id, "Source has no feed URL, parked until edited");
                return Some(result);
            }
            Err(FetchError::NotFound(_)) => return Some(result),
            Err(e @ FetchError::StoreReadFailed(_)) => {
                tracing::warn!(source_id, error = %e, "Fetch could not start");
            }
        }

        // Re-read for the fresh last_fetched; the source may also have changed mid-fetch
        match self.sources.get(source_id).await {
            Ok(Some(source)) if source.is_active() => {
                if let Err(e) = self.schedule_source(&source).await {
                    tracing::error!(source_id, error = %e, "Failed to reschedule source");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::error!(source_id, error = %e, "Failed to reload source for rescheduling"),
        }
        Some(result)
    }

    pub async fn state(&self, source_id: SourceId) -> Result<ScheduleState, ScheduleError> {
        let running = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .running
            .contains(&source_id);
        if running {
            return Ok(ScheduleState::Running);
        }
        if self
            .jobs
            .has_scheduled(&ObligationKey::for_source(source_id))
            .await?
        {
            return Ok(ScheduleState::Scheduled);
        }
        Ok(ScheduleState::Unscheduled)
    }

    /// Drain fired jobs, handling each on its own task
    pub fn spawn_dispatcher(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<FiredJob>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let scheduler = Arc::clone(&scheduler);
                tokio::spawn(async move {
                    scheduler.on_fired(job).await;
                });
            }
            tracing::info!("Job channel closed, dispatcher exiting");
        })
    }
}

#[async_trait]
impl SourceListener for Scheduler {
    async fn on_source_event(&self, event: &SourceEvent) {
        let result = match event {
            SourceEvent::Created(source)
            | SourceEvent::Updated(source)
            | SourceEvent::StatusChanged { source, .. } => {
                if source.is_active() {
                    self.schedule_source(source).await.map(|_| ())
                } else {
                    self.unschedule(source.id).await.map(|_| ())
                }
            }
            SourceEvent::Deleted(id) => self.unschedule(*id).await.map(|_| ()),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to apply source event to schedule");
        }
    }
}
