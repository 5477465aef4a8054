//! Job scheduling facility.
//!
//! The [`JobFacility`] trait abstracts where one-shot fetch obligations live
//! and how they fire. [`TokioJobs`] keeps them as in-process timers and
//! delivers fired jobs over a channel; [`ManualJobs`] only records them so
//! tests can inspect obligations and fire them by hand.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::storage::SourceId;

/// Address of a source's fetch obligation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObligationKey(String);

impl ObligationKey {
    pub fn for_source(source_id: SourceId) -> Self {
        Self(format!("fetch-source:{}", source_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObligationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobPayload {
    pub source_id: SourceId,
}

/// A job whose time has come, handed to the scheduler's dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredJob {
    pub key: ObligationKey,
    pub payload: JobPayload,
}

#[derive(Debug, Error)]
pub enum JobError {
    /// The facility cannot accept work (dispatcher gone, or disabled)
    #[error("Job facility unavailable")]
    Unavailable,
}

#[async_trait]
pub trait JobFacility: Send + Sync {
    /// Register a one-shot obligation, replacing any under the same key
    async fn schedule_at(
        &self,
        at: DateTime<Utc>,
        key: &ObligationKey,
        payload: JobPayload,
    ) -> Result<(), JobError>;

    /// Returns whether an obligation was removed
    async fn cancel(&self, key: &ObligationKey) -> Result<bool, JobError>;

    async fn has_scheduled(&self, key: &ObligationKey) -> Result<bool, JobError>;

    /// Run as soon as possible, without registering an obligation
    async fn enqueue_now(&self, key: &ObligationKey, payload: JobPayload) -> Result<(), JobError>;
}

// ============================================================================
// Tokio timers
// ============================================================================

struct PendingTimer {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct TimerTable {
    next_generation: u64,
    pending: HashMap<ObligationKey, PendingTimer>,
}

/// In-process facility: one sleeping task per obligation
pub struct TokioJobs {
    table: Arc<Mutex<TimerTable>>,
    tx: mpsc::UnboundedSender<FiredJob>,
}

impl TokioJobs {
    /// Create the facility and the receiving end the dispatcher drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FiredJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let jobs = Self {
            table: Arc::new(Mutex::new(TimerTable::default())),
            tx,
        };
        (jobs, rx)
    }

    fn ensure_open(&self) -> Result<(), JobError> {
        if self.tx.is_closed() {
            return Err(JobError::Unavailable);
        }
        Ok(())
    }

    /// Number of pending timers
    pub fn pending(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .len()
    }
}

impl Drop for TokioJobs {
    fn drop(&mut self) {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        for timer in table.pending.values() {
            timer.handle.abort();
        }
    }
}

#[async_trait]
impl JobFacility for TokioJobs {
    async fn schedule_at(
        &self,
        at: DateTime<Utc>,
        key: &ObligationKey,
        payload: JobPayload,
    ) -> Result<(), JobError> {
        self.ensure_open()?;

        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.next_generation += 1;
        let generation = table.next_generation;

        // The task cannot take the lock until this insert is done
        let task_table = Arc::clone(&self.table);
        let tx = self.tx.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut table = task_table.lock().unwrap_or_else(|e| e.into_inner());
                match table.pending.get(&task_key) {
                    Some(timer) if timer.generation == generation => {
                        table.pending.remove(&task_key);
                    }
                    // Replaced or cancelled while we slept
                    _ => return,
                }
            }
            if tx.send(FiredJob { key: task_key, payload }).is_err() {
                tracing::warn!("Job dispatcher is gone, dropping fired obligation");
            }
        })
        .abort_handle();

        if let Some(old) = table
            .pending
            .insert(key.clone(), PendingTimer { generation, handle })
        {
            old.handle.abort();
        }
        Ok(())
    }

    async fn cancel(&self, key: &ObligationKey) -> Result<bool, JobError> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        match table.pending.remove(key) {
            Some(timer) => {
                timer.handle.abort();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn has_scheduled(&self, key: &ObligationKey) -> Result<bool, JobError> {
        Ok(self
            .table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .contains_key(key))
    }

    async fn enqueue_now(&self, key: &ObligationKey, payload: JobPayload) -> Result<(), JobError> {
        self.tx
            .send(FiredJob {
                key: key.clone(),
                payload,
            })
            .map_err(|_| JobError::Unavailable)
    }
}

// ============================================================================
// Manual facility
// ============================================================================

/// Facility that only records obligations. Nothing fires on its own.
pub struct ManualJobs {
    obligations: Mutex<HashMap<ObligationKey, (DateTime<Utc>, JobPayload)>>,
    enqueued: Mutex<Vec<FiredJob>>,
    available: AtomicBool,
}

impl Default for ManualJobs {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualJobs {
    pub fn new() -> Self {
        Self {
            obligations: Mutex::new(HashMap::new()),
            enqueued: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Make every call fail with [`JobError::Unavailable`]
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), JobError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(JobError::Unavailable)
        }
    }

    /// When the obligation under `key` is due, if any
    pub fn scheduled_at(&self, key: &ObligationKey) -> Option<DateTime<Utc>> {
        self.obligations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|(at, _)| *at)
    }

    /// Number of registered obligations
    pub fn obligation_count(&self) -> usize {
        self.obligations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Remove the obligation and hand back the job it would have fired
    pub fn fire(&self, key: &ObligationKey) -> Option<FiredJob> {
        self.obligations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .map(|(_, payload)| FiredJob {
                key: key.clone(),
                payload,
            })
    }

    /// Drain jobs passed to `enqueue_now`
    pub fn take_enqueued(&self) -> Vec<FiredJob> {
        std::mem::take(&mut *self.enqueued.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl JobFacility for ManualJobs {
    async fn schedule_at(
        &self,
        at: DateTime<Utc>,
        key: &ObligationKey,
        payload: JobPayload,
    ) -> Result<(), JobError> {
        self.check()?;
        self.obligations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), (at, payload));
        Ok(())
    }

    async fn cancel(&self, key: &ObligationKey) -> Result<bool, JobError> {
        self.check()?;
        Ok(self
            .obligations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .is_some())
    }

    async fn has_scheduled(&self, key: &ObligationKey) -> Result<bool, JobError> {
        self.check()?;
        Ok(self
            .obligations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key))
    }

    async fn enqueue_now(&self, key: &ObligationKey, payload: JobPayload) -> Result<(), JobError> {
        self.check()?;
        self.enqueued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(FiredJob {
                key: key.clone(),
                payload,
            });
        Ok(())
    }
}
