//! Per-stage progress for one pipeline run
//!
//! Stages move `pending -> in-progress -> completed` in the fixed order of
//! [`SyncStage::ALL`]. Every mutation is persisted through a [`ProgressSink`]
//! so a crashed run still exposes how far it got.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::stages::SyncStage;
use super::store::{ContentStore, StoreError};
use crate::utils::constants::PROGRESS_RESOURCE_TYPE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
}

/// Counters for one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub stage: SyncStage,
    pub status: StageStatus,
    pub items_found: u64,
    pub items_new: u64,
    pub items_updated: u64,
    pub items_deleted: u64,
    pub errors_detected: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    fn new(stage: SyncStage) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            items_found: 0,
            items_new: 0,
            items_updated: 0,
            items_deleted: 0,
            errors_detected: 0,
            started_at: None,
            completed_at: None,
        }
    }
}

/// The aggregate record persisted after every change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProgress {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub current_stage: Option<SyncStage>,
    pub pending_stages: Vec<SyncStage>,
    pub completed_stages: Vec<SyncStage>,
    pub stages: Vec<StageRecord>,
}

impl RunProgress {
    fn new(run_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            started_at: now,
            updated_at: now,
            finished_at: None,
            current_stage: None,
            pending_stages: SyncStage::ALL.to_vec(),
            completed_stages: Vec::new(),
            stages: SyncStage::ALL.into_iter().map(StageRecord::new).collect(),
        }
    }

    #[must_use]
    pub fn record(&self, stage: SyncStage) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    fn record_mut(&mut self, stage: SyncStage) -> Option<&mut StageRecord> {
        self.stages.iter_mut().find(|r| r.stage == stage)
    }

    #[must_use]
    pub fn total_errors(&self) -> u64 {
        self.stages.iter().map(|r| r.errors_detected).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("stage {stage} is not pending")]
    NotPending { stage: SyncStage },

    #[error("stage {stage} is not in progress")]
    NotInProgress { stage: SyncStage },

    #[error("cannot start {requested} while {active} is in progress")]
    AnotherInProgress { requested: SyncStage, active: SyncStage },

    #[error("cannot start {requested} before {expected}")]
    OutOfOrder { requested: SyncStage, expected: SyncStage },
}

/// Where progress snapshots go
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn persist(&self, progress: &RunProgress) -> Result<(), StoreError>;
}

/// Discards progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl ProgressSink for NullSink {
    async fn persist(&self, _progress: &RunProgress) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Persists progress into the content store, keyed by run id
pub struct StoreProgressSink {
    store: Arc<dyn ContentStore>,
}

impl StoreProgressSink {
    #[must_use]
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ProgressSink for StoreProgressSink {
    async fn persist(&self, progress: &RunProgress) -> Result<(), StoreError> {
        let payload = serde_json::to_value(progress)?;
        self.store
            .upsert(PROGRESS_RESOURCE_TYPE, &progress.run_id.to_string(), payload)
            .await?;
        Ok(())
    }
}

/// Which counter an increment applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageCounter {
    Found,
    New,
    Updated,
    Deleted,
    Errors,
}

/// Coordinates stage progress for one run
pub struct StageTracker {
    progress: Mutex<RunProgress>,
    sink: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for StageTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageTracker").finish_non_exhaustive()
    }
}

impl StageTracker {
    #[must_use]
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self::with_run_id(Uuid::new_v4(), sink)
    }

    #[must_use]
    pub fn with_run_id(run_id: Uuid, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            progress: Mutex::new(RunProgress::new(run_id)),
            sink,
        }
    }

    pub async fn snapshot(&self) -> RunProgress {
        self.progress.lock().await.clone()
    }

    pub async fn run_id(&self) -> Uuid {
        self.progress.lock().await.run_id
    }

    /// Persist while still holding the lock so snapshots land in order
    async fn persist(&self, progress: &mut RunProgress) {
        progress.updated_at = Utc::now();
        if let Err(e) = self.sink.persist(progress).await {
            warn!("Failed to persist run progress: {e}");
        }
    }

    pub async fn start_stage(&self, stage: SyncStage) -> Result<(), StageError> {
        let mut progress = self.progress.lock().await;
        if let Some(active) = progress.current_stage {
            return Err(StageError::AnotherInProgress {
                requested: stage,
                active,
            });
        }
        match progress.pending_stages.first() {
            None => return Err(StageError::NotPending { stage }),
            Some(&expected) if expected != stage => {
                if !progress.pending_stages.contains(&stage) {
                    return Err(StageError::NotPending { stage });
                }
                return Err(StageError::OutOfOrder {
                    requested: stage,
                    expected,
                });
            }
            Some(_) => {}
        }
        let record = progress
            .record_mut(stage)
            .ok_or(StageError::NotPending { stage })?;
        record.status = StageStatus::InProgress;
        record.started_at = Some(Utc::now());
        progress.current_stage = Some(stage);
        info!("Stage {stage} started");
        self.persist(&mut progress).await;
        Ok(())
    }

    /// Add `amount` to one counter of the in-progress stage
    pub async fn increment(&self, stage: SyncStage, counter: StageCounter, amount: u64) -> Result<(), StageError> {
        if amount == 0 {
            return Ok(());
        }
        let mut progress = self.progress.lock().await;
        if progress.current_stage != Some(stage) {
            return Err(StageError::NotInProgress { stage });
        }
        let record = progress
            .record_mut(stage)
            .ok_or(StageError::NotInProgress { stage })?;
        let slot = match counter {
            StageCounter::Found => &mut record.items_found,
            StageCounter::New => &mut record.items_new,
            StageCounter::Updated => &mut record.items_updated,
            StageCounter::Deleted => &mut record.items_deleted,
            StageCounter::Errors => &mut record.errors_detected,
        };
        *slot = slot.saturating_add(amount);
        self.persist(&mut progress).await;
        Ok(())
    }

    pub async fn add_found(&self, stage: SyncStage, n: u64) -> Result<(), StageError> {
        self.increment(stage, StageCounter::Found, n).await
    }

    pub async fn add_new(&self, stage: SyncStage, n: u64) -> Result<(), StageError> {
        self.increment(stage, StageCounter::New, n).await
    }

    pub async fn add_updated(&self, stage: SyncStage, n: u64) -> Result<(), StageError> {
        self.increment(stage, StageCounter::Updated, n).await
    }

    pub async fn add_deleted(&self, stage: SyncStage, n: u64) -> Result<(), StageError> {
        self.increment(stage, StageCounter::Deleted, n).await
    }

    pub async fn add_errors(&self, stage: SyncStage, n: u64) -> Result<(), StageError> {
        self.increment(stage, StageCounter::Errors, n).await
    }

    /// Move `stage` from pending to completed.
    ///
    /// A stage may be completed without being started, which is how earlier
    /// stages are skipped; it is never completed twice.
    pub async fn complete_stage(&self, stage: SyncStage) -> Result<StageRecord, StageError> {
        let mut progress = self.progress.lock().await;
        let Some(position) = progress.pending_stages.iter().position(|s| *s == stage) else {
            return Err(StageError::NotPending { stage });
        };
        if let Some(active) = progress.current_stage
            && active != stage
        {
            return Err(StageError::AnotherInProgress {
                requested: stage,
                active,
            });
        }

        progress.pending_stages.remove(position);
        progress.completed_stages.push(stage);
        progress.current_stage = None;
        let record = {
            let record = progress
                .record_mut(stage)
                .ok_or(StageError::NotPending { stage })?;
            record.status = StageStatus::Completed;
            record.completed_at = Some(Utc::now());
            record.clone()
        };
        info!(
            "Stage {stage} completed: found={} new={} updated={} deleted={} errors={}",
            record.items_found,
            record.items_new,
            record.items_updated,
            record.items_deleted,
            record.errors_detected
        );
        self.persist(&mut progress).await;
        Ok(record)
    }

    /// Mark the run finished and persist the final record
    pub async fn finish(&self) -> RunProgress {
        let mut progress = self.progress.lock().await;
        progress.finished_at = Some(Utc::now());
        progress.current_stage = None;
        self.persist(&mut progress).await;
        progress.clone()
    }
}
