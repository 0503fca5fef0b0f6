//! Multi-stage sync pipeline
//!
//! competitions -> teams -> games -> fixture validation -> fixture cleanup,
//! each stage a batch on the task runner, with progress recorded per stage.

pub mod stage_tracker;
pub mod stages;
pub mod store;
pub mod sync;

pub use stage_tracker::{
    NullSink, ProgressSink, RunProgress, StageCounter, StageError, StageRecord, StageStatus,
    StageTracker, StoreProgressSink,
};
pub use stages::SyncStage;
pub use store::{ContentStore, HttpContentStore, InMemoryStore, StoreError, UpsertOutcome, upsert_once};
pub use sync::{PipelineError, StageContext, StageReport, SyncPipeline, store_from_config};
