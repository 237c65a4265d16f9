#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Worker side of the pipeline.
//!
//! A remote task loads its chunk from the environment
//! ([`payload_source_from_env`]), then hands it to a [`WorkerRunner`],
//! which processes items one by one with bounded retries, uploads both
//! artifacts per item, and checkpoints a progress record to the store.
//! Re-running a task is safe: every write overwrites by key.
//!
//! [`run_local`] is the single-machine alternative used for small backfills
//! and debugging.

pub mod local;
pub mod payload;
pub mod progress;
pub mod retry;
pub mod runner;

use std::path::PathBuf;
use std::sync::Arc;

use chirps_cog_config::PipelineConfig;
use chirps_cog_pipeline_models::ProgressRecord;
use chirps_cog_processor::ItemProcessor;
use chirps_cog_store::BlobStore;

pub use local::{LocalRunReport, run_local};
pub use payload::{
    ChunkPayloadSource, InlinePayload, PayloadError, ReferencePayload, payload_source_from_env,
    task_id_from_env,
};
pub use progress::{NullProgress, ProgressCallback, null_progress};
pub use retry::{AttemptOutcome, RetryFailure, RetryPolicy};
pub use runner::{RunnerError, RunnerSettings, WorkerRunner};

/// Entry point of a remote task: reads the task id and payload from the
/// environment and runs the chunk.
///
/// # Errors
///
/// Returns [`RunnerError`] if the payload is missing or malformed, or the
/// workspace cannot be prepared. Per-item failures are not errors.
pub async fn run_task(
    config: &PipelineConfig,
    processor: Arc<dyn ItemProcessor>,
    store: Arc<dyn BlobStore>,
    workspace: PathBuf,
) -> Result<ProgressRecord, RunnerError> {
    let task_id = task_id_from_env();
    log::info!("Task ID: {task_id}");

    let source = payload_source_from_env()?;
    log::info!("Loading work items from {}", source.describe());
    let items = source.load().await?;
    if items.is_empty() {
        log::warn!("Task {task_id} received an empty chunk");
    }

    let runner = WorkerRunner::new(
        processor,
        store,
        RunnerSettings {
            workspace,
            retry: RetryPolicy::from_config(config),
            checkpoint_every: config.checkpoint_every,
        },
    );
    runner.run(task_id, &items).await
}
