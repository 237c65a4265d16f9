#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Fleet-wide progress from per-task checkpoints.
//!
//! Workers never talk to each other or to a coordinator. Each one
//! overwrites `batch-logs/<task_id>.json` as it goes, and this crate reads
//! every record back, merges them, and flags tasks whose last checkpoint is
//! older than the staleness window.

pub mod monitor;
pub mod report;

use std::time::Duration;

use chirps_cog_pipeline_models::{GlobalProgressSummary, ProgressRecord};
use chirps_cog_store::{BlobStore, Container, StoreError};
use chrono::{DateTime, TimeDelta, Utc};

pub use monitor::{MonitorSettings, monitor, monitor_until};
pub use report::{failed_items_report, recovery_items, render_failed_report, render_summary};

/// Key prefix of progress records in the `batch-logs` container.
pub const RECORD_PREFIX: &str = "task_";

/// Records read from the store, plus how many could not be used.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedRecords {
    /// Successfully parsed records, in key order.
    pub records: Vec<ProgressRecord>,
    /// Records that could not be read or parsed.
    pub skipped: usize,
}

/// Reads every progress record from the `batch-logs` container.
///
/// Unreadable or malformed records are logged and counted, never fatal.
///
/// # Errors
///
/// Returns [`StoreError`] only if the container cannot be listed.
pub async fn fetch_records(store: &dyn BlobStore) -> Result<FetchedRecords, StoreError> {
    let keys = store.list_keys(Container::BatchLogs, RECORD_PREFIX).await?;
    let mut fetched = FetchedRecords::default();

    for key in keys.iter().filter(|k| k.ends_with(".json")) {
        let data = match store.get(Container::BatchLogs, key).await {
            Ok(data) => data,
            Err(e) => {
                log::warn!("Skipping progress record {key}: {e}");
                fetched.skipped += 1;
                continue;
            }
        };
        match serde_json::from_slice::<ProgressRecord>(&data) {
            Ok(record) => fetched.records.push(record),
            Err(e) => {
                log::warn!("Skipping malformed progress record {key}: {e}");
                fetched.skipped += 1;
            }
        }
    }

    log::debug!(
        "Read {} progress records ({} skipped)",
        fetched.records.len(),
        fetched.skipped
    );
    Ok(fetched)
}

/// Merges `records` into a summary as of `now`.
///
/// A task is stalled when its last checkpoint is strictly older than
/// `stale_after`; otherwise it is active. The estimated total assumes every
/// task holds `chunk_size` items.
#[must_use]
pub fn aggregate(
    records: &[ProgressRecord],
    now: DateTime<Utc>,
    stale_after: Duration,
    chunk_size: usize,
) -> GlobalProgressSummary {
    let window = TimeDelta::from_std(stale_after).unwrap_or(TimeDelta::MAX);

    let mut total_completed = 0u64;
    let mut total_failed = 0u64;
    let mut active_tasks = 0usize;
    let mut stalled_tasks = Vec::new();

    for record in records {
        total_completed += record.completed_count;
        total_failed += record.failed_files.len() as u64;

        if now - record.iso_timestamp > window {
            stalled_tasks.push(record.task_id.clone());
        } else {
            active_tasks += 1;
        }
    }

    let estimated_total = (records.len() as u64).saturating_mul(chunk_size as u64);
    #[allow(clippy::cast_precision_loss)] // display-only percentage
    let completion_percentage = if estimated_total == 0 {
        0.0
    } else {
        total_completed as f64 / estimated_total as f64 * 100.0
    };

    GlobalProgressSummary {
        total_completed,
        total_failed,
        estimated_total,
        completion_percentage,
        active_tasks,
        stalled_tasks,
        total_tasks: records.len(),
        skipped_records: 0,
    }
}

/// Fetches every record and aggregates it as of now.
///
/// # Errors
///
/// Returns [`StoreError`] if the container cannot be listed.
pub async fn current_summary(
    store: &dyn BlobStore,
    stale_after: Duration,
    chunk_size: usize,
) -> Result<(GlobalProgressSummary, Vec<ProgressRecord>), StoreError> {
    let fetched = fetch_records(store).await?;
    let mut summary = aggregate(&fetched.records, Utc::now(), stale_after, chunk_size);
    summary.skipped_records = fetched.skipped;
    Ok((summary, fetched.records))
}
