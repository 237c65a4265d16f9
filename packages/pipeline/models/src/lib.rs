#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared types for the CHIRPS COG batch pipeline.
//!
//! Everything that crosses a process boundary lives here: the work items
//! handed to remote tasks, the chunks they are grouped into, and the
//! progress records workers drop into the `batch-logs` container. The JSON
//! shapes of [`WorkItem`] and [`ProgressRecord`] are persisted and read back
//! by other processes, so field names are part of the contract.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Environment variable carrying a chunk's work items as inline JSON.
pub const WORK_ITEMS_JSON_VAR: &str = "WORK_ITEMS_JSON";

/// Environment variable carrying a URL to a chunk's work items.
pub const WORK_ITEMS_URL_VAR: &str = "WORK_ITEMS_URL";

/// Environment variable the batch service sets to the running task's id.
pub const TASK_ID_VAR: &str = "AZ_BATCH_TASK_ID";

/// Task id used when [`TASK_ID_VAR`] is unset.
pub const UNKNOWN_TASK_ID: &str = "unknown_task";

// ---------------------------------------------------------------------------
// Work items and chunks
// ---------------------------------------------------------------------------

/// One source file plus the year partition it belongs to.
///
/// Serialized as `{"year": "...", "url": "..."}`. The `source_url` key is
/// accepted as an alias when reading.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    /// Year label of the listing the file was found in (e.g. `"1995"`).
    pub year: String,
    /// Absolute URL of the compressed source raster.
    #[serde(rename = "url", alias = "source_url")]
    pub source_url: String,
}

impl WorkItem {
    /// Creates a new work item.
    #[must_use]
    pub fn new(year: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            year: year.into(),
            source_url: source_url.into(),
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.source_url, self.year)
    }
}

/// A fixed-size, ordered group of work items bound to one remote task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position of the chunk in the run, assigned at creation.
    pub index: usize,
    /// Items in processing order.
    pub items: Vec<WorkItem>,
}

impl Chunk {
    /// The task id derived from this chunk's index.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        TaskId::from_index(self.index)
    }

    /// Number of items in the chunk.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the chunk holds no items.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Task ids
// ---------------------------------------------------------------------------

/// Identifier of a remote task, `task_<index zero-padded to 3 digits>`.
///
/// Progress records written by older workers may carry the bare chunk
/// number instead of a string; those deserialize to the same padded form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Builds the task id for a chunk index.
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        Self(format!("task_{index:03}"))
    }

    /// Wraps an id handed to us by the batch service.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Self(s),
            Raw::Number(n) => Self(format!("task_{n:03}")),
        })
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Local files produced by converting one work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedArtifact {
    /// Year partition, used as the key prefix in the durable store.
    pub year: String,
    /// Path of the decompressed source raster.
    pub raw_path: PathBuf,
    /// File name of the decompressed source raster.
    pub raw_name: String,
    /// Path of the clipped, tiled output.
    pub cog_path: PathBuf,
    /// File name of the clipped, tiled output.
    pub cog_name: String,
}

impl ProcessedArtifact {
    /// Store key of the raw raster: `<year>/<raw_name>`.
    #[must_use]
    pub fn raw_key(&self) -> String {
        format!("{}/{}", self.year, self.raw_name)
    }

    /// Store key of the converted raster: `<year>/<cog_name>`.
    #[must_use]
    pub fn cog_key(&self) -> String {
        format!("{}/{}", self.year, self.cog_name)
    }
}

// ---------------------------------------------------------------------------
// Progress records
// ---------------------------------------------------------------------------

/// A work item that could not be processed, with the last error seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedFile {
    /// The item that failed.
    pub item: WorkItem,
    /// Display form of the final error.
    #[serde(rename = "Error")]
    pub error: String,
}

/// A task's checkpointed state, stored at `batch-logs/<task_id>.json`.
///
/// Each checkpoint overwrites the previous one, so the store only ever
/// holds the latest state per task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Time the checkpoint was written.
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub iso_timestamp: DateTime<Utc>,
    /// Task that wrote the record.
    #[serde(rename = "batch_number")]
    pub task_id: TaskId,
    /// Items fully processed and uploaded so far.
    #[serde(rename = "completed")]
    pub completed_count: u64,
    /// Items that exhausted their retries.
    #[serde(default)]
    pub failed_files: Vec<FailedFile>,
}

impl ProgressRecord {
    /// Store key for this record's task.
    #[must_use]
    pub fn key(&self) -> String {
        record_key(&self.task_id)
    }
}

/// Store key of the progress record for `task_id`.
#[must_use]
pub fn record_key(task_id: &TaskId) -> String {
    format!("{task_id}.json")
}

/// Accepts RFC 3339 timestamps and naive ISO-8601 timestamps (read as UTC).
fn deserialize_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| {
        serde::de::Error::custom(format!("invalid ISO-8601 timestamp: {raw}"))
    })
}

/// Parses an ISO-8601 timestamp with or without a UTC offset.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// Aggregated views
// ---------------------------------------------------------------------------

/// Fleet-wide progress derived from every task's latest record.
///
/// Never persisted; recomputed from scratch on every poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalProgressSummary {
    /// Sum of `completed` across records.
    pub total_completed: u64,
    /// Sum of failed-file entries across records.
    pub total_failed: u64,
    /// `record count × chunk size`; the true total is not persisted.
    pub estimated_total: u64,
    /// `total_completed / estimated_total × 100`, or 0 with no records.
    pub completion_percentage: f64,
    /// Tasks whose last checkpoint is within the staleness window.
    pub active_tasks: usize,
    /// Tasks whose last checkpoint is older than the staleness window.
    pub stalled_tasks: Vec<TaskId>,
    /// Number of records that contributed.
    pub total_tasks: usize,
    /// Records that could not be read or parsed.
    pub skipped_records: usize,
}

/// One row of the failed-items report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItemReport {
    /// Task whose record listed the failure.
    pub task_id: TaskId,
    /// The item that failed.
    pub item: WorkItem,
    /// Final error message.
    pub error: String,
    /// Timestamp of the record the failure was read from.
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_is_zero_padded() {
        assert_eq!(TaskId::from_index(0).as_str(), "task_000");
        assert_eq!(TaskId::from_index(42).as_str(), "task_042");
        assert_eq!(TaskId::from_index(1234).as_str(), "task_1234");
    }

    #[test]
    fn work_item_uses_url_key() {
        let item = WorkItem::new("1995", "https://example.com/1995/a.tif.gz");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["url"], "https://example.com/1995/a.tif.gz");
        assert_eq!(json["year"], "1995");

        let aliased: WorkItem =
            serde_json::from_str(r#"{"year":"1995","source_url":"https://example.com/x"}"#)
                .unwrap();
        assert_eq!(aliased.source_url, "https://example.com/x");
    }

    #[test]
    fn progress_record_matches_persisted_schema() {
        let record = ProgressRecord {
            iso_timestamp: parse_timestamp("2024-03-01T12:00:00Z").unwrap(),
            task_id: TaskId::from_index(7),
            completed_count: 12,
            failed_files: vec![FailedFile {
                item: WorkItem::new("1981", "https://example.com/1981/b.tif.gz"),
                error: "HTTP 404".to_string(),
            }],
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["batch_number"], "task_007");
        assert_eq!(json["completed"], 12);
        assert_eq!(json["failed_files"][0]["Error"], "HTTP 404");
        assert_eq!(json["failed_files"][0]["item"]["year"], "1981");
        assert!(json["iso_timestamp"].as_str().unwrap().starts_with("2024-03-01T12:00:00"));
        assert_eq!(record.key(), "task_007.json");
    }

    #[test]
    fn reads_naive_timestamps_and_numeric_batch_numbers() {
        let raw = r#"{
            "iso_timestamp": "2024-03-01T12:30:15.123456",
            "batch_number": 3,
            "completed": 5,
            "failed_files": []
        }"#;
        let record: ProgressRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.task_id.as_str(), "task_003");
        assert_eq!(record.completed_count, 5);
        assert_eq!(
            record.iso_timestamp,
            parse_timestamp("2024-03-01T12:30:15.123456Z").unwrap()
        );
    }

    #[test]
    fn rejects_garbage_timestamp() {
        let raw = r#"{"iso_timestamp":"yesterday","batch_number":"task_001","completed":0}"#;
        assert!(serde_json::from_str::<ProgressRecord>(raw).is_err());
    }

    #[test]
    fn artifact_keys_are_year_prefixed() {
        let artifact = ProcessedArtifact {
            year: "2001".to_string(),
            raw_path: PathBuf::from("/tmp/raw-data/a.tif"),
            raw_name: "a.tif".to_string(),
            cog_path: PathBuf::from("/tmp/processed-cogs/nigeria-cog-a.tif"),
            cog_name: "nigeria-cog-a.tif".to_string(),
        };
        assert_eq!(artifact.raw_key(), "2001/a.tif");
        assert_eq!(artifact.cog_key(), "2001/nigeria-cog-a.tif");
    }
}
