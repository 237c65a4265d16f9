#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Fan-out of chunks to the remote batch service.
//!
//! A dispatch creates one job named `<prefix>-<YYYYmmdd-HHMMSS>` and adds
//! one task per chunk. Each task receives its work items either inline in
//! `WORK_ITEMS_JSON` or, when the serialized chunk is too large for an
//! environment variable, as a presigned URL in `WORK_ITEMS_URL` pointing at
//! a blob in the `task-data` container.
//!
//! Tasks are added in collections of at most [`MAX_TASKS_PER_COLLECTION`].
//! Rejections never abort accepted tasks; they are collected and returned
//! together in a [`SubmissionError`].

pub mod batch;
pub mod chunker;
pub mod credentials;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chirps_cog_config::BatchConfig;
use chirps_cog_pipeline_models::{
    Chunk, TaskId, WORK_ITEMS_JSON_VAR, WORK_ITEMS_URL_VAR, WorkItem,
};
use chirps_cog_store::{BlobStore, Container};
use chrono::{DateTime, Utc};

pub use batch::{BatchError, BatchServiceClient, RejectedTask, TaskOutcome, TaskSpec, TaskSubmitter};
pub use chunker::{ChunkError, chunk};
pub use credentials::{
    AccessToken, CachedCredentials, ClientSecretTokenSource, CredentialError, CredentialProvider,
    StaticToken, TokenSource,
};

/// The batch service accepts at most this many tasks per collection.
pub const MAX_TASKS_PER_COLLECTION: usize = 100;

/// Errors that stop a dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// There was nothing to dispatch.
    #[error("No chunks to dispatch")]
    NoChunks,

    /// The job could not be created; no tasks were submitted.
    #[error("Failed to create job {job_id}: {source}")]
    JobCreation {
        /// Job that was being created.
        job_id: String,
        /// Underlying error.
        source: BatchError,
    },

    /// Some tasks were rejected.
    #[error(transparent)]
    Submission(#[from] SubmissionError),

    /// A chunk could not be serialized.
    #[error("Failed to encode chunk payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// How a task receives its work items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadKind {
    /// Serialized into `WORK_ITEMS_JSON`.
    Inline,
    /// Uploaded to `task-data/<key>` and passed as a presigned URL.
    Reference {
        /// Key of the payload blob.
        key: String,
    },
}

/// A task the service accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    /// The task's id.
    pub task_id: TaskId,
    /// Number of work items the task will process.
    pub item_count: usize,
    /// How its payload was delivered.
    pub payload: PayloadKind,
}

/// A fully accepted dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    /// The job the tasks belong to.
    pub job_id: String,
    /// One handle per chunk, in chunk order.
    pub tasks: Vec<TaskHandle>,
}

/// A dispatch in which at least one task was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionError {
    /// The job the tasks belong to.
    pub job_id: String,
    /// Tasks that were accepted and are running.
    pub accepted: Vec<TaskHandle>,
    /// Every rejected task with the provider's reason.
    pub rejected: Vec<RejectedTask>,
}

impl fmt::Display for SubmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} tasks rejected in job {}",
            self.rejected.len(),
            self.rejected.len() + self.accepted.len(),
            self.job_id
        )
    }
}

impl std::error::Error for SubmissionError {}

/// What a dispatch would submit for one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTask {
    /// Task id derived from the chunk index.
    pub task_id: TaskId,
    /// Items in the chunk.
    pub item_count: usize,
    /// Size of the serialized payload.
    pub payload_bytes: usize,
    /// Whether the payload fits inline.
    pub inline: bool,
}

/// Dispatch parameters taken from [`BatchConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Prefix of generated job ids.
    pub job_prefix: String,
    /// Command every task runs.
    pub command_line: String,
    /// Largest payload, in bytes, passed inline.
    pub inline_payload_limit: usize,
    /// Validity of presigned payload URLs.
    pub payload_url_ttl: Duration,
}

impl DispatchSettings {
    /// Reads the dispatch settings from `config`.
    #[must_use]
    pub fn from_config(config: &BatchConfig) -> Self {
        Self {
            job_prefix: config.job_prefix.clone(),
            command_line: config.command_line.clone(),
            inline_payload_limit: config.inline_payload_limit,
            payload_url_ttl: config.payload_url_ttl(),
        }
    }
}

/// Builds a job id of the form `<prefix>-<YYYYmmdd-HHMMSS>`.
#[must_use]
pub fn job_id(prefix: &str, now: DateTime<Utc>) -> String {
    format!("{prefix}-{}", now.format("%Y%m%d-%H%M%S"))
}

/// Store key of an uploaded payload.
#[must_use]
pub fn payload_key(job_id: &str, task_id: &TaskId) -> String {
    format!("{job_id}/{task_id}_work_items.json")
}

fn encode_items(items: &[WorkItem]) -> Result<String, serde_json::Error> {
    serde_json::to_string(items)
}

/// Describes what [`Dispatcher::dispatch`] would submit, without side
/// effects.
///
/// # Errors
///
/// Returns [`DispatchError::Encode`] if a chunk cannot be serialized.
pub fn plan(chunks: &[Chunk], settings: &DispatchSettings) -> Result<Vec<PlannedTask>, DispatchError> {
    chunks
        .iter()
        .map(|chunk| {
            let payload_bytes = encode_items(&chunk.items)?.len();
            Ok(PlannedTask {
                task_id: chunk.task_id(),
                item_count: chunk.len(),
                payload_bytes,
                inline: payload_bytes <= settings.inline_payload_limit,
            })
        })
        .collect()
}

/// Submits chunks as tasks of a new job.
pub struct Dispatcher {
    submitter: Arc<dyn TaskSubmitter>,
    store: Arc<dyn BlobStore>,
    settings: DispatchSettings,
}

/// A task ready to submit, with the handle it becomes on acceptance.
struct Prepared {
    spec: TaskSpec,
    handle: TaskHandle,
}

impl Dispatcher {
    /// Creates a dispatcher. `store` receives oversized payloads.
    #[must_use]
    pub fn new(
        submitter: Arc<dyn TaskSubmitter>,
        store: Arc<dyn BlobStore>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            submitter,
            store,
            settings,
        }
    }

    /// Creates a job and submits one task per chunk.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::JobCreation`] if the job cannot be created,
    /// or [`DispatchError::Submission`] listing every rejected task (the
    /// accepted ones keep running).
    pub async fn dispatch(&self, chunks: &[Chunk]) -> Result<Dispatched, DispatchError> {
        self.dispatch_at(chunks, Utc::now()).await
    }

    async fn dispatch_at(
        &self,
        chunks: &[Chunk],
        now: DateTime<Utc>,
    ) -> Result<Dispatched, DispatchError> {
        if chunks.is_empty() {
            return Err(DispatchError::NoChunks);
        }

        let job_id = job_id(&self.settings.job_prefix, now);
        log::info!("Job ID: {job_id}");
        self.submitter
            .create_job(&job_id)
            .await
            .map_err(|source| DispatchError::JobCreation {
                job_id: job_id.clone(),
                source,
            })?;

        let mut accepted = Vec::with_capacity(chunks.len());
        let mut rejected = Vec::new();

        for (batch_number, batch) in chunks.chunks(MAX_TASKS_PER_COLLECTION).enumerate() {
            let mut prepared = Vec::with_capacity(batch.len());
            for chunk in batch {
                match self.prepare(&job_id, chunk).await {
                    Ok(task) => prepared.push(task),
                    Err(rejection) => {
                        log::error!(
                            "Failed to stage payload for {}: {}",
                            rejection.task_id,
                            rejection.message
                        );
                        rejected.push(rejection);
                    }
                }
            }
            if prepared.is_empty() {
                continue;
            }

            let specs: Vec<TaskSpec> = prepared.iter().map(|p| p.spec.clone()).collect();
            match self.submitter.submit_tasks(&job_id, &specs).await {
                Ok(outcomes) => {
                    for (task, outcome) in prepared.into_iter().zip(outcomes) {
                        match outcome {
                            Ok(_) => accepted.push(task.handle),
                            Err(rejection) => {
                                log::error!(
                                    "Task {} rejected: {} - {}",
                                    rejection.task_id,
                                    rejection.code,
                                    rejection.message
                                );
                                rejected.push(rejection);
                            }
                        }
                    }
                }
                Err(e) => {
                    log::error!("Task collection {batch_number} failed: {e}");
                    let message = e.to_string();
                    rejected.extend(prepared.into_iter().map(|p| RejectedTask {
                        task_id: p.spec.id,
                        code: "RequestFailed".to_string(),
                        message: message.clone(),
                    }));
                }
            }
            log::info!(
                "Submitted collection {batch_number}: {} accepted so far",
                accepted.len()
            );
        }

        log::info!(
            "Dispatched {} tasks to job {job_id} ({} rejected)",
            accepted.len(),
            rejected.len()
        );

        if rejected.is_empty() {
            Ok(Dispatched {
                job_id,
                tasks: accepted,
            })
        } else {
            Err(SubmissionError {
                job_id,
                accepted,
                rejected,
            }
            .into())
        }
    }

    /// Serializes a chunk's payload, uploading it when too large to inline.
    async fn prepare(&self, job_id: &str, chunk: &Chunk) -> Result<Prepared, RejectedTask> {
        let task_id = chunk.task_id();
        let reject = |code: &str, message: String| RejectedTask {
            task_id: task_id.clone(),
            code: code.to_string(),
            message,
        };

        let payload = encode_items(&chunk.items).map_err(|e| reject("EncodeFailed", e.to_string()))?;

        let (environment, payload_kind) = if payload.len() <= self.settings.inline_payload_limit {
            (vec![(WORK_ITEMS_JSON_VAR.to_string(), payload)], PayloadKind::Inline)
        } else {
            let key = payload_key(job_id, &task_id);
            log::info!(
                "{task_id} payload is {} bytes, uploading to {}/{key}",
                payload.len(),
                Container::TaskData
            );
            self.store
                .put(Container::TaskData, &key, payload.into_bytes())
                .await
                .map_err(|e| reject("PayloadUploadFailed", e.to_string()))?;
            let url = self
                .store
                .presign_get(Container::TaskData, &key, self.settings.payload_url_ttl)
                .await
                .map_err(|e| reject("PayloadUploadFailed", e.to_string()))?;
            (
                vec![(WORK_ITEMS_URL_VAR.to_string(), url)],
                PayloadKind::Reference { key },
            )
        };

        Ok(Prepared {
            spec: TaskSpec {
                id: task_id.clone(),
                command_line: self.settings.command_line.clone(),
                environment,
            },
            handle: TaskHandle {
                task_id,
                item_count: chunk.len(),
                payload: payload_kind,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chirps_cog_config::{ContainerNames, PipelineConfig};
    use chirps_cog_store::LocalStore;

    use super::*;

    /// Records calls; rejects listed task ids and fails listed collections.
    #[derive(Default)]
    struct FakeSubmitter {
        fail_job: bool,
        reject: Vec<String>,
        fail_collections: Vec<usize>,
        jobs: Mutex<Vec<String>>,
        collections: Mutex<Vec<Vec<TaskSpec>>>,
    }

    #[async_trait]
    impl TaskSubmitter for FakeSubmitter {
        async fn create_job(&self, job_id: &str) -> Result<(), BatchError> {
            if self.fail_job {
                return Err(BatchError::Status {
                    operation: "Create job".to_string(),
                    status: 403,
                    body: "forbidden".to_string(),
                });
            }
            self.jobs.lock().unwrap().push(job_id.to_string());
            Ok(())
        }

        async fn submit_tasks(
            &self,
            _job_id: &str,
            tasks: &[TaskSpec],
        ) -> Result<Vec<TaskOutcome>, BatchError> {
            let mut collections = self.collections.lock().unwrap();
            let number = collections.len();
            collections.push(tasks.to_vec());
            if self.fail_collections.contains(&number) {
                return Err(BatchError::Status {
                    operation: "Add task collection".to_string(),
                    status: 500,
                    body: "boom".to_string(),
                });
            }

            Ok(tasks
                .iter()
                .map(|t| {
                    if self.reject.iter().any(|r| r == t.id.as_str()) {
                        Err(RejectedTask {
                            task_id: t.id.clone(),
                            code: "TaskExists".to_string(),
                            message: "already exists".to_string(),
                        })
                    } else {
                        Ok(t.id.clone())
                    }
                })
                .collect())
        }
    }

    fn chunks(count: usize, size: usize) -> Vec<Chunk> {
        let items: Vec<WorkItem> = (0..count * size)
            .map(|i| WorkItem::new("2010", format!("https://host/2010/chirps-v2.0.{i}.tif.gz")))
            .collect();
        chunk(&items, size).unwrap()
    }

    fn settings(inline_payload_limit: usize) -> DispatchSettings {
        DispatchSettings {
            job_prefix: "chirps-processing".to_string(),
            command_line: "chirps_cog run-task".to_string(),
            inline_payload_limit,
            payload_url_ttl: Duration::from_secs(48 * 3600),
        }
    }

    fn temp_store(name: &str) -> (Arc<LocalStore>, PathBuf) {
        let root = std::env::temp_dir().join(format!("chirps_cog_dispatch_{name}"));
        let _ = std::fs::remove_dir_all(&root);
        let names = ContainerNames {
            raw_data: "raw-data".to_string(),
            processed_cogs: "processed-cogs".to_string(),
            batch_logs: "batch-logs".to_string(),
            task_data: "task-data".to_string(),
        };
        (Arc::new(LocalStore::new(&root, names)), root)
    }

    fn now() -> DateTime<Utc> {
        chirps_cog_pipeline_models::parse_timestamp("2024-03-01T12:34:56Z").unwrap()
    }

    #[test]
    fn job_id_embeds_timestamp() {
        assert_eq!(
            job_id("chirps-processing", now()),
            "chirps-processing-20240301-123456"
        );
    }

    #[test]
    fn settings_from_config_saturate_huge_ttl() {
        let config = PipelineConfig::from_toml_overrides(Some(
            "[batch]\npayload_url_ttl_hours = 9223372036854775807",
        ))
        .unwrap();
        let settings = DispatchSettings::from_config(&config.batch);
        assert_eq!(settings.payload_url_ttl, Duration::from_secs(u64::MAX));

        let defaults = DispatchSettings::from_config(&PipelineConfig::defaults().unwrap().batch);
        assert_eq!(defaults.payload_url_ttl, Duration::from_secs(48 * 3600));
    }

    #[tokio::test]
    async fn small_chunks_are_inlined() {
        let (store, root) = temp_store("inline");
        let submitter = Arc::new(FakeSubmitter::default());
        let dispatcher = Dispatcher::new(submitter.clone(), store, settings(32 * 1024));

        let input = chunks(3, 4);
        let dispatched = dispatcher.dispatch_at(&input, now()).await.unwrap();

        assert_eq!(dispatched.job_id, "chirps-processing-20240301-123456");
        assert_eq!(dispatched.tasks.len(), 3);
        assert!(dispatched.tasks.iter().all(|t| t.payload == PayloadKind::Inline));

        let collections = submitter.collections.lock().unwrap();
        let spec = &collections[0][1];
        assert_eq!(spec.id.as_str(), "task_001");
        assert_eq!(spec.command_line, "chirps_cog run-task");
        let (name, value) = &spec.environment[0];
        assert_eq!(name, WORK_ITEMS_JSON_VAR);
        let items: Vec<WorkItem> = serde_json::from_str(value).unwrap();
        assert_eq!(items, input[1].items);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn oversized_chunks_are_uploaded_and_referenced() {
        let (store, root) = temp_store("reference");
        let submitter = Arc::new(FakeSubmitter::default());
        let dispatcher = Dispatcher::new(submitter.clone(), store.clone(), settings(64));

        let input = chunks(1, 5);
        let dispatched = dispatcher.dispatch_at(&input, now()).await.unwrap();

        let key = "chirps-processing-20240301-123456/task_000_work_items.json";
        assert_eq!(
            dispatched.tasks[0].payload,
            PayloadKind::Reference {
                key: key.to_string()
            }
        );

        let stored = store.get(Container::TaskData, key).await.unwrap();
        let items: Vec<WorkItem> = serde_json::from_slice(&stored).unwrap();
        assert_eq!(items, input[0].items);

        let collections = submitter.collections.lock().unwrap();
        let (name, value) = &collections[0][0].environment[0];
        assert_eq!(name, WORK_ITEMS_URL_VAR);
        assert!(value.starts_with("file://"));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn submits_in_collections_of_one_hundred() {
        let (store, root) = temp_store("collections");
        let submitter = Arc::new(FakeSubmitter::default());
        let dispatcher = Dispatcher::new(submitter.clone(), store, settings(32 * 1024));

        let dispatched = dispatcher.dispatch_at(&chunks(250, 1), now()).await.unwrap();
        assert_eq!(dispatched.tasks.len(), 250);

        let sizes: Vec<usize> = submitter
            .collections
            .lock()
            .unwrap()
            .iter()
            .map(Vec::len)
            .collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(submitter.jobs.lock().unwrap().len(), 1);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn rejections_are_reported_without_aborting_accepted_tasks() {
        let (store, root) = temp_store("rejections");
        let submitter = Arc::new(FakeSubmitter {
            reject: vec!["task_003".to_string()],
            fail_collections: vec![1],
            ..FakeSubmitter::default()
        });
        let dispatcher = Dispatcher::new(submitter.clone(), store, settings(32 * 1024));

        let err = dispatcher.dispatch_at(&chunks(150, 1), now()).await.unwrap_err();
        let failure = match err {
            DispatchError::Submission(failure) => failure,
            other => panic!("expected a submission error, got {other}"),
        };

        assert_eq!(failure.accepted.len(), 99);
        assert_eq!(failure.rejected.len(), 51);
        assert_eq!(failure.rejected[0].task_id.as_str(), "task_003");
        assert_eq!(failure.rejected[0].code, "TaskExists");
        assert!(failure.rejected[1..].iter().all(|r| r.code == "RequestFailed"));
        assert_eq!(failure.rejected[1].task_id.as_str(), "task_100");
        assert_eq!(
            failure.to_string(),
            "51 of 150 tasks rejected in job chirps-processing-20240301-123456"
        );

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn job_creation_failure_submits_nothing() {
        let (store, root) = temp_store("job_failure");
        let submitter = Arc::new(FakeSubmitter {
            fail_job: true,
            ..FakeSubmitter::default()
        });
        let dispatcher = Dispatcher::new(submitter.clone(), store, settings(32 * 1024));

        let err = dispatcher.dispatch_at(&chunks(2, 2), now()).await.unwrap_err();
        assert!(matches!(err, DispatchError::JobCreation { .. }));
        assert!(submitter.collections.lock().unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn empty_input_is_rejected() {
        let (store, root) = temp_store("empty");
        let dispatcher = Dispatcher::new(Arc::new(FakeSubmitter::default()), store, settings(1));
        assert!(matches!(
            dispatcher.dispatch(&[]).await,
            Err(DispatchError::NoChunks)
        ));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn plan_marks_inline_payloads() {
        let input = chunks(2, 3);
        let planned = plan(&input, &settings(100)).unwrap();
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0].task_id.as_str(), "task_000");
        assert_eq!(planned[0].item_count, 3);
        assert!(planned[0].payload_bytes > 100);
        assert!(!planned[0].inline);

        let planned = plan(&input, &settings(usize::MAX)).unwrap();
        assert!(planned.iter().all(|p| p.inline));
    }
}
