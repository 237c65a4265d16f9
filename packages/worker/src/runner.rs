//! Drives one chunk through processing, upload and checkpointing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chirps_cog_pipeline_models::{FailedFile, ProcessedArtifact, ProgressRecord, TaskId, WorkItem};
use chirps_cog_processor::{ItemProcessor, ProcessError};
use chirps_cog_store::{BlobStore, Container, StoreError, remove_local};
use chrono::Utc;

use crate::retry::{AttemptOutcome, RetryPolicy};

/// Errors that abort a whole task.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The chunk payload could not be loaded.
    #[error(transparent)]
    Payload(#[from] crate::payload::PayloadError),

    /// The scratch workspace could not be prepared.
    #[error("Failed to prepare workspace {path}: {source}")]
    Workspace {
        /// Workspace path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Tunables for [`WorkerRunner`].
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Scratch directory for downloaded and converted files.
    pub workspace: PathBuf,
    /// Retry policy for processing and uploads.
    pub retry: RetryPolicy,
    /// Completed items between checkpoints.
    pub checkpoint_every: u64,
}

/// Processes a chunk's items in order, uploads their artifacts, and
/// checkpoints a [`ProgressRecord`] to the `batch-logs` container.
pub struct WorkerRunner {
    processor: Arc<dyn ItemProcessor>,
    store: Arc<dyn BlobStore>,
    settings: RunnerSettings,
}

/// Mutable state of one run.
struct RunState {
    task_id: TaskId,
    completed: u64,
    failed_files: Vec<FailedFile>,
    pending_cleanup: Vec<PathBuf>,
}

impl RunState {
    fn record_failure(&mut self, item: &WorkItem, error: String) {
        log::error!("  {} failed: {error}", item.source_url);
        self.failed_files.push(FailedFile {
            item: item.clone(),
            error,
        });
    }

    fn snapshot(&self) -> ProgressRecord {
        ProgressRecord {
            iso_timestamp: Utc::now(),
            task_id: self.task_id.clone(),
            completed_count: self.completed,
            failed_files: self.failed_files.clone(),
        }
    }
}

impl WorkerRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(
        processor: Arc<dyn ItemProcessor>,
        store: Arc<dyn BlobStore>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            processor,
            store,
            settings,
        }
    }

    /// Runs every item of the chunk and returns the final checkpoint.
    ///
    /// Per-item failures are recorded in the checkpoint and never abort the
    /// chunk.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Workspace`] if the scratch directories cannot
    /// be created.
    pub async fn run(
        &self,
        task_id: TaskId,
        items: &[WorkItem],
    ) -> Result<ProgressRecord, RunnerError> {
        self.prepare_workspace().await?;

        log::info!("Task {task_id}: processing {} items", items.len());
        let mut state = RunState {
            task_id,
            completed: 0,
            failed_files: Vec::new(),
            pending_cleanup: Vec::new(),
        };
        let checkpoint_every = self.settings.checkpoint_every.max(1);

        for (index, item) in items.iter().enumerate() {
            log::info!("[{}/{}] {}", index + 1, items.len(), item.source_url);

            let Some(artifact) = self.process_item(item, &mut state).await else {
                continue;
            };

            if self.upload_artifact(&artifact, item, &mut state).await {
                state.completed += 1;
                for path in [&artifact.raw_path, &artifact.cog_path] {
                    if !remove_local(path).await {
                        state.pending_cleanup.push(path.clone());
                    }
                }

                if state.completed % checkpoint_every == 0 {
                    self.checkpoint(&mut state).await;
                }
            }
        }

        let record = self.checkpoint(&mut state).await;
        log::info!(
            "Task {}: {} completed, {} failed",
            record.task_id,
            record.completed_count,
            record.failed_files.len()
        );
        Ok(record)
    }

    async fn prepare_workspace(&self) -> Result<(), RunnerError> {
        for dir in [
            self.settings.workspace.join(chirps_cog_processor::RAW_DIR),
            self.settings.workspace.join(chirps_cog_processor::COG_DIR),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| RunnerError::Workspace { path: dir, source })?;
        }
        Ok(())
    }

    /// Runs the processor under the retry policy. Partial files are removed
    /// after every failed attempt.
    async fn process_item(&self, item: &WorkItem, state: &mut RunState) -> Option<ProcessedArtifact> {
        let workspace = self.settings.workspace.as_path();
        let result = self
            .settings
            .retry
            .run(&item.source_url, |_| async move {
                let result = self.processor.process(item, workspace).await;
                if result.is_err() {
                    self.remove_partial_files(item, workspace).await;
                }
                AttemptOutcome::classify(result, ProcessError::is_retryable)
            })
            .await;

        match result {
            Ok(artifact) => Some(artifact),
            Err(failure) => {
                state.record_failure(item, failure.error.to_string());
                None
            }
        }
    }

    async fn remove_partial_files(&self, item: &WorkItem, workspace: &Path) {
        for path in self.processor.scratch_paths(item, workspace) {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                remove_local(&path).await;
            }
        }
    }

    /// Uploads the raw file then the converted file. Returns `false` and
    /// records the failure if either upload is exhausted; local files are
    /// kept in that case.
    async fn upload_artifact(
        &self,
        artifact: &ProcessedArtifact,
        item: &WorkItem,
        state: &mut RunState,
    ) -> bool {
        let uploads = [
            (Container::RawData, artifact.raw_key(), &artifact.raw_path),
            (Container::ProcessedCogs, artifact.cog_key(), &artifact.cog_path),
        ];

        for (container, key, path) in uploads {
            let label = format!("upload {container}/{key}");
            let result = self
                .settings
                .retry
                .run(&label, |_| {
                    let key = key.as_str();
                    async move {
                        AttemptOutcome::classify(
                            self.store.put_file(container, key, path).await,
                            is_retryable_upload,
                        )
                    }
                })
                .await;

            if let Err(failure) = result {
                state.record_failure(item, failure.error.to_string());
                return false;
            }
        }

        true
    }

    /// Writes the current progress record and retries pending deletions.
    /// A failed write is logged and the run continues.
    async fn checkpoint(&self, state: &mut RunState) -> ProgressRecord {
        let record = state.snapshot();

        match serde_json::to_vec_pretty(&record) {
            Ok(body) => {
                if let Err(e) = self.store.put(Container::BatchLogs, &record.key(), body).await {
                    log::error!("Checkpoint for {} failed: {e}", record.task_id);
                } else {
                    log::info!(
                        "Checkpoint {}: {} completed, {} failed",
                        record.task_id,
                        record.completed_count,
                        record.failed_files.len()
                    );
                }
            }
            Err(e) => log::error!("Failed to serialize checkpoint: {e}"),
        }

        let pending = std::mem::take(&mut state.pending_cleanup);
        for path in pending {
            if !remove_local(&path).await {
                state.pending_cleanup.push(path);
            }
        }

        record
    }
}

/// Upload errors worth retrying: transport failures, not missing local
/// files or bad credentials.
const fn is_retryable_upload(e: &StoreError) -> bool {
    matches!(e, StoreError::Upload { .. })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chirps_cog_config::ContainerNames;
    use chirps_cog_processor::{DownloadError, artifact_paths, derive_raw_name};
    use chirps_cog_store::LocalStore;

    use super::*;

    /// Writes fake artifacts, failing every attempt for URLs containing
    /// `fail_marker`. Each COG holds `cog-<attempt number>`.
    struct StubProcessor {
        fail_marker: Option<&'static str>,
        failure_status: u16,
        attempts: AtomicU32,
    }

    impl StubProcessor {
        fn new(fail_marker: Option<&'static str>, failure_status: u16) -> Self {
            Self {
                fail_marker,
                failure_status,
                attempts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ItemProcessor for StubProcessor {
        async fn process(
            &self,
            item: &WorkItem,
            workspace: &Path,
        ) -> Result<ProcessedArtifact, ProcessError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let raw_name = derive_raw_name(item)?;
            let (raw_path, cog_path) = artifact_paths(workspace, &raw_name, "nigeria-cog-");
            std::fs::write(&raw_path, b"raw").unwrap();

            if self.fail_marker.is_some_and(|m| item.source_url.contains(m)) {
                return Err(ProcessError::Download(DownloadError::HttpStatus {
                    url: item.source_url.clone(),
                    status: self.failure_status,
                }));
            }

            std::fs::write(&cog_path, format!("cog-{attempt}")).unwrap();
            Ok(ProcessedArtifact {
                year: item.year.clone(),
                raw_path,
                raw_name: raw_name.clone(),
                cog_path,
                cog_name: format!("nigeria-cog-{raw_name}"),
            })
        }

        fn scratch_paths(&self, item: &WorkItem, workspace: &Path) -> Vec<PathBuf> {
            let raw_name = derive_raw_name(item).unwrap();
            let (raw, cog) = artifact_paths(workspace, &raw_name, "nigeria-cog-");
            vec![raw, cog]
        }
    }

    /// Wraps a store, failing every put to one container and counting puts
    /// per container.
    struct FlakyStore {
        inner: LocalStore,
        failing: Option<Container>,
        puts: Mutex<Vec<Container>>,
    }

    #[async_trait]
    impl BlobStore for FlakyStore {
        async fn put(
            &self,
            container: Container,
            key: &str,
            data: Vec<u8>,
        ) -> Result<(), StoreError> {
            self.puts.lock().unwrap().push(container);
            if self.failing == Some(container) {
                return Err(StoreError::Upload {
                    container,
                    key: key.to_string(),
                    source: "connection reset".into(),
                });
            }
            self.inner.put(container, key, data).await
        }

        async fn get(&self, container: Container, key: &str) -> Result<Vec<u8>, StoreError> {
            self.inner.get(container, key).await
        }

        async fn list_keys(
            &self,
            container: Container,
            prefix: &str,
        ) -> Result<Vec<String>, StoreError> {
            self.inner.list_keys(container, prefix).await
        }

        async fn presign_get(
            &self,
            container: Container,
            key: &str,
            ttl: Duration,
        ) -> Result<String, StoreError> {
            self.inner.presign_get(container, key, ttl).await
        }
    }

    struct Fixture {
        root: PathBuf,
        store: Arc<FlakyStore>,
    }

    impl Fixture {
        fn new(name: &str, failing: Option<Container>) -> Self {
            let root = std::env::temp_dir().join(format!("chirps_cog_runner_{name}"));
            let _ = std::fs::remove_dir_all(&root);
            let names = ContainerNames {
                raw_data: "raw-data".to_string(),
                processed_cogs: "processed-cogs".to_string(),
                batch_logs: "batch-logs".to_string(),
                task_data: "task-data".to_string(),
            };
            let store = Arc::new(FlakyStore {
                inner: LocalStore::new(&root.join("store"), names),
                failing,
                puts: Mutex::new(Vec::new()),
            });
            Self { root, store }
        }

        fn runner(&self, processor: Arc<dyn ItemProcessor>, checkpoint_every: u64) -> WorkerRunner {
            WorkerRunner::new(
                processor,
                self.store.clone(),
                RunnerSettings {
                    workspace: self.workspace(),
                    retry: RetryPolicy::immediate(3),
                    checkpoint_every,
                },
            )
        }

        fn workspace(&self) -> PathBuf {
            self.root.join("workspace")
        }

        fn puts_to(&self, container: Container) -> usize {
            self.store
                .puts
                .lock()
                .unwrap()
                .iter()
                .filter(|c| **c == container)
                .count()
        }

        async fn stored_record(&self, task_id: &TaskId) -> ProgressRecord {
            let body = self
                .store
                .get(Container::BatchLogs, &chirps_cog_pipeline_models::record_key(task_id))
                .await
                .unwrap();
            serde_json::from_slice(&body).unwrap()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    fn items(count: usize) -> Vec<WorkItem> {
        (1..=count)
            .map(|day| {
                WorkItem::new(
                    "1995",
                    format!("https://host/1995/chirps-v2.0.1995.01.{day:02}.tif.gz"),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn retries_until_exhausted_then_records_failure() {
        let fixture = Fixture::new("exhaustion", None);
        let processor = Arc::new(StubProcessor::new(Some("1995.01"), 503));
        let runner = fixture.runner(processor.clone(), 10);

        let record = runner.run(TaskId::from_index(0), &items(1)).await.unwrap();

        assert_eq!(processor.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(record.completed_count, 0);
        assert_eq!(record.failed_files.len(), 1);
        assert!(record.failed_files[0].error.contains("HTTP 503"));

        // partial raw file removed after each failed attempt
        let raw = fixture
            .workspace()
            .join("raw-data/chirps-v2.0.1995.01.01.tif");
        assert!(!raw.exists());
    }

    #[tokio::test]
    async fn permanent_client_errors_are_not_retried() {
        let fixture = Fixture::new("permanent", None);
        let processor = Arc::new(StubProcessor::new(Some("1995.01.02"), 404));
        let runner = fixture.runner(processor.clone(), 10);

        let record = runner.run(TaskId::from_index(1), &items(2)).await.unwrap();

        assert_eq!(processor.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(record.completed_count, 1);
        assert_eq!(record.failed_files.len(), 1);
    }

    #[tokio::test]
    async fn one_failing_item_does_not_affect_the_others() {
        let fixture = Fixture::new("isolation", None);
        let processor = Arc::new(StubProcessor::new(Some("1995.01.03"), 500));
        let runner = fixture.runner(processor, 10);
        let task_id = TaskId::from_index(4);

        let record = runner.run(task_id.clone(), &items(5)).await.unwrap();

        assert_eq!(record.completed_count, 4);
        assert_eq!(record.failed_files.len(), 1);
        assert_eq!(
            record.failed_files[0].item.source_url,
            "https://host/1995/chirps-v2.0.1995.01.03.tif.gz"
        );

        let cogs = fixture
            .store
            .list_keys(Container::ProcessedCogs, "1995/")
            .await
            .unwrap();
        assert_eq!(cogs.len(), 4);
        assert!(!cogs.contains(&"1995/nigeria-cog-chirps-v2.0.1995.01.03.tif".to_string()));

        let raws = fixture
            .store
            .list_keys(Container::RawData, "1995/")
            .await
            .unwrap();
        assert_eq!(raws.len(), 4);

        // uploaded artifacts are deleted locally
        let leftover: Vec<_> = std::fs::read_dir(fixture.workspace().join("processed-cogs"))
            .unwrap()
            .collect();
        assert!(leftover.is_empty());

        assert_eq!(fixture.stored_record(&task_id).await, record);
    }

    #[tokio::test]
    async fn checkpoints_periodically_and_after_last_item() {
        let fixture = Fixture::new("checkpoints", None);
        let runner = fixture.runner(Arc::new(StubProcessor::new(None, 500)), 2);
        let task_id = TaskId::from_index(7);

        let record = runner.run(task_id.clone(), &items(5)).await.unwrap();

        // after items 2 and 4, then the final one
        assert_eq!(fixture.puts_to(Container::BatchLogs), 3);
        assert_eq!(record.completed_count, 5);

        let stored = fixture.stored_record(&task_id).await;
        assert_eq!(stored.completed_count, 5);
        assert_eq!(stored.task_id, task_id);
    }

    #[tokio::test]
    async fn failed_checkpoint_write_does_not_abort() {
        let fixture = Fixture::new("checkpoint_failure", Some(Container::BatchLogs));
        let runner = fixture.runner(Arc::new(StubProcessor::new(None, 500)), 1);

        let record = runner.run(TaskId::from_index(2), &items(3)).await.unwrap();

        assert_eq!(record.completed_count, 3);
        assert_eq!(fixture.puts_to(Container::BatchLogs), 4);
    }

    #[tokio::test]
    async fn exhausted_upload_keeps_local_files() {
        let fixture = Fixture::new("upload_failure", Some(Container::ProcessedCogs));
        let runner = fixture.runner(Arc::new(StubProcessor::new(None, 500)), 10);

        let record = runner.run(TaskId::from_index(3), &items(1)).await.unwrap();

        assert_eq!(record.completed_count, 0);
        assert_eq!(record.failed_files.len(), 1);
        assert!(record.failed_files[0].error.contains("Failed to upload"));
        assert_eq!(fixture.puts_to(Container::ProcessedCogs), 3);
        assert!(
            fixture
                .workspace()
                .join("processed-cogs/nigeria-cog-chirps-v2.0.1995.01.01.tif")
                .exists()
        );
    }

    #[tokio::test]
    async fn rerunning_a_chunk_overwrites_artifacts_and_record() {
        let fixture = Fixture::new("rerun", None);
        let runner = fixture.runner(Arc::new(StubProcessor::new(None, 500)), 10);
        let task_id = TaskId::from_index(9);
        let first_cog = "1995/nigeria-cog-chirps-v2.0.1995.01.01.tif";

        runner.run(task_id.clone(), &items(2)).await.unwrap();
        assert_eq!(
            fixture.store.get(Container::ProcessedCogs, first_cog).await.unwrap(),
            b"cog-1"
        );

        let record = runner.run(task_id.clone(), &items(2)).await.unwrap();
        assert_eq!(record.completed_count, 2);
        let cogs = fixture
            .store
            .list_keys(Container::ProcessedCogs, "")
            .await
            .unwrap();
        assert_eq!(cogs.len(), 2);
        assert_eq!(
            fixture.store.get(Container::ProcessedCogs, first_cog).await.unwrap(),
            b"cog-3"
        );

        // A later run that loses an item replaces the record rather than
        // merging into it.
        let failing = fixture.runner(Arc::new(StubProcessor::new(Some("1995.01.02"), 404)), 10);
        failing.run(task_id.clone(), &items(2)).await.unwrap();
        let stored = fixture.stored_record(&task_id).await;
        assert_eq!(stored.completed_count, 1);
        assert_eq!(stored.failed_files.len(), 1);
        assert_eq!(
            stored.failed_files[0].item.source_url,
            "https://host/1995/chirps-v2.0.1995.01.02.tif.gz"
        );
    }
}
