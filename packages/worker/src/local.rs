//! Single-machine mode: convert items concurrently, no uploads.

use std::path::Path;
use std::sync::Arc;

use chirps_cog_pipeline_models::{FailedFile, WorkItem};
use chirps_cog_processor::ItemProcessor;
use futures::StreamExt as _;
use tokio::sync::Mutex;

use crate::progress::ProgressCallback;

/// Outcome of a local run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalRunReport {
    /// Items converted successfully.
    pub succeeded: u64,
    /// Items that failed, with their errors.
    pub failed: Vec<FailedFile>,
}

/// Converts `items` with up to `concurrency` in flight at once. Outputs stay
/// in `workspace`.
///
/// Each item gets a single attempt; failures are collected and returned.
pub async fn run_local(
    items: Vec<WorkItem>,
    processor: Arc<dyn ItemProcessor>,
    workspace: &Path,
    concurrency: usize,
    progress: Arc<dyn ProgressCallback>,
) -> LocalRunReport {
    let total = items.len() as u64;
    progress.set_total(total);
    progress.set_message("Processing files".to_string());
    log::info!(
        "Processing {total} files with concurrency {}",
        concurrency.max(1)
    );

    let failed: Arc<Mutex<Vec<FailedFile>>> = Arc::new(Mutex::new(Vec::new()));

    let succeeded = futures::stream::iter(items)
        .map(|item| {
            let processor = Arc::clone(&processor);
            let failed = Arc::clone(&failed);
            let progress = Arc::clone(&progress);
            async move {
                let ok = match processor.process(&item, workspace).await {
                    Ok(_) => true,
                    Err(e) => {
                        log::error!("Failed: {} - Error: {e}", item.source_url);
                        failed.lock().await.push(FailedFile {
                            item,
                            error: e.to_string(),
                        });
                        false
                    }
                };
                progress.inc(1);
                ok
            }
        })
        .buffer_unordered(concurrency.max(1))
        .fold(0u64, |count, ok| async move { count + u64::from(ok) })
        .await;

    let failed = std::mem::take(&mut *failed.lock().await);
    progress.finish(format!(
        "Completed! {} files failed out of {total} total",
        failed.len()
    ));

    LocalRunReport { succeeded, failed }
}
