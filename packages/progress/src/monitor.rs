//! Continuous status polling.

use std::future::Future;
use std::time::Duration;

use chirps_cog_store::BlobStore;
use chrono::Utc;

use crate::{current_summary, render_summary};

/// Parameters of a monitoring loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Time between polls.
    pub interval: Duration,
    /// Staleness window for stalled-task detection.
    pub stale_after: Duration,
    /// Items per chunk, for the estimated total.
    pub chunk_size: usize,
}

/// Polls the store every `settings.interval` and passes each rendered
/// report to `emit`, until Ctrl-C.
pub async fn monitor(store: &dyn BlobStore, settings: MonitorSettings, emit: impl FnMut(&str)) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };
    monitor_until(store, settings, emit, ctrl_c).await;
}

/// Like [`monitor`], but stops when `shutdown` completes.
///
/// A poll that fails to list the store is logged and retried at the next
/// interval.
pub async fn monitor_until(
    store: &dyn BlobStore,
    settings: MonitorSettings,
    mut emit: impl FnMut(&str),
    shutdown: impl Future<Output = ()>,
) {
    log::info!(
        "Starting continuous monitoring (checking every {} minutes)",
        settings.interval.as_secs() / 60
    );
    tokio::pin!(shutdown);

    loop {
        match current_summary(store, settings.stale_after, settings.chunk_size).await {
            Ok((summary, _)) if summary.total_tasks == 0 && summary.skipped_records == 0 => {
                emit(&format!(
                    "No progress files found - {}",
                    Utc::now().format("%H:%M:%S")
                ));
            }
            Ok((summary, _)) => emit(&render_summary(&summary, Utc::now())),
            Err(e) => log::error!("Error reading progress files: {e}"),
        }

        tokio::select! {
            () = &mut shutdown => break,
            () = tokio::time::sleep(settings.interval) => {}
        }
    }

    log::info!("Monitoring stopped");
}

#[cfg(test)]
mod tests {
    use chirps_cog_config::ContainerNames;
    use chirps_cog_pipeline_models::{ProgressRecord, TaskId};
    use chirps_cog_store::{Container, LocalStore};

    use super::*;

    #[tokio::test]
    async fn polls_until_shutdown() {
        let root = std::env::temp_dir().join("chirps_cog_progress_monitor");
        let _ = std::fs::remove_dir_all(&root);
        let store = LocalStore::new(
            &root,
            ContainerNames {
                raw_data: "raw-data".to_string(),
                processed_cogs: "processed-cogs".to_string(),
                batch_logs: "batch-logs".to_string(),
                task_data: "task-data".to_string(),
            },
        );
        let record = ProgressRecord {
            iso_timestamp: Utc::now(),
            task_id: TaskId::from_index(0),
            completed_count: 11,
            failed_files: Vec::new(),
        };
        store
            .put(Container::BatchLogs, &record.key(), serde_json::to_vec(&record).unwrap())
            .await
            .unwrap();

        let mut reports = Vec::new();
        monitor_until(
            &store,
            MonitorSettings {
                interval: Duration::from_millis(10),
                stale_after: Duration::from_secs(1800),
                chunk_size: 550,
            },
            |text| reports.push(text.to_string()),
            tokio::time::sleep(Duration::from_millis(55)),
        )
        .await;

        assert!(!reports.is_empty());
        assert!(reports[0].contains("Files Completed: 11"));
        assert!(reports[0].contains("Active Tasks: 1"));

        let _ = std::fs::remove_dir_all(&root);
    }
}
