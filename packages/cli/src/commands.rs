//! Subcommand implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chirps_cog_catalog::{DiscoveryError, HttpPageSource, discover as discover_listings, flatten};
use chirps_cog_cli_utils::{IndicatifProgress, MultiProgress};
use chirps_cog_config::{ConfigError, PipelineConfig, optional_env};
use chirps_cog_dispatch::{
    BatchServiceClient, CachedCredentials, ClientSecretTokenSource, CredentialProvider,
    DispatchError, DispatchSettings, Dispatcher, StaticToken, chunk, plan,
};
use chirps_cog_pipeline_models::WorkItem;
use chirps_cog_processor::{CogProcessor, ItemProcessor, default_converter};
use chirps_cog_progress::{
    MonitorSettings, current_summary, failed_items_report, fetch_records, monitor,
    recovery_items, render_failed_report, render_summary,
};
use chirps_cog_store::open_store;

type CliResult = Result<(), Box<dyn std::error::Error>>;

async fn discover_items(config: &PipelineConfig) -> Result<Vec<WorkItem>, DiscoveryError> {
    let source = HttpPageSource::new(reqwest::Client::new());
    let listings = discover_listings(&source, &config.catalog).await?;
    Ok(flatten(&listings))
}

fn processor(config: &PipelineConfig) -> Result<Arc<dyn ItemProcessor>, Box<dyn std::error::Error>> {
    Ok(Arc::new(CogProcessor::new(
        config.region.clone(),
        &config.cog_prefix,
        default_converter(),
    )?))
}

/// Uses `BATCH_ACCESS_TOKEN` when set, otherwise the client-credentials
/// grant.
fn credentials(config: &PipelineConfig) -> Result<Arc<dyn CredentialProvider>, ConfigError> {
    if let Some(token) = optional_env("BATCH_ACCESS_TOKEN") {
        log::info!("Using pre-issued batch access token");
        return Ok(Arc::new(CachedCredentials::new(StaticToken::new(token))));
    }
    Ok(Arc::new(CachedCredentials::new(
        ClientSecretTokenSource::from_env(&config.batch.token_scope)?,
    )))
}

pub async fn discover(config: &PipelineConfig, estimate_size: bool) -> CliResult {
    let source = HttpPageSource::new(reqwest::Client::new());
    let listings = discover_listings(&source, &config.catalog).await?;

    println!("{:<8} {:>8}  LISTING", "YEAR", "FILES");
    println!("{}", "-".repeat(60));
    for listing in &listings {
        println!(
            "{:<8} {:>8}  {}",
            listing.year,
            listing.urls.len(),
            listing.listing_url
        );
    }
    let total: usize = listings.iter().map(|l| l.urls.len()).sum();
    println!("\nTotal files: {total} across {} years", listings.len());

    if estimate_size {
        let mut total_mb = 0.0;
        for listing in &listings {
            total_mb += chirps_cog_catalog::estimate_storage_mb(
                &source,
                &listing.listing_url,
                &config.catalog.size_selector,
            )
            .await?;
        }
        println!("Estimated compressed size: {total_mb:.1} MB");
    }

    Ok(())
}

/// Work items from `items_file`, or from discovery when none is given.
/// An empty list is an error.
async fn load_items(
    config: &PipelineConfig,
    items_file: Option<&Path>,
) -> Result<Vec<WorkItem>, Box<dyn std::error::Error>> {
    let items = match items_file {
        Some(path) => {
            log::info!("Reading work items from {}", path.display());
            serde_json::from_slice::<Vec<WorkItem>>(&tokio::fs::read(path).await?)?
        }
        None => discover_items(config).await?,
    };
    if items.is_empty() {
        return Err("No work items to dispatch".into());
    }
    Ok(items)
}

pub async fn dispatch(config: &PipelineConfig, items_file: Option<&Path>, dry_run: bool) -> CliResult {
    let items = load_items(config, items_file).await?;
    log::info!("Total work items: {}", items.len());

    let chunks = chunk(&items, config.chunk_size)?;
    log::info!(
        "Split into {} chunks of up to {} items",
        chunks.len(),
        config.chunk_size
    );

    let settings = DispatchSettings::from_config(&config.batch);

    if dry_run {
        let planned = plan(&chunks, &settings)?;
        println!("{:<10} {:>6} {:>10}  PAYLOAD", "TASK", "ITEMS", "BYTES");
        for task in &planned {
            println!(
                "{:<10} {:>6} {:>10}  {}",
                task.task_id,
                task.item_count,
                task.payload_bytes,
                if task.inline { "inline" } else { "reference" }
            );
        }
        println!("\n{} tasks would be submitted", planned.len());
        return Ok(());
    }

    let submitter = Arc::new(BatchServiceClient::new(&config.batch, credentials(config)?));
    let store = open_store(&config.storage)?;
    let dispatcher = Dispatcher::new(submitter, store, settings);

    match dispatcher.dispatch(&chunks).await {
        Ok(dispatched) => {
            println!("Job ID: {}", dispatched.job_id);
            for task in &dispatched.tasks {
                println!("  {} ({} items)", task.task_id, task.item_count);
            }
            println!(
                "\nSubmitted {} tasks, {} accepted",
                chunks.len(),
                dispatched.tasks.len()
            );
            Ok(())
        }
        Err(DispatchError::Submission(failure)) => {
            println!("Job ID: {}", failure.job_id);
            println!(
                "Submitted {} tasks, {} accepted",
                chunks.len(),
                failure.accepted.len()
            );
            println!("\nRejected tasks:");
            for rejected in &failure.rejected {
                println!(
                    "  {}: {} - {}",
                    rejected.task_id, rejected.code, rejected.message
                );
            }
            Err(failure.into())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn run_task(config: &PipelineConfig, workspace: PathBuf) -> CliResult {
    let start = Instant::now();
    let store = open_store(&config.storage)?;

    let record = chirps_cog_worker::run_task(config, processor(config)?, store, workspace).await?;

    log::info!(
        "Task {} finished in {:.1}s: {} completed, {} failed",
        record.task_id,
        start.elapsed().as_secs_f64(),
        record.completed_count,
        record.failed_files.len()
    );
    Ok(())
}

pub async fn local_run(
    config: &PipelineConfig,
    multi: &MultiProgress,
    concurrency: usize,
    limit: Option<usize>,
    workspace: &Path,
) -> CliResult {
    let start = Instant::now();
    let mut items = discover_items(config).await?;
    if let Some(limit) = limit {
        items.truncate(limit);
    }

    let progress = IndicatifProgress::items_bar(multi, "Processing files");
    let report = chirps_cog_worker::run_local(
        items,
        processor(config)?,
        workspace,
        concurrency,
        progress,
    )
    .await;

    println!(
        "\nConverted {} files in {:.1}s ({} failed)",
        report.succeeded,
        start.elapsed().as_secs_f64(),
        report.failed.len()
    );
    for failed in &report.failed {
        println!("  {}: {}", failed.item.source_url, failed.error);
    }
    Ok(())
}

pub async fn status(
    config: &PipelineConfig,
    continuous: bool,
    interval: Duration,
    failed: bool,
    write_items: Option<&Path>,
) -> CliResult {
    let store = open_store(&config.storage)?;

    if failed {
        let fetched = fetch_records(store.as_ref()).await?;
        let report = failed_items_report(&fetched.records);
        print!("{}", render_failed_report(&report));

        if let Some(path) = write_items {
            let items = recovery_items(&report);
            tokio::fs::write(path, serde_json::to_vec_pretty(&items)?).await?;
            println!(
                "\nWrote {} items to {} (re-run with `dispatch --items`)",
                items.len(),
                path.display()
            );
        }
        return Ok(());
    }

    if continuous {
        println!("Press Ctrl+C to stop");
        monitor(
            store.as_ref(),
            MonitorSettings {
                interval,
                stale_after: config.stale_after(),
                chunk_size: config.chunk_size,
            },
            |text| println!("\n{text}"),
        )
        .await;
        return Ok(());
    }

    let (summary, _) =
        current_summary(store.as_ref(), config.stale_after(), config.chunk_size).await?;
    if summary.total_tasks == 0 && summary.skipped_records == 0 {
        println!("No progress files found");
    } else {
        print!("{}", render_summary(&summary, chrono::Utc::now()));
    }
    Ok(())
}
