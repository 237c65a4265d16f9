#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Per-item conversion: download → decompress → clip → re-encode.
//!
//! [`CogProcessor`] turns one [`WorkItem`] into two local files under the
//! workspace:
//!
//! - `raw-data/<name>`: the decompressed source raster
//! - `processed-cogs/<prefix><name>`: the clipped, tiled output
//!
//! where `<name>` is the part of the source URL after the `<year>/`
//! segment, without the `.gz` suffix. Uploading and cleanup are the
//! caller's job.

pub mod convert;
pub mod download;
pub mod window;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chirps_cog_config::RegionConfig;
use chirps_cog_pipeline_models::{ProcessedArtifact, WorkItem};

pub use convert::{ClipError, ClipRequest, RasterConverter, default_converter};
pub use download::DownloadError;

/// Scratch directory for decompressed source rasters.
pub const RAW_DIR: &str = "raw-data";

/// Scratch directory for converted outputs.
pub const COG_DIR: &str = "processed-cogs";

/// Per-request timeout for source downloads.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors from processing a single work item.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The source file could not be fetched.
    #[error("Download failed: {0}")]
    Download(#[from] DownloadError),

    /// The source file is not a complete gzip stream.
    #[error("Failed to decompress {url}: {source}")]
    Decode {
        /// Source URL.
        url: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Clipping or re-encoding failed.
    #[error("Clip/convert failed for {name}: {source}")]
    ClipConversion {
        /// Raw file name.
        name: String,
        /// Underlying error.
        source: ClipError,
    },

    /// No file name could be derived from the URL.
    #[error("Cannot derive a file name from {url} (year {year})")]
    Naming {
        /// Source URL.
        url: String,
        /// Year the URL should contain.
        year: String,
    },

    /// I/O error writing scratch files.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path that caused the error.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

impl ProcessError {
    /// Whether another attempt could succeed. Naming errors, permanent
    /// HTTP client errors and a missing raster engine never will.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Naming { .. }
            | Self::ClipConversion {
                source: ClipError::Unsupported,
                ..
            } => false,
            Self::Download(e) => !e.is_permanent(),
            Self::Decode { .. } | Self::ClipConversion { .. } | Self::Io { .. } => true,
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Converts one work item into local artifacts.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Processes `item`, writing its artifacts under `workspace`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] describing the first step that failed.
    async fn process(
        &self,
        item: &WorkItem,
        workspace: &Path,
    ) -> Result<ProcessedArtifact, ProcessError>;

    /// Local files `process` may leave behind for `item`, removed by the
    /// caller after a failure.
    fn scratch_paths(&self, _item: &WorkItem, _workspace: &Path) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// File name of the decompressed raster for `item`: the URL remainder after
/// the `<year>/` segment with any `.gz` suffix removed.
///
/// # Errors
///
/// Returns [`ProcessError::Naming`] if the URL has no `<year>/` segment or
/// nothing follows it.
pub fn derive_raw_name(item: &WorkItem) -> Result<String, ProcessError> {
    let naming_error = || ProcessError::Naming {
        url: item.source_url.clone(),
        year: item.year.clone(),
    };

    if item.year.is_empty() {
        return Err(naming_error());
    }

    let segment = format!("{}/", item.year);
    let start = item
        .source_url
        .match_indices(&segment)
        .map(|(i, _)| i)
        .find(|&i| i == 0 || item.source_url[..i].ends_with('/'))
        .ok_or_else(naming_error)?;

    let remainder = &item.source_url[start + segment.len()..];
    let name = remainder.strip_suffix(".gz").unwrap_or(remainder);
    if name.is_empty() {
        return Err(naming_error());
    }

    Ok(name.to_string())
}

/// Local paths of the raw and converted files for a raw file name.
#[must_use]
pub fn artifact_paths(workspace: &Path, raw_name: &str, cog_prefix: &str) -> (PathBuf, PathBuf) {
    (
        workspace.join(RAW_DIR).join(raw_name),
        workspace
            .join(COG_DIR)
            .join(format!("{cog_prefix}{raw_name}")),
    )
}

/// Downloads, decompresses, clips and re-encodes CHIRPS rasters.
pub struct CogProcessor {
    client: reqwest::Client,
    converter: Arc<dyn RasterConverter>,
    region: RegionConfig,
    cog_prefix: String,
}

impl CogProcessor {
    /// Creates a processor clipping to `region` and naming outputs
    /// `<cog_prefix><name>`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Http`] if the HTTP client cannot be built.
    pub fn new(
        region: RegionConfig,
        cog_prefix: &str,
        converter: Arc<dyn RasterConverter>,
    ) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .user_agent("chirps-cog/0.1")
            .timeout(DOWNLOAD_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            converter,
            region,
            cog_prefix: cog_prefix.to_string(),
        })
    }

    /// Everything after the download: decompress, write the raw file, and
    /// convert it.
    async fn materialize(
        &self,
        item: &WorkItem,
        raw_name: &str,
        compressed: &[u8],
        workspace: &Path,
    ) -> Result<ProcessedArtifact, ProcessError> {
        let raw = download::gunzip(compressed).map_err(|source| ProcessError::Decode {
            url: item.source_url.clone(),
            source,
        })?;

        let (raw_path, cog_path) = artifact_paths(workspace, raw_name, &self.cog_prefix);
        for dir in [workspace.join(RAW_DIR), workspace.join(COG_DIR)] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| ProcessError::io(&dir, e))?;
        }
        tokio::fs::write(&raw_path, &raw)
            .await
            .map_err(|e| ProcessError::io(&raw_path, e))?;

        let request = ClipRequest {
            source: raw_path.clone(),
            destination: cog_path.clone(),
            bounds: self.region.bounds,
            crs: self.region.crs.clone(),
        };
        let converter = Arc::clone(&self.converter);
        let clip_error = |source| ProcessError::ClipConversion {
            name: raw_name.to_string(),
            source,
        };

        let summary = tokio::task::spawn_blocking(move || converter.convert(&request))
            .await
            .map_err(|e| ProcessError::io(&cog_path, std::io::Error::other(e)))?
            .map_err(|e| {
                log::error!("  conversion of {raw_name} failed: {e}");
                clip_error(e)
            })?;

        log::info!(
            "  clipped {raw_name} to {}x{} pixels",
            summary.window.width,
            summary.window.height
        );

        let cog_name = format!("{}{raw_name}", self.cog_prefix);
        Ok(ProcessedArtifact {
            year: item.year.clone(),
            raw_path,
            raw_name: raw_name.to_string(),
            cog_path,
            cog_name,
        })
    }
}

#[async_trait]
impl ItemProcessor for CogProcessor {
    async fn process(
        &self,
        item: &WorkItem,
        workspace: &Path,
    ) -> Result<ProcessedArtifact, ProcessError> {
        let raw_name = derive_raw_name(item)?;
        let compressed = download::fetch_bytes(&self.client, &item.source_url).await?;
        self.materialize(item, &raw_name, &compressed, workspace)
            .await
    }

    fn scratch_paths(&self, item: &WorkItem, workspace: &Path) -> Vec<PathBuf> {
        derive_raw_name(item).map_or_else(
            |_| Vec::new(),
            |name| {
                let (raw, cog) = artifact_paths(workspace, &name, &self.cog_prefix);
                vec![raw, cog]
            },
        )
    }
}
