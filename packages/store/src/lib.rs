#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Durable key-blob store for pipeline artifacts and progress records.
//!
//! The store is the single source of truth shared by every worker. All
//! writes overwrite by key, so re-running a task never conflicts with what
//! an earlier run left behind.
//!
//! Two backends implement [`BlobStore`]:
//!
//! - [`S3Store`] talks to any S3-compatible endpoint (one bucket per
//!   logical [`Container`]).
//! - [`LocalStore`] mirrors the same layout under a local directory, for
//!   local runs and tests.
//!
//! # Environment Variables (S3 backend)
//!
//! | Variable | Required | Description |
//! |---|---|---|
//! | `S3_ACCESS_KEY_ID` | Yes | Access key |
//! | `S3_SECRET_ACCESS_KEY` | Yes | Secret key |
//! | `S3_ENDPOINT_URL` | No | Custom endpoint (R2, `MinIO`, ...) |

mod local;
mod s3;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chirps_cog_config::{ConfigError, ContainerNames, StorageBackend, StorageConfig};

pub use local::LocalStore;
pub use s3::S3Store;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Store configuration (credentials, endpoints) is missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The requested object does not exist.
    #[error("Object not found: {container}/{key}")]
    NotFound {
        /// Logical container.
        container: Container,
        /// Object key.
        key: String,
    },

    /// Reading an object failed.
    #[error("Failed to download {container}/{key}: {source}")]
    Download {
        /// Logical container.
        container: Container,
        /// Object key.
        key: String,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Writing an object failed.
    #[error("Failed to upload {container}/{key}: {source}")]
    Upload {
        /// Logical container.
        container: Container,
        /// Object key.
        key: String,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Listing a container failed.
    #[error("Failed to list {container}/{prefix}: {source}")]
    List {
        /// Logical container.
        container: Container,
        /// Key prefix.
        prefix: String,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Minting a read reference failed.
    #[error("Failed to presign {container}/{key}: {source}")]
    Presign {
        /// Logical container.
        container: Container,
        /// Object key.
        key: String,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// I/O error reading or writing local files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Logical containers the pipeline writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Container {
    /// Decompressed source rasters, keyed `<year>/<name>`.
    RawData,
    /// Clipped, tiled outputs, keyed `<year>/<name>`.
    ProcessedCogs,
    /// Progress records, keyed `<task_id>.json`.
    BatchLogs,
    /// Oversized chunk payloads, keyed `<job_id>/<task_id>_work_items.json`.
    TaskData,
}

impl Container {
    /// All containers.
    pub const ALL: &[Self] = &[
        Self::RawData,
        Self::ProcessedCogs,
        Self::BatchLogs,
        Self::TaskData,
    ];

    /// Canonical (default) name of the container.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RawData => "raw-data",
            Self::ProcessedCogs => "processed-cogs",
            Self::BatchLogs => "batch-logs",
            Self::TaskData => "task-data",
        }
    }

    /// Physical bucket/directory name configured for this container.
    #[must_use]
    pub fn resolve(self, names: &ContainerNames) -> &str {
        match self {
            Self::RawData => &names.raw_data,
            Self::ProcessedCogs => &names.processed_cogs,
            Self::BatchLogs => &names.batch_logs,
            Self::TaskData => &names.task_data,
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable key-blob store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Writes `data` at `key`, replacing any existing object.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Upload`] if the write fails.
    async fn put(&self, container: Container, key: &str, data: Vec<u8>)
    -> Result<(), StoreError>;

    /// Reads the object at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no object exists, or
    /// [`StoreError::Download`] if the read fails.
    async fn get(&self, container: Container, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Lists every key in `container` starting with `prefix`, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::List`] if the listing fails.
    async fn list_keys(&self, container: Container, prefix: &str)
    -> Result<Vec<String>, StoreError>;

    /// Mints a time-bounded, read-only URL for the object at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Presign`] if the reference cannot be created.
    async fn presign_get(
        &self,
        container: Container,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StoreError>;

    /// Uploads a local file, replacing any existing object. Returns the
    /// number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file cannot be read, or
    /// [`StoreError::Upload`] if the write fails.
    async fn put_file(
        &self,
        container: Container,
        key: &str,
        local_path: &Path,
    ) -> Result<u64, StoreError> {
        let data = tokio::fs::read(local_path).await?;
        let size = data.len() as u64;
        #[allow(clippy::cast_precision_loss)] // display-only MB value
        let mb = size as f64 / 1_048_576.0;
        log::info!(
            "Pushing {} -> {container}/{key} ({mb:.1} MB)",
            local_path.display()
        );
        self.put(container, key, data).await?;
        Ok(size)
    }
}

/// Opens the store selected by `config.backend`.
///
/// # Errors
///
/// Returns [`StoreError::Config`] if the S3 backend is selected and its
/// credentials are missing from the environment.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn BlobStore>, StoreError> {
    Ok(match config.backend {
        StorageBackend::S3 => Arc::new(S3Store::from_env(config)?),
        StorageBackend::Local => Arc::new(LocalStore::new(
            &config.local_root,
            config.containers.clone(),
        )),
    })
}

/// Deletes a local scratch file.
///
/// Best-effort: a file that is already gone is logged and counted as
/// removed. Returns `false` only if the file exists but could not be
/// deleted.
pub async fn remove_local(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            log::debug!("  removed {}", path.display());
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::warn!("  {} already removed", path.display());
            true
        }
        Err(e) => {
            log::warn!("  failed to remove {}: {e}", path.display());
            false
        }
    }
}
