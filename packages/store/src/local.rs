//! Directory-backed store, laid out as `<root>/<container>/<key>`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chirps_cog_config::ContainerNames;

use crate::{BlobStore, Container, StoreError};

/// Store that keeps every container as a directory under a local root.
///
/// Used by `local-run` and by tests. Presigned references are plain
/// `file://` URLs and never expire.
pub struct LocalStore {
    root: PathBuf,
    containers: ContainerNames,
}

impl LocalStore {
    /// Creates a store rooted at `root`. Directories are created lazily on
    /// first write.
    #[must_use]
    pub fn new(root: &Path, containers: ContainerNames) -> Self {
        Self {
            root: root.to_path_buf(),
            containers,
        }
    }

    fn container_dir(&self, container: Container) -> PathBuf {
        self.root.join(container.resolve(&self.containers))
    }

    fn object_path(&self, container: Container, key: &str) -> PathBuf {
        let mut path = self.container_dir(container);
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn put(
        &self,
        container: Container,
        key: &str,
        data: Vec<u8>,
    ) -> Result<(), StoreError> {
        let path = self.object_path(container, key);
        let upload_err = |e: std::io::Error| StoreError::Upload {
            container,
            key: key.to_string(),
            source: Box::new(e),
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(upload_err)?;
        }
        tokio::fs::write(&path, data).await.map_err(upload_err)?;

        log::debug!("  stored {container}/{key} at {}", path.display());
        Ok(())
    }

    async fn get(&self, container: Container, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(container, key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                container,
                key: key.to_string(),
            }),
            Err(e) => Err(StoreError::Download {
                container,
                key: key.to_string(),
                source: Box::new(e),
            }),
        }
    }

    async fn list_keys(
        &self,
        container: Container,
        prefix: &str,
    ) -> Result<Vec<String>, StoreError> {
        let dir = self.container_dir(container);
        let walked = tokio::task::spawn_blocking(move || walk_keys(&dir))
            .await
            .map_err(|e| StoreError::List {
                container,
                prefix: prefix.to_string(),
                source: Box::new(e),
            })?
            .map_err(|e| StoreError::List {
                container,
                prefix: prefix.to_string(),
                source: Box::new(e),
            })?;

        let mut keys: Vec<String> = walked
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn presign_get(
        &self,
        container: Container,
        key: &str,
        _ttl: Duration,
    ) -> Result<String, StoreError> {
        let path = self.object_path(container, key);
        let absolute = std::path::absolute(&path).map_err(|e| StoreError::Presign {
            container,
            key: key.to_string(),
            source: Box::new(e),
        })?;
        Ok(format!("file://{}", absolute.display()))
    }
}

/// Recursively collects `/`-separated keys below `dir`. A missing directory
/// is an empty container.
fn walk_keys(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut keys = Vec::new();
    if !dir.exists() {
        return Ok(keys);
    }

    let mut pending = vec![(dir.to_path_buf(), String::new())];
    while let Some((current, prefix)) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let key = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };

            if entry.file_type()?.is_dir() {
                pending.push((entry.path(), key));
            } else {
                keys.push(key);
            }
        }
    }

    Ok(keys)
}
