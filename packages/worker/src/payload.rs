//! How a remote task receives its chunk of work items.
//!
//! Small chunks arrive inline as JSON in `WORK_ITEMS_JSON`. Chunks too
//! large for the batch service's environment limits are uploaded by the
//! dispatcher and referenced by URL in `WORK_ITEMS_URL`.

use std::path::PathBuf;

use async_trait::async_trait;
use chirps_cog_pipeline_models::{
    TASK_ID_VAR, TaskId, UNKNOWN_TASK_ID, WORK_ITEMS_JSON_VAR, WORK_ITEMS_URL_VAR, WorkItem,
};

/// Errors from loading a chunk payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// Neither payload variable is set.
    #[error("Neither WORK_ITEMS_JSON nor WORK_ITEMS_URL is set")]
    Missing,

    /// The payload is not a JSON list of work items.
    #[error("Failed to parse work items: {0}")]
    Parse(#[from] serde_json::Error),

    /// Fetching a referenced payload failed.
    #[error("Failed to fetch work items from {url}: {source}")]
    Fetch {
        /// Payload URL.
        url: String,
        /// Underlying error.
        source: reqwest::Error,
    },

    /// The payload URL answered with a non-success status.
    #[error("HTTP {status} fetching work items from {url}")]
    FetchStatus {
        /// Payload URL.
        url: String,
        /// Response status code.
        status: u16,
    },

    /// Reading a local payload file failed.
    #[error("Failed to read work items from {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// A source of one chunk's work items.
#[async_trait]
pub trait ChunkPayloadSource: Send + Sync {
    /// Loads the work items.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError`] if the payload cannot be read or parsed.
    async fn load(&self) -> Result<Vec<WorkItem>, PayloadError>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Work items embedded directly as JSON.
#[derive(Debug, Clone)]
pub struct InlinePayload {
    json: String,
}

impl InlinePayload {
    /// Wraps a JSON list of work items.
    #[must_use]
    pub fn new(json: impl Into<String>) -> Self {
        Self { json: json.into() }
    }
}

#[async_trait]
impl ChunkPayloadSource for InlinePayload {
    async fn load(&self) -> Result<Vec<WorkItem>, PayloadError> {
        Ok(serde_json::from_str(&self.json)?)
    }

    fn describe(&self) -> String {
        format!("inline payload ({} bytes)", self.json.len())
    }
}

/// Work items stored elsewhere and referenced by URL.
///
/// `http://` and `https://` URLs are fetched; `file://` URLs are read from
/// the local filesystem.
#[derive(Debug, Clone)]
pub struct ReferencePayload {
    url: String,
    client: reqwest::Client,
}

impl ReferencePayload {
    /// Creates a source for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn fetch(&self) -> Result<String, PayloadError> {
        if let Some(path) = self.url.strip_prefix("file://") {
            let path = PathBuf::from(path);
            return tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| PayloadError::Io { path, source });
        }

        let fetch_err = |source| PayloadError::Fetch {
            url: self.url.clone(),
            source,
        };
        let response = self.client.get(&self.url).send().await.map_err(fetch_err)?;
        if !response.status().is_success() {
            return Err(PayloadError::FetchStatus {
                url: self.url.clone(),
                status: response.status().as_u16(),
            });
        }
        response.text().await.map_err(fetch_err)
    }
}

#[async_trait]
impl ChunkPayloadSource for ReferencePayload {
    async fn load(&self) -> Result<Vec<WorkItem>, PayloadError> {
        let body = self.fetch().await?;
        Ok(serde_json::from_str(&body)?)
    }

    fn describe(&self) -> String {
        // Presigned query strings carry credentials.
        let visible = self.url.split('?').next().unwrap_or_default();
        format!("referenced payload at {visible}")
    }
}

/// Picks the payload source from the environment. An inline payload wins
/// when both variables are set.
///
/// # Errors
///
/// Returns [`PayloadError::Missing`] if neither variable is set.
pub fn payload_source_from_env() -> Result<Box<dyn ChunkPayloadSource>, PayloadError> {
    payload_source_from(
        std::env::var(WORK_ITEMS_JSON_VAR).ok(),
        std::env::var(WORK_ITEMS_URL_VAR).ok(),
    )
}

fn payload_source_from(
    inline: Option<String>,
    reference: Option<String>,
) -> Result<Box<dyn ChunkPayloadSource>, PayloadError> {
    match (
        inline.filter(|s| !s.trim().is_empty()),
        reference.filter(|s| !s.trim().is_empty()),
    ) {
        (Some(json), _) => Ok(Box::new(InlinePayload::new(json))),
        (None, Some(url)) => Ok(Box::new(ReferencePayload::new(url))),
        (None, None) => Err(PayloadError::Missing),
    }
}

/// Id of the running task, from `AZ_BATCH_TASK_ID` (default
/// `unknown_task`).
#[must_use]
pub fn task_id_from_env() -> TaskId {
    TaskId::new(std::env::var(TASK_ID_VAR).unwrap_or_else(|_| UNKNOWN_TASK_ID.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITEMS: &str = r#"[
        {"year": "1995", "url": "https://host/1995/chirps-v2.0.1995.01.01.tif.gz"},
        {"year": "1995", "url": "https://host/1995/chirps-v2.0.1995.01.02.tif.gz"}
    ]"#;

    #[tokio::test]
    async fn parses_inline_payload() {
        let items = InlinePayload::new(ITEMS).load().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].year, "1995");
        assert_eq!(
            items[1].source_url,
            "https://host/1995/chirps-v2.0.1995.01.02.tif.gz"
        );
    }

    #[tokio::test]
    async fn malformed_inline_payload_is_an_error() {
        let err = InlinePayload::new("{not json").load().await.unwrap_err();
        assert!(matches!(err, PayloadError::Parse(_)));
    }

    #[tokio::test]
    async fn reads_file_reference() {
        let path = std::env::temp_dir().join("chirps_cog_payload_reference.json");
        std::fs::write(&path, ITEMS).unwrap();

        let source = ReferencePayload::new(format!("file://{}", path.display()));
        assert_eq!(source.load().await.unwrap().len(), 2);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_file_reference_is_an_error() {
        let source = ReferencePayload::new("file:///nonexistent/chirps_cog/items.json");
        assert!(matches!(
            source.load().await,
            Err(PayloadError::Io { .. })
        ));
    }

    #[test]
    fn inline_payload_takes_precedence() {
        let source =
            payload_source_from(Some(ITEMS.to_string()), Some("https://x/y".to_string())).unwrap();
        assert!(source.describe().starts_with("inline payload"));

        let source = payload_source_from(None, Some("https://x/y?sig=secret".to_string())).unwrap();
        assert_eq!(source.describe(), "referenced payload at https://x/y");

        assert!(matches!(
            payload_source_from(Some("  ".to_string()), None),
            Err(PayloadError::Missing)
        ));
    }
}
