//! Fetching and decompressing source rasters.

use std::io::Read as _;

/// Errors from download operations.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP status.
    #[error("HTTP {status} for {url}")]
    HttpStatus {
        /// Request URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },
}

impl DownloadError {
    /// Whether the server answered with a permanent client error
    /// (4xx other than 429).
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        match self {
            Self::Http(_) => false,
            Self::HttpStatus { status, .. } => *status >= 400 && *status < 500 && *status != 429,
        }
    }
}

/// Downloads `url` fully into memory.
///
/// # Errors
///
/// Returns [`DownloadError::HttpStatus`] for a non-success response, or
/// [`DownloadError::Http`] if the request or body transfer fails.
pub async fn fetch_bytes(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, DownloadError> {
    log::info!("Downloading {url}");

    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(DownloadError::HttpStatus {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    let bytes = response.bytes().await?;

    #[allow(clippy::cast_precision_loss)]
    let mb = bytes.len() as f64 / 1_048_576.0;
    log::info!("  download complete: {mb:.1} MB");

    Ok(bytes.to_vec())
}

/// Decompresses a complete gzip stream.
///
/// # Errors
///
/// Returns the underlying I/O error if the data is not gzip or the stream
/// is truncated.
pub fn gunzip(compressed: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(compressed);
    let mut out = Vec::with_capacity(capacity_hint(compressed.len()));
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Initial buffer size for a stream of `compressed_len` bytes. Rasters
/// usually inflate about 4x; the buffer grows past this when needed.
const fn capacity_hint(compressed_len: usize) -> usize {
    compressed_len.saturating_mul(4)
}
