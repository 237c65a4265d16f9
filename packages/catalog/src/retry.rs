//! HTTP retry helpers for listing pages.
//!
//! Every page fetch goes through [`send_text`] so transient failures
//! (timeouts, connection resets, 429, 5xx) are retried with exponential
//! backoff. Other 4xx responses are permanent.

use std::time::Duration;

/// Maximum number of retry attempts for transient HTTP errors.
///
/// With exponential backoff (2s, 4s, 8s, 16s) the total wait before giving
/// up is 30 seconds.
const MAX_RETRIES: u32 = 4;

/// Errors from fetching a listing page.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The request could not be sent or the body could not be read.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status {
        /// Requested URL.
        url: String,
        /// Response status code.
        status: u16,
    },
}

impl FetchError {
    /// Whether a later attempt could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => is_transient(e),
            Self::Status { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

/// Sends an HTTP request and returns the response body as a `String`.
///
/// The `build_request` closure is called on each attempt to construct a
/// fresh [`reqwest::RequestBuilder`], since builders are consumed by
/// `.send()`.
///
/// # Errors
///
/// Returns [`FetchError`] if the request fails after all retries, the
/// server returns a non-retryable status, or the body cannot be read.
#[allow(clippy::future_not_send)]
pub async fn send_text<F>(build_request: F) -> Result<String, FetchError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let response = send_inner(&build_request, MAX_RETRIES).await?;
    Ok(response.text().await?)
}

/// Core retry loop behind [`send_text`].
///
/// Returns the successful [`reqwest::Response`] (status 2xx or 3xx).
#[allow(clippy::future_not_send)]
async fn send_inner<F>(build_request: &F, max_retries: u32) -> Result<reqwest::Response, FetchError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            let delay = Duration::from_secs(2u64.saturating_pow(attempt));
            log::warn!("  retry {attempt}/{max_retries} in {delay:?}...");
            tokio::time::sleep(delay).await;
        }

        let error = match build_request().send().await {
            Err(e) => FetchError::Http(e),
            Ok(response) => {
                let status = response.status();
                if status.is_success() || status.is_redirection() {
                    return Ok(response);
                }
                FetchError::Status {
                    url: response.url().to_string(),
                    status: status.as_u16(),
                }
            }
        };

        if !error.is_transient() || attempt >= max_retries {
            return Err(error);
        }

        log::warn!("  transient error: {error}");
        attempt += 1;
    }
}

/// Returns `true` if the error is likely transient and worth retrying.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode() || e.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_server_errors_are_transient() {
        let status = |status| FetchError::Status {
            url: "https://example.com/".to_string(),
            status,
        };
        assert!(status(429).is_transient());
        assert!(status(503).is_transient());
        assert!(!status(404).is_transient());
        assert!(!status(403).is_transient());
    }
}
