#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Work item discovery from HTML directory listings.
//!
//! The archive is laid out as one sub-listing per year under a root
//! listing. [`discover`] walks the root, follows every link matching the
//! year pattern, and collects the file links matching the file pattern in
//! each year. [`flatten`] turns the result into the ordered
//! [`WorkItem`] sequence the dispatcher chunks.
//!
//! Page fetching sits behind [`PageSource`] so discovery can run against
//! canned HTML in tests.

pub mod listing;
pub mod retry;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chirps_cog_config::CatalogConfig;
use chirps_cog_pipeline_models::WorkItem;
use regex::Regex;

pub use listing::{ListingLink, extract_links, parse_size_mb};
pub use retry::FetchError;

/// Errors that can occur during discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// A listing page could not be fetched.
    #[error("Listing {url} is unreachable: {source}")]
    Unreachable {
        /// Listing URL.
        url: String,
        /// Underlying fetch error.
        source: FetchError,
    },

    /// The root listing had no entries matching the year pattern.
    #[error("No year listings matched under {url}")]
    NoYears {
        /// Root listing URL.
        url: String,
    },

    /// A configured CSS selector is malformed.
    #[error("Invalid CSS selector '{selector}': {message}")]
    InvalidSelector {
        /// The selector text.
        selector: String,
        /// Parser message.
        message: String,
    },

    /// A configured pattern is not a valid regex.
    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// The files found under one year listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YearListing {
    /// Year label, e.g. `"1995"`.
    pub year: String,
    /// URL of the year's listing page.
    pub listing_url: String,
    /// Absolute URLs of the matching files, in listing order.
    pub urls: Vec<String>,
}

/// Fetches listing pages.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Returns the HTML body of the page at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] if the page cannot be fetched.
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

/// [`PageSource`] that fetches pages over HTTP with retries.
#[derive(Debug, Clone, Default)]
pub struct HttpPageSource {
    client: reqwest::Client,
}

impl HttpPageSource {
    /// Creates a page source using `client`.
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        log::debug!("Fetching listing {url}");
        retry::send_text(|| self.client.get(url)).await
    }
}

/// [`PageSource`] serving fixed pages from memory. Unknown URLs answer 404.
#[derive(Debug, Clone, Default)]
pub struct StaticPages {
    pages: BTreeMap<String, String>,
}

impl StaticPages {
    /// Creates an empty page set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a page.
    #[must_use]
    pub fn with_page(mut self, url: &str, html: &str) -> Self {
        self.pages.insert(url.to_string(), html.to_string());
        self
    }
}

#[async_trait]
impl PageSource for StaticPages {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        self.pages.get(url).cloned().ok_or_else(|| FetchError::Status {
            url: url.to_string(),
            status: 404,
        })
    }
}

/// Compiled selectors and patterns for one discovery pass.
struct Matchers {
    link_selector: scraper::Selector,
    year_pattern: Regex,
    file_pattern: Regex,
}

impl Matchers {
    fn new(config: &CatalogConfig) -> Result<Self, DiscoveryError> {
        Ok(Self {
            link_selector: listing::parse_selector(&config.link_selector)?,
            year_pattern: Regex::new(&config.year_pattern)?,
            file_pattern: Regex::new(&config.file_pattern)?,
        })
    }
}

async fn fetch_listing(source: &dyn PageSource, url: &str) -> Result<String, DiscoveryError> {
    source
        .fetch(url)
        .await
        .map_err(|e| DiscoveryError::Unreachable {
            url: url.to_string(),
            source: e,
        })
}

/// Enumerates the year listings under `config.root_url` and the matching
/// files in each.
///
/// Years come back in root listing order, files in year listing order. A
/// year with no matching files is kept with an empty `urls` list.
///
/// # Errors
///
/// Returns [`DiscoveryError::Unreachable`] if any listing cannot be
/// fetched, [`DiscoveryError::NoYears`] if the root yields no year entries,
/// or a configuration error if a selector or pattern is malformed.
pub async fn discover(
    source: &dyn PageSource,
    config: &CatalogConfig,
) -> Result<Vec<YearListing>, DiscoveryError> {
    let matchers = Matchers::new(config)?;

    log::info!("Discovering years under {}", config.root_url);
    let root_html = fetch_listing(source, &config.root_url).await?;
    let years = extract_links(
        &root_html,
        &config.root_url,
        &matchers.link_selector,
        &matchers.year_pattern,
    );

    if years.is_empty() {
        return Err(DiscoveryError::NoYears {
            url: config.root_url.clone(),
        });
    }
    log::info!("Found {} year listings", years.len());

    let mut listings = Vec::with_capacity(years.len());
    for year_link in years {
        let year = listing::year_label(&year_link.href, &matchers.year_pattern);
        let html = fetch_listing(source, &year_link.url).await?;
        let urls: Vec<String> = extract_links(
            &html,
            &year_link.url,
            &matchers.link_selector,
            &matchers.file_pattern,
        )
        .into_iter()
        .map(|link| link.url)
        .collect();

        log::info!("  {year}: {} files", urls.len());
        listings.push(YearListing {
            year,
            listing_url: year_link.url,
            urls,
        });
    }

    Ok(listings)
}

/// Flattens listings into work items, preserving year order then file
/// order.
#[must_use]
pub fn flatten(listings: &[YearListing]) -> Vec<WorkItem> {
    listings
        .iter()
        .flat_map(|listing| {
            listing
                .urls
                .iter()
                .map(|url| WorkItem::new(listing.year.clone(), url.clone()))
        })
        .collect()
}

/// Sums the size column of a listing page, in megabytes.
///
/// Rows without a parseable size (directories, `"-"`) are ignored.
///
/// # Errors
///
/// Returns [`DiscoveryError::Unreachable`] if the page cannot be fetched,
/// or [`DiscoveryError::InvalidSelector`] if the size selector is
/// malformed.
pub async fn estimate_storage_mb(
    source: &dyn PageSource,
    listing_url: &str,
    size_selector: &str,
) -> Result<f64, DiscoveryError> {
    let selector = listing::parse_selector(size_selector)?;
    let html = fetch_listing(source, listing_url).await?;

    Ok(listing::extract_sizes(&html, &selector)
        .iter()
        .filter_map(|cell| parse_size_mb(cell))
        .sum())
}
