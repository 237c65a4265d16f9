//! Parsing of HTML directory listings.
//!
//! Listings are plain directory indexes: a `#list` table whose `td.link`
//! cells hold one anchor per entry and whose `td.size` cells hold a human
//! readable size (`"1.2M"`, `"512K"`, `"740 KiB"`, `"-"` for directories).

use regex::Regex;
use scraper::{Html, Selector};

use crate::DiscoveryError;

/// One matching link from a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingLink {
    /// The raw `href` attribute.
    pub href: String,
    /// `listing_url` joined with `href`.
    pub url: String,
}

/// Parses a CSS selector, returning a [`DiscoveryError`] on failure.
///
/// # Errors
///
/// Returns [`DiscoveryError::InvalidSelector`] if the selector is malformed.
pub fn parse_selector(selector: &str) -> Result<Selector, DiscoveryError> {
    Selector::parse(selector).map_err(|e| DiscoveryError::InvalidSelector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// Extracts every link under `selector` whose `href` matches `pattern` at
/// its start, in document order.
#[must_use]
pub fn extract_links(
    html: &str,
    listing_url: &str,
    selector: &Selector,
    pattern: &Regex,
) -> Vec<ListingLink> {
    let document = Html::parse_document(html);

    document
        .select(selector)
        .filter_map(|el| el.value().attr("href"))
        .filter(|href| pattern.find(href).is_some_and(|m| m.start() == 0))
        .map(|href| ListingLink {
            href: href.to_string(),
            url: join_url(listing_url, href),
        })
        .collect()
}

/// Extracts the text of every size cell under `selector`.
#[must_use]
pub fn extract_sizes(html: &str, selector: &Selector) -> Vec<String> {
    let document = Html::parse_document(html);

    document
        .select(selector)
        .map(|el| el.text().collect::<String>().trim().to_owned())
        .collect()
}

/// Converts a listing size cell to megabytes (10^6 bytes).
///
/// Bare numbers are bytes. Directory rows (`"-"`) and anything else that
/// does not start with a number yield `None`.
#[must_use]
pub fn parse_size_mb(cell: &str) -> Option<f64> {
    let cell = cell.trim();
    let split = cell
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(cell.len());
    let (number, unit) = cell.split_at(split);
    let value: f64 = number.parse().ok()?;

    let bytes_per_unit = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1.0,
        "K" | "KB" | "KIB" => 1_024.0,
        "M" | "MB" | "MIB" => 1_048_576.0,
        "G" | "GB" | "GIB" => 1_073_741_824.0,
        _ => return None,
    };

    Some(value * bytes_per_unit / 1_000_000.0)
}

/// Year label for a year-listing link: the first capture group of
/// `pattern` if it has one, otherwise the href without its trailing `/`.
#[must_use]
pub fn year_label(href: &str, pattern: &Regex) -> String {
    pattern
        .captures(href)
        .and_then(|caps| caps.get(1))
        .map_or_else(
            || href.trim_end_matches('/').to_string(),
            |m| m.as_str().to_string(),
        )
}

/// Joins a listing URL and a relative `href`.
fn join_url(listing_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    if listing_url.ends_with('/') {
        format!("{listing_url}{href}")
    } else {
        format!("{listing_url}/{href}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT_LISTING: &str = r#"
        <html><body>
        <table id="list">
          <thead><tr><th>Name</th><th>Size</th></tr></thead>
          <tbody>
            <tr><td class="link"><a href="../">Parent directory/</a></td><td class="size">-</td></tr>
            <tr><td class="link"><a href="1981/">1981/</a></td><td class="size">-</td></tr>
            <tr><td class="link"><a href="1982/">1982/</a></td><td class="size">-</td></tr>
            <tr><td class="link"><a href="README.txt">README.txt</a></td><td class="size">2K</td></tr>
          </tbody>
        </table>
        <a href="1999/">outside the table</a>
        </body></html>
    "#;

    #[test]
    fn keeps_only_matching_links_inside_the_listing() {
        let selector = parse_selector("#list td.link a[href]").unwrap();
        let pattern = Regex::new(r"^(\d{4})/").unwrap();

        let links = extract_links(ROOT_LISTING, "https://host/tifs/", &selector, &pattern);

        assert_eq!(
            links,
            vec![
                ListingLink {
                    href: "1981/".to_string(),
                    url: "https://host/tifs/1981/".to_string(),
                },
                ListingLink {
                    href: "1982/".to_string(),
                    url: "https://host/tifs/1982/".to_string(),
                },
            ]
        );
    }

    #[test]
    fn pattern_must_match_at_href_start() {
        let selector = parse_selector("#list td.link a[href]").unwrap();
        let pattern = Regex::new(r"\d{4}/").unwrap();
        let html = r#"<table id="list"><tr><td class="link"><a href="old/1981/">x</a></td></tr></table>"#;

        assert!(extract_links(html, "https://host/", &selector, &pattern).is_empty());
    }

    #[test]
    fn year_label_prefers_capture_group() {
        let with_group = Regex::new(r"^(\d{4})/").unwrap();
        let without_group = Regex::new(r"^\d{4}/").unwrap();

        assert_eq!(year_label("1995/", &with_group), "1995");
        assert_eq!(year_label("1995/", &without_group), "1995");
    }

    #[test]
    fn parses_listing_sizes() {
        assert_eq!(parse_size_mb("-"), None);
        assert_eq!(parse_size_mb(""), None);
        assert_eq!(parse_size_mb("2000000"), Some(2.0));
        assert!((parse_size_mb("1000K").unwrap() - 1.024).abs() < 1e-9);
        assert!((parse_size_mb("740 KiB").unwrap() - 0.757_76).abs() < 1e-9);
        assert!((parse_size_mb("1.5M").unwrap() - 1.572_864).abs() < 1e-9);
        assert_eq!(parse_size_mb("3 parsecs"), None);
    }

    #[test]
    fn extracts_size_cells() {
        let selector = parse_selector("#list td.size").unwrap();
        assert_eq!(extract_sizes(ROOT_LISTING, &selector), vec!["-", "-", "-", "2K"]);
    }

    #[test]
    fn rejects_bad_selector() {
        assert!(matches!(
            parse_selector("td[[["),
            Err(DiscoveryError::InvalidSelector { .. })
        ));
    }
}
