//! Source adapter contracts, the job-board adapters, and listing normalization.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use itrack_core::RawListing;
use itrack_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

mod ashby;
mod csv_import;
mod greenhouse;
mod lever;
pub mod normalize;

pub use ashby::AshbyAdapter;
pub use csv_import::CsvFileAdapter;
pub use greenhouse::GreenhouseAdapter;
pub use lever::LeverAdapter;
pub use normalize::{Normalizer, Rejection};

pub const CRATE_NAME: &str = "itrack-adapters";

/// One entry of `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub kind: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub boards: Vec<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

/// A unit of fetching. Candidate URLs are tried in order until one succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingTarget {
    pub label: String,
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub target: String,
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching {target}: {source}")]
    Fetch {
        target: String,
        #[source]
        source: FetchError,
    },
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed payload from {target}: {message}")]
    Malformed { target: String, message: String },
    #[error("{0}")]
    Message(String),
}

/// Per-record parse result; one bad record never invalidates the page.
pub type RecordResult = Result<RawListing, AdapterError>;

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    /// Human-readable name stored as the listing's `source`.
    fn source_name(&self) -> &str;

    fn listing_targets(&self) -> Vec<ListingTarget>;

    async fn fetch_target(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        target: &ListingTarget,
    ) -> Result<FetchedPage, AdapterError> {
        let mut last_error = None;
        for url in &target.urls {
            match http.fetch_bytes(ctx.run_id, self.source_id(), url).await {
                Ok(resp) => {
                    return Ok(FetchedPage {
                        target: target.label.clone(),
                        url: resp.final_url,
                        content_type: resp
                            .content_type
                            .unwrap_or_else(|| "application/json".to_string()),
                        body: resp.body,
                        fetched_at: Utc::now(),
                    });
                }
                Err(err) => {
                    debug!(source_id = self.source_id(), url, error = %err, "candidate url failed");
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(source) => Err(AdapterError::Fetch {
                target: target.label.clone(),
                source,
            }),
            None => Err(AdapterError::Message(format!(
                "no candidate urls for {}",
                target.label
            ))),
        }
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<RecordResult>, AdapterError>;
}

/// Builds the adapter for a configured source, or `None` for an unknown kind.
pub fn adapter_for_source(config: &SourceConfig) -> Option<Box<dyn SourceAdapter>> {
    match config.kind.as_str() {
        "greenhouse" => Some(Box::new(GreenhouseAdapter::from_config(config))),
        "lever" => Some(Box::new(LeverAdapter::from_config(config))),
        "ashby" => Some(Box::new(AshbyAdapter::from_config(config))),
        "csv" => CsvFileAdapter::from_config(config).map(|a| Box::new(a) as Box<dyn SourceAdapter>),
        _ => None,
    }
}

/// Splits a JSON array payload into per-item values so item failures stay local.
///
/// Object payloads are unwrapped through `root` when given.
pub(crate) fn json_items(
    page: &FetchedPage,
    root: Option<&str>,
) -> Result<Vec<serde_json::Value>, AdapterError> {
    let malformed = |message: String| AdapterError::Malformed {
        target: page.target.clone(),
        message,
    };
    let value: serde_json::Value =
        serde_json::from_slice(&page.body).map_err(|e| malformed(e.to_string()))?;
    let array = match (value, root) {
        (serde_json::Value::Object(mut map), Some(key)) => {
            map.remove(key).unwrap_or(serde_json::Value::Null)
        }
        (value, _) => value,
    };
    match array {
        serde_json::Value::Array(items) => Ok(items),
        other => Err(malformed(format!("expected an array, found {}", json_kind(&other)))),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

pub(crate) fn decode_item<T: serde::de::DeserializeOwned>(
    page: &FetchedPage,
    item: serde_json::Value,
) -> Result<T, AdapterError> {
    serde_json::from_value(item).map_err(|e| AdapterError::Malformed {
        target: page.target.clone(),
        message: e.to_string(),
    })
}

pub(crate) fn text_or_none(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            parse_date(value)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
        })
}

pub(crate) fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|ts| ts.with_timezone(&Utc).date_naive())
        })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::PathBuf;

    use chrono::Utc;

    use crate::FetchedPage;

    pub fn fixture_path(relative: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("fixtures")
            .join(relative)
    }

    pub fn page_from_fixture(relative: &str) -> FetchedPage {
        let body = std::fs::read(fixture_path(relative)).expect("read fixture");
        FetchedPage {
            target: relative.to_string(),
            url: format!("file://{relative}"),
            content_type: "application/json".to_string(),
            body,
            fetched_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: &str) -> SourceConfig {
        SourceConfig {
            source_id: format!("{kind}-boards"),
            kind: kind.to_string(),
            display_name: kind.to_string(),
            enabled: true,
            boards: vec!["acme".to_string()],
            path: Some(PathBuf::from("data/internships.csv")),
        }
    }

    #[test]
    fn registry_builds_known_kinds_only() {
        for kind in ["greenhouse", "lever", "ashby", "csv"] {
            let adapter = adapter_for_source(&config(kind)).expect("known kind");
            assert_eq!(adapter.source_id(), format!("{kind}-boards"));
        }
        assert!(adapter_for_source(&config("workday")).is_none());
    }

    #[test]
    fn non_array_payload_is_malformed() {
        let page = FetchedPage {
            target: "acme".to_string(),
            url: "https://example.test".to_string(),
            content_type: "application/json".to_string(),
            body: br#"{"jobs": {"not": "a list"}}"#.to_vec(),
            fetched_at: Utc::now(),
        };
        let err = json_items(&page, Some("jobs")).expect_err("object is not a list");
        assert!(matches!(err, AdapterError::Malformed { .. }));
    }

    #[test]
    fn timestamps_accept_dates_and_rfc3339() {
        assert_eq!(
            parse_date("2026-05-01"),
            NaiveDate::from_ymd_opt(2026, 5, 1)
        );
        assert_eq!(
            parse_date("2026-05-01T10:00:00Z"),
            NaiveDate::from_ymd_opt(2026, 5, 1)
        );
        assert!(parse_timestamp("2026-05-01").is_some());
        assert!(parse_timestamp("soon").is_none());
    }
}
