use chrono::{DateTime, Utc};
use itrack_core::RawListing;
use serde::Deserialize;

use crate::{
    decode_item, json_items, text_or_none, AdapterError, FetchedPage, ListingTarget,
    RecordResult, SourceAdapter, SourceConfig,
};

const POSTINGS_API: &str = "https://api.lever.co/v0/postings";

/// Lever postings API. The company name is the configured board slug.
#[derive(Debug, Clone)]
pub struct LeverAdapter {
    source_id: String,
    boards: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeverPosting {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    description_plain: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    hosted_url: Option<String>,
    #[serde(default)]
    apply_url: Option<String>,
    /// Epoch milliseconds.
    #[serde(default)]
    created_at: Option<i64>,
    #[serde(default)]
    categories: Option<LeverCategories>,
    #[serde(default)]
    workplace_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LeverCategories {
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    commitment: Option<String>,
}

impl LeverAdapter {
    pub fn new(source_id: impl Into<String>, boards: Vec<String>) -> Self {
        Self {
            source_id: source_id.into(),
            boards,
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(config.source_id.clone(), config.boards.clone())
    }

    fn to_raw(posting: LeverPosting, board: &str) -> RawListing {
        let (location, commitment) = match posting.categories {
            Some(c) => (c.location.unwrap_or_default(), c.commitment),
            None => (String::new(), None),
        };
        let remote = posting
            .workplace_type
            .as_deref()
            .filter(|w| w.eq_ignore_ascii_case("remote"))
            .map(|_| true);
        RawListing {
            external_id: text_or_none(posting.id),
            title: posting.text.unwrap_or_default(),
            company: board.to_string(),
            location,
            remote,
            description: text_or_none(posting.description_plain)
                .or(posting.description)
                .unwrap_or_default(),
            source_url: text_or_none(posting.hosted_url).or_else(|| text_or_none(posting.apply_url)),
            posted_at: posting
                .created_at
                .and_then(DateTime::<Utc>::from_timestamp_millis),
            raw_meta: commitment.map(|c| serde_json::json!({ "commitment": c })),
            ..RawListing::default()
        }
    }
}

#[async_trait::async_trait]
impl SourceAdapter for LeverAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn source_name(&self) -> &str {
        "Lever"
    }

    fn listing_targets(&self) -> Vec<ListingTarget> {
        self.boards
            .iter()
            .map(|board| ListingTarget {
                label: board.clone(),
                urls: vec![format!("{POSTINGS_API}/{board}?mode=json")],
            })
            .collect()
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<RecordResult>, AdapterError> {
        Ok(json_items(page, None)?
            .into_iter()
            .map(|item| decode_item(page, item).map(|p| Self::to_raw(p, &page.target)))
            .collect())
    }
}
