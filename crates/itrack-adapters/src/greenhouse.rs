use itrack_core::RawListing;
use serde::Deserialize;

use crate::{
    decode_item, json_items, parse_timestamp, text_or_none, AdapterError, FetchedPage,
    ListingTarget, RecordResult, SourceAdapter, SourceConfig,
};

const BOARD_API: &str = "https://boards-api.greenhouse.io/v1/boards";

/// Greenhouse public job-board API, one request per board token.
#[derive(Debug, Clone)]
pub struct GreenhouseAdapter {
    source_id: String,
    boards: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GreenhouseJob {
    id: Option<u64>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    absolute_url: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    location: Option<NamedRef>,
    #[serde(default)]
    company: Option<NamedRef>,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    #[serde(default)]
    name: Option<String>,
}

impl GreenhouseAdapter {
    pub fn new(source_id: impl Into<String>, boards: Vec<String>) -> Self {
        Self {
            source_id: source_id.into(),
            boards,
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(config.source_id.clone(), config.boards.clone())
    }

    fn to_raw(job: GreenhouseJob, board: &str) -> RawListing {
        RawListing {
            external_id: job.id.map(|id| id.to_string()),
            title: job.title.unwrap_or_default(),
            company: text_or_none(job.company.and_then(|c| c.name))
                .unwrap_or_else(|| board.to_string()),
            location: job.location.and_then(|l| l.name).unwrap_or_default(),
            description: job.content.unwrap_or_default(),
            source_url: text_or_none(job.absolute_url),
            posted_at: job.updated_at.as_deref().and_then(parse_timestamp),
            ..RawListing::default()
        }
    }
}

#[async_trait::async_trait]
impl SourceAdapter for GreenhouseAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn source_name(&self) -> &str {
        "Greenhouse"
    }

    fn listing_targets(&self) -> Vec<ListingTarget> {
        self.boards
            .iter()
            .map(|board| ListingTarget {
                label: board.clone(),
                urls: vec![format!("{BOARD_API}/{board}/jobs?content=true")],
            })
            .collect()
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<RecordResult>, AdapterError> {
        Ok(json_items(page, Some("jobs"))?
            .into_iter()
            .map(|item| decode_item(page, item).map(|job| Self::to_raw(job, &page.target)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::page_from_fixture;

    #[test]
    fn parses_board_payload_and_keeps_bad_items_local() {
        let adapter = GreenhouseAdapter::new("greenhouse", vec!["acme".to_string()]);
        let mut page = page_from_fixture("greenhouse/acme.json");
        page.target = "acme".to_string();

        let records = adapter.parse_listing(&page).expect("page parses");
        assert_eq!(records.len(), 3);

        let first = records[0].as_ref().expect("first job");
        assert_eq!(first.title, "Machine Learning Intern");
        assert_eq!(first.company, "Acme AI");
        assert_eq!(first.location, "Remote - US");
        assert_eq!(first.external_id.as_deref(), Some("4012"));
        assert_eq!(
            first.source_url.as_deref(),
            Some("https://boards.greenhouse.io/acme/jobs/4012")
        );
        assert!(first.posted_at.is_some());

        let second = records[1].as_ref().expect("second job");
        assert_eq!(second.company, "acme");

        assert!(records[2].is_err());
    }

    #[test]
    fn one_target_per_board() {
        let adapter =
            GreenhouseAdapter::new("greenhouse", vec!["acme".to_string(), "globex".to_string()]);
        let targets = adapter.listing_targets();
        assert_eq!(targets.len(), 2);
        assert_eq!(
            targets[1].urls,
            vec!["https://boards-api.greenhouse.io/v1/boards/globex/jobs?content=true"]
        );
    }
}
