use itrack_core::RawListing;
use serde::Deserialize;

use crate::{
    decode_item, json_items, parse_timestamp, text_or_none, AdapterError, FetchedPage,
    ListingTarget, RecordResult, SourceAdapter, SourceConfig,
};

const ASHBY_API: &str = "https://jobs.ashbyhq.com/api";

/// Ashby organization job boards.
///
/// Two public endpoint shapes exist; each organization's target lists both and the
/// first one that answers wins. The board endpoint wraps jobs in `{"jobs": [...]}`,
/// the organization endpoint returns a bare array.
#[derive(Debug, Clone)]
pub struct AshbyAdapter {
    source_id: String,
    organizations: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AshbyJob {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    company_name: Option<String>,
    #[serde(default)]
    organization: Option<AshbyOrganization>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    description_html: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    location_name: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    job_url: Option<String>,
    #[serde(default)]
    is_remote: Option<bool>,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    /// Nested variant where the posting details live under `job`.
    #[serde(default)]
    job: Option<Box<AshbyJob>>,
}

#[derive(Debug, Default, Deserialize)]
struct AshbyOrganization {
    #[serde(default)]
    name: Option<String>,
}

impl AshbyAdapter {
    pub fn new(source_id: impl Into<String>, organizations: Vec<String>) -> Self {
        Self {
            source_id: source_id.into(),
            organizations,
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(config.source_id.clone(), config.boards.clone())
    }

    fn to_raw(job: AshbyJob, organization: &str) -> RawListing {
        let inner = job.job.map(|b| *b).unwrap_or_default();
        let posted = job
            .updated_at
            .or(job.created_at)
            .or(inner.updated_at)
            .or(inner.created_at);
        RawListing {
            external_id: text_or_none(job.id).or_else(|| text_or_none(inner.id)),
            title: text_or_none(job.title)
                .or_else(|| text_or_none(inner.title))
                .unwrap_or_default(),
            company: text_or_none(job.company_name)
                .or_else(|| text_or_none(job.organization.and_then(|o| o.name)))
                .unwrap_or_else(|| organization.to_string()),
            location: text_or_none(job.location)
                .or_else(|| text_or_none(job.location_name))
                .or_else(|| text_or_none(inner.location))
                .unwrap_or_default(),
            remote: job.is_remote.or(inner.is_remote),
            description: text_or_none(job.description)
                .or_else(|| text_or_none(job.description_html))
                .or_else(|| text_or_none(inner.description_html))
                .unwrap_or_default(),
            source_url: text_or_none(job.url)
                .or_else(|| text_or_none(inner.job_url))
                .or_else(|| text_or_none(job.job_url)),
            posted_at: posted.as_deref().and_then(parse_timestamp),
            ..RawListing::default()
        }
    }
}

#[async_trait::async_trait]
impl SourceAdapter for AshbyAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn source_name(&self) -> &str {
        "Ashby"
    }

    fn listing_targets(&self) -> Vec<ListingTarget> {
        self.organizations
            .iter()
            .map(|org| ListingTarget {
                label: org.clone(),
                urls: vec![
                    format!("{ASHBY_API}/job-board/{org}"),
                    format!("{ASHBY_API}/non-user-organization/{org}.jobs"),
                ],
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
