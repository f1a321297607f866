use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use itrack_core::RawListing;
use itrack_storage::HttpFetcher;
use serde::Deserialize;

use crate::{
    parse_date, parse_timestamp, text_or_none, AdapterContext, AdapterError, FetchedPage,
    ListingTarget, RecordResult, SourceAdapter, SourceConfig,
};

/// Bulk import from a local CSV file with a header row.
///
/// `skills` and `tags` cells are `|`-separated. Rows are curated input and skip
/// the relevance filters.
#[derive(Debug, Clone)]
pub struct CsvFileAdapter {
    source_id: String,
    source_name: String,
    path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CsvRow {
    title: Option<String>,
    company: Option<String>,
    location: Option<String>,
    remote: Option<String>,
    stipend_min: Option<String>,
    stipend_max: Option<String>,
    duration_weeks: Option<String>,
    skills: Option<String>,
    tags: Option<String>,
    description: Option<String>,
    source: Option<String>,
    source_url: Option<String>,
    external_id: Option<String>,
    deadline: Option<String>,
    posted_at: Option<String>,
}

fn split_list(cell: Option<String>) -> Vec<String> {
    text_or_none(cell)
        .map(|cell| {
            cell.split('|')
                .filter_map(|part| text_or_none(Some(part.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

impl CsvFileAdapter {
    pub fn new(
        source_id: impl Into<String>,
        source_name: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            source_name: source_name.into(),
            path: path.into(),
        }
    }

    /// `None` when the config names no file.
    pub fn from_config(config: &SourceConfig) -> Option<Self> {
        let path = config.path.clone()?;
        Some(Self::new(
            config.source_id.clone(),
            config.display_name.clone(),
            path,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn row_to_raw(&self, row: CsvRow, line: u64) -> RecordResult {
        let invalid = |field: &str, value: &str| AdapterError::Malformed {
            target: format!("{}:{line}", self.path.display()),
            message: format!("invalid {field} {value:?}"),
        };
        let number = |field: &str, cell: Option<String>| -> Result<Option<f64>, AdapterError> {
            match text_or_none(cell) {
                Some(v) => match v.parse::<f64>() {
                    Ok(n) if n.is_finite() && n >= 0.0 => Ok(Some(n)),
                    _ => Err(invalid(field, &v)),
                },
                None => Ok(None),
            }
        };

        let deadline = match text_or_none(row.deadline) {
            Some(v) => Some(parse_date(&v).ok_or_else(|| invalid("deadline", &v))?),
            None => None,
        };
        let posted_at = match text_or_none(row.posted_at) {
            Some(v) => Some(parse_timestamp(&v).ok_or_else(|| invalid("postedAt", &v))?),
            None => None,
        };
        let duration_weeks = match text_or_none(row.duration_weeks) {
            Some(v) => Some(v.parse::<u32>().map_err(|_| invalid("durationWeeks", &v))?),
            None => None,
        };

        Ok(RawListing {
            external_id: text_or_none(row.external_id),
            title: row.title.unwrap_or_default(),
            company: row.company.unwrap_or_default(),
            location: row.location.unwrap_or_default(),
            remote: text_or_none(row.remote).map(|v| v.eq_ignore_ascii_case("true")),
            description: row.description.unwrap_or_default(),
            source_url: text_or_none(row.source_url),
            stipend_min: number("stipendMin", row.stipend_min)?,
            stipend_max: number("stipendMax", row.stipend_max)?,
            duration_weeks,
            skills: split_list(row.skills),
            tags: split_list(row.tags),
            deadline,
            posted_at,
            raw_meta: None,
            source: text_or_none(row.source),
            curated: true,
        })
    }
}

#[async_trait]
impl SourceAdapter for CsvFileAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn source_name(&self) -> &str {
        &self.source_name
    }

    fn listing_targets(&self) -> Vec<ListingTarget> {
        vec![ListingTarget {
            label: self.path.display().to_string(),
            urls: Vec::new(),
        }]
    }

    async fn fetch_target(
        &self,
        _http: &HttpFetcher,
        _ctx: &AdapterContext,
        target: &ListingTarget,
    ) -> Result<FetchedPage, AdapterError> {
        let body = tokio::fs::read(&self.path)
            .await
            .map_err(|source| AdapterError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        Ok(FetchedPage {
            target: target.label.clone(),
            url: format!("file://{}", self.path.display()),
            content_type: "text/csv".to_string(),
            body,
            fetched_at: Utc::now(),
        })
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<RecordResult>, AdapterError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(page.body.as_slice());

        reader.headers().map_err(|e| AdapterError::Malformed {
            target: page.target.clone(),
            message: format!("reading header row: {e}"),
        })?;

        let mut records = Vec::new();
        for (index, row) in reader.deserialize::<CsvRow>().enumerate() {
            let line = index as u64 + 2;
            records.push(match row {
                Ok(row) => self.row_to_raw(row, line),
                Err(e) => Err(AdapterError::Malformed {
                    target: format!("{}:{line}", page.target),
                    message: e.to_string(),
                }),
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture_path;
    use chrono::NaiveDate;
    use std::io::Write;
    use uuid::Uuid;

    fn ctx() -> AdapterContext {
        AdapterContext {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn reads_pipe_separated_lists_and_typed_cells() {
        let adapter = CsvFileAdapter::new(
            "csv",
            "CSV",
            fixture_path("csv/internships.csv"),
        );
        let http = HttpFetcher::new(Default::default()).expect("http");
        let target = adapter.listing_targets().remove(0);
        let page = adapter
            .fetch_target(&http, &ctx(), &target)
            .await
            .expect("read csv");

        let records = adapter.parse_listing(&page).expect("parse csv");
        assert_eq!(records.len(), 3);

        let first = records[0].as_ref().expect("valid row");
        assert_eq!(first.title, "Machine Learning Intern");
        assert_eq!(first.skills, vec!["Python", "PyTorch", "SQL"]);
        assert_eq!(first.tags, vec!["AI", "ML"]);
        assert_eq!(first.stipend_min, Some(15000.0));
        assert_eq!(first.remote, Some(true));
        assert_eq!(first.deadline, NaiveDate::from_ymd_opt(2026, 6, 30));
        assert_eq!(first.source.as_deref(), Some("Campus Board"));
        assert!(first.curated);

        let second = records[1].as_ref().expect("quoted row");
        assert_eq!(second.description, "Build eval tooling, dashboards, and reports");
        assert_eq!(second.source_url, None);

        assert!(records[2].is_err(), "bad deadline is a per-row error");
    }

    #[tokio::test]
    async fn missing_file_is_a_target_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = CsvFileAdapter::new("csv", "CSV", dir.path().join("absent.csv"));
        let http = HttpFetcher::new(Default::default()).expect("http");
        let target = adapter.listing_targets().remove(0);
        let err = adapter
            .fetch_target(&http, &ctx(), &target)
            .await
            .expect_err("no file");
        assert!(matches!(err, AdapterError::Io { .. }));
    }

    #[tokio::test]
    async fn header_only_file_yields_no_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.csv");
        let mut file = std::fs::File::create(&path).expect("create");
        writeln!(file, "title,company,location").expect("write");

        let adapter = CsvFileAdapter::new("csv", "CSV", &path);
        let http = HttpFetcher::new(Default::default()).expect("http");
        let target = adapter.listing_targets().remove(0);
        let page = adapter
            .fetch_target(&http, &ctx(), &target)
            .await
            .expect("read");
        assert!(adapter.parse_listing(&page).expect("parse").is_empty());
    }

    #[tokio::test]
    async fn negative_or_non_finite_stipends_are_row_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stipends.csv");
        let mut file = std::fs::File::create(&path).expect("create");
        writeln!(file, "title,company,stipendMin,stipendMax").expect("write");
        writeln!(file, "ML Intern,Acme,-500,").expect("write");
        writeln!(file, "AI Intern,Acme,NaN,").expect("write");
        writeln!(file, "NLP Intern,Acme,,inf").expect("write");
        writeln!(file, "CV Intern,Acme,0,1000").expect("write");

        let adapter = CsvFileAdapter::new("csv", "CSV", &path);
        let http = HttpFetcher::new(Default::default()).expect("http");
        let target = adapter.listing_targets().remove(0);
        let page = adapter
            .fetch_target(&http, &ctx(), &target)
            .await
            .expect("read");
        let records = adapter.parse_listing(&page).expect("parse");
        assert_eq!(records.len(), 4);
        assert!(records[..3].iter().all(Result::is_err));
        let valid = records[3].as_ref().expect("valid row");
        assert_eq!(valid.stipend_max, Some(1000.0));
    }
}
