//! Listing search, detail, and manual submission.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use itrack_core::{
    Listing, ListingId, ListingQuery, RawListing, SortField, SortOrder, UpsertOutcome,
    MAX_PAGE_LIMIT,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use url::Url;
use uuid::Uuid;

use crate::auth::AdminAccess;
use crate::error::{ApiError, ApiResult, FieldError};
use crate::AppState;

pub const MANUAL_SOURCE: &str = "Manual";

/// Raw query string values; validated into a [`ListingQuery`].
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchParams {
    pub search: Option<String>,
    pub skills: Option<String>,
    pub location: Option<String>,
    pub remote: Option<String>,
    pub min_stipend: Option<String>,
    pub sort_by: Option<String>,
    pub order: Option<String>,
    pub page: Option<String>,
    pub limit: Option<String>,
    pub include_expired: Option<String>,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl SearchParams {
    pub fn into_query(self) -> Result<ListingQuery, Vec<FieldError>> {
        let mut problems = Vec::new();
        let mut query = ListingQuery {
            search: non_empty(self.search),
            location: non_empty(self.location),
            skills: self
                .skills
                .map(|list| {
                    list.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            ..ListingQuery::default()
        };

        if let Some(raw) = non_empty(self.remote) {
            match parse_bool(&raw) {
                Some(remote) => query.remote = Some(remote),
                None => problems.push(FieldError::new("remote", "must be a boolean")),
            }
        }
        if let Some(raw) = non_empty(self.include_expired) {
            match parse_bool(&raw) {
                Some(include) => query.include_expired = include,
                None => problems.push(FieldError::new("includeExpired", "must be a boolean")),
            }
        }
        if let Some(raw) = non_empty(self.min_stipend) {
            match raw.parse::<f64>() {
                Ok(min) if min.is_finite() => query.min_stipend = Some(min),
                _ => problems.push(FieldError::new("minStipend", "must be a number")),
            }
        }
        if let Some(raw) = non_empty(self.sort_by) {
            match SortField::parse(&raw) {
                Some(field) => query.sort_by = field,
                None => problems.push(FieldError::new(
                    "sortBy",
                    "must be one of postedAt, deadline, stipendMin",
                )),
            }
        }
        if let Some(raw) = non_empty(self.order) {
            match SortOrder::parse(&raw) {
                Some(order) => query.order = order,
                None => problems.push(FieldError::new("order", "must be asc or desc")),
            }
        }
        if let Some(raw) = non_empty(self.page) {
            match raw.parse::<u32>() {
                Ok(page) if page >= 1 => query.page = page,
                _ => problems.push(FieldError::new("page", "must be an integer of at least 1")),
            }
        }
        if let Some(raw) = non_empty(self.limit) {
            match raw.parse::<u32>() {
                Ok(limit) if (1..=MAX_PAGE_LIMIT).contains(&limit) => query.limit = limit,
                _ => problems.push(FieldError::new(
                    "limit",
                    format!("must be an integer between 1 and {MAX_PAGE_LIMIT}"),
                )),
            }
        }

        if problems.is_empty() {
            Ok(query)
        } else {
            Err(problems)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Pagination {
    pub total: u64,
    pub page: u32,
    pub pages: u32,
    pub limit: u32,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub data: Vec<Listing>,
    pub pagination: Pagination,
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> ApiResult<Json<SearchResponse>> {
    let Query(params) = params?;
    let query = params.into_query().map_err(ApiError::Validation)?;
    let page = state
        .store
        .search_listings(&query, Utc::now().date_naive())
        .await?;
    Ok(Json(SearchResponse {
        pagination: Pagination {
            total: page.total,
            page: page.page,
            pages: page.pages,
            limit: page.limit,
        },
        data: page.items,
    }))
}

pub(crate) fn parse_listing_id(raw: &str) -> ApiResult<ListingId> {
    Uuid::parse_str(raw.trim()).map_err(|_| ApiError::invalid("id", "invalid internship id"))
}

pub async fn detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = parse_listing_id(&id)?;
    let listing = state
        .store
        .find_listing_by_id(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("internship not found".to_string()))?;
    Ok(Json(serde_json::json!({ "data": listing })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubmissionRequest {
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub remote: Option<bool>,
    pub stipend_min: Option<f64>,
    pub stipend_max: Option<f64>,
    pub duration_weeks: Option<u32>,
    pub skills: Vec<String>,
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub source: Option<String>,
    pub source_url: Option<String>,
    pub external_id: Option<String>,
    pub deadline: Option<NaiveDate>,
    pub posted_at: Option<DateTime<Utc>>,
    pub raw_meta: Option<Value>,
}

impl SubmissionRequest {
    fn validate(&self) -> Vec<FieldError> {
        let mut problems = Vec::new();
        if self.title.as_deref().is_none_or(|t| t.trim().is_empty()) {
            problems.push(FieldError::new("title", "title is required"));
        }
        if let Some(raw) = self.source_url.as_deref().filter(|u| !u.trim().is_empty()) {
            match Url::parse(raw.trim()) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                _ => problems.push(FieldError::new("sourceUrl", "source URL must be a valid URL")),
            }
        }
        for (field, value) in [("stipendMin", self.stipend_min), ("stipendMax", self.stipend_max)] {
            if value.is_some_and(|v| !v.is_finite() || v < 0.0) {
                problems.push(FieldError::new(field, "must be a non-negative number"));
            }
        }
        if let (Some(min), Some(max)) = (self.stipend_min, self.stipend_max) {
            if max < min {
                problems.push(FieldError::new(
                    "stipendMax",
                    "maximum stipend cannot be less than minimum",
                ));
            }
        }
        problems
    }

    fn into_raw(self) -> RawListing {
        RawListing {
            external_id: non_empty(self.external_id),
            title: self.title.unwrap_or_default(),
            company: self.company.unwrap_or_default(),
            location: self.location.unwrap_or_default(),
            remote: self.remote,
            description: self.description.unwrap_or_default(),
            source_url: non_empty(self.source_url),
            stipend_min: self.stipend_min,
            stipend_max: self.stipend_max,
            duration_weeks: self.duration_weeks,
            skills: self.skills,
            tags: self.tags,
            deadline: self.deadline,
            posted_at: self.posted_at,
            raw_meta: self.raw_meta,
            source: non_empty(self.source),
            curated: true,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubmissionResponse {
    pub created: bool,
    pub outcome: UpsertOutcome,
    pub data: Option<Listing>,
}

/// Identity-based upsert of one curated listing.
pub async fn submit(
    State(state): State<Arc<AppState>>,
    _admin: AdminAccess,
    payload: Result<Json<SubmissionRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SubmissionResponse>)> {
    let Json(request) = payload?;
    let problems = request.validate();
    if !problems.is_empty() {
        return Err(ApiError::Validation(problems));
    }

    let draft = state
        .normalizer
        .normalize(request.into_raw(), MANUAL_SOURCE)
        .map_err(|reason| ApiError::Unprocessable(format!("listing rejected: {}", reason.as_str())))?;
    let identified = state.identity.identify(draft).map_err(|_| {
        ApiError::Unprocessable(
            "listing needs a sourceUrl or externalId to be identified".to_string(),
        )
    })?;

    let outcome = state.upserter.upsert(&identified, Utc::now()).await?;
    let data = match outcome.listing_id() {
        Some(id) => state.store.find_listing_by_id(id).await?,
        None => {
            state
                .store
                .find_listing_by_hash(&identified.identity.unique_hash)
                .await?
        }
    };
    let created = outcome.is_created();
    info!(?outcome, title = %identified.draft.title, "manual listing submitted");
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(SubmissionResponse {
            created,
            outcome,
            data,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_params_validate_into_query() {
        let params = SearchParams {
            skills: Some("python, pytorch,,".to_string()),
            remote: Some("true".to_string()),
            sort_by: Some("deadline".to_string()),
            order: Some("asc".to_string()),
            page: Some("2".to_string()),
            limit: Some("5".to_string()),
            ..SearchParams::default()
        };
        let query = params.into_query().expect("valid");
        assert_eq!(query.skills, vec!["python", "pytorch"]);
        assert_eq!(query.remote, Some(true));
        assert_eq!(query.sort_by, SortField::Deadline);
        assert_eq!(query.order, SortOrder::Asc);
        assert_eq!(query.offset(), 5);
        assert!(!query.include_expired);
    }

    #[test]
    fn bad_params_report_every_field() {
        let params = SearchParams {
            limit: Some("500".to_string()),
            page: Some("0".to_string()),
            sort_by: Some("title".to_string()),
            ..SearchParams::default()
        };
        let problems = params.into_query().expect_err("invalid");
        let fields: Vec<_> = problems.iter().map(|p| p.field.as_str()).collect();
        assert_eq!(fields, vec!["sortBy", "page", "limit"]);
    }

    #[test]
    fn submission_validation() {
        let request = SubmissionRequest {
            title: Some("  ".to_string()),
            source_url: Some("ftp://files.test/job".to_string()),
            stipend_min: Some(500.0),
            stipend_max: Some(100.0),
            ..SubmissionRequest::default()
        };
        let fields: Vec<_> = request
            .validate()
            .into_iter()
            .map(|p| p.field)
            .collect();
        assert_eq!(fields, vec!["title", "sourceUrl", "stipendMax"]);
    }
}
