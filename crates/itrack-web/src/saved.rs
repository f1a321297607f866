use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use itrack_core::{Listing, ListingId, SaveOutcome, SavedStatus, UserId};
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::internships::parse_listing_id;
use crate::AppState;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedView {
    pub internship: ListingId,
    pub status: SavedStatus,
    pub saved_at: DateTime<Utc>,
    pub last_reminder_at: Option<DateTime<Utc>>,
    pub internship_details: Option<Listing>,
}

#[derive(Debug, Serialize)]
pub struct SavedResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SaveOutcome>,
    pub saved: Vec<SavedView>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SaveRequest {
    pub internship_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StatusRequest {
    pub status: Option<String>,
}

fn parse_status(raw: Option<&str>) -> ApiResult<Option<SavedStatus>> {
    match raw {
        None => Ok(None),
        Some(raw) => SavedStatus::parse(raw).map(Some).ok_or_else(|| {
            ApiError::invalid("status", "status must be interested, applied or selected")
        }),
    }
}

/// Saved entries joined with their listings, most recently saved first.
async fn saved_views(state: &AppState, user_id: UserId) -> ApiResult<Vec<SavedView>> {
    let user = state
        .store
        .find_user_by_id(user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("user not found".to_string()))?;
    let ids: Vec<ListingId> = user.saved.keys().copied().collect();
    let mut listings: HashMap<ListingId, Listing> = state
        .store
        .listings_by_ids(&ids)
        .await?
        .into_iter()
        .map(|listing| (listing.id, listing))
        .collect();

    let mut views: Vec<SavedView> = user
        .saved
        .values()
        .map(|entry| SavedView {
            internship: entry.listing_id,
            status: entry.status,
            saved_at: entry.saved_at,
            last_reminder_at: entry.last_reminder_at,
            internship_details: listings.remove(&entry.listing_id),
        })
        .collect();
    views.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
    Ok(views)
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> ApiResult<Json<SavedResponse>> {
    Ok(Json(SavedResponse {
        outcome: None,
        saved: saved_views(&state, auth.id).await?,
    }))
}

pub async fn save(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    payload: Result<Json<SaveRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SavedResponse>)> {
    let Json(request) = payload?;
    let listing_id = match request.internship_id.as_deref() {
        Some(raw) if !raw.trim().is_empty() => parse_listing_id(raw)
            .map_err(|_| ApiError::invalid("internshipId", "invalid internshipId"))?,
        _ => return Err(ApiError::invalid("internshipId", "internshipId required")),
    };
    let status = parse_status(request.status.as_deref())?;

    let outcome = state
        .store
        .save_listing(auth.id, listing_id, status, Utc::now())
        .await?;
    let code = match outcome {
        SaveOutcome::Created => StatusCode::CREATED,
        SaveOutcome::AlreadySaved | SaveOutcome::StatusUpdated => StatusCode::OK,
    };
    Ok((
        code,
        Json(SavedResponse {
            outcome: Some(outcome),
            saved: saved_views(&state, auth.id).await?,
        }),
    ))
}

pub async fn update_status(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(id): Path<String>,
    payload: Result<Json<StatusRequest>, JsonRejection>,
) -> ApiResult<Json<SavedResponse>> {
    let listing_id = parse_listing_id(&id)?;
    let Json(request) = payload?;
    let status = parse_status(request.status.as_deref())?
        .ok_or_else(|| ApiError::invalid("status", "status required"))?;

    if !state
        .store
        .update_saved_status(auth.id, listing_id, status)
        .await?
    {
        return Err(ApiError::NotFound("internship not saved".to_string()));
    }
    Ok(Json(SavedResponse {
        outcome: None,
        saved: saved_views(&state, auth.id).await?,
    }))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<SavedResponse>> {
    let listing_id = parse_listing_id(&id)?;
    if !state.store.remove_saved(auth.id, listing_id).await? {
        return Err(ApiError::NotFound("internship not saved".to_string()));
    }
    Ok(Json(SavedResponse {
        outcome: None,
        saved: saved_views(&state, auth.id).await?,
    }))
}
