use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::auth::AdminAccess;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// Starts an ingestion run in the background unless one already holds the lease.
pub async fn trigger_run(
    State(state): State<Arc<AppState>>,
    _admin: AdminAccess,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let pipeline = state
        .pipeline
        .clone()
        .ok_or_else(|| ApiError::Unavailable("ingestion pipeline not configured".to_string()))?;

    let Some(lease) = pipeline.acquire_lease().await? else {
        return Ok((
            StatusCode::CONFLICT,
            Json(json!({ "status": "already-running" })),
        ));
    };
    let run_id = lease.run_id();
    info!(%run_id, "ingestion run triggered by admin");

    tokio::spawn(async move {
        match pipeline.run_with_lease(lease).await {
            Ok(summary) => info!(
                %run_id,
                created = summary.totals.created,
                updated = summary.totals.updated,
                errored = summary.totals.errored,
                "admin-triggered run finished"
            ),
            Err(err) => error!(%run_id, error = %err, "admin-triggered run failed"),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "started", "runId": run_id })),
    ))
}
