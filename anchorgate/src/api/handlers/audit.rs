//! Read-side audit endpoints: usage logs and inclusion verification.

use crate::AppState;
use crate::anchor::pipeline::{self, Verification};
use crate::errors::{Error, Result};
use crate::store::UsageLog;
use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub consumer_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 500;

pub async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<UsageLog>>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let offset = query.offset.unwrap_or(0).max(0);
    let logs = state
        .store
        .list_usage_logs(query.consumer_id.as_deref(), limit, offset)
        .await?;
    Ok(Json(logs))
}

pub async fn get_log(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<UsageLog>> {
    let log = state
        .store
        .get_usage_log(id)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "usage log",
            id: id.to_string(),
        })?;
    Ok(Json(log))
}

/// Re-derive the record's Merkle inclusion and its batch's chain linkage.
pub async fn verify_log(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Verification>> {
    let verification = pipeline::verify_log(state.store.as_ref(), state.chain.as_ref(), id)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "usage log",
            id: id.to_string(),
        })?;
    Ok(Json(verification))
}
