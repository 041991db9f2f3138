//! Aggregate read-side endpoints: anchor batches, the daily budget and
//! per-consumer usage totals.

use crate::AppState;
use crate::errors::{Error, Result};
use crate::store::{BatchRow, BudgetRow, UsageTotals};
use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct BatchesQuery {
    pub limit: Option<i64>,
}

pub async fn list_batches(
    State(state): State<AppState>,
    Query(query): Query<BatchesQuery>,
) -> Result<Json<Vec<BatchRow>>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    Ok(Json(state.store.list_batches(limit).await?))
}

pub async fn get_batch(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<BatchRow>> {
    let batch = state
        .store
        .get_batch(id)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "batch",
            id: id.to_string(),
        })?;
    Ok(Json(batch))
}

/// Today's anchoring-budget counters.
pub async fn budget_today(State(state): State<AppState>) -> Result<Json<BudgetRow>> {
    let budget = state.store.get_budget(Utc::now().date_naive()).await?;
    Ok(Json(budget))
}

pub async fn usage_totals(State(state): State<AppState>) -> Result<Json<Vec<UsageTotals>>> {
    Ok(Json(state.store.usage_totals().await?))
}

/// The local batch store's view of the anchoring state against the chain's.
#[derive(Debug, Serialize)]
pub struct AnchorStatus {
    pub anchoring_enabled: bool,
    pub stored_max_sequence: Option<i64>,
    pub chain_batches: Option<u64>,
}

pub async fn anchor_status(State(state): State<AppState>) -> Result<Json<AnchorStatus>> {
    let stored_max_sequence = state.store.max_anchor_sequence().await?;
    let chain_batches = match state.chain.total_batches().await {
        Ok(count) => Some(count),
        Err(e) => {
            tracing::warn!(error = %e, "Chain batch count unavailable");
            None
        }
    };
    Ok(Json(AnchorStatus {
        anchoring_enabled: state.batcher.is_some(),
        stored_max_sequence,
        chain_batches,
    }))
}
