//! Pricing administration. Writes invalidate the hot snapshot so the next
//! request sees the new rates.

use crate::AppState;
use crate::errors::{Error, Result};
use crate::store::PricingRow;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use crate::types::Provider;

pub async fn list_pricing(State(state): State<AppState>) -> Result<Json<Vec<PricingRow>>> {
    Ok(Json(state.store.list_pricing().await?))
}

pub async fn upsert_pricing(
    State(state): State<AppState>,
    Json(row): Json<PricingRow>,
) -> Result<Json<PricingRow>> {
    if Provider::parse(&row.provider).is_none() {
        return Err(Error::BadRequest {
            message: format!("unknown provider {:?}", row.provider),
        });
    }
    state.store.upsert_pricing(&row).await?;
    state.pricing.invalidate();
    Ok(Json(row))
}

pub async fn delete_pricing(
    State(state): State<AppState>,
    Path((provider, model)): Path<(String, String)>,
) -> Result<StatusCode> {
    let deleted = state.store.delete_pricing(&provider, &model).await?;
    if !deleted {
        return Err(Error::NotFound {
            resource: "pricing row",
            id: format!("{provider}/{model}"),
        });
    }
    state.pricing.invalidate();
    Ok(StatusCode::NO_CONTENT)
}

pub async fn invalidate_pricing(State(state): State<AppState>) -> StatusCode {
    state.pricing.invalidate();
    StatusCode::NO_CONTENT
}
