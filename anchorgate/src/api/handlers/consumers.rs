//! Consumer quota read and update. Consumer CRUD itself lives at the
//! upstream edge; the gateway only owns the quota ledger.

use crate::AppState;
use crate::errors::{Error, Result};
use crate::store::ConsumerQuota;
use axum::Json;
use axum::extract::{Path, State};
use rust_decimal::Decimal;
use serde::Deserialize;

pub async fn get_consumer(
    State(state): State<AppState>,
    Path(consumer_id): Path<String>,
) -> Result<Json<ConsumerQuota>> {
    let consumer = state
        .store
        .get_consumer(&consumer_id)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "consumer",
            id: consumer_id.clone(),
        })?;
    Ok(Json(consumer))
}

#[derive(Debug, Deserialize)]
pub struct QuotaUpdate {
    pub quota: Decimal,
}

pub async fn set_quota(
    State(state): State<AppState>,
    Path(consumer_id): Path<String>,
    Json(update): Json<QuotaUpdate>,
) -> Result<Json<ConsumerQuota>> {
    if update.quota < Decimal::ZERO {
        return Err(Error::BadRequest {
            message: "quota must not be negative".to_string(),
        });
    }
    let consumer = state
        .store
        .set_consumer_quota(&consumer_id, update.quota)
        .await
        .map_err(|e| match e {
            crate::store::StoreError::NotFound => Error::NotFound {
                resource: "consumer",
                id: consumer_id.clone(),
            },
            other => other.into(),
        })?;
    Ok(Json(consumer))
}
