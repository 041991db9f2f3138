//! The single client-facing path: `POST /ai/v1/chat/completions`.

use crate::AppState;
use crate::proxy;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match proxy::proxy_chat(state, &headers, body).await {
        Ok(response) => response.into_response(),
        Err(error) => error.into_response(),
    }
}
