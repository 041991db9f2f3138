//! The request router and streaming proxy.
//!
//! One operation: take an OpenAI-style chat payload addressed to
//! `provider/modelName`, admit it (pricing, quota, context window), rewrite
//! it for the provider's dialect, relay the upstream response byte-for-byte,
//! and afterwards extract usage, price the call, debit the consumer and hand
//! the audit record to the anchoring batcher.
//!
//! The relay tees the response into a bounded capture buffer. If the client
//! disconnects mid-stream the upstream is still drained and the post-flight
//! pipeline still runs; billing does not depend on client liveness.

pub mod rewrite;
pub mod upstream;

use crate::anchor::PendingRecord;
use crate::config::IdentityHeaders;
use crate::errors::Error;
use crate::pricing::{self, Rates};
use crate::store::NewUsageLog;
use crate::types::{ModelRef, Provider};
use crate::usage::{self, ExtractError, estimator};
use crate::AppState;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Response, StatusCode, header};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, instrument, warn};
use upstream::UpstreamFailure;

/// Status recorded when the client disconnected before the upstream
/// finished.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Consumer identity established by the upstream edge.
#[derive(Debug, Clone)]
pub struct Identity {
    pub consumer_id: String,
    pub username: Option<String>,
    pub external_id: Option<String>,
}

impl Identity {
    pub fn from_headers(headers: &HeaderMap, names: &IdentityHeaders) -> Result<Identity, Error> {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let consumer_id = get(&names.consumer_id).ok_or(Error::Unauthenticated)?;
        Ok(Identity {
            consumer_id,
            username: get(&names.username),
            external_id: get(&names.external_id),
        })
    }
}

/// Handle one chat-completion call end to end.
#[instrument(skip_all, fields(consumer_id = tracing::field::Empty, model = tracing::field::Empty))]
pub async fn proxy_chat(
    state: AppState,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, Error> {
    let identity = Identity::from_headers(headers, &state.config.identity)?;
    tracing::Span::current().record("consumer_id", identity.consumer_id.as_str());

    if let Err(e) = state.store.bump_request_count(Utc::now().date_naive()).await {
        warn!(error = %e, "Failed to count request against the daily budget");
    }

    let payload: Value = serde_json::from_slice(&body).map_err(|e| Error::BadRequest {
        message: format!("request body is not valid JSON: {e}"),
    })?;
    let model_name = payload
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::BadRequest {
            message: "request has no model field".to_string(),
        })?;
    let model = ModelRef::parse(model_name).ok_or_else(|| Error::InvalidModelFormat {
        model: model_name.to_string(),
    })?;
    tracing::Span::current().record("model", model.to_string().as_str());

    // Admission. Pricing first: an unpriced model must never reach the
    // upstream, or it would spend unmetered.
    if let Err(e) = state.pricing.ensure_fresh().await {
        warn!(error = %e, "Pricing reload failed; serving previous snapshot");
    }
    let rates = state
        .pricing
        .get(model.provider, &model.name)
        .ok_or_else(|| Error::UnsupportedModel {
            provider: model.provider.to_string(),
            model: model.name.clone(),
        })?;

    let consumer = state
        .store
        .get_or_create_consumer(
            &identity.consumer_id,
            identity.username.as_deref(),
            identity.external_id.as_deref(),
            state.config.default_quota,
        )
        .await?;
    if consumer.used >= consumer.quota {
        return Err(Error::QuotaExceeded {
            consumer_id: identity.consumer_id,
        });
    }

    if model.provider == Provider::Local
        && let Some(limit) = state.upstream.context_limit(&model.name).await
    {
        let estimated = estimator::estimate_prompt_tokens(&body);
        if estimated as u64 > limit {
            return Err(Error::ContextLengthExceeded {
                model: model.name,
                estimated,
                limit,
            });
        }
    }

    let mut outbound = payload;
    rewrite::apply(&model, &mut outbound);

    let post_flight = PostFlight {
        state: state.clone(),
        identity,
        model: model.clone(),
        rates,
        request: body,
    };

    match state.upstream.chat(model.provider, &outbound).await {
        Ok(response) => Ok(relay(post_flight, response)),
        Err(failure) => {
            // No upstream response at all. Bill the input side anyway, then
            // surface a synthesized upstream error.
            let status = match failure {
                UpstreamFailure::Timeout => StatusCode::GATEWAY_TIMEOUT,
                UpstreamFailure::Unreachable(_) => StatusCode::BAD_GATEWAY,
            };
            run_post_flight(post_flight, Vec::new(), false, status.as_u16()).await;
            let body = serde_json::json!({
                "error": {
                    "message": failure.to_string(),
                    "type": "api_error",
                    "code": "upstream_unavailable",
                }
            });
            Err(Error::Upstream {
                status,
                body: Bytes::from(body.to_string()),
                content_type: Some(HeaderValue::from_static("application/json")),
            })
        }
    }
}

struct PostFlight {
    state: AppState,
    identity: Identity,
    model: ModelRef,
    rates: Rates,
    request: Bytes,
}

/// Response headers that must not be forwarded: the tee may have implicitly
/// decoded the payload, and the relay re-chunks the body.
fn is_hop_header(name: &header::HeaderName) -> bool {
    name == header::CONTENT_LENGTH
        || name == header::CONTENT_ENCODING
        || name == header::TRANSFER_ENCODING
}

/// Stream the upstream response to the client while capturing it for usage
/// extraction. The drain task owns the upstream stream and outlives the
/// client connection.
fn relay(ctx: PostFlight, upstream_response: reqwest::Response) -> Response<Body> {
    let status = upstream_response.status();
    let capture_cap = ctx.state.config.capture.max_capture_bytes;

    let mut builder = Response::builder().status(status);
    for (name, value) in upstream_response.headers() {
        if !is_hop_header(name) {
            builder = builder.header(name, value);
        }
    }

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);
    tokio::spawn(async move {
        let mut stream = upstream_response.bytes_stream();
        let mut captured: Vec<u8> = Vec::new();
        let mut truncated = false;
        let mut client_gone = false;

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    if !truncated {
                        if captured.len() + chunk.len() <= capture_cap {
                            captured.extend_from_slice(&chunk);
                        } else {
                            truncated = true;
                            warn!(
                                cap = capture_cap,
                                "Response capture exceeded its budget; extraction will be estimated"
                            );
                        }
                    }
                    if !client_gone && tx.send(Ok(chunk)).await.is_err() {
                        client_gone = true;
                        debug!("Client disconnected; continuing to drain the upstream");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Upstream stream ended with an error");
                    if !client_gone {
                        let _ = tx
                            .send(Err(std::io::Error::other(e.to_string())))
                            .await;
                    }
                    break;
                }
            }
        }
        drop(tx);

        let recorded_status = if client_gone {
            CLIENT_CLOSED_REQUEST
        } else {
            status.as_u16()
        };
        run_post_flight(ctx, captured, truncated, recorded_status).await;
    });

    builder
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .expect("relay response build cannot fail")
}

/// Extract usage, price the call, write the audit record with its quota
/// debit, and enqueue it for anchoring. Runs after the response has been
/// fully drained, independent of the client.
async fn run_post_flight(ctx: PostFlight, captured: Vec<u8>, truncated: bool, status: u16) {
    let facts = match usage::extract(&ctx.request, &captured, truncated, ctx.model.provider, status)
    {
        Ok(facts) => facts,
        Err(ExtractError::InsufficientData) => {
            warn!(
                consumer_id = %ctx.identity.consumer_id,
                model = %ctx.model,
                status,
                "No usage data for a successful call; refusing to bill and log it"
            );
            return;
        }
    };

    let cost = pricing::cost(&facts, &ctx.rates);
    let store_bodies = ctx.state.config.capture.store_full_bodies;
    let new_log = NewUsageLog {
        consumer_id: ctx.identity.consumer_id.clone(),
        provider: ctx.model.provider.as_str().to_string(),
        model: ctx.model.name.clone(),
        prompt_tokens: facts.prompt_tokens,
        completion_tokens: facts.completion_tokens,
        cache_creation_input_tokens: facts.cache_creation_tokens,
        cache_read_input_tokens: facts.cache_read_tokens,
        cost,
        status: status as i32,
        estimated: facts.estimated,
        request_body: store_bodies.then(|| String::from_utf8_lossy(&ctx.request).into_owned()),
        response_body: store_bodies.then(|| String::from_utf8_lossy(&captured).into_owned()),
        request_hash: facts.request_hash,
        response_hash: facts.response_hash,
    };

    let log = match ctx.state.store.record_usage(new_log).await {
        Ok(log) => log,
        Err(e) => {
            error!(
                error = %e,
                consumer_id = %ctx.identity.consumer_id,
                "Failed to persist usage log"
            );
            return;
        }
    };
    debug!(
        log_id = %log.id,
        cost = %log.cost,
        prompt_tokens = log.prompt_tokens,
        completion_tokens = log.completion_tokens,
        estimated = log.estimated,
        "Usage recorded"
    );

    // Fire-and-forget: the anchoring outcome settles out of band and is
    // never awaited on the request path.
    if let Some(batcher) = &ctx.state.batcher {
        let outcome = batcher.enqueue(PendingRecord::from_log(&log)).await;
        let log_id = log.id;
        tokio::spawn(async move {
            match outcome.await {
                Ok(outcome) => debug!(log_id = %log_id, ?outcome, "Anchoring settled"),
                Err(_) => debug!(log_id = %log_id, "Anchoring future dropped"),
            }
        });
    }
}
