//! Token-usage extraction from captured upstream responses.
//!
//! The extractor is deterministic: the same request/response bytes always
//! produce the same [`UsageFacts`]. Response bodies are parsed either as a
//! single JSON document or as an SSE transcript; both the OpenAI and the
//! Anthropic usage schemas are normalised into the same internal counts.
//! When no usage object can be found the call is still billed from
//! character-count estimates, except for the one case we refuse: a
//! successful call with no data at all.

pub mod estimator;
pub mod sse;

use crate::merkle::sha256;
use crate::types::Provider;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Normalised usage for one call, plus the integrity hashes of the raw
/// request and response bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageFacts {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    /// Hex SHA-256 of the raw request bytes.
    pub request_hash: String,
    /// Hex SHA-256 of the captured response bytes.
    pub response_hash: String,
    /// True when the counts came from the estimation fallback rather than a
    /// provider-reported usage object.
    pub estimated: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    /// A successful call produced no usage object, no response body and
    /// therefore nothing to bill. Billing $0 for a successful call would
    /// mask a metering gap, so the log is rejected instead.
    #[error("no usage data for a successful call")]
    InsufficientData,
}

/// Provider-reported usage in its native schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Usage {
    OpenAi(OpenAiUsage),
    Anthropic(AnthropicUsage),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OpenAiUsage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AnthropicUsage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub cache_creation_input_tokens: i64,
    #[serde(default)]
    pub cache_read_input_tokens: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub prompt: i64,
    pub completion: i64,
    pub cache_creation: i64,
    pub cache_read: i64,
}

impl Usage {
    /// Deserialize a `usage` JSON object in the provider's native schema.
    pub fn from_value(provider: Provider, usage: &Value) -> Option<Usage> {
        match provider {
            Provider::Anthropic => serde_json::from_value(usage.clone()).ok().map(Usage::Anthropic),
            Provider::OpenAi | Provider::Local => {
                serde_json::from_value(usage.clone()).ok().map(Usage::OpenAi)
            }
        }
    }

    /// Normalise into internal counts.
    ///
    /// For the OpenAI schema, cached prompt tokens are split out so the
    /// uncached portion bills at the input rate and the cached portion at
    /// the cache-read rate. Malformed input can drive the uncached count
    /// negative; the value is kept as-is rather than clamped.
    pub fn normalize(&self) -> TokenCounts {
        match self {
            Usage::OpenAi(u) => {
                let cached = u.prompt_tokens_details.as_ref().map_or(0, |d| d.cached_tokens);
                TokenCounts {
                    prompt: u.prompt_tokens - cached,
                    completion: u.completion_tokens,
                    cache_creation: 0,
                    cache_read: cached,
                }
            }
            Usage::Anthropic(u) => TokenCounts {
                prompt: u.input_tokens,
                completion: u.output_tokens,
                cache_creation: u.cache_creation_input_tokens,
                cache_read: u.cache_read_input_tokens,
            },
        }
    }
}

/// Extract usage facts from one completed call.
///
/// `truncated` marks a capture that exceeded the tee budget: the body bytes
/// are a prefix, so usage-object extraction is skipped and only the
/// estimation fallback runs.
pub fn extract(
    request: &[u8],
    response: &[u8],
    truncated: bool,
    provider: Provider,
    status: u16,
) -> Result<UsageFacts, ExtractError> {
    let request_hash = hex::encode(sha256(request));
    let response_hash = hex::encode(sha256(response));

    let body = String::from_utf8_lossy(response);
    let reported = if truncated { None } else { find_usage(&body, provider) };

    if let Some(usage) = reported {
        let counts = usage.normalize();
        return Ok(UsageFacts {
            prompt_tokens: counts.prompt,
            completion_tokens: counts.completion,
            cache_creation_tokens: counts.cache_creation,
            cache_read_tokens: counts.cache_read,
            request_hash,
            response_hash,
            estimated: false,
        });
    }

    // Estimation fallback.
    let success = (200..300).contains(&status);
    if response.is_empty() {
        if success {
            return Err(ExtractError::InsufficientData);
        }
        // Errored before producing a body: bill the input side only.
        return Ok(UsageFacts {
            prompt_tokens: estimator::estimate_prompt_tokens(request),
            completion_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            request_hash,
            response_hash,
            estimated: true,
        });
    }

    Ok(UsageFacts {
        prompt_tokens: estimator::estimate_prompt_tokens(request),
        completion_tokens: estimator::estimate_completion_tokens(body.chars().count()),
        cache_creation_tokens: 0,
        cache_read_tokens: 0,
        request_hash,
        response_hash,
        estimated: true,
    })
}

/// Locate the authoritative usage object in a captured body.
///
/// SSE transcripts are walked from the last `data:` frame backwards; the
/// first frame carrying a `usage` object wins (for the Anthropic dialect
/// this is the final `message_delta`). Plain bodies are parsed as one JSON
/// document with a top-level `usage` object. `[DONE]` markers, unparseable
/// frames and `"usage": null` chunks are skipped.
fn find_usage(body: &str, provider: Provider) -> Option<Usage> {
    if sse::looks_like_sse(body) {
        for frame in sse::data_frames(body).iter().rev() {
            let Ok(value) = serde_json::from_str::<Value>(frame) else {
                continue;
            };
            if let Some(usage) = value.get("usage").filter(|u| u.is_object()) {
                return Usage::from_value(provider, usage);
            }
        }
        return None;
    }
    let value = serde_json::from_str::<Value>(body).ok()?;
    let usage = value.get("usage").filter(|u| u.is_object())?;
    Usage::from_value(provider, usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const OK: u16 = 200;

    fn facts(request: &Value, response: &str, provider: Provider, status: u16) -> UsageFacts {
        let request = serde_json::to_vec(request).unwrap();
        extract(&request, response.as_bytes(), false, provider, status).unwrap()
    }

    #[test]
    fn openai_json_usage() {
        let response = json!({
            "id": "chatcmpl-1",
            "choices": [],
            "usage": {"prompt_tokens": 8, "completion_tokens": 12, "total_tokens": 20}
        })
        .to_string();
        let f = facts(&json!({"model": "gpt-5"}), &response, Provider::OpenAi, OK);
        assert_eq!(f.prompt_tokens, 8);
        assert_eq!(f.completion_tokens, 12);
        assert_eq!(f.cache_read_tokens, 0);
        assert!(!f.estimated);
    }

    #[test]
    fn openai_cached_tokens_are_split_out() {
        let response = json!({
            "usage": {
                "prompt_tokens": 2000,
                "completion_tokens": 1,
                "prompt_tokens_details": {"cached_tokens": 1500}
            }
        })
        .to_string();
        let f = facts(&json!({}), &response, Provider::OpenAi, OK);
        assert_eq!(f.prompt_tokens, 500);
        assert_eq!(f.cache_read_tokens, 1500);
    }

    #[test]
    fn malformed_cached_tokens_may_go_negative() {
        let response = json!({
            "usage": {
                "prompt_tokens": 100,
                "completion_tokens": 1,
                "prompt_tokens_details": {"cached_tokens": 150}
            }
        })
        .to_string();
        let f = facts(&json!({}), &response, Provider::OpenAi, OK);
        assert_eq!(f.prompt_tokens, -50);
        assert_eq!(f.cache_read_tokens, 150);
    }

    #[test]
    fn anthropic_sse_with_cache_counts() {
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":1}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"hi\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"input_tokens\":100,\"output_tokens\":50,",
            "\"cache_creation_input_tokens\":2000,\"cache_read_input_tokens\":500}}\n\n",
        );
        let f = facts(&json!({}), body, Provider::Anthropic, OK);
        assert_eq!(f.prompt_tokens, 100);
        assert_eq!(f.completion_tokens, 50);
        assert_eq!(f.cache_creation_tokens, 2000);
        assert_eq!(f.cache_read_tokens, 500);
        assert!(!f.estimated);
    }

    #[test]
    fn last_usage_frame_wins_and_noise_is_ignored() {
        let with_noise = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}],\"usage\":null}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n",
            "data: {\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":4}}\n\n",
            "data: not json\n\n",
            "data: {\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":9}}\n\n",
            "data: [DONE]\n\n",
        );
        let without_noise = concat!(
            "data: {\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":9}}\n\n",
            "data: [DONE]\n\n",
        );
        let a = facts(&json!({}), with_noise, Provider::OpenAi, OK);
        let b = facts(&json!({}), without_noise, Provider::OpenAi, OK);
        assert_eq!(a.prompt_tokens, 7);
        assert_eq!(a.completion_tokens, 9);
        assert_eq!((a.prompt_tokens, a.completion_tokens), (b.prompt_tokens, b.completion_tokens));
    }

    #[test]
    fn cancelled_stream_falls_back_to_estimates() {
        // A stream cut off before the usage chunk: 3 messages of 400
        // characters total estimate to 100 prompt tokens; the captured
        // partial body estimates at one token per four characters.
        let request = json!({
            "model": "openai/gpt-4o",
            "messages": [
                {"role": "system", "content": "a".repeat(100)},
                {"role": "user", "content": "b".repeat(150)},
                {"role": "user", "content": "c".repeat(150)},
            ]
        });
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n";
        let f = facts(&request, body, Provider::OpenAi, 499);
        assert_eq!(f.prompt_tokens, 100);
        assert_eq!(f.completion_tokens, (body.chars().count().div_ceil(4)) as i64);
        assert!(f.estimated);
    }

    #[test]
    fn truncated_capture_skips_usage_objects() {
        let body = "{\"usage\":{\"prompt_tokens\":8,\"completion_tokens\":12}}";
        let f = extract(b"{}", body.as_bytes(), true, Provider::OpenAi, OK).unwrap();
        assert!(f.estimated);
        assert_eq!(f.completion_tokens, (body.chars().count().div_ceil(4)) as i64);
    }

    #[test]
    fn error_status_with_no_body_bills_input_only() {
        let request = json!({"messages": [{"role": "user", "content": "x".repeat(40)}]});
        let request = serde_json::to_vec(&request).unwrap();
        let f = extract(&request, b"", false, Provider::OpenAi, 500).unwrap();
        assert_eq!(f.prompt_tokens, 10);
        assert_eq!(f.completion_tokens, 0);
        assert!(f.estimated);
    }

    #[test]
    fn successful_call_with_no_data_is_rejected() {
        let err = extract(b"{}", b"", false, Provider::OpenAi, 200).unwrap_err();
        assert_eq!(err, ExtractError::InsufficientData);
    }

    #[test]
    fn hashes_cover_raw_bytes_regardless_of_outcome() {
        let request = b"{\"messages\":[]}";
        let ok = extract(request, b"some body", false, Provider::OpenAi, 200).unwrap();
        assert_eq!(ok.request_hash, hex::encode(sha256(request)));
        assert_eq!(ok.response_hash, hex::encode(sha256(b"some body")));

        // Deterministic: same inputs, same output.
        let again = extract(request, b"some body", false, Provider::OpenAi, 200).unwrap();
        assert_eq!(ok, again);
    }

    #[test]
    fn empty_usage_object_is_tolerated_as_zero() {
        // Shape says "usage reported", content is empty: stored as zeros
        // rather than rejected, since the provider did respond with a usage
        // object.
        let f = facts(&json!({}), "{\"usage\":{}}", Provider::OpenAi, OK);
        assert_eq!(f.prompt_tokens, 0);
        assert_eq!(f.completion_tokens, 0);
        assert!(!f.estimated);
    }
}
