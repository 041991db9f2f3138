//! Upstream provider dispatch.
//!
//! One shared `reqwest` client forwards chat payloads to the configured
//! provider endpoints with each dialect's auth headers. The local backend's
//! context window is discovered once per model from its `/v1/models`
//! introspection endpoint and memoised.

use crate::config::{Config, ProvidersConfig};
use crate::types::Provider;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
const MODELS_PATH: &str = "/v1/models";

/// A request that never produced an upstream response.
#[derive(Debug, Error)]
pub enum UpstreamFailure {
    #[error("upstream request timed out")]
    Timeout,
    #[error("upstream unreachable: {0}")]
    Unreachable(String),
}

pub struct UpstreamClient {
    http: reqwest::Client,
    providers: ProvidersConfig,
    context_limits: DashMap<String, u64>,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    max_model_len: Option<u64>,
    #[serde(default)]
    context_length: Option<u64>,
}

impl UpstreamClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .build()?;
        Ok(UpstreamClient {
            http,
            providers: config.providers.clone(),
            context_limits: DashMap::new(),
        })
    }

    fn base_url(&self, provider: Provider) -> &url::Url {
        match provider {
            Provider::OpenAi => &self.providers.openai.url,
            Provider::Anthropic => &self.providers.anthropic.url,
            Provider::Local => &self.providers.local.url,
        }
    }

    fn endpoint(&self, provider: Provider, path: &str) -> String {
        format!(
            "{}{}",
            self.base_url(provider).as_str().trim_end_matches('/'),
            path
        )
    }

    /// Forward a (rewritten) chat payload. Returns the raw response for the
    /// relay to stream; network-level failures are mapped so the caller can
    /// synthesize a status and still bill the input side.
    #[instrument(skip(self, payload), fields(provider = %provider))]
    pub async fn chat(
        &self,
        provider: Provider,
        payload: &Value,
    ) -> Result<reqwest::Response, UpstreamFailure> {
        let mut request = self
            .http
            .post(self.endpoint(provider, CHAT_COMPLETIONS_PATH))
            .json(payload);

        request = match provider {
            Provider::OpenAi => match &self.providers.openai.api_key {
                Some(key) => request.bearer_auth(key),
                None => request,
            },
            Provider::Local => match &self.providers.local.api_key {
                Some(key) => request.bearer_auth(key),
                None => request,
            },
            Provider::Anthropic => {
                let anthropic = &self.providers.anthropic;
                let mut req = request.header("anthropic-version", &anthropic.version);
                if let Some(key) = &anthropic.api_key {
                    req = req.header("x-api-key", key);
                }
                req
            }
        };

        request.send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamFailure::Timeout
            } else {
                UpstreamFailure::Unreachable(e.to_string())
            }
        })
    }

    /// The local model's context window, if the backend reports one.
    /// Memoised per model; an unreachable introspection endpoint skips the
    /// context check rather than failing the request.
    pub async fn context_limit(&self, model: &str) -> Option<u64> {
        if let Some(limit) = self.context_limits.get(model) {
            return Some(*limit);
        }

        let url = self.endpoint(Provider::Local, MODELS_PATH);
        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "Local model introspection unavailable; skipping context check");
                return None;
            }
        };
        let list = match response.json::<ModelList>().await {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "Could not parse local model list");
                return None;
            }
        };

        for entry in list.data {
            if let Some(limit) = entry.max_model_len.or(entry.context_length) {
                self.context_limits.insert(entry.id.clone(), limit);
            }
        }
        self.context_limits.get(model).map(|l| *l)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_with_local(url: &str) -> Config {
        let mut config = Config::default();
        config.providers.local.url = url.parse().unwrap();
        config.providers.openai.url = url.parse().unwrap();
        config.providers.openai.api_key = Some("sk-test".to_string());
        config.providers.anthropic.url = url.parse().unwrap();
        config.providers.anthropic.api_key = Some("ak-test".to_string());
        config
    }

    #[tokio::test]
    async fn openai_requests_carry_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "gpt-5"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .expect(1)
            .mount(&server)
            .await;

        let client = UpstreamClient::new(&config_with_local(&server.uri())).unwrap();
        let response = client
            .chat(Provider::OpenAi, &json!({"model": "gpt-5"}))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }

    #[tokio::test]
    async fn anthropic_requests_carry_dialect_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("x-api-key", "ak-test"))
            .and(header("anthropic-version", "2023-06-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": []})))
            .expect(1)
            .mount(&server)
            .await;

        let client = UpstreamClient::new(&config_with_local(&server.uri())).unwrap();
        client
            .chat(Provider::Anthropic, &json!({"model": "claude-sonnet-4"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn context_limit_is_memoised() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"id": "llama-3.1-8b", "max_model_len": 8192},
                    {"id": "qwen-7b", "context_length": 32768},
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = UpstreamClient::new(&config_with_local(&server.uri())).unwrap();
        assert_eq!(client.context_limit("llama-3.1-8b").await, Some(8192));
        // Served from the memo, not a second introspection call.
        assert_eq!(client.context_limit("llama-3.1-8b").await, Some(8192));
        assert_eq!(client.context_limit("qwen-7b").await, Some(32768));
    }

    #[tokio::test]
    async fn unreachable_introspection_skips_the_check() {
        let mut config = Config::default();
        config.providers.local.url = "http://127.0.0.1:1".parse().unwrap();
        config.upstream_timeout = std::time::Duration::from_millis(200);
        let client = UpstreamClient::new(&config).unwrap();
        assert_eq!(client.context_limit("llama").await, None);
    }

    #[tokio::test]
    async fn connection_failure_maps_to_unreachable() {
        let mut config = Config::default();
        config.providers.openai.url = "http://127.0.0.1:1".parse().unwrap();
        config.upstream_timeout = std::time::Duration::from_millis(200);
        let client = UpstreamClient::new(&config).unwrap();
        let err = client
            .chat(Provider::OpenAi, &json!({"model": "gpt-5"}))
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamFailure::Unreachable(_) | UpstreamFailure::Timeout));
    }
}
