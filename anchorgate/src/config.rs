//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The file path defaults to `config.yaml` and can be set with
//! the `-f` flag or the `ANCHORGATE_CONFIG` environment variable.
//!
//! ## Loading Priority
//!
//! Sources are merged in order, later sources overriding earlier ones:
//!
//! 1. **YAML config file** — base configuration
//! 2. **Environment variables** — `ANCHORGATE_`-prefixed, `__` for nesting
//!    (e.g. `ANCHORGATE_PROVIDERS__OPENAI__API_KEY`)
//! 3. **DATABASE_URL** — special case override for `database.url`
//!
//! ## Example
//!
//! ```yaml
//! host: 0.0.0.0
//! port: 8080
//! database:
//!   url: postgresql://localhost/anchorgate
//! providers:
//!   openai:
//!     url: https://api.openai.com
//!     api_key: sk-...
//!   local:
//!     url: http://localhost:8000
//! default_quota: "5.0"
//! anchoring:
//!   enabled: true
//!   endpoint: https://anchor.example.com
//!   signing_key: hex-or-ascii-secret
//!   contract_address: "0xabc..."
//! batching:
//!   base_size: 10
//!   flush_interval: 60s
//!   daily_tx_budget: 240
//! ```

use crate::anchor::batcher::BatchingConfig;
use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Simple CLI args - just for specifying the config file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "ANCHORGATE_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// PostgreSQL connection settings
    pub database: DatabaseConfig,
    /// Upstream provider endpoints and credentials
    pub providers: ProvidersConfig,
    /// Names of the identity headers set by the upstream edge
    pub identity: IdentityHeaders,
    /// Timeout applied to upstream LLM requests
    #[serde(with = "humantime_serde")]
    pub upstream_timeout: Duration,
    /// Response capture behaviour for usage extraction
    pub capture: CaptureConfig,
    /// Quota assigned to a consumer on first sight, in monetary units
    pub default_quota: Decimal,
    /// Pricing rows seeded into an empty pricing table at startup
    pub pricing_seed: Vec<crate::store::PricingRow>,
    /// On-chain anchoring endpoint settings
    pub anchoring: AnchoringConfig,
    /// Audit batching behaviour
    pub batching: BatchingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "0.0.0.0".to_string(),
            port: 8080,
            database: DatabaseConfig::default(),
            providers: ProvidersConfig::default(),
            identity: IdentityHeaders::default(),
            upstream_timeout: Duration::from_secs(300),
            capture: CaptureConfig::default(),
            default_quota: Decimal::new(5, 0),
            pricing_seed: Vec::new(),
            anchoring: AnchoringConfig::default(),
            batching: BatchingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            url: "postgresql://localhost/anchorgate".to_string(),
            max_connections: 10,
            acquire_timeout_secs: 30,
        }
    }
}

/// One upstream provider endpoint. The URL is the base; the gateway appends
/// the chat-completions path.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderEndpoint {
    pub url: Url,
    pub api_key: Option<String>,
}

impl ProviderEndpoint {
    fn with_url(url: &str) -> Self {
        ProviderEndpoint {
            url: url.parse().expect("static default URL"),
            api_key: None,
        }
    }
}

impl Default for ProviderEndpoint {
    fn default() -> Self {
        Self::with_url("https://api.openai.com")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvidersConfig {
    pub openai: ProviderEndpoint,
    pub anthropic: AnthropicEndpoint,
    pub local: ProviderEndpoint,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        ProvidersConfig {
            openai: ProviderEndpoint::with_url("https://api.openai.com"),
            anthropic: AnthropicEndpoint::default(),
            local: ProviderEndpoint::with_url("http://localhost:8000"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnthropicEndpoint {
    pub url: Url,
    pub api_key: Option<String>,
    /// Sent as the `anthropic-version` header.
    pub version: String,
}

impl Default for AnthropicEndpoint {
    fn default() -> Self {
        AnthropicEndpoint {
            url: "https://api.anthropic.com".parse().expect("static default URL"),
            api_key: None,
            version: "2023-06-01".to_string(),
        }
    }
}

/// Header names carrying the identity established by the upstream edge.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentityHeaders {
    pub consumer_id: String,
    pub username: String,
    pub external_id: String,
}

impl Default for IdentityHeaders {
    fn default() -> Self {
        IdentityHeaders {
            consumer_id: "x-consumer-id".to_string(),
            username: "x-consumer-username".to_string(),
            external_id: "x-consumer-custom-id".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Persist full request/response text on the audit record.
    pub store_full_bodies: bool,
    /// Tee budget; a response larger than this is relayed but only its
    /// prefix is captured, and usage extraction falls back to estimation.
    pub max_capture_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            store_full_bodies: false,
            max_capture_bytes: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnchoringConfig {
    pub enabled: bool,
    pub endpoint: Url,
    pub signing_key: String,
    pub contract_address: String,
}

impl Default for AnchoringConfig {
    fn default() -> Self {
        AnchoringConfig {
            enabled: false,
            endpoint: "http://localhost:9545".parse().expect("static default URL"),
            signing_key: String::new(),
            contract_address: String::new(),
        }
    }
}

impl Config {
    /// Load configuration from the YAML file and environment.
    pub fn load(args: &Args) -> anyhow::Result<Config> {
        let figment = Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("ANCHORGATE_").split("__"));

        let mut config: Config = figment.extract()?;

        // Common deployment convention: DATABASE_URL overrides database.url.
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = url;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.anchoring.enabled {
            if self.anchoring.signing_key.is_empty() {
                anyhow::bail!("anchoring.signing_key is required when anchoring is enabled");
            }
            if self.anchoring.contract_address.is_empty() {
                anyhow::bail!("anchoring.contract_address is required when anchoring is enabled");
            }
        }
        if self.capture.max_capture_bytes == 0 {
            anyhow::bail!("capture.max_capture_bytes must be non-zero");
        }
        if self.default_quota < Decimal::ZERO {
            anyhow::bail!("default_quota must not be negative");
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.identity.consumer_id, "x-consumer-id");
    }

    #[test]
    fn yaml_and_env_override_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                r#"
port: 9000
default_quota: "2.5"
providers:
  local:
    url: http://inference:8000
batching:
  base_size: 4
  flush_interval: 5s
  daily_tx_budget: 12
  adaptive: false
"#,
            )?;
            jail.set_env("ANCHORGATE_HOST", "127.0.0.1");
            jail.set_env("ANCHORGATE_PROVIDERS__OPENAI__API_KEY", "sk-test");
            jail.set_env("DATABASE_URL", "postgresql://db/anchorgate");

            let args = Args {
                config: "config.yaml".to_string(),
                validate: false,
            };
            let config = Config::load(&args).unwrap();
            assert_eq!(config.port, 9000);
            assert_eq!(config.host, "127.0.0.1");
            assert_eq!(config.default_quota, Decimal::new(25, 1));
            assert_eq!(config.providers.openai.api_key.as_deref(), Some("sk-test"));
            assert_eq!(config.providers.local.url.as_str(), "http://inference:8000/");
            assert_eq!(config.database.url, "postgresql://db/anchorgate");
            assert_eq!(config.batching.base_size, 4);
            assert_eq!(config.batching.flush_interval, Duration::from_secs(5));
            Ok(())
        });
    }

    #[test]
    fn anchoring_requires_signing_material() {
        let mut config = Config::default();
        config.anchoring.enabled = true;
        assert!(config.validate().is_err());

        config.anchoring.signing_key = "secret".to_string();
        assert!(config.validate().is_err());

        config.anchoring.contract_address = "0xabc".to_string();
        config.validate().unwrap();
    }
}
