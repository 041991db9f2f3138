//! Core identifier and model-classification types shared across the crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The upstream providers the gateway can route to.
///
/// The wire tag (`openai`, `anthropic`, `local`) is both the model-name
/// prefix clients use and the value persisted in `usage_logs.provider` and
/// `model_pricing.provider`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Local,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Local => "local",
        }
    }

    pub fn parse(s: &str) -> Option<Provider> {
        match s {
            "openai" => Some(Provider::OpenAi),
            "anthropic" => Some(Provider::Anthropic),
            "local" => Some(Provider::Local),
            _ => None,
        }
    }

    /// Whether the provider speaks the OpenAI chat-completions wire protocol.
    /// These are the providers that need `stream_options.include_usage` to
    /// report token usage on streamed responses.
    pub fn is_openai_protocol(&self) -> bool {
        matches!(self, Provider::OpenAi | Provider::Local)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a model treats the completion-limit parameter.
///
/// Strict-completion model families reject `max_tokens` and require
/// `max_completion_tokens`; legacy families are the inverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelClass {
    StrictCompletion,
    LegacyCompletion,
}

/// Model-name prefixes that map to [`ModelClass::StrictCompletion`].
const STRICT_COMPLETION_PREFIXES: &[&str] = &["gpt-5", "o1"];

impl ModelClass {
    pub fn classify(model: &str) -> ModelClass {
        if STRICT_COMPLETION_PREFIXES.iter().any(|p| model.starts_with(p)) {
            ModelClass::StrictCompletion
        } else {
            ModelClass::LegacyCompletion
        }
    }
}

/// A parsed `provider/modelName` reference from a client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider: Provider,
    /// The model name with the provider prefix stripped, as forwarded upstream.
    pub name: String,
}

impl ModelRef {
    /// Parse a client-supplied model identifier of the form
    /// `provider/modelName`. Returns `None` for unknown providers, a missing
    /// separator, or an empty model name.
    pub fn parse(model: &str) -> Option<ModelRef> {
        let (prefix, name) = model.split_once('/')?;
        let provider = Provider::parse(prefix)?;
        if name.is_empty() {
            return None;
        }
        Some(ModelRef {
            provider,
            name: name.to_string(),
        })
    }

    pub fn class(&self) -> ModelClass {
        ModelClass::classify(&self.name)
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_providers() {
        let m = ModelRef::parse("openai/gpt-5").unwrap();
        assert_eq!(m.provider, Provider::OpenAi);
        assert_eq!(m.name, "gpt-5");

        let m = ModelRef::parse("anthropic/claude-sonnet-4").unwrap();
        assert_eq!(m.provider, Provider::Anthropic);

        let m = ModelRef::parse("local/llama-3.1-8b").unwrap();
        assert_eq!(m.provider, Provider::Local);
    }

    #[test]
    fn rejects_unknown_or_malformed_models() {
        assert!(ModelRef::parse("gpt-4").is_none());
        assert!(ModelRef::parse("mistral/mistral-large").is_none());
        assert!(ModelRef::parse("openai/").is_none());
        assert!(ModelRef::parse("").is_none());
    }

    #[test]
    fn model_name_may_contain_slashes() {
        let m = ModelRef::parse("local/org/model-v2").unwrap();
        assert_eq!(m.name, "org/model-v2");
    }

    #[test]
    fn classification_table() {
        assert_eq!(ModelClass::classify("gpt-5"), ModelClass::StrictCompletion);
        assert_eq!(ModelClass::classify("gpt-5-mini"), ModelClass::StrictCompletion);
        assert_eq!(ModelClass::classify("o1-preview"), ModelClass::StrictCompletion);
        assert_eq!(ModelClass::classify("gpt-4o"), ModelClass::LegacyCompletion);
        assert_eq!(ModelClass::classify("gpt-4.1"), ModelClass::LegacyCompletion);
    }
}
