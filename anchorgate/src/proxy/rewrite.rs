//! Per-provider request parameter rewriting.
//!
//! Each provider dialect names the completion-limit parameter differently:
//! strict-completion OpenAI families take `max_completion_tokens`, the local
//! inference backend takes `max_tokens`. The rewrite is a bijection — a
//! request carrying exactly one of the two leaves with exactly the canonical
//! field for its target, value preserved.
//!
//! Streamed requests to OpenAI-protocol providers additionally get
//! `stream_options.include_usage = true` injected: the final usage chunk is
//! the only reliable token count for streamed responses, and without the
//! opt-in it is never sent.

use crate::types::{ModelClass, ModelRef, Provider};
use serde_json::{Value, json};

const MAX_TOKENS: &str = "max_tokens";
const MAX_COMPLETION_TOKENS: &str = "max_completion_tokens";

/// Rewrite a chat payload in place for its target provider. Also strips the
/// provider prefix from the `model` field so the upstream sees its own name.
pub fn apply(model: &ModelRef, payload: &mut Value) {
    let Some(body) = payload.as_object_mut() else {
        return;
    };

    body.insert("model".to_string(), Value::String(model.name.clone()));

    match (model.provider, model.class()) {
        (Provider::OpenAi, ModelClass::StrictCompletion) => {
            rename_limit(body, MAX_TOKENS, MAX_COMPLETION_TOKENS);
        }
        (Provider::Local, _) => {
            rename_limit(body, MAX_COMPLETION_TOKENS, MAX_TOKENS);
        }
        _ => {}
    }

    if model.provider.is_openai_protocol() && body.get("stream").and_then(Value::as_bool) == Some(true) {
        inject_include_usage(body);
    }
}

/// Rename `from` to `to`. When both fields are present the canonical `to`
/// wins and `from` is dropped.
fn rename_limit(body: &mut serde_json::Map<String, Value>, from: &str, to: &str) {
    let Some(value) = body.remove(from) else {
        return;
    };
    if !body.contains_key(to) {
        body.insert(to.to_string(), value);
    }
}

fn inject_include_usage(body: &mut serde_json::Map<String, Value>) {
    match body.get_mut("stream_options") {
        Some(Value::Object(options)) => {
            options
                .entry("include_usage".to_string())
                .or_insert_with(|| json!(true));
        }
        Some(_) => {
            // A malformed stream_options (e.g. null) is replaced; losing it
            // is better than losing the usage chunk.
            body.insert("stream_options".to_string(), json!({"include_usage": true}));
        }
        None => {
            body.insert("stream_options".to_string(), json!({"include_usage": true}));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rewrite(model: &str, mut payload: Value) -> Value {
        let model = ModelRef::parse(model).unwrap();
        apply(&model, &mut payload);
        payload
    }

    #[test]
    fn strict_completion_renames_max_tokens() {
        let out = rewrite("openai/gpt-5", json!({"model": "openai/gpt-5", "max_tokens": 10}));
        assert_eq!(out["max_completion_tokens"], 10);
        assert!(out.get("max_tokens").is_none());
        assert_eq!(out["model"], "gpt-5");
    }

    #[test]
    fn strict_completion_keeps_existing_canonical_field() {
        let out = rewrite(
            "openai/o1",
            json!({"model": "openai/o1", "max_tokens": 10, "max_completion_tokens": 20}),
        );
        assert_eq!(out["max_completion_tokens"], 20);
        assert!(out.get("max_tokens").is_none());
    }

    #[test]
    fn legacy_openai_models_are_untouched() {
        let out = rewrite("openai/gpt-4o", json!({"model": "openai/gpt-4o", "max_tokens": 10}));
        assert_eq!(out["max_tokens"], 10);
        assert!(out.get("max_completion_tokens").is_none());
    }

    #[test]
    fn local_provider_applies_inverse_rename() {
        let out = rewrite(
            "local/llama-3.1-8b",
            json!({"model": "local/llama-3.1-8b", "max_completion_tokens": 64}),
        );
        assert_eq!(out["max_tokens"], 64);
        assert!(out.get("max_completion_tokens").is_none());
        assert_eq!(out["model"], "llama-3.1-8b");
    }

    #[test]
    fn rewrite_is_a_bijection_on_single_limit_fields() {
        // Exactly one limit field in, exactly the canonical one out, value
        // preserved.
        for (model, input_field, output_field) in [
            ("openai/gpt-5", MAX_TOKENS, MAX_COMPLETION_TOKENS),
            ("openai/gpt-5", MAX_COMPLETION_TOKENS, MAX_COMPLETION_TOKENS),
            ("local/llama", MAX_COMPLETION_TOKENS, MAX_TOKENS),
            ("local/llama", MAX_TOKENS, MAX_TOKENS),
            ("openai/gpt-4o", MAX_TOKENS, MAX_TOKENS),
            ("anthropic/claude-sonnet-4", MAX_TOKENS, MAX_TOKENS),
        ] {
            let out = rewrite(model, json!({"model": model, input_field: 42}));
            assert_eq!(out[output_field], 42, "{model}: {input_field} -> {output_field}");
            let limit_fields = [MAX_TOKENS, MAX_COMPLETION_TOKENS]
                .iter()
                .filter(|f| out.get(**f).is_some())
                .count();
            assert_eq!(limit_fields, 1, "{model} must end with exactly one limit field");
        }
    }

    #[test]
    fn streamed_openai_requests_get_include_usage() {
        let out = rewrite(
            "openai/gpt-4o",
            json!({"model": "openai/gpt-4o", "stream": true}),
        );
        assert_eq!(out["stream_options"]["include_usage"], true);

        let out = rewrite("local/llama", json!({"model": "local/llama", "stream": true}));
        assert_eq!(out["stream_options"]["include_usage"], true);
    }

    #[test]
    fn existing_stream_options_fields_are_preserved() {
        let out = rewrite(
            "openai/gpt-4o",
            json!({
                "model": "openai/gpt-4o",
                "stream": true,
                "stream_options": {"include_usage": false, "chunk_size": 8}
            }),
        );
        // An explicit include_usage is respected; only absence is filled in.
        assert_eq!(out["stream_options"]["include_usage"], false);
        assert_eq!(out["stream_options"]["chunk_size"], 8);
    }

    #[test]
    fn non_streamed_and_anthropic_requests_skip_injection() {
        let out = rewrite("openai/gpt-4o", json!({"model": "openai/gpt-4o"}));
        assert!(out.get("stream_options").is_none());

        let out = rewrite(
            "anthropic/claude-sonnet-4",
            json!({"model": "anthropic/claude-sonnet-4", "stream": true}),
        );
        assert!(out.get("stream_options").is_none());
        assert_eq!(out["model"], "claude-sonnet-4");
    }

    #[test]
    fn null_stream_options_is_replaced() {
        let out = rewrite(
            "openai/gpt-4o",
            json!({"model": "openai/gpt-4o", "stream": true, "stream_options": null}),
        );
        assert_eq!(out["stream_options"]["include_usage"], true);
    }
}
