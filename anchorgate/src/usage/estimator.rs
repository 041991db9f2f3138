//! Character-count token estimation for calls where the upstream never
//! reported usage (cancelled streams, upstream errors, truncated captures).
//!
//! The heuristics are deliberately coarse: roughly four characters per token
//! for natural-language text, six for raw JSON (the envelope inflates the
//! character count).

use serde_json::Value;

const CHARS_PER_TOKEN_TEXT: usize = 4;
const CHARS_PER_TOKEN_RAW: usize = 6;

fn ceil_div(n: usize, d: usize) -> i64 {
    (n.div_ceil(d)) as i64
}

/// Estimate completion tokens from the captured response body length.
pub fn estimate_completion_tokens(response_len_chars: usize) -> i64 {
    ceil_div(response_len_chars, CHARS_PER_TOKEN_TEXT)
}

/// Estimate prompt tokens from a raw request body.
///
/// If the body parses as JSON with a `messages` array (string or
/// content-part form) or a legacy `prompt` string, the concatenated text is
/// counted at four characters per token. Anything else falls back to six
/// characters per token over the whole body.
pub fn estimate_prompt_tokens(request: &[u8]) -> i64 {
    if let Ok(value) = serde_json::from_slice::<Value>(request)
        && let Some(text) = prompt_text(&value)
    {
        return ceil_div(text.chars().count(), CHARS_PER_TOKEN_TEXT);
    }
    ceil_div(String::from_utf8_lossy(request).chars().count(), CHARS_PER_TOKEN_RAW)
}

/// Concatenated user-visible text of a chat or legacy-completion payload.
fn prompt_text(value: &Value) -> Option<String> {
    if let Some(messages) = value.get("messages").and_then(Value::as_array) {
        let mut text = String::new();
        for message in messages {
            match message.get("content") {
                Some(Value::String(s)) => text.push_str(s),
                Some(Value::Array(parts)) => {
                    for part in parts {
                        if let Some(s) = part.get("text").and_then(Value::as_str) {
                            text.push_str(s);
                        }
                    }
                }
                _ => {}
            }
        }
        return Some(text);
    }
    value.get("prompt").and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counts_message_text_at_four_chars_per_token() {
        // Three messages totalling 400 characters estimate to 100 tokens.
        let body = json!({
            "model": "local/llama",
            "messages": [
                {"role": "system", "content": "a".repeat(100)},
                {"role": "user", "content": "b".repeat(150)},
                {"role": "assistant", "content": "c".repeat(150)},
            ]
        });
        let bytes = serde_json::to_vec(&body).unwrap();
        assert_eq!(estimate_prompt_tokens(&bytes), 100);
    }

    #[test]
    fn content_part_arrays_are_flattened() {
        let body = json!({
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "x".repeat(7)},
                    {"type": "image_url", "image_url": {"url": "ignored"}},
                    {"type": "text", "text": "y".repeat(2)},
                ]}
            ]
        });
        let bytes = serde_json::to_vec(&body).unwrap();
        // 9 characters of text, rounded up.
        assert_eq!(estimate_prompt_tokens(&bytes), 3);
    }

    #[test]
    fn legacy_prompt_string() {
        let body = json!({"model": "local/llama", "prompt": "z".repeat(41)});
        let bytes = serde_json::to_vec(&body).unwrap();
        assert_eq!(estimate_prompt_tokens(&bytes), 11);
    }

    #[test]
    fn unparseable_request_falls_back_to_raw_length() {
        let raw = "not json at all, twelve".as_bytes();
        assert_eq!(estimate_prompt_tokens(raw), (raw.len().div_ceil(6)) as i64);
    }

    #[test]
    fn json_without_messages_or_prompt_uses_raw_length() {
        let body = json!({"input": "some embedding text"});
        let bytes = serde_json::to_vec(&body).unwrap();
        assert_eq!(estimate_prompt_tokens(&bytes), (bytes.len().div_ceil(6)) as i64);
    }

    #[test]
    fn completion_estimate_rounds_up() {
        assert_eq!(estimate_completion_tokens(0), 0);
        assert_eq!(estimate_completion_tokens(1), 1);
        assert_eq!(estimate_completion_tokens(4), 1);
        assert_eq!(estimate_completion_tokens(5), 2);
        assert_eq!(estimate_completion_tokens(400), 100);
    }
}
