//! Line-oriented parsing of captured server-sent-event transcripts.

/// Whether a captured response body looks like an SSE transcript rather
/// than a plain JSON document.
pub fn looks_like_sse(body: &str) -> bool {
    let head = body.trim_start();
    head.starts_with("event:") || head.starts_with("data:")
}

/// Split a captured SSE transcript into its `data:` frame payloads.
///
/// Per the SSE specification a single event may spread its data over several
/// `data:` lines and is terminated by a blank line; an empty data field still
/// dispatches an (empty) event. A trailing frame without a terminating blank
/// line is kept.
pub fn data_frames(body: &str) -> Vec<String> {
    let mut frames = Vec::new();
    let mut current = String::new();
    let mut pending = false;

    for line in body.lines() {
        let trimmed = line.trim();
        if let Some(data) = trimmed.strip_prefix("data:") {
            let data = data.strip_prefix(' ').unwrap_or(data);
            if pending {
                // Multi-line data field: joined with a newline per the SSE
                // specification.
                current.push('\n');
            }
            current.push_str(data);
            pending = true;
        } else if trimmed.is_empty() && pending {
            frames.push(std::mem::take(&mut current));
            pending = false;
        }
    }
    if pending {
        frames.push(current);
    }
    frames
}
