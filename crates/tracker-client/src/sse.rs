use serde_json::Value;
use tracker_types::StreamEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Pops the next complete SSE frame off the front of `buffer`.
///
/// Frames end at a blank line (`\n\n` or `\r\n\r\n`). Multiple `data:` lines are joined with
/// `\n`, the space after the colon is optional, and frames without data (comments, keep-alives)
/// are skipped.
pub fn parse_sse_frame(buffer: &mut String) -> Option<SseFrame> {
    loop {
        let (end_idx, delim_len) = match (buffer.find("\r\n\r\n"), buffer.find("\n\n")) {
            (Some(crlf), Some(lf)) if lf < crlf => (lf, 2),
            (Some(crlf), _) => (crlf, 4),
            (None, Some(lf)) => (lf, 2),
            (None, None) => return None,
        };

        let frame_str = buffer[..end_idx].to_string();
        buffer.drain(..end_idx + delim_len);

        let mut event = None;
        let mut data_lines: Vec<&str> = Vec::new();
        for raw_line in frame_str.lines() {
            let line = raw_line.trim_end_matches('\r');
            if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
            } else if let Some(rest) = line.strip_prefix("event:") {
                let name = rest.trim();
                if !name.is_empty() {
                    event = Some(name.to_string());
                }
            }
        }

        if data_lines.is_empty() {
            continue;
        }

        return Some(SseFrame {
            event,
            data: data_lines.join("\n"),
        });
    }
}

/// Appends raw network bytes to `buffer` as UTF-8. A character cut off at the end of a read is
/// held in `pending` until the next read completes it; invalid sequences become U+FFFD.
pub fn push_utf8_chunk(pending: &mut Vec<u8>, buffer: &mut String, bytes: &[u8]) {
    pending.extend_from_slice(bytes);
    let mut consumed = 0;
    while consumed < pending.len() {
        match std::str::from_utf8(&pending[consumed..]) {
            Ok(text) => {
                buffer.push_str(text);
                consumed = pending.len();
            }
            Err(e) => {
                let valid = consumed + e.valid_up_to();
                buffer.push_str(std::str::from_utf8(&pending[consumed..valid]).unwrap_or_default());
                match e.error_len() {
                    Some(bad) => {
                        buffer.push(char::REPLACEMENT_CHARACTER);
                        consumed = valid + bad;
                    }
                    None => {
                        consumed = valid;
                        break;
                    }
                }
            }
        }
    }
    pending.drain(..consumed);
}

/// Maps a frame to a [`StreamEvent`]. The event type comes from the `event:` line when present,
/// otherwise from a `type` field inside the JSON payload.
pub fn decode_stream_event(frame: &SseFrame) -> Option<StreamEvent> {
    let data = frame.data.trim();
    if data == "[DONE]" {
        return Some(StreamEvent::End);
    }

    let value = match serde_json::from_str::<Value>(data) {
        Ok(value) => value,
        Err(_) => {
            // Plain-text chunk frames are accepted verbatim.
            return match frame.event.as_deref() {
                Some("chunk") => Some(StreamEvent::Chunk {
                    content: frame.data.clone(),
                }),
                Some("end") => Some(StreamEvent::End),
                Some("error") => Some(StreamEvent::Error {
                    message: Some(frame.data.clone()),
                }),
                _ => {
                    tracing::debug!("Dropping undecodable SSE frame: {}", truncate(data, 200));
                    None
                }
            };
        }
    };

    let mut object = match value {
        Value::Object(map) => map,
        Value::Null if frame.event.is_some() => serde_json::Map::new(),
        other => {
            tracing::debug!("Dropping non-object SSE payload: {}", other);
            return None;
        }
    };

    if let Some(event) = frame.event.as_deref() {
        object.insert("type".to_string(), Value::String(event.to_string()));
    }

    match serde_json::from_value::<StreamEvent>(Value::Object(object)) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::debug!("Unhandled stream event ({}): {}", e, truncate(data, 200));
            None
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
