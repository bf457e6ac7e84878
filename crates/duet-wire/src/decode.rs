use tracing::warn;
use uuid::Uuid;

use crate::events::StreamEvent;
use crate::frame::Frame;

/// Outcome of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(StreamEvent),
    /// Event name we don't recognize; skipped without penalty.
    Ignored,
    /// Recognized name with an unparseable payload; counts against the
    /// per-stream malformed-frame budget.
    Malformed,
}

/// Decode one completed frame according to its event name.
pub fn decode_frame(frame: &Frame) -> Decoded {
    match frame.event.as_str() {
        "session" | "dialogue_session" => match parse_identifier(&frame.data) {
            Some(id) => Decoded::Event(StreamEvent::Session { id }),
            None => {
                warn!(event = %frame.event, "dropping frame with unparseable session id");
                Decoded::Malformed
            }
        },
        "request" => match parse_identifier(&frame.data) {
            Some(id) => Decoded::Event(StreamEvent::Request { id }),
            None => {
                warn!("dropping request frame with unparseable id");
                Decoded::Malformed
            }
        },
        "token" => Decoded::Event(StreamEvent::Token {
            text: decode_token_payload(&frame.data),
        }),
        "tool_start" => Decoded::Event(StreamEvent::ToolStart),
        "tool_args" => Decoded::Event(StreamEvent::ToolArgs {
            raw: frame.data.clone(),
        }),
        "tool_done" => Decoded::Event(StreamEvent::ToolDone),
        "partner_message" => Decoded::Event(StreamEvent::PartnerMessage {
            text: decode_token_payload(&frame.data),
        }),
        "done" => Decoded::Event(StreamEvent::Done),
        "error" => Decoded::Event(StreamEvent::Error {
            message: strip_quotes(&frame.data).to_string(),
        }),
        _ => Decoded::Ignored,
    }
}

/// Extract a UUID from a payload that may be a JSON string, a JSON object
/// carrying the id in some field, or bare text.
fn parse_identifier(data: &str) -> Option<Uuid> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(data) {
        match value {
            serde_json::Value::String(s) => {
                if let Ok(id) = Uuid::parse_str(s.trim()) {
                    return Some(id);
                }
            }
            serde_json::Value::Object(map) => {
                for v in map.values() {
                    if let Some(s) = v.as_str() {
                        if let Ok(id) = Uuid::parse_str(s.trim()) {
                            return Some(id);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    Uuid::parse_str(strip_quotes(data).trim()).ok()
}

/// Decode a token payload. JSON-quoted strings are preferred; anything else
/// is treated as a raw string with manual escape sequences.
fn decode_token_payload(data: &str) -> String {
    if let Ok(text) = serde_json::from_str::<String>(data) {
        return text;
    }

    // Raw fallback. No trimming here: leading and trailing whitespace in a
    // token is content.
    let raw = data
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(data);
    unescape(raw)
}

fn strip_quotes(data: &str) -> &str {
    let trimmed = data.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    }
}

/// Manual unescape fallback for `\n \t \" \\ \/ \r`. Unknown escapes pass
/// through verbatim.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }

    out
}
