use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Decoded wire event, produced by the decoder and consumed exactly once
/// by the stream coordinator. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Server started executing a side action on behalf of this turn.
    ToolStart,

    /// Raw tool argument fragment, accumulated while the tool runs.
    ToolArgs { raw: String },

    /// Server finished the side action.
    ToolDone,

    /// One token of assistant text, already unescaped to plain text.
    Token { text: String },

    /// Session id for this stream, assigned by the server. Arrives at most
    /// once, possibly after tokens have already been emitted.
    Session { id: Uuid },

    /// Server-side request confirmation for the in-flight send.
    Request { id: Uuid },

    /// A complete partner draft block, emitted in one event.
    PartnerMessage { text: String },

    /// Normal end of stream. Nothing follows.
    Done,

    /// Terminal failure, either transport-level or an `error` frame from
    /// the server. Nothing follows.
    Error { message: String },
}

impl StreamEvent {
    /// True for the two variants that end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error { .. })
    }
}
