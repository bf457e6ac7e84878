use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One block of message content.
///
/// `Text` segments grow as tokens arrive; consecutive tokens coalesce into
/// the open segment. A `PartnerDraft` is emitted whole in one event and is
/// immutable once appended — later tokens open a fresh `Text` segment
/// after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Segment {
    Text { text: String },
    PartnerDraft { text: String },
}

impl Segment {
    pub fn text(&self) -> &str {
        match self {
            Segment::Text { text } | Segment::PartnerDraft { text } => text,
        }
    }
}

/// A conversation message. Mutation happens by replacing the whole value at
/// its index in the owning list; the helpers below consume and return the
/// message so partial states are never observable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub segments: Vec<Segment>,
    /// Concatenation of all text segments, kept for consumers that predate
    /// segmented content.
    pub content: String,
    pub tool_loading: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: Uuid::new_v4(),
            role: Role::User,
            segments: vec![Segment::Text { text: content.clone() }],
            content,
            tool_loading: false,
            created_at: Utc::now(),
        }
    }

    /// Empty assistant placeholder, to be filled by streamed events.
    pub fn placeholder() -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::Assistant,
            segments: Vec::new(),
            content: String::new(),
            tool_loading: false,
            created_at: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: Uuid::new_v4(),
            role: Role::Assistant,
            segments: vec![Segment::Text { text: content.clone() }],
            content,
            tool_loading: false,
            created_at: Utc::now(),
        }
    }

    /// Append one streamed token, coalescing into the trailing `Text`
    /// segment when there is one.
    pub fn push_token(mut self, token: &str) -> Self {
        match self.segments.last_mut() {
            Some(Segment::Text { text }) => text.push_str(token),
            _ => self.segments.push(Segment::Text { text: token.to_string() }),
        }
        self.content.push_str(token);
        self
    }

    /// Append a complete partner draft block.
    pub fn push_partner_draft(mut self, draft: &str) -> Self {
        self.segments.push(Segment::PartnerDraft { text: draft.to_string() });
        self.content.push_str(draft);
        self
    }

    pub fn with_tool_loading(mut self, loading: bool) -> Self {
        self.tool_loading = loading;
        self
    }

    /// The partner draft carried by this message, if its final segment is
    /// one. Used by reconciliation to spot an unconfirmed optimistic tail.
    pub fn trailing_partner_draft(&self) -> Option<&str> {
        match self.segments.last() {
            Some(Segment::PartnerDraft { text }) if !text.is_empty() => Some(text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_coalesce_into_one_segment() {
        let msg = Message::placeholder().push_token("Hi").push_token(" there");

        assert_eq!(msg.segments.len(), 1);
        assert_eq!(msg.segments[0], Segment::Text { text: "Hi there".into() });
        assert_eq!(msg.content, "Hi there");
    }

    #[test]
    fn test_token_after_draft_opens_new_segment() {
        let msg = Message::placeholder()
            .push_token("before")
            .push_partner_draft("draft")
            .push_token("after");

        assert_eq!(msg.segments.len(), 3);
        assert_eq!(msg.segments[1], Segment::PartnerDraft { text: "draft".into() });
        assert_eq!(msg.segments[2], Segment::Text { text: "after".into() });
        assert_eq!(msg.content, "beforedraftafter");
    }

    #[test]
    fn test_draft_is_never_appended_to() {
        let msg = Message::placeholder()
            .push_partner_draft("fixed")
            .push_token("x");

        assert_eq!(msg.segments[0], Segment::PartnerDraft { text: "fixed".into() });
    }

    #[test]
    fn test_trailing_partner_draft() {
        let msg = Message::placeholder().push_partner_draft("call them");
        assert_eq!(msg.trailing_partner_draft(), Some("call them"));

        let msg = msg.push_token("more");
        assert_eq!(msg.trailing_partner_draft(), None);

        assert_eq!(Message::placeholder().trailing_partner_draft(), None);
    }

    #[test]
    fn test_id_stable_across_updates() {
        let msg = Message::placeholder();
        let id = msg.id;
        let msg = msg.push_token("a").with_tool_loading(true);
        assert_eq!(msg.id, id);
    }
}
