use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

use super::message::Message;

/// Conversation identifier. Assigned locally before the first send or by
/// the server on the first event of a new conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Cached message list for one background session. Looked up and replaced
/// wholesale, never partially mutated.
///
/// The id of the assistant message currently streaming into this session
/// lives here, on the entry, so the binding can never desynchronize from
/// the cached list it points into.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub messages: Vec<Message>,
    pub last_loaded: Instant,
    pub placeholder_id: Option<Uuid>,
}

impl CacheEntry {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            last_loaded: Instant::now(),
            placeholder_id: None,
        }
    }

    /// Apply `update` to the placeholder message bound to this entry,
    /// creating one first if the binding is empty or dangling.
    pub fn update_placeholder<F>(&mut self, update: F)
    where
        F: FnOnce(Message) -> Message,
    {
        let index = match self
            .placeholder_id
            .and_then(|id| self.messages.iter().position(|m| m.id == id))
        {
            Some(index) => index,
            None => {
                let placeholder = Message::placeholder();
                self.placeholder_id = Some(placeholder.id);
                self.messages.push(placeholder);
                self.messages.len() - 1
            }
        };
        let updated = update(self.messages[index].clone());
        self.messages[index] = updated;
    }

    /// Replace the last message, or append when the list is empty.
    pub fn replace_last(&mut self, message: Message) {
        match self.messages.last_mut() {
            Some(slot) => *slot = message,
            None => self.messages.push(message),
        }
    }
}
