use uuid::Uuid;

use crate::types::{Message, SessionId};

/// The canonical message list for the session shown in the foreground.
/// Messages are mutated by replacing the whole value at an index; nothing
/// outside the engine lock ever sees a half-updated message.
#[derive(Default)]
pub struct MessageStore {
    pub session_id: Option<SessionId>,
    messages: Vec<Message>,
    pub placeholder_id: Option<Uuid>,
    pub loading: bool,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn index_of(&self, id: Uuid) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    /// Replace the message at `index` wholesale.
    pub fn replace_at(&mut self, index: usize, message: Message) {
        if index < self.messages.len() {
            self.messages[index] = message;
        }
    }

    /// Replace the last message, or append when the list is empty.
    pub fn replace_last(&mut self, message: Message) {
        match self.messages.last_mut() {
            Some(slot) => *slot = message,
            None => self.messages.push(message),
        }
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Swap in a whole new list, e.g. after a history reload or a
    /// foreground switch.
    pub fn replace_all(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Hand the list over for demotion into the cache.
    pub fn take_messages(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.messages)
    }

    /// Apply `update` to the current placeholder message, creating one
    /// first if none is bound.
    pub fn update_placeholder<F>(&mut self, update: F)
    where
        F: FnOnce(Message) -> Message,
    {
        let index = match self.placeholder_id.and_then(|id| self.index_of(id)) {
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
}
