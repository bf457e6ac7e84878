use std::collections::HashSet;
use std::sync::Mutex;

use crate::types::{Message, SessionId};

/// Merge freshly fetched server history with a not-yet-persisted optimistic
/// local message.
///
/// If the local tail carries a non-empty partner draft that does not appear
/// anywhere in the server list (exact text match), it is appended so the
/// unconfirmed message is not lost; once the server echoes it back, the
/// optimistic copy is discarded instead. Reconciling twice against an
/// unchanged server list is a no-op.
pub fn merge_optimistic(server: Vec<Message>, local_last: Option<&Message>) -> Vec<Message> {
    let Some(local) = local_last else {
        return server;
    };
    let Some(draft) = local.trailing_partner_draft() else {
        return server;
    };

    let already_present = server.iter().any(|m| {
        m.content == draft || m.segments.iter().any(|s| s.text() == draft)
    });

    if already_present {
        return server;
    }

    let mut merged = server;
    merged.push(local.clone());
    merged
}

const SENT_KEY_PREFIX_LEN: usize = 100;

fn sent_key(session: SessionId, content: &str) -> (SessionId, String) {
    let prefix: String = content.chars().take(SENT_KEY_PREFIX_LEN).collect();
    (session, prefix)
}

/// Process-wide record of partner drafts already sent, keyed by session and
/// the first 100 characters of content. Consulted before allowing the same
/// draft to be sent again.
#[derive(Default)]
pub struct SentDraftRegistry {
    sent: Mutex<HashSet<(SessionId, String)>>,
}

impl SentDraftRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_sent(&self, session: SessionId, content: &str) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.insert(sent_key(session, content));
        }
    }

    pub fn is_sent(&self, session: SessionId, content: &str) -> bool {
        self.sent
            .lock()
            .map(|sent| sent.contains(&sent_key(session, content)))
            .unwrap_or(false)
    }
}
