use std::collections::HashMap;
use std::time::Duration;

use crate::types::{CacheEntry, Message, SessionId};

/// Maximum age at which a cached entry is served without a refresh.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(300);

/// Past this fraction of the window a read still serves the stale value
/// but schedules a non-blocking background refresh.
const REVALIDATE_FRACTION: f64 = 0.7;

/// In-memory store of cached message lists, one per background session.
/// Owned by the engine state and only touched under its lock.
#[derive(Default)]
pub struct SessionCache {
    entries: HashMap<SessionId, CacheEntry>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session: SessionId) -> Option<&CacheEntry> {
        self.entries.get(&session)
    }

    /// Replace the entry wholesale, stamping it freshly loaded. The
    /// placeholder binding survives the replacement.
    pub fn put(&mut self, session: SessionId, messages: Vec<Message>) {
        let placeholder_id = self
            .entries
            .get(&session)
            .and_then(|entry| entry.placeholder_id);
        let mut entry = CacheEntry::new(messages);
        entry.placeholder_id = placeholder_id;
        self.entries.insert(session, entry);
    }

    /// Remove the entry, forcing a server round-trip on the next reload.
    pub fn invalidate(&mut self, session: SessionId) {
        self.entries.remove(&session);
    }

    pub fn is_fresh(&self, entry: &CacheEntry) -> bool {
        entry.last_loaded.elapsed() < FRESHNESS_WINDOW
    }

    /// True once the entry's age crosses the revalidation threshold.
    pub fn needs_revalidation(&self, entry: &CacheEntry) -> bool {
        let threshold = FRESHNESS_WINDOW.mul_f64(REVALIDATE_FRACTION);
        entry.last_loaded.elapsed() >= threshold
    }

    /// Entry for a session a stream is writing into, created empty if
    /// missing. Streaming writes do not re-stamp `last_loaded`.
    pub fn entry_mut(&mut self, session: SessionId) -> &mut CacheEntry {
        self.entries
            .entry(session)
            .or_insert_with(|| CacheEntry::new(Vec::new()))
    }

    /// Seed an entry only when none exists, so a later read is never
    /// empty. An existing entry always wins over a seed.
    pub fn seed(&mut self, session: SessionId, messages: Vec<Message>) {
        self.entries
            .entry(session)
            .or_insert_with(|| CacheEntry::new(messages));
    }

    pub fn contains(&self, session: SessionId) -> bool {
        self.entries.contains_key(&session)
    }
}
