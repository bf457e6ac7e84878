pub mod bus;
pub mod cache;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod reconcile;
pub mod store;
pub mod transport;
pub mod types;

pub use bus::{EngineBus, EngineNotification};
pub use cache::{SessionCache, FRESHNESS_WINDOW};
pub use engine::{ChatEngine, EngineSnapshot, SendPhase};
pub use error::{EngineError, Result};
pub use fallback::FALLBACK_TIMEOUT;
pub use reconcile::{merge_optimistic, SentDraftRegistry};
pub use store::MessageStore;
pub use transport::{
    ChatTransport, HttpChatTransport, MessageRow, SendOutcome, SendRequest, TokenProvider,
};
pub use types::{CacheEntry, Message, Role, Segment, SessionId};
