pub mod message;
pub mod session;

pub use message::{Message, Role, Segment};
pub use session::{CacheEntry, SessionId};
