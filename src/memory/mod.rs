//! Processing memory: the persistent SQLite history, in-memory sessions and
//! the optional JSON-lines trace log.

pub mod sessions;
pub mod store;
pub mod trace_log;

pub use sessions::{SessionError, SessionManager, SessionStatus};
pub use store::{MemoryStore, StoreError};
pub use trace_log::TraceLog;
