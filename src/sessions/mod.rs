//! Session tracking: identifiers, per-session writers and the active registry.

pub mod id;
pub mod registry;
pub mod writer;

pub use id::{SessionId, SessionIdError, LOG_FILE_EXTENSION};
pub use registry::{ActiveRegistry, BufferLimits, Enqueued, SessionSnapshot, SharedWriter};
pub use writer::{SessionWriter, WriteOutcome};
