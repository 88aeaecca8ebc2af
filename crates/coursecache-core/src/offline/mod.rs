//! Offline action queue.
//!
//! Writes made while offline, or while earlier writes for the same entity are
//! still pending, are stored here and replayed in order by the sync layer.

pub mod queue;
pub mod writer;

pub use queue::{EntityKey, OfflineQueue, PendingAction};
pub use writer::{OfflineWriter, SendOutcome};
