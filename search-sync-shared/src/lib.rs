//! # Search Sync Shared
//!
//! Types shared by every crate of the search index sync pipeline: the change
//! events flowing through the queue, the documents written to the search
//! engine, and the process-wide sync state.

pub mod document;
pub mod event;
pub mod outbox;
pub mod record;
pub mod state;

pub use document::{DocumentVersion, SearchDocument};
pub use event::{ChangeEvent, DocumentKey, Operation};
pub use outbox::{OutboxJob, OutboxJobKind};
pub use record::{Page, SourceRecord};
pub use state::{MigrationCursor, OrchestratorState, SyncState};
