mod error;
mod manager;
mod rebase;
mod records;

pub use error::SyncError;
pub use manager::{
    BookkeepingPersistence, DEFAULT_SYNC_MANAGER_ID, ErrorHandler, PullContext, SyncManager,
    SyncManagerOptions, SyncOptions, SyncTransport,
};
pub use rebase::apply_changes;
pub use records::{ChangeKind, ChangeRecord, SnapshotRecord, SyncOperationRecord, SyncStatus};
