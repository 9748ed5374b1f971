use std::fmt;

use ripple_db::DbError;

#[derive(Debug, Clone)]
pub enum SyncError {
    /// The collection was never added to the sync manager.
    UnknownCollection(String),
    /// Pull or push failed.
    Transport(String),
    /// A bookkeeping or target-collection operation failed.
    Db(DbError),
}

impl SyncError {
    pub fn transport(msg: impl Into<String>) -> Self {
        SyncError::Transport(msg.into())
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::UnknownCollection(name) => write!(f, "unknown collection: {name}"),
            SyncError::Transport(msg) => write!(f, "sync transport error: {msg}"),
            SyncError::Db(e) => write!(f, "sync database error: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<DbError> for SyncError {
    fn from(e: DbError) -> Self {
        SyncError::Db(e)
    }
}
