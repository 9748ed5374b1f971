use std::fmt;

use ripple_query::QueryError;

#[derive(Debug, Clone)]
pub enum DbError {
    InvalidSelector(String),
    InvalidModifier(String),
    InvalidProjection(String),
    DuplicateId(String),
    Validation(String),
    /// The collection has been disposed; the state is terminal.
    Disposed,
    /// The backing worker has been terminated; in-flight calls reject.
    WorkerDisposed,
    Persistence(String),
    /// Sync and async index providers cannot serve one selector.
    IndexUnsupportedMix,
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::InvalidSelector(msg) => write!(f, "invalid selector: {msg}"),
            DbError::InvalidModifier(msg) => write!(f, "invalid modifier: {msg}"),
            DbError::InvalidProjection(msg) => write!(f, "invalid projection: {msg}"),
            DbError::DuplicateId(id) => write!(f, "duplicate id: {id}"),
            DbError::Validation(msg) => write!(f, "validation failed: {msg}"),
            DbError::Disposed => write!(f, "collection is disposed"),
            DbError::WorkerDisposed => write!(f, "worker is disposed"),
            DbError::Persistence(msg) => write!(f, "persistence error: {msg}"),
            DbError::IndexUnsupportedMix => {
                write!(f, "cannot mix sync and async index providers in one query")
            }
        }
    }
}

impl std::error::Error for DbError {}

impl From<QueryError> for DbError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::InvalidSelector(msg) => DbError::InvalidSelector(msg),
            QueryError::InvalidModifier(msg) => DbError::InvalidModifier(msg),
            QueryError::InvalidProjection(msg) => DbError::InvalidProjection(msg),
        }
    }
}

impl From<crate::persistence::PersistenceError> for DbError {
    fn from(e: crate::persistence::PersistenceError) -> Self {
        DbError::Persistence(e.0)
    }
}
