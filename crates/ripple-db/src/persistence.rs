use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bson::Document;
use serde::{Deserialize, Serialize};

/// Failure in an adapter's load/save/register path. Surfaced through
/// `persistence.error` events and rejects the triggering await.
#[derive(Debug, Clone)]
pub struct PersistenceError(pub String);

impl PersistenceError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PersistenceError {}

/// An id-joined delta between two document sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Changeset {
    pub added: Vec<Document>,
    pub modified: Vec<Document>,
    pub removed: Vec<Document>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }

    /// Fold another changeset into this one, preserving order.
    pub fn merge(&mut self, other: Changeset) {
        self.added.extend(other.added);
        self.modified.extend(other.modified);
        self.removed.extend(other.removed);
    }
}

/// What an adapter hands back from `load` (or pushes through the
/// change callback): either a full snapshot replacing the collection
/// state, or a delta applied to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LoadResponse {
    Items(Vec<Document>),
    Changes(Changeset),
}

/// Remote-change notification callback. `None` asks the collection to
/// re-`load`; `Some` carries the data directly.
pub type OnChange = Arc<dyn Fn(Option<LoadResponse>) + Send + Sync>;

/// A persistence back-end as the collection core consumes it.
///
/// `register` is called once before the first `load`; `save` receives
/// the full item snapshot alongside the per-operation delta so
/// adapters can persist either way.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn register(&self, on_change: OnChange) -> Result<(), PersistenceError>;

    async fn load(&self) -> Result<LoadResponse, PersistenceError>;

    async fn save(
        &self,
        items: Vec<Document>,
        changes: Changeset,
    ) -> Result<(), PersistenceError>;

    /// Called by collection disposal. Optional.
    async fn unregister(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// Compute the `{added, modified, removed}` delta between two item
/// sets by joining on `id`. `modified` uses structural equality.
pub fn compute_changes(old_items: &[Document], new_items: &[Document]) -> Changeset {
    use crate::observer::documents_equal;
    use bson::Bson;
    use ripple_query::canonical_string;
    use std::collections::HashMap;

    let key = |d: &Document| canonical_string(d.get("id").unwrap_or(&Bson::Null));
    let old_by_id: HashMap<String, &Document> =
        old_items.iter().map(|d| (key(d), d)).collect();
    let new_ids: std::collections::HashSet<String> = new_items.iter().map(key).collect();

    let mut changes = Changeset::default();
    for doc in new_items {
        match old_by_id.get(&key(doc)) {
            None => changes.added.push(doc.clone()),
            Some(old) if !documents_equal(old, doc) => changes.modified.push(doc.clone()),
            Some(_) => {}
        }
    }
    for doc in old_items {
        if !new_ids.contains(&key(doc)) {
            changes.removed.push(doc.clone());
        }
    }
    changes
}
