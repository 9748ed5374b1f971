use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bson::{Bson, Document};
use ripple_query::{FieldOp, Selector, canonical_string};

use crate::collection::{Collection, CollectionOptions};
use crate::cursor::FindOptions;
use crate::error::DbError;
use crate::events::Event;
use crate::storage::StorageAdapter;

/// Orchestrates a collection over a row-level storage back-end,
/// fetching data on demand per selector and mirroring local writes
/// back into storage.
///
/// Composition instead of inheritance: the orchestrator owns a plain
/// [`Collection`] plus a per-selector fetch cache. A selector is read
/// from storage at most once until [`release`](Self::release) drops
/// its cache entry.
pub struct AutoFetchCollection {
    collection: Collection,
    storage: Arc<dyn StorageAdapter>,
    fetched: Mutex<HashSet<String>>,
    merging: Arc<AtomicBool>,
}

impl AutoFetchCollection {
    /// Wrap a storage adapter. Local mutations flow back into storage
    /// through the collection's change events.
    pub fn new(storage: Arc<dyn StorageAdapter>) -> AutoFetchCollection {
        let collection = Collection::new(CollectionOptions::default());
        let merging = Arc::new(AtomicBool::new(false));

        let writeback = storage.clone();
        let suppress = merging.clone();
        collection.on(Arc::new(move |event| {
            if suppress.load(Ordering::SeqCst) {
                return;
            }
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                return;
            };
            let storage = writeback.clone();
            match event {
                Event::Added(doc) => {
                    let doc = doc.clone();
                    runtime.spawn(async move {
                        if let Err(e) = storage.insert(doc).await {
                            tracing::warn!(error = %e, "storage insert failed");
                        }
                    });
                }
                Event::Changed { item, .. } => {
                    let doc = item.clone();
                    runtime.spawn(async move {
                        let id = doc.get("id").cloned().unwrap_or(Bson::Null);
                        if let Err(e) = storage.replace(&id, doc).await {
                            tracing::warn!(error = %e, "storage replace failed");
                        }
                    });
                }
                Event::Removed(doc) => {
                    let id = doc.get("id").cloned().unwrap_or(Bson::Null);
                    runtime.spawn(async move {
                        if let Err(e) = storage.remove(&id).await {
                            tracing::warn!(error = %e, "storage remove failed");
                        }
                    });
                }
                _ => {}
            }
        }));

        AutoFetchCollection {
            collection,
            storage,
            fetched: Mutex::new(HashSet::new()),
            merging,
        }
    }

    /// The backing collection, for cursors, observers and writes.
    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    /// Fetch matching documents, reading the selector's rows from
    /// storage on first use. Single-field equality selectors go
    /// through the storage index when one exists; everything else
    /// falls back to a full read.
    pub async fn fetch(
        &self,
        selector: &Document,
        options: FindOptions,
    ) -> Result<Vec<Document>, DbError> {
        let parsed = Selector::parse(selector)?;
        let key = selector_key(selector);

        let first_use = match self.fetched.lock() {
            Ok(mut fetched) => fetched.insert(key),
            Err(_) => false,
        };
        if first_use {
            let rows = self.read_rows(&parsed).await?;
            self.merge(&parsed, rows);
        }

        self.collection.find(selector, options)?.fetch()
    }

    /// Drop a selector's cache entry; the next fetch re-reads it.
    pub fn release(&self, selector: &Document) {
        if let Ok(mut fetched) = self.fetched.lock() {
            fetched.remove(&selector_key(selector));
        }
    }

    async fn read_rows(&self, selector: &Selector) -> Result<Vec<Document>, DbError> {
        // indexed point read: one field, one equality
        if let Selector::Field(field, pred) = selector
            && let [FieldOp::Eq(value)] = pred.ops.as_slice()
            && let Ok(index) = self.storage.read_index(field).await
        {
            let Some(ids) = index.get(&canonical_string(value)) else {
                return Ok(Vec::new());
            };
            let ids: Vec<Bson> = ids.iter().map(|id| Bson::String(id.clone())).collect();
            return Ok(self.storage.read_ids(&ids).await?);
        }
        Ok(self.storage.read_all().await?)
    }

    /// Merge fetched rows into the collection without echoing them
    /// back into storage.
    fn merge(&self, selector: &Selector, rows: Vec<Document>) {
        self.merging.store(true, Ordering::SeqCst);
        let rows: Vec<Document> = rows
            .into_iter()
            .filter(|row| selector.is_empty() || selector.matches(row))
            .collect();
        let mut by_id: HashMap<String, Document> = HashMap::new();
        for row in rows {
            if let Some(id) = row.get("id") {
                by_id.insert(canonical_string(id), row);
            }
        }
        let existing = self.collection.snapshot_vec();
        let result: Result<(), DbError> = (|| {
            for doc in existing {
                let Some(id) = doc.get("id").cloned() else {
                    continue;
                };
                if let Some(fresh) = by_id.remove(&canonical_string(&id)) {
                    if !crate::observer::documents_equal(&doc, &fresh) {
                        self.collection.replace_one(
                            &bson::doc! { "id": id },
                            &fresh,
                            Default::default(),
                        )?;
                    }
                }
            }
            for (_, doc) in by_id {
                self.collection.insert(doc)?;
            }
            Ok(())
        })();
        self.merging.store(false, Ordering::SeqCst);
        if let Err(e) = result {
            tracing::warn!(error = %e, "auto-fetch merge failed");
        }
    }
}

/// Cache key: the canonical form of the selector document.
fn selector_key(selector: &Document) -> String {
    canonical_string(&Bson::Document(selector.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bson::doc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::persistence::PersistenceError;

    #[derive(Default)]
    struct CountingStorage {
        rows: Mutex<Vec<Document>>,
        reads: AtomicUsize,
        inserts: AtomicUsize,
    }

    #[async_trait]
    impl StorageAdapter for CountingStorage {
        async fn setup(&self) -> Result<(), PersistenceError> {
            Ok(())
        }

        async fn teardown(&self) -> Result<(), PersistenceError> {
            Ok(())
        }

        async fn read_all(&self) -> Result<Vec<Document>, PersistenceError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.rows.lock().unwrap().clone())
        }

        async fn read_ids(&self, ids: &[Bson]) -> Result<Vec<Document>, PersistenceError> {
            let wanted: HashSet<String> = ids.iter().map(canonical_string).collect();
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|d| {
                    d.get("id")
                        .is_some_and(|id| wanted.contains(&canonical_string(id)))
                })
                .cloned()
                .collect())
        }

        async fn create_index(&self, _field: &str) -> Result<(), PersistenceError> {
            Ok(())
        }

        async fn drop_index(&self, _field: &str) -> Result<(), PersistenceError> {
            Ok(())
        }

        async fn read_index(
            &self,
            _field: &str,
        ) -> Result<HashMap<String, HashSet<String>>, PersistenceError> {
            Err(PersistenceError::new("no index"))
        }

        async fn insert(&self, doc: Document) -> Result<(), PersistenceError> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            self.rows.lock().unwrap().push(doc);
            Ok(())
        }

        async fn replace(&self, id: &Bson, doc: Document) -> Result<(), PersistenceError> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.iter_mut().find(|d| d.get("id") == Some(id)) {
                *row = doc;
            }
            Ok(())
        }

        async fn remove(&self, id: &Bson) -> Result<(), PersistenceError> {
            self.rows.lock().unwrap().retain(|d| d.get("id") != Some(id));
            Ok(())
        }

        async fn remove_all(&self) -> Result<(), PersistenceError> {
            self.rows.lock().unwrap().clear();
            Ok(())
        }
    }

    fn seeded_storage(rows: Vec<Document>) -> Arc<CountingStorage> {
        let storage = CountingStorage::default();
        *storage.rows.lock().unwrap() = rows;
        Arc::new(storage)
    }

    #[tokio::test]
    async fn first_fetch_reads_storage_once_per_selector() {
        let storage = seeded_storage(vec![
            doc! { "id": "1", "kind": "a" },
            doc! { "id": "2", "kind": "b" },
        ]);
        let auto = AutoFetchCollection::new(storage.clone());

        let first = auto
            .fetch(&doc! { "kind": "a" }, FindOptions::default())
            .await
            .unwrap();
        assert_eq!(first, vec![doc! { "id": "1", "kind": "a" }]);
        assert_eq!(storage.reads.load(Ordering::SeqCst), 1);

        // same selector: served from the collection, no re-read
        auto.fetch(&doc! { "kind": "a" }, FindOptions::default())
            .await
            .unwrap();
        assert_eq!(storage.reads.load(Ordering::SeqCst), 1);

        // a new selector reads again
        auto.fetch(&doc! { "kind": "b" }, FindOptions::default())
            .await
            .unwrap();
        assert_eq!(storage.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn release_forces_a_reread() {
        let storage = seeded_storage(vec![doc! { "id": "1", "kind": "a" }]);
        let auto = AutoFetchCollection::new(storage.clone());

        auto.fetch(&doc! { "kind": "a" }, FindOptions::default())
            .await
            .unwrap();
        auto.release(&doc! { "kind": "a" });
        auto.fetch(&doc! { "kind": "a" }, FindOptions::default())
            .await
            .unwrap();
        assert_eq!(storage.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn merged_rows_are_not_echoed_into_storage() {
        let storage = seeded_storage(vec![doc! { "id": "1", "kind": "a" }]);
        let auto = AutoFetchCollection::new(storage.clone());

        auto.fetch(&doc! { "kind": "a" }, FindOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(storage.inserts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn local_writes_flow_back_into_storage() {
        let storage = seeded_storage(vec![]);
        let auto = AutoFetchCollection::new(storage.clone());

        auto.collection()
            .insert(doc! { "id": "local", "kind": "x" })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(storage.inserts.load(Ordering::SeqCst), 1);
        assert_eq!(storage.rows.lock().unwrap().len(), 1);

        auto.collection().remove_one(&doc! { "id": "local" }).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(storage.rows.lock().unwrap().is_empty());
    }
}
