use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bson::{Bson, Document};

use crate::persistence::PersistenceError;

/// Row-level storage back-end, as consumed by auto-fetch
/// orchestrators and worker hosts. Implementations own their encoding
/// entirely; the core only sees documents and id sets.
///
/// `read_index` returns the inverted map for an indexed field:
/// canonicalized value → set of canonicalized ids.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn setup(&self) -> Result<(), PersistenceError>;
    async fn teardown(&self) -> Result<(), PersistenceError>;

    async fn read_all(&self) -> Result<Vec<Document>, PersistenceError>;
    async fn read_ids(&self, ids: &[Bson]) -> Result<Vec<Document>, PersistenceError>;

    async fn create_index(&self, field: &str) -> Result<(), PersistenceError>;
    async fn drop_index(&self, field: &str) -> Result<(), PersistenceError>;
    async fn read_index(
        &self,
        field: &str,
    ) -> Result<HashMap<String, HashSet<String>>, PersistenceError>;

    async fn insert(&self, doc: Document) -> Result<(), PersistenceError>;
    async fn replace(&self, id: &Bson, doc: Document) -> Result<(), PersistenceError>;
    async fn remove(&self, id: &Bson) -> Result<(), PersistenceError>;
    async fn remove_all(&self) -> Result<(), PersistenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use ripple_query::{canonical_string, get_first};
    use std::sync::Mutex;

    /// Reference in-memory implementation used to pin the interface
    /// semantics.
    #[derive(Default)]
    struct MemoryStorage {
        rows: Mutex<Vec<Document>>,
        indexes: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl StorageAdapter for MemoryStorage {
        async fn setup(&self) -> Result<(), PersistenceError> {
            Ok(())
        }

        async fn teardown(&self) -> Result<(), PersistenceError> {
            Ok(())
        }

        async fn read_all(&self) -> Result<Vec<Document>, PersistenceError> {
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

        async fn create_index(&self, field: &str) -> Result<(), PersistenceError> {
            self.indexes.lock().unwrap().insert(field.to_string());
            Ok(())
        }

        async fn drop_index(&self, field: &str) -> Result<(), PersistenceError> {
            self.indexes.lock().unwrap().remove(field);
            Ok(())
        }

        async fn read_index(
            &self,
            field: &str,
        ) -> Result<HashMap<String, HashSet<String>>, PersistenceError> {
            if !self.indexes.lock().unwrap().contains(field) {
                return Err(PersistenceError::new(format!("no index on {field}")));
            }
            let mut map: HashMap<String, HashSet<String>> = HashMap::new();
            for doc in self.rows.lock().unwrap().iter() {
                let (Some(value), Some(id)) = (get_first(doc, field), doc.get("id")) else {
                    continue;
                };
                map.entry(canonical_string(value))
                    .or_default()
                    .insert(canonical_string(id));
            }
            Ok(map)
        }

        async fn insert(&self, doc: Document) -> Result<(), PersistenceError> {
            self.rows.lock().unwrap().push(doc);
            Ok(())
        }

        async fn replace(&self, id: &Bson, doc: Document) -> Result<(), PersistenceError> {
            let mut rows = self.rows.lock().unwrap();
            match rows
                .iter_mut()
                .find(|d| d.get("id").is_some_and(|v| v == id))
            {
                Some(row) => {
                    *row = doc;
                    Ok(())
                }
                None => Err(PersistenceError::new("row not found")),
            }
        }

        async fn remove(&self, id: &Bson) -> Result<(), PersistenceError> {
            self.rows
                .lock()
                .unwrap()
                .retain(|d| d.get("id") != Some(id));
            Ok(())
        }

        async fn remove_all(&self) -> Result<(), PersistenceError> {
            self.rows.lock().unwrap().clear();
            Ok(())
        }
    }

    #[tokio::test]
    async fn read_index_returns_value_to_id_sets() {
        let storage = MemoryStorage::default();
        storage.create_index("type").await.unwrap();
        storage
            .insert(doc! { "id": "k1", "type": "kitten" })
            .await
            .unwrap();
        storage
            .insert(doc! { "id": "k2", "type": "kitten" })
            .await
            .unwrap();
        storage
            .insert(doc! { "id": "c1", "type": "crypto" })
            .await
            .unwrap();

        let index = storage.read_index("type").await.unwrap();
        let kittens = index.get(&canonical_string(&Bson::String("kitten".into())));
        assert_eq!(kittens.map(|s| s.len()), Some(2));
    }

    #[tokio::test]
    async fn read_ids_filters() {
        let storage = MemoryStorage::default();
        storage.insert(doc! { "id": "1" }).await.unwrap();
        storage.insert(doc! { "id": "2" }).await.unwrap();
        let rows = storage
            .read_ids(&[Bson::String("2".into())])
            .await
            .unwrap();
        assert_eq!(rows, vec![doc! { "id": "2" }]);
    }

    #[tokio::test]
    async fn replace_and_remove() {
        let storage = MemoryStorage::default();
        storage.insert(doc! { "id": "1", "v": 1 }).await.unwrap();
        storage
            .replace(&Bson::String("1".into()), doc! { "id": "1", "v": 2 })
            .await
            .unwrap();
        assert_eq!(storage.read_all().await.unwrap()[0].get_i32("v").unwrap(), 2);

        storage.remove(&Bson::String("1".into())).await.unwrap();
        assert!(storage.read_all().await.unwrap().is_empty());
    }
}
