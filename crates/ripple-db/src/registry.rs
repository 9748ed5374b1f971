use std::sync::Mutex;

use crate::collection::Collection;

/// Process-wide bookkeeping of live collections, with explicit
/// init/teardown instead of ambient globals. Enables cross-collection
/// batching and global debug toggling.
#[derive(Default)]
pub struct CollectionRegistry {
    collections: Mutex<Vec<(String, Collection)>>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under a name, replacing any previous entry.
    pub fn register(&self, name: impl Into<String>, collection: &Collection) {
        let name = name.into();
        if let Ok(mut collections) = self.collections.lock() {
            collections.retain(|(n, _)| n != &name);
            collections.push((name, collection.clone()));
        }
    }

    pub fn unregister(&self, name: &str) {
        if let Ok(mut collections) = self.collections.lock() {
            collections.retain(|(n, _)| n != name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Collection> {
        self.collections
            .lock()
            .ok()?
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c.clone())
    }

    pub fn names(&self) -> Vec<String> {
        match self.collections.lock() {
            Ok(collections) => collections.iter().map(|(n, _)| n.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn snapshot(&self) -> Vec<Collection> {
        match self.collections.lock() {
            Ok(collections) => collections.iter().map(|(_, c)| c.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Run `f` with every registered collection in batch mode; each
    /// collection rebuilds once when the scope closes, even if `f`
    /// unwinds.
    pub fn batch_all<R>(&self, f: impl FnOnce() -> R) -> R {
        let collections = self.snapshot();
        let _guard = GlobalBatchGuard {
            collections: &collections,
        };
        for collection in &collections {
            collection.start_batch();
        }
        f()
    }

    pub fn set_debug_mode(&self, enabled: bool) {
        for collection in self.snapshot() {
            collection.set_debug_mode(enabled);
        }
    }

    /// Dispose every collection and empty the registry.
    pub fn teardown(&self) {
        let collections = self.snapshot();
        if let Ok(mut registered) = self.collections.lock() {
            registered.clear();
        }
        for collection in collections {
            collection.dispose();
        }
    }
}

struct GlobalBatchGuard<'a> {
    collections: &'a [Collection],
}

impl Drop for GlobalBatchGuard<'_> {
    fn drop(&mut self) {
        for collection in self.collections {
            collection.end_batch();
        }
    }
}
