use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use ripple_db::{
    Changeset, Collection, CollectionOptions, Event, FindOptions, LoadResponse, OnChange,
    PersistenceAdapter, PersistenceError,
};
use ripple_query::value_eq;

/// In-memory adapter with hooks for failure injection, slow loads and
/// remote-change pushes.
#[derive(Default)]
struct TestAdapter {
    stored: Mutex<Vec<Document>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
    load_delay: Option<Duration>,
    save_gate: tokio::sync::Mutex<()>,
    on_change: Mutex<Option<OnChange>>,
    unregistered: AtomicBool,
}

impl TestAdapter {
    fn seeded(items: Vec<Document>) -> Arc<Self> {
        let adapter = Self::default();
        *adapter.stored.lock().unwrap() = items;
        Arc::new(adapter)
    }

    fn with_load_delay(items: Vec<Document>, delay: Duration) -> Arc<Self> {
        let mut adapter = Self::default();
        *adapter.stored.lock().unwrap() = items;
        adapter.load_delay = Some(delay);
        Arc::new(adapter)
    }

    fn stored_ids(&self) -> Vec<String> {
        self.stored
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.get_str("id").unwrap_or("?").to_string())
            .collect()
    }

    fn push_remote(&self, response: Option<LoadResponse>) {
        let callback = self.on_change.lock().unwrap().clone();
        callback.expect("adapter not registered")(response);
    }
}

#[async_trait]
impl PersistenceAdapter for TestAdapter {
    async fn register(&self, on_change: OnChange) -> Result<(), PersistenceError> {
        *self.on_change.lock().unwrap() = Some(on_change);
        Ok(())
    }

    async fn load(&self) -> Result<LoadResponse, PersistenceError> {
        if let Some(delay) = self.load_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(LoadResponse::Items(self.stored.lock().unwrap().clone()))
    }

    async fn save(
        &self,
        _items: Vec<Document>,
        changes: Changeset,
    ) -> Result<(), PersistenceError> {
        let _gate = self.save_gate.lock().await;
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(PersistenceError::new("disk full"));
        }
        let mut stored = self.stored.lock().unwrap();
        let position = |stored: &Vec<Document>, id: &Bson| {
            stored
                .iter()
                .position(|d| d.get("id").is_some_and(|v| value_eq(v, id)))
        };
        for doc in changes.added.iter().chain(changes.modified.iter()) {
            let id = doc.get("id").cloned().unwrap_or(Bson::Null);
            match position(&stored, &id) {
                Some(i) => stored[i] = doc.clone(),
                None => stored.push(doc.clone()),
            }
        }
        for doc in &changes.removed {
            let id = doc.get("id").cloned().unwrap_or(Bson::Null);
            if let Some(i) = position(&stored, &id) {
                stored.remove(i);
            }
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unregister(&self) -> Result<(), PersistenceError> {
        self.unregistered.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn collect_events(collection: &Collection) -> Arc<Mutex<Vec<String>>> {
    let log: Arc<Mutex<Vec<String>>> = Default::default();
    let seen = log.clone();
    collection.on(Arc::new(move |event| {
        let name = match event {
            Event::PersistenceInit => "init",
            Event::PersistenceReceived => "received",
            Event::PersistenceTransmitted => "transmitted",
            Event::PersistencePullStarted => "pullStarted",
            Event::PersistencePullCompleted => "pullCompleted",
            Event::PersistencePushStarted => "pushStarted",
            Event::PersistencePushCompleted => "pushCompleted",
            Event::PersistenceError(_) => "error",
            _ => return,
        };
        seen.lock().unwrap().push(name.to_string());
    }));
    log
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

fn persisted_collection(adapter: Arc<TestAdapter>) -> Collection {
    Collection::new(CollectionOptions {
        persistence: Some(adapter),
        ..Default::default()
    })
}

// ── Init handshake ──────────────────────────────────────────────

#[tokio::test]
async fn init_loads_stored_items_and_fires_init() {
    let adapter = TestAdapter::seeded(vec![doc! { "id": "a", "v": 1 }]);
    let collection = persisted_collection(adapter);
    let events = collect_events(&collection);

    assert!(!collection.is_ready());
    collection.ready().await;

    let items = collection
        .find(&doc! {}, FindOptions::default())
        .unwrap()
        .fetch()
        .unwrap();
    assert_eq!(items, vec![doc! { "id": "a", "v": 1 }]);

    let events = events.lock().unwrap();
    assert!(events.contains(&"received".to_string()));
    assert_eq!(events.iter().filter(|e| *e == "init").count(), 1);
    // init lands after the pulls that fed it
    assert!(events.iter().position(|e| e == "init") > events.iter().position(|e| e == "received"));
}

#[tokio::test]
async fn writes_during_init_are_flushed_and_persisted() {
    // scenario: two inserts land before persistence.init fires
    let adapter =
        TestAdapter::with_load_delay(vec![doc! { "id": "stored" }], Duration::from_millis(50));
    let collection = persisted_collection(adapter.clone());

    collection.insert(doc! { "id": "early-1" }).unwrap();
    collection.insert(doc! { "id": "early-2" }).unwrap();

    collection.ready().await;

    // both early writes and the stored doc are observable
    let mut ids: Vec<String> = collection
        .find(&doc! {}, FindOptions::default())
        .unwrap()
        .fetch()
        .unwrap()
        .iter()
        .map(|d| d.get_str("id").unwrap().to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["early-1", "early-2", "stored"]);

    // and the adapter persisted the pending buffer
    let mut stored = adapter.stored_ids();
    stored.sort();
    assert_eq!(stored, vec!["early-1", "early-2", "stored"]);
}

// ── Save queue ──────────────────────────────────────────────────

#[tokio::test]
async fn mutations_flow_into_the_adapter() {
    let adapter = TestAdapter::seeded(vec![]);
    let collection = persisted_collection(adapter.clone());
    let events = collect_events(&collection);
    collection.ready().await;

    collection.insert(doc! { "id": "1", "v": 1 }).unwrap();
    wait_until(|| adapter.stored_ids() == vec!["1"]).await;

    collection
        .update_one(
            &doc! { "id": "1" },
            &doc! { "$set": { "v": 2 } },
            Default::default(),
        )
        .unwrap();
    wait_until(|| {
        adapter
            .stored
            .lock()
            .unwrap()
            .first()
            .and_then(|d| d.get_i32("v").ok())
            == Some(2)
    })
    .await;

    collection.remove_one(&doc! { "id": "1" }).unwrap();
    wait_until(|| adapter.stored_ids().is_empty()).await;

    let events = events.lock().unwrap();
    let pushes = events.iter().filter(|e| *e == "pushStarted").count();
    let completions = events.iter().filter(|e| *e == "pushCompleted").count();
    assert!(pushes >= 1);
    assert_eq!(pushes, completions);
    assert!(events.contains(&"transmitted".to_string()));
}

#[tokio::test]
async fn save_failure_emits_error_and_queue_continues() {
    let adapter = TestAdapter::seeded(vec![]);
    let collection = persisted_collection(adapter.clone());
    let events = collect_events(&collection);
    collection.ready().await;

    adapter.fail_saves.store(true, Ordering::SeqCst);
    collection.insert(doc! { "id": "lost" }).unwrap();
    wait_until(|| events.lock().unwrap().contains(&"error".to_string())).await;

    adapter.fail_saves.store(false, Ordering::SeqCst);
    collection.insert(doc! { "id": "kept" }).unwrap();
    wait_until(|| adapter.stored_ids().contains(&"kept".to_string())).await;
}

// ── Remote changes ──────────────────────────────────────────────

#[tokio::test]
async fn pushed_changes_merge_without_echoing_saves() {
    let adapter = TestAdapter::seeded(vec![doc! { "id": "a", "v": 1 }]);
    let collection = persisted_collection(adapter.clone());
    collection.ready().await;
    let saves_before = adapter.saves.load(Ordering::SeqCst);

    adapter.push_remote(Some(LoadResponse::Changes(Changeset {
        added: vec![doc! { "id": "b", "v": 2 }],
        modified: vec![doc! { "id": "a", "v": 10 }],
        removed: vec![],
    })));

    wait_until(|| {
        collection
            .find(&doc! {}, FindOptions::default())
            .unwrap()
            .count()
            .unwrap()
            == 2
    })
    .await;
    let a = collection
        .find_one(&doc! { "id": "a" }, FindOptions::default())
        .unwrap()
        .unwrap();
    assert_eq!(a.get_i32("v").unwrap(), 10);

    // applying received data is not a local write: nothing re-saved
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(adapter.saves.load(Ordering::SeqCst), saves_before);
}

#[tokio::test]
async fn bare_notification_triggers_reload() {
    let adapter = TestAdapter::seeded(vec![doc! { "id": "a" }]);
    let collection = persisted_collection(adapter.clone());
    collection.ready().await;

    adapter
        .stored
        .lock()
        .unwrap()
        .push(doc! { "id": "late" });
    adapter.push_remote(None);

    wait_until(|| {
        collection
            .find(&doc! {}, FindOptions::default())
            .unwrap()
            .count()
            .unwrap()
            == 2
    })
    .await;
}

#[tokio::test]
async fn load_results_are_discarded_while_a_save_is_in_flight() {
    let adapter = TestAdapter::seeded(vec![]);
    let collection = persisted_collection(adapter.clone());
    collection.ready().await;

    // hold the save gate so the next save never completes
    let gate = adapter.save_gate.lock().await;
    collection.insert(doc! { "id": "local" }).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // a full snapshot arriving now would clobber the un-persisted
    // local write; it must be dropped
    adapter.push_remote(Some(LoadResponse::Items(vec![doc! { "id": "remote" }])));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        collection
            .find(&doc! { "id": "local" }, FindOptions::default())
            .unwrap()
            .count()
            .unwrap(),
        1
    );

    drop(gate);
    wait_until(|| adapter.stored_ids().contains(&"local".to_string())).await;
}

// ── Dispose ─────────────────────────────────────────────────────

#[tokio::test]
async fn dispose_unregisters_the_adapter() {
    let adapter = TestAdapter::seeded(vec![]);
    let collection = persisted_collection(adapter.clone());
    collection.ready().await;

    collection.dispose();
    wait_until(|| adapter.unregistered.load(Ordering::SeqCst)).await;
}
