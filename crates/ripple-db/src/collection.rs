use std::collections::HashSet;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use arc_swap::ArcSwap;
use bson::{Bson, Document};
use imbl::Vector;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use ripple_query::{Modifier, Selector, canonical_string};

use crate::cursor::{Cursor, FindOptions};
use crate::error::DbError;
use crate::events::{Event, EventBus, Listener, ListenerId};
use crate::index::{FieldIndex, IndexRegistry};
use crate::observer::Observer;
use crate::persistence::{Changeset, LoadResponse, OnChange, PersistenceAdapter, PersistenceError};
use crate::planner::{self, Candidates};
use crate::reactivity::{Dependency, ReactivityAdapter};

pub type Transform = Arc<dyn Fn(Document) -> Document + Send + Sync>;
pub type TransformAll = Arc<dyn Fn(Vec<Document>, &[String]) -> Vec<Document> + Send + Sync>;
pub type PrimaryKeyGenerator = Arc<dyn Fn() -> Bson + Send + Sync>;
pub type ValidateHook = Arc<dyn Fn(&Document) -> Result<(), String> + Send + Sync>;

/// Construction options. Everything is optional; the default is a
/// plain in-memory collection with uuid-v4 primary keys.
#[derive(Default)]
pub struct CollectionOptions {
    /// Initial backing items.
    pub memory: Vec<Document>,
    /// Field names to index from the start.
    pub indices: Vec<String>,
    /// Prebuilt index providers (e.g. async storage-backed ones).
    pub index_providers: Vec<FieldIndex>,
    pub reactivity: Option<Arc<dyn ReactivityAdapter>>,
    pub persistence: Option<Arc<dyn PersistenceAdapter>>,
    /// Per-item hook applied after projection on fetch.
    pub transform: Option<Transform>,
    /// One-pass hook over the whole result set, before sorting.
    pub transform_all: Option<TransformAll>,
    pub primary_key_generator: Option<PrimaryKeyGenerator>,
    pub enable_debug_mode: bool,
    /// Receives each document before insert/update/replace; an error
    /// aborts the operation with `Validation`.
    pub validate: Option<ValidateHook>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    pub upsert: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PersistState {
    Initializing,
    Ready,
    Disposed,
}

pub(crate) struct PersistenceHandle {
    adapter: Arc<dyn PersistenceAdapter>,
    save_tx: mpsc::UnboundedSender<Changeset>,
    pending: Mutex<Changeset>,
    saves_in_flight: Arc<AtomicUsize>,
    state: Mutex<PersistState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A live query subscription: how to requery, the diff state, and the
/// reactive dependency invalidated on changes.
pub(crate) struct LiveObserver {
    pub(crate) id: u64,
    pub(crate) fetch: Box<dyn Fn(&Collection) -> Result<Vec<Document>, DbError> + Send + Sync>,
    pub(crate) observer: Mutex<Observer>,
    pub(crate) dependency: Option<Arc<dyn Dependency>>,
}

pub(crate) struct CollectionInner {
    items: ArcSwap<Vector<Document>>,
    write_lock: Mutex<()>,
    pub(crate) indexes: Mutex<IndexRegistry>,
    events: EventBus,
    emit_lock: Mutex<()>,
    observers: Mutex<Vec<Arc<LiveObserver>>>,
    observer_seq: AtomicU64,
    pub(crate) transform: Option<Transform>,
    pub(crate) transform_all: Option<TransformAll>,
    validate: Option<ValidateHook>,
    key_gen: PrimaryKeyGenerator,
    pub(crate) reactivity: Option<Arc<dyn ReactivityAdapter>>,
    batch_depth: AtomicUsize,
    debug: AtomicBool,
    disposed: AtomicBool,
    persistence: Mutex<Option<Arc<PersistenceHandle>>>,
    ready_tx: watch::Sender<bool>,
}

/// A reactive, in-memory document collection with MongoDB-style
/// selectors and modifiers, optional secondary indices, change events
/// and an optional persistence adapter.
///
/// Cloning is cheap and shares state. All mutation goes through the
/// public operations; cursors and observers read consistent snapshots.
#[derive(Clone)]
pub struct Collection {
    pub(crate) inner: Arc<CollectionInner>,
}

impl Collection {
    /// Create a collection. When a persistence adapter is configured,
    /// initialization starts immediately and requires an ambient Tokio
    /// runtime; the collection accepts writes during initialization
    /// and flushes them once the adapter is ready.
    pub fn new(options: CollectionOptions) -> Collection {
        let mut registry = IndexRegistry::new();
        for field in &options.indices {
            registry.create_index(field.clone());
        }
        for provider in options.index_providers {
            registry.add_provider(provider);
        }
        let items: Vector<Document> = options.memory.into_iter().collect();
        registry.rebuild(&items);

        let (ready_tx, _) = watch::channel(true);
        let collection = Collection {
            inner: Arc::new(CollectionInner {
                items: ArcSwap::new(Arc::new(items)),
                write_lock: Mutex::new(()),
                indexes: Mutex::new(registry),
                events: EventBus::new(),
                emit_lock: Mutex::new(()),
                observers: Mutex::new(Vec::new()),
                observer_seq: AtomicU64::new(0),
                transform: options.transform,
                transform_all: options.transform_all,
                validate: options.validate,
                key_gen: options
                    .primary_key_generator
                    .unwrap_or_else(|| Arc::new(|| Bson::String(uuid::Uuid::new_v4().to_string()))),
                reactivity: options.reactivity,
                batch_depth: AtomicUsize::new(0),
                debug: AtomicBool::new(options.enable_debug_mode),
                disposed: AtomicBool::new(false),
                persistence: Mutex::new(None),
                ready_tx,
            }),
        };

        if let Some(adapter) = options.persistence {
            collection.attach_persistence(adapter);
        }
        collection
    }

    /// In-memory collection seeded with `items`.
    pub fn from_memory(items: Vec<Document>) -> Collection {
        Collection::new(CollectionOptions {
            memory: items,
            ..Default::default()
        })
    }

    pub(crate) fn upgrade(weak: &Weak<CollectionInner>) -> Option<Collection> {
        weak.upgrade().map(|inner| Collection { inner })
    }

    // ── Events ──────────────────────────────────────────────────

    pub fn on(&self, listener: Listener) -> ListenerId {
        self.inner.events.on(listener)
    }

    pub fn off(&self, id: ListenerId) {
        self.inner.events.off(id);
    }

    /// Emit a sequence of events atomically with respect to other
    /// emitters on this collection.
    pub(crate) fn emit_sequence(&self, events: &[Event]) {
        let _guard = self.inner.emit_lock.lock();
        for event in events {
            self.inner.events.emit(event);
        }
    }

    fn emit_persistence_error(&self, error: PersistenceError) {
        tracing::warn!(error = %error, "persistence failure");
        self.emit_sequence(&[Event::PersistenceError(error.0)]);
    }

    fn emit_debug(&self, op: &'static str, call_site: &Location<'_>) {
        if self.inner.debug.load(Ordering::Relaxed) {
            self.emit_sequence(&[Event::Debug {
                op,
                call_site: format!("{}:{}", call_site.file(), call_site.line()),
            }]);
        }
    }

    pub fn set_debug_mode(&self, enabled: bool) {
        self.inner.debug.store(enabled, Ordering::Relaxed);
    }

    // ── Reads ───────────────────────────────────────────────────

    /// Build a cursor over the selector. The cursor is lazy; nothing
    /// is evaluated until `fetch`/`count`/`observe`.
    #[track_caller]
    pub fn find(&self, selector: &Document, options: FindOptions) -> Result<Cursor, DbError> {
        let call_site = Location::caller();
        self.ensure_active()?;
        self.emit_debug("find", call_site);
        if options.limit == Some(0) {
            return Err(DbError::InvalidSelector("limit must be greater than 0".into()));
        }
        let parsed = Selector::parse(selector)?;
        Ok(Cursor::new(self.clone(), parsed, options))
    }

    /// First match, or `None`.
    #[track_caller]
    pub fn find_one(
        &self,
        selector: &Document,
        options: FindOptions,
    ) -> Result<Option<Document>, DbError> {
        let call_site = Location::caller();
        self.ensure_active()?;
        self.emit_debug("findOne", call_site);
        let options = FindOptions {
            limit: Some(1),
            ..options
        };
        let parsed = Selector::parse(selector)?;
        let cursor = Cursor::new(self.clone(), parsed, options);
        Ok(cursor.fetch()?.into_iter().next())
    }

    pub(crate) fn snapshot(&self) -> Arc<Vector<Document>> {
        self.inner.items.load_full()
    }

    pub(crate) fn snapshot_vec(&self) -> Vec<Document> {
        self.snapshot().iter().cloned().collect()
    }

    /// Candidate resolution + residual match, in insertion order.
    /// No sort/skip/limit/projection; the cursor layers those.
    pub(crate) fn query_raw(&self, selector: &Selector) -> Result<Vec<Document>, DbError> {
        self.ensure_active()?;
        let (snapshot, plan) = {
            let indexes = lock(&self.inner.indexes);
            let snapshot = self.inner.items.load_full();
            let plan = planner::plan(selector, &indexes)?;
            (snapshot, plan)
        };
        let residual = &plan.residual;
        let docs = match plan.candidates {
            Candidates::FullScan => snapshot
                .iter()
                .filter(|d| residual.is_empty() || residual.matches(d))
                .cloned()
                .collect(),
            Candidates::Positions(positions) => positions
                .iter()
                .filter_map(|p| snapshot.get(*p))
                .filter(|d| residual.is_empty() || residual.matches(d))
                .cloned()
                .collect(),
        };
        Ok(docs)
    }

    /// Create a field index and build it from the current state.
    pub fn create_index(&self, field: impl Into<String>) -> Result<(), DbError> {
        self.ensure_active()?;
        let _w = lock(&self.inner.write_lock);
        let mut indexes = lock(&self.inner.indexes);
        indexes.create_index(field);
        let items = self.inner.items.load_full();
        indexes.rebuild(&items);
        Ok(())
    }

    // ── Writes ──────────────────────────────────────────────────

    /// Insert a document, generating an id when absent. Returns the
    /// primary key.
    #[track_caller]
    pub fn insert(&self, doc: Document) -> Result<Bson, DbError> {
        let call_site = Location::caller();
        self.ensure_active()?;
        self.emit_debug("insert", call_site);
        let (id, doc) = self.insert_inner(doc)?;
        self.emit_sequence(&[Event::Added(doc.clone()), Event::Insert(doc.clone())]);
        self.enqueue_save(Changeset {
            added: vec![doc],
            ..Default::default()
        });
        self.notify_observers();
        Ok(id)
    }

    /// Insert a batch of documents. A duplicate id (against the
    /// collection or within the batch) fails the whole call before
    /// anything is applied.
    #[track_caller]
    pub fn insert_many(&self, docs: Vec<Document>) -> Result<Vec<Bson>, DbError> {
        let call_site = Location::caller();
        self.ensure_active()?;
        self.emit_debug("insertMany", call_site);

        let mut prepared = Vec::with_capacity(docs.len());
        for mut doc in docs {
            self.run_validate(&doc)?;
            let id = match doc.get("id") {
                Some(id) => id.clone(),
                None => {
                    let id = (self.inner.key_gen)();
                    doc.insert("id".to_string(), id.clone());
                    id
                }
            };
            prepared.push((id, doc));
        }

        {
            let _w = lock(&self.inner.write_lock);
            let mut indexes = lock(&self.inner.indexes);
            let mut seen: HashSet<String> = HashSet::new();
            for (id, _) in &prepared {
                let key = canonical_string(id);
                if indexes.contains_id(id) || !seen.insert(key) {
                    return Err(DbError::DuplicateId(canonical_string(id)));
                }
            }
            let mut items = (*self.inner.items.load_full()).clone();
            for (id, doc) in &prepared {
                items.push_back(doc.clone());
                indexes.insert_id(id, items.len() - 1);
            }
            self.inner.items.store(Arc::new(items));
            self.refresh_indexes(&mut indexes);
        }

        let mut events = Vec::with_capacity(prepared.len() * 2);
        for (_, doc) in &prepared {
            events.push(Event::Added(doc.clone()));
            events.push(Event::Insert(doc.clone()));
        }
        self.emit_sequence(&events);
        self.enqueue_save(Changeset {
            added: prepared.iter().map(|(_, d)| d.clone()).collect(),
            ..Default::default()
        });
        self.notify_observers();
        Ok(prepared.into_iter().map(|(id, _)| id).collect())
    }

    /// Mutate the first match via deep-clone-then-replace. Returns the
    /// number of affected documents (1 on upsert insertion).
    #[track_caller]
    pub fn update_one(
        &self,
        selector: &Document,
        modifier: &Document,
        options: UpdateOptions,
    ) -> Result<u64, DbError> {
        let call_site = Location::caller();
        self.ensure_active()?;
        self.emit_debug("updateOne", call_site);
        self.update_docs(selector, modifier, options, Some(1), false)
    }

    /// Mutate every match. Returns the count.
    #[track_caller]
    pub fn update_many(
        &self,
        selector: &Document,
        modifier: &Document,
        options: UpdateOptions,
    ) -> Result<u64, DbError> {
        let call_site = Location::caller();
        self.ensure_active()?;
        self.emit_debug("updateMany", call_site);
        self.update_docs(selector, modifier, options, None, true)
    }

    /// Replace the first match wholesale, keeping its id. The
    /// replacement's id, when present, must equal the matched one.
    #[track_caller]
    pub fn replace_one(
        &self,
        selector: &Document,
        replacement: &Document,
        options: UpdateOptions,
    ) -> Result<u64, DbError> {
        let call_site = Location::caller();
        self.ensure_active()?;
        self.emit_debug("replaceOne", call_site);
        let parsed = Selector::parse(selector)?;

        let replaced = {
            let _w = lock(&self.inner.write_lock);
            let mut indexes = lock(&self.inner.indexes);
            let snapshot = self.inner.items.load_full();
            let positions = find_positions(&parsed, &indexes, &snapshot, Some(1))?;

            match positions.first() {
                None => None,
                Some(&position) => {
                    let old = snapshot
                        .get(position)
                        .cloned()
                        .ok_or(DbError::Disposed)?;
                    let old_id = old.get("id").cloned().unwrap_or(Bson::Null);
                    if let Some(new_id) = replacement.get("id")
                        && !ripple_query::value_eq(new_id, &old_id)
                    {
                        return Err(DbError::InvalidModifier(
                            "replacement id must match the replaced document".into(),
                        ));
                    }
                    let mut new_doc = Document::new();
                    new_doc.insert("id".to_string(), old_id);
                    for (k, v) in replacement {
                        if k != "id" {
                            new_doc.insert(k.clone(), v.clone());
                        }
                    }
                    self.run_validate(&new_doc)?;

                    let mut items = (*snapshot).clone();
                    items.set(position, new_doc.clone());
                    self.inner.items.store(Arc::new(items));
                    self.refresh_indexes(&mut indexes);
                    Some(new_doc)
                }
            }
        };

        match replaced {
            Some(new_doc) => {
                self.emit_sequence(&[
                    Event::Changed {
                        item: new_doc.clone(),
                        modifier: None,
                    },
                    Event::ReplaceOne {
                        selector: selector.clone(),
                        replacement: replacement.clone(),
                    },
                ]);
                self.enqueue_save(Changeset {
                    modified: vec![new_doc],
                    ..Default::default()
                });
                self.notify_observers();
                Ok(1)
            }
            None if options.upsert => {
                let (_, doc) = self.insert_inner(replacement.clone())?;
                self.emit_sequence(&[
                    Event::Added(doc.clone()),
                    Event::ReplaceOne {
                        selector: selector.clone(),
                        replacement: replacement.clone(),
                    },
                ]);
                self.enqueue_save(Changeset {
                    added: vec![doc],
                    ..Default::default()
                });
                self.notify_observers();
                Ok(1)
            }
            None => {
                self.emit_sequence(&[Event::ReplaceOne {
                    selector: selector.clone(),
                    replacement: replacement.clone(),
                }]);
                Ok(0)
            }
        }
    }

    /// Remove the first match. Returns the count.
    #[track_caller]
    pub fn remove_one(&self, selector: &Document) -> Result<u64, DbError> {
        let call_site = Location::caller();
        self.ensure_active()?;
        self.emit_debug("removeOne", call_site);
        self.remove_docs(selector, Some(1), false)
    }

    /// Remove every match. Returns the count.
    #[track_caller]
    pub fn remove_many(&self, selector: &Document) -> Result<u64, DbError> {
        let call_site = Location::caller();
        self.ensure_active()?;
        self.emit_debug("removeMany", call_site);
        self.remove_docs(selector, None, true)
    }

    // ── Batch ───────────────────────────────────────────────────

    /// Defer index rebuilds and observer requeries until `f` returns.
    /// Nests safely; the rebuild happens once at the outermost close.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = BatchGuard::begin(self);
        f()
    }

    pub(crate) fn start_batch(&self) {
        self.inner.batch_depth.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn end_batch(&self) {
        let prev = self.inner.batch_depth.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            {
                let _w = lock(&self.inner.write_lock);
                let mut indexes = lock(&self.inner.indexes);
                if indexes.is_outdated() {
                    let items = self.inner.items.load_full();
                    indexes.rebuild(&items);
                }
            }
            self.notify_observers();
        }
    }

    pub(crate) fn in_batch(&self) -> bool {
        self.inner.batch_depth.load(Ordering::SeqCst) > 0
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Terminal teardown: unregisters persistence, clears state and
    /// indices, drops observers. Subsequent operations fail with
    /// `Disposed`. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = lock(&self.inner.persistence).take();
        if let Some(handle) = handle {
            *lock(&handle.state) = PersistState::Disposed;
            for task in lock(&handle.tasks).drain(..) {
                task.abort();
            }
            let adapter = handle.adapter.clone();
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    let _ = adapter.unregister().await;
                });
            }
        }
        self.inner.items.store(Arc::new(Vector::new()));
        lock(&self.inner.indexes).clear();
        lock(&self.inner.observers).clear();
        self.inner.events.clear();
        self.inner.ready_tx.send_replace(true);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_active(&self) -> Result<(), DbError> {
        if self.is_disposed() {
            Err(DbError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Resolves once persistence initialization has finished (or
    /// immediately when the collection is purely in-memory).
    pub async fn ready(&self) {
        let mut rx = self.inner.ready_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready_tx.borrow()
    }

    // ── Observers ───────────────────────────────────────────────

    pub(crate) fn register_observer(
        &self,
        fetch: Box<dyn Fn(&Collection) -> Result<Vec<Document>, DbError> + Send + Sync>,
        observer: Observer,
        dependency: Option<Arc<dyn Dependency>>,
    ) -> u64 {
        let id = self.inner.observer_seq.fetch_add(1, Ordering::Relaxed);
        let live = Arc::new(LiveObserver {
            id,
            fetch,
            observer: Mutex::new(observer),
            dependency,
        });
        lock(&self.inner.observers).push(live);
        self.emit_sequence(&[Event::ObserverCreated]);
        id
    }

    pub(crate) fn unregister_observer(&self, id: u64) {
        let mut observers = lock(&self.inner.observers);
        let before = observers.len();
        observers.retain(|o| o.id != id);
        if observers.len() != before {
            drop(observers);
            self.emit_sequence(&[Event::ObserverDisposed]);
        }
    }

    pub(crate) fn with_observer<R>(
        &self,
        id: u64,
        f: impl FnOnce(&LiveObserver) -> R,
    ) -> Option<R> {
        let observers = lock(&self.inner.observers);
        observers.iter().find(|o| o.id == id).map(|o| f(o))
    }

    /// Requery every live observer and diff. Coalesced away inside
    /// batches; the batch close calls it once.
    pub(crate) fn notify_observers(&self) {
        if self.in_batch() {
            return;
        }
        let observers: Vec<Arc<LiveObserver>> = lock(&self.inner.observers).clone();
        for live in observers {
            match (live.fetch)(self) {
                Ok(items) => {
                    let changed = lock(&live.observer).check(&items);
                    if changed && let Some(dep) = &live.dependency {
                        dep.notify();
                    }
                }
                Err(e) => lock(&live.observer).set_query_error(e),
            }
        }
    }

    // ── Internal write helpers ──────────────────────────────────

    fn run_validate(&self, doc: &Document) -> Result<(), DbError> {
        if let Some(validate) = &self.inner.validate {
            validate(doc).map_err(DbError::Validation)?;
        }
        Ok(())
    }

    /// Outside a batch, rebuild every index from the stored items;
    /// inside one, leave them stale for the batch close.
    fn refresh_indexes(&self, indexes: &mut IndexRegistry) {
        if self.in_batch() {
            indexes.mark_outdated();
        } else {
            let items = self.inner.items.load_full();
            indexes.rebuild(&items);
        }
    }

    /// Validate, assign id, check uniqueness and append. Emits
    /// nothing; callers own the event sequence.
    fn insert_inner(&self, mut doc: Document) -> Result<(Bson, Document), DbError> {
        self.run_validate(&doc)?;
        let id = match doc.get("id") {
            Some(id) => id.clone(),
            None => {
                let id = (self.inner.key_gen)();
                doc.insert("id".to_string(), id.clone());
                id
            }
        };
        let _w = lock(&self.inner.write_lock);
        let mut indexes = lock(&self.inner.indexes);
        if indexes.contains_id(&id) {
            return Err(DbError::DuplicateId(canonical_string(&id)));
        }
        let mut items = (*self.inner.items.load_full()).clone();
        items.push_back(doc.clone());
        let position = items.len() - 1;
        self.inner.items.store(Arc::new(items));
        indexes.insert_id(&id, position);
        self.refresh_indexes(&mut indexes);
        Ok((id, doc))
    }

    fn update_docs(
        &self,
        selector: &Document,
        modifier: &Document,
        options: UpdateOptions,
        limit: Option<usize>,
        many: bool,
    ) -> Result<u64, DbError> {
        let parsed_selector = Selector::parse(selector)?;
        let parsed_modifier = Modifier::parse(modifier)?;

        let updated: Vec<Document> = {
            let _w = lock(&self.inner.write_lock);
            let mut indexes = lock(&self.inner.indexes);
            let snapshot = self.inner.items.load_full();
            let positions = find_positions(&parsed_selector, &indexes, &snapshot, limit)?;

            if positions.is_empty() {
                Vec::new()
            } else {
                // validate the whole batch before touching anything,
                // so a failure applies no partial mutation
                let mut taken: HashSet<String> = snapshot
                    .iter()
                    .filter_map(|d| d.get("id"))
                    .map(canonical_string)
                    .collect();
                let mut staged: Vec<(usize, Document, Option<(Bson, Bson)>)> =
                    Vec::with_capacity(positions.len());
                for &position in &positions {
                    let old = snapshot.get(position).cloned().ok_or(DbError::Disposed)?;
                    let new_doc = parsed_modifier.apply(&old, false)?;
                    let old_id = old.get("id").cloned().unwrap_or(Bson::Null);
                    let new_id = new_doc.get("id").cloned().unwrap_or(Bson::Null);
                    let id_change = if ripple_query::value_eq(&old_id, &new_id) {
                        None
                    } else {
                        let new_key = canonical_string(&new_id);
                        if taken.contains(&new_key) {
                            return Err(DbError::DuplicateId(new_key));
                        }
                        taken.remove(&canonical_string(&old_id));
                        taken.insert(new_key);
                        Some((old_id, new_id))
                    };
                    self.run_validate(&new_doc)?;
                    staged.push((position, new_doc, id_change));
                }

                let mut items = (*snapshot).clone();
                let mut updated = Vec::with_capacity(staged.len());
                for (position, new_doc, id_change) in staged {
                    if let Some((old_id, new_id)) = id_change {
                        indexes.replace_id(&old_id, &new_id, position);
                    }
                    items.set(position, new_doc.clone());
                    updated.push(new_doc);
                }
                self.inner.items.store(Arc::new(items));
                self.refresh_indexes(&mut indexes);
                updated
            }
        };

        let op_event = if many {
            Event::UpdateMany {
                selector: selector.clone(),
                modifier: modifier.clone(),
            }
        } else {
            Event::UpdateOne {
                selector: selector.clone(),
                modifier: modifier.clone(),
            }
        };

        if updated.is_empty() {
            if options.upsert {
                let upserted = parsed_modifier.apply(&Document::new(), true)?;
                let (_, doc) = self.insert_inner(upserted)?;
                self.emit_sequence(&[Event::Added(doc.clone()), op_event]);
                self.enqueue_save(Changeset {
                    added: vec![doc],
                    ..Default::default()
                });
                self.notify_observers();
                return Ok(1);
            }
            self.emit_sequence(&[op_event]);
            return Ok(0);
        }

        let mut events: Vec<Event> = updated
            .iter()
            .map(|doc| Event::Changed {
                item: doc.clone(),
                modifier: Some(modifier.clone()),
            })
            .collect();
        let count = updated.len() as u64;
        events.push(op_event);
        self.emit_sequence(&events);
        self.enqueue_save(Changeset {
            modified: updated,
            ..Default::default()
        });
        self.notify_observers();
        Ok(count)
    }

    fn remove_docs(
        &self,
        selector: &Document,
        limit: Option<usize>,
        many: bool,
    ) -> Result<u64, DbError> {
        let parsed = Selector::parse(selector)?;

        let removed: Vec<Document> = {
            let _w = lock(&self.inner.write_lock);
            let mut indexes = lock(&self.inner.indexes);
            let snapshot = self.inner.items.load_full();
            let positions = find_positions(&parsed, &indexes, &snapshot, limit)?;

            if positions.is_empty() {
                Vec::new()
            } else {
                let mut items = (*snapshot).clone();
                let mut removed = Vec::with_capacity(positions.len());
                // splice from the back so earlier positions stay valid
                for &position in positions.iter().rev() {
                    removed.push(items.remove(position));
                    indexes.remove_position(position);
                }
                removed.reverse();
                self.inner.items.store(Arc::new(items));
                self.refresh_indexes(&mut indexes);
                removed
            }
        };

        let op_event = if many {
            Event::RemoveMany {
                selector: selector.clone(),
            }
        } else {
            Event::RemoveOne {
                selector: selector.clone(),
            }
        };

        let count = removed.len() as u64;
        let mut events: Vec<Event> = removed.iter().cloned().map(Event::Removed).collect();
        events.push(op_event);
        self.emit_sequence(&events);
        if count > 0 {
            self.enqueue_save(Changeset {
                removed,
                ..Default::default()
            });
            self.notify_observers();
        }
        Ok(count)
    }

    // ── Persistence pipeline ────────────────────────────────────

    fn attach_persistence(&self, adapter: Arc<dyn PersistenceAdapter>) {
        let (save_tx, mut save_rx) = mpsc::unbounded_channel::<Changeset>();
        let (remote_tx, mut remote_rx) = mpsc::unbounded_channel::<Option<LoadResponse>>();

        let handle = Arc::new(PersistenceHandle {
            adapter: adapter.clone(),
            save_tx,
            pending: Mutex::new(Changeset::default()),
            saves_in_flight: Arc::new(AtomicUsize::new(0)),
            state: Mutex::new(PersistState::Initializing),
            tasks: Mutex::new(Vec::new()),
        });
        *lock(&self.inner.persistence) = Some(handle.clone());
        self.inner.ready_tx.send_replace(false);

        let weak = Arc::downgrade(&self.inner);

        // remote-change listener: applies pushed data, or re-pulls on
        // a bare notification
        let remote_task = tokio::spawn({
            let weak = weak.clone();
            let adapter = adapter.clone();
            let handle = handle.clone();
            async move {
                while let Some(msg) = remote_rx.recv().await {
                    let Some(collection) = Collection::upgrade(&weak) else {
                        break;
                    };
                    let response = match msg {
                        Some(response) => Ok(response),
                        None => {
                            collection.emit_sequence(&[Event::PersistencePullStarted]);
                            adapter.load().await
                        }
                    };
                    match response {
                        Ok(response) => {
                            collection.apply_load_response(response, &handle).await
                        }
                        Err(e) => collection.emit_persistence_error(e),
                    }
                }
            }
        });

        // single save flusher: drains the queue sequentially, tagging
        // pushStarted/Completed around non-empty bursts
        let save_task = tokio::spawn({
            let weak = weak.clone();
            let adapter = adapter.clone();
            let handle = handle.clone();
            async move {
                while let Some(first) = save_rx.recv().await {
                    let Some(collection) = Collection::upgrade(&weak) else {
                        break;
                    };
                    collection.emit_sequence(&[Event::PersistencePushStarted]);
                    let mut burst = vec![first];
                    while let Ok(next) = save_rx.try_recv() {
                        burst.push(next);
                    }
                    for changes in burst {
                        collection.run_save(&adapter, &handle, changes).await;
                    }
                    collection.emit_sequence(&[Event::PersistencePushCompleted]);
                }
            }
        });

        // init handshake: register → load → flush pending → reload →
        // persistence.init on the next tick
        let init_task = tokio::spawn({
            let weak = weak.clone();
            let handle = handle.clone();
            async move {
                let on_change: OnChange = Arc::new(move |data| {
                    let _ = remote_tx.send(data);
                });
                let Some(collection) = Collection::upgrade(&weak) else {
                    return;
                };
                if let Err(e) = adapter.register(on_change).await {
                    collection.emit_persistence_error(e);
                }

                collection.emit_sequence(&[Event::PersistencePullStarted]);
                match adapter.load().await {
                    Ok(response) => collection.apply_load_response(response, &handle).await,
                    Err(e) => collection.emit_persistence_error(e),
                }

                // accept new saves into the queue from here on
                *lock(&handle.state) = PersistState::Ready;
                let pending = std::mem::take(&mut *lock(&handle.pending));
                if !pending.is_empty() {
                    // writes accepted during init survive the snapshot
                    // replace by re-applying them before the flush
                    collection.apply_changes_internal(&pending);
                    collection.run_save(&adapter, &handle, pending).await;
                }
                match adapter.load().await {
                    Ok(response) => collection.apply_load_response(response, &handle).await,
                    Err(e) => collection.emit_persistence_error(e),
                }

                tokio::task::yield_now().await;
                collection.emit_sequence(&[Event::PersistenceInit]);
                collection.inner.ready_tx.send_replace(true);
            }
        });

        *lock(&handle.tasks) = vec![remote_task, save_task, init_task];
    }

    async fn run_save(
        &self,
        adapter: &Arc<dyn PersistenceAdapter>,
        handle: &PersistenceHandle,
        changes: Changeset,
    ) {
        handle.saves_in_flight.fetch_add(1, Ordering::SeqCst);
        let items = self.snapshot_vec();
        let result = adapter.save(items, changes).await;
        handle.saves_in_flight.fetch_sub(1, Ordering::SeqCst);
        match result {
            Ok(()) => self.emit_sequence(&[Event::PersistenceTransmitted]),
            Err(e) => self.emit_persistence_error(e),
        }
    }

    fn enqueue_save(&self, changes: Changeset) {
        if changes.is_empty() {
            return;
        }
        let Some(handle) = lock(&self.inner.persistence).clone() else {
            return;
        };
        let state = *lock(&handle.state);
        match state {
            PersistState::Initializing => lock(&handle.pending).merge(changes),
            PersistState::Ready => {
                let _ = handle.save_tx.send(changes);
            }
            PersistState::Disposed => {}
        }
    }

    /// Merge a load response into the collection state. Full
    /// snapshots replace S; deltas apply in place. Fires
    /// `persistence.received` and, on the next tick,
    /// `persistence.pullCompleted`.
    pub(crate) async fn apply_load_response(
        &self,
        response: LoadResponse,
        handle: &PersistenceHandle,
    ) {
        if handle.saves_in_flight.load(Ordering::SeqCst) > 0 {
            tracing::debug!("discarding load result while a save is in flight");
            return;
        }
        if self.is_disposed() {
            return;
        }
        match response {
            LoadResponse::Items(list) => {
                let _w = lock(&self.inner.write_lock);
                let mut indexes = lock(&self.inner.indexes);
                let items: Vector<Document> = list.into_iter().collect();
                indexes.rebuild(&items);
                self.inner.items.store(Arc::new(items));
            }
            LoadResponse::Changes(changes) => self.apply_changes_internal(&changes),
        }
        self.emit_sequence(&[Event::PersistenceReceived]);
        self.notify_observers();
        tokio::task::yield_now().await;
        self.emit_sequence(&[Event::PersistencePullCompleted]);
        self.notify_observers();
    }

    /// Apply a changeset directly to S without touching the save
    /// path. Used for loaded data and the init-time pending replay.
    pub(crate) fn apply_changes_internal(&self, changes: &Changeset) {
        let _w = lock(&self.inner.write_lock);
        let mut indexes = lock(&self.inner.indexes);
        let mut items = (*self.inner.items.load_full()).clone();

        let position_of = |items: &Vector<Document>, id: &Bson| {
            items
                .iter()
                .position(|d| d.get("id").is_some_and(|v| ripple_query::value_eq(v, id)))
        };

        for doc in changes.added.iter().chain(changes.modified.iter()) {
            let Some(id) = doc.get("id").cloned() else {
                continue;
            };
            match position_of(&items, &id) {
                Some(position) => {
                    items.set(position, doc.clone());
                }
                None => items.push_back(doc.clone()),
            }
        }
        for doc in &changes.removed {
            let Some(id) = doc.get("id").cloned() else {
                continue;
            };
            if let Some(position) = position_of(&items, &id) {
                items.remove(position);
            }
        }

        indexes.rebuild(&items);
        self.inner.items.store(Arc::new(items));
    }
}

/// Batch scope guard; closes the batch even when `f` unwinds.
struct BatchGuard {
    collection: Collection,
}

impl BatchGuard {
    fn begin(collection: &Collection) -> BatchGuard {
        collection.start_batch();
        BatchGuard {
            collection: collection.clone(),
        }
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        self.collection.end_batch();
    }
}

/// Candidate positions for a selector, in insertion order, residual
/// applied, truncated at `limit`.
fn find_positions(
    selector: &Selector,
    indexes: &IndexRegistry,
    snapshot: &Vector<Document>,
    limit: Option<usize>,
) -> Result<Vec<usize>, DbError> {
    let plan = planner::plan(selector, indexes)?;
    let residual = &plan.residual;
    let keep = |position: &usize| {
        snapshot
            .get(*position)
            .is_some_and(|d| residual.is_empty() || residual.matches(d))
    };
    let limit = limit.unwrap_or(usize::MAX);
    let positions = match plan.candidates {
        Candidates::FullScan => (0..snapshot.len()).filter(keep).take(limit).collect(),
        Candidates::Positions(set) => set.into_iter().filter(|p| keep(p)).take(limit).collect(),
    };
    Ok(positions)
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
