use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use ripple_db::{
    Changeset, Collection, CollectionOptions, DbError, Event, FindOptions, ListenerId,
    LoadResponse, PersistenceAdapter, UpdateOptions, compute_changes,
};

use crate::error::SyncError;
use crate::rebase;
use crate::records::{
    ChangeKind, ChangeRecord, SnapshotRecord, SyncOperationRecord, SyncStatus, now_millis,
};

pub const DEFAULT_SYNC_MANAGER_ID: &str = "default-sync-manager";
const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// High-water mark of the last finished sync, handed to `pull` so
/// servers can answer incrementally.
#[derive(Debug, Clone, Default)]
pub struct PullContext {
    pub last_finished_sync_start: Option<i64>,
    pub last_finished_sync_end: Option<i64>,
}

/// The remote side of the sync engine.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn pull(
        &self,
        collection: &str,
        context: &PullContext,
    ) -> Result<LoadResponse, SyncError>;

    async fn push(&self, collection: &str, changes: &Changeset) -> Result<(), SyncError>;
}

pub type ErrorHandler = Arc<dyn Fn(&str, &SyncError) + Send + Sync>;
pub type BookkeepingPersistence = Arc<dyn Fn(&str) -> Arc<dyn PersistenceAdapter> + Send + Sync>;

pub struct SyncManagerOptions {
    /// Prefix for the four bookkeeping collections:
    /// `{id}-changes`, `{id}-remote-changes`, `{id}-snapshots`,
    /// `{id}-sync-operations`.
    pub id: String,
    /// Window over which bursts of writes collapse into one push.
    pub debounce: Duration,
    pub on_error: Option<ErrorHandler>,
    /// Persistence factory for the bookkeeping collections, called
    /// with each collection name.
    pub persistence: Option<BookkeepingPersistence>,
}

impl Default for SyncManagerOptions {
    fn default() -> Self {
        Self {
            id: DEFAULT_SYNC_MANAGER_ID.to_string(),
            debounce: DEFAULT_DEBOUNCE,
            on_error: None,
            persistence: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Skip the per-collection serialization queue.
    pub force: bool,
    /// Return early when the local change log is empty.
    pub only_with_changes: bool,
}

struct SyncManagerInner {
    id: String,
    instance_id: String,
    transport: Arc<dyn SyncTransport>,
    changes: Collection,
    remote_changes: Collection,
    snapshots: Collection,
    sync_operations: Collection,
    collections: Mutex<HashMap<String, (Collection, ListenerId)>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    debounce: Duration,
    debounce_pending: Mutex<HashSet<String>>,
    seq: AtomicI64,
    on_error: Option<ErrorHandler>,
}

/// Coordinates bidirectional replication for a set of collections:
/// logs local writes, debounces pushes, pulls remote snapshots and
/// rebases un-synced local changes onto them.
///
/// The manager exclusively owns its four bookkeeping collections; it
/// touches target collections only through their public CRUD API.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<SyncManagerInner>,
}

impl SyncManager {
    pub fn new(transport: Arc<dyn SyncTransport>, options: SyncManagerOptions) -> SyncManager {
        let bookkeeping = |suffix: &str| {
            let name = format!("{}-{suffix}", options.id);
            Collection::new(CollectionOptions {
                persistence: options.persistence.as_ref().map(|factory| factory(&name)),
                ..Default::default()
            })
        };
        SyncManager {
            inner: Arc::new(SyncManagerInner {
                instance_id: uuid::Uuid::new_v4().to_string(),
                transport,
                changes: bookkeeping("changes"),
                remote_changes: bookkeeping("remote-changes"),
                snapshots: bookkeeping("snapshots"),
                sync_operations: bookkeeping("sync-operations"),
                collections: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                debounce: options.debounce,
                debounce_pending: Mutex::new(HashSet::new()),
                seq: AtomicI64::new(0),
                on_error: options.on_error,
                id: options.id,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Register a collection for syncing. Local writes start flowing
    /// into the change log and schedule a debounced push.
    pub fn add_collection(&self, name: impl Into<String>, collection: &Collection) {
        let name = name.into();
        let weak = Arc::downgrade(&self.inner);
        let listener_name = name.clone();
        let listener = collection.on(Arc::new(move |event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let (kind, payload) = match event {
                Event::Added(doc) => (ChangeKind::Insert, Bson::Document(doc.clone())),
                Event::Changed { item, modifier } => {
                    let id = item.get("id").cloned().unwrap_or(Bson::Null);
                    // replacements carry no modifier; log them as a
                    // full $set so the rebase can replay them
                    let modifier = modifier.clone().unwrap_or_else(|| set_modifier(item));
                    (
                        ChangeKind::Update,
                        Bson::Document(doc! { "id": id, "modifier": modifier }),
                    )
                }
                Event::Removed(doc) => (
                    ChangeKind::Remove,
                    doc.get("id").cloned().unwrap_or(Bson::Null),
                ),
                _ => return,
            };
            SyncManagerInner::on_local_change(&inner, &listener_name, kind, payload);
        }));
        self.inner
            .collections
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name, (collection.clone(), listener));
    }

    pub fn remove_collection(&self, name: &str) {
        let removed = self
            .inner
            .collections
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name);
        if let Some((collection, listener)) = removed {
            collection.off(listener);
        }
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.inner
            .collections
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Number of un-synced local changes for a collection.
    pub fn pending_changes(&self, name: &str) -> Result<usize, SyncError> {
        Ok(self.changes_for(name)?.len())
    }

    /// Whether any sync-operation is currently `active` (optionally
    /// scoped to one collection).
    pub fn is_syncing(&self, name: Option<&str>) -> Result<bool, SyncError> {
        let selector = match name {
            Some(n) => doc! { "collection": n, "status": "active" },
            None => doc! { "status": "active" },
        };
        let count = self
            .inner
            .sync_operations
            .find(&selector, FindOptions::default())?
            .count()?;
        Ok(count > 0)
    }

    // ── Sync entry points ───────────────────────────────────────

    pub async fn sync(&self, name: &str) -> Result<(), SyncError> {
        self.sync_with(name, SyncOptions::default()).await
    }

    pub async fn sync_all(&self) -> Result<(), SyncError> {
        let mut first_error = None;
        for name in self.collection_names() {
            if let Err(e) = self.sync(&name).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn sync_with(&self, name: &str, options: SyncOptions) -> Result<(), SyncError> {
        let result = self.sync_inner(name, options).await;
        if let Err(e) = &result {
            tracing::warn!(collection = name, error = %e, "sync failed");
            if let Some(handler) = &self.inner.on_error {
                handler(name, e);
            }
        }
        result
    }

    async fn sync_inner(&self, name: &str, options: SyncOptions) -> Result<(), SyncError> {
        let collection = self
            .collection(name)
            .ok_or_else(|| SyncError::UnknownCollection(name.to_string()))?;

        // 1. persistence must be ready before remote data merges in
        collection.ready().await;

        // concurrent syncs per collection are serialized; force skips
        // the queue
        let _guard = if options.force {
            None
        } else {
            Some(self.inner.lock_for(name).lock_owned().await)
        };

        let local_changes = self.changes_for(name)?;
        if options.only_with_changes && local_changes.is_empty() {
            return Ok(());
        }

        let op_id = self.record_operation_start(name)?;
        let result = self.run_sync(name, &collection, local_changes).await;
        self.finish_operation(&op_id, &result)?;
        result
    }

    // ── The sync algorithm ──────────────────────────────────────

    async fn run_sync(
        &self,
        name: &str,
        collection: &Collection,
        local_changes: Vec<ChangeRecord>,
    ) -> Result<(), SyncError> {
        let transport = &self.inner.transport;
        let last = self.last_finished_operation(name)?;
        let context = PullContext {
            last_finished_sync_start: last.as_ref().map(|op| op.start),
            last_finished_sync_end: last.as_ref().and_then(|op| op.end),
        };
        let previous_snapshot = self.snapshot_items(name)?;

        let mut data = transport.pull(name, &context).await?;
        let mut new_snapshot = materialize_snapshot(&previous_snapshot, &data);

        if !local_changes.is_empty() {
            // does replaying the local log actually change anything?
            let rebased_previous = rebase::apply_changes(&previous_snapshot, &local_changes);
            if !compute_changes(&previous_snapshot, &rebased_previous).is_empty() {
                // rebase onto the fresh pull and push the delta
                let rebased_new = rebase::apply_changes(&new_snapshot, &local_changes);
                let changes_to_push = compute_changes(&new_snapshot, &rebased_new);
                if !changes_to_push.is_empty() {
                    transport.push(name, &changes_to_push).await?;
                    // re-pull to fold in server-side effects
                    data = transport.pull(name, &context).await?;
                    new_snapshot = materialize_snapshot(&previous_snapshot, &data);
                }
            }
            for record in &local_changes {
                self.inner
                    .changes
                    .remove_one(&doc! { "id": record.id.as_str() })?;
            }
        }

        let incoming = match &data {
            LoadResponse::Changes(changes) => changes.clone(),
            LoadResponse::Items(items) => compute_changes(&previous_snapshot, items),
        };
        self.apply_incoming(name, collection, &incoming)?;
        self.store_snapshot(name, new_snapshot)?;
        Ok(())
    }

    /// Apply the incoming changeset to the target collection through
    /// its public API, logging each mutation into the remote-changes
    /// log first so the collection listener suppresses the echo.
    fn apply_incoming(
        &self,
        name: &str,
        collection: &Collection,
        incoming: &Changeset,
    ) -> Result<(), SyncError> {
        for doc in incoming.added.iter().chain(incoming.modified.iter()) {
            let Some(id) = doc.get("id").cloned() else {
                continue;
            };
            let exists = collection
                .find_one(&doc! { "id": id.clone() }, FindOptions::default())?
                .is_some();
            if exists {
                self.record_remote(name, ChangeKind::Update, Bson::Document(doc! { "id": id.clone() }))?;
                collection.replace_one(&doc! { "id": id }, doc, UpdateOptions::default())?;
            } else {
                self.record_remote(name, ChangeKind::Insert, Bson::Document(doc.clone()))?;
                collection.insert(doc.clone())?;
            }
        }
        for doc in &incoming.removed {
            let Some(id) = doc.get("id").cloned() else {
                continue;
            };
            let exists = collection
                .find_one(&doc! { "id": id.clone() }, FindOptions::default())?
                .is_some();
            if exists {
                self.record_remote(name, ChangeKind::Remove, id.clone())?;
                collection.remove_one(&doc! { "id": id })?;
            }
        }
        Ok(())
    }

    // ── Bookkeeping ─────────────────────────────────────────────

    fn collection(&self, name: &str) -> Option<Collection> {
        self.inner
            .collections
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .map(|(c, _)| c.clone())
    }

    fn changes_for(&self, name: &str) -> Result<Vec<ChangeRecord>, SyncError> {
        let docs = self
            .inner
            .changes
            .find(&doc! { "collection": name }, FindOptions::default())?
            .fetch()?;
        let mut records: Vec<ChangeRecord> = docs.into_iter().filter_map(decode).collect();
        records.sort_by_key(|r| (r.time, r.seq));
        Ok(records)
    }

    fn snapshot_items(&self, name: &str) -> Result<Vec<Document>, SyncError> {
        let record = self
            .inner
            .snapshots
            .find_one(&doc! { "collection": name }, FindOptions::default())?
            .and_then(decode::<SnapshotRecord>);
        Ok(record.map(|r| r.items).unwrap_or_default())
    }

    fn store_snapshot(&self, name: &str, items: Vec<Document>) -> Result<(), SyncError> {
        self.inner
            .snapshots
            .remove_many(&doc! { "collection": name })?;
        let record = SnapshotRecord {
            id: uuid::Uuid::new_v4().to_string(),
            collection: name.to_string(),
            time: now_millis(),
            items,
        };
        self.inner.snapshots.insert(encode(&record)?)?;
        Ok(())
    }

    fn last_finished_operation(
        &self,
        name: &str,
    ) -> Result<Option<SyncOperationRecord>, SyncError> {
        let docs = self
            .inner
            .sync_operations
            .find(&doc! { "collection": name, "status": "done" }, FindOptions::default())?
            .fetch()?;
        Ok(docs
            .into_iter()
            .filter_map(decode::<SyncOperationRecord>)
            .max_by_key(|op| op.start))
    }

    fn record_operation_start(&self, name: &str) -> Result<String, SyncError> {
        let record = SyncOperationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            collection: name.to_string(),
            instance_id: self.inner.instance_id.clone(),
            start: now_millis(),
            end: None,
            status: SyncStatus::Active,
            error: None,
        };
        let id = record.id.clone();
        self.inner.sync_operations.insert(encode(&record)?)?;
        Ok(id)
    }

    fn finish_operation(
        &self,
        op_id: &str,
        result: &Result<(), SyncError>,
    ) -> Result<(), SyncError> {
        let mut set = doc! { "end": now_millis() };
        match result {
            Ok(()) => {
                set.insert("status".to_string(), "done");
            }
            Err(e) => {
                set.insert("status".to_string(), "error");
                set.insert("error".to_string(), e.to_string());
            }
        }
        self.inner
            .sync_operations
            .update_one(&doc! { "id": op_id }, &doc! { "$set": set }, UpdateOptions::default())?;
        Ok(())
    }

    fn record_remote(
        &self,
        name: &str,
        kind: ChangeKind,
        payload: Bson,
    ) -> Result<(), SyncError> {
        let record = ChangeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            collection: name.to_string(),
            time: now_millis(),
            seq: self.inner.seq.fetch_add(1, Ordering::SeqCst),
            kind,
            payload,
        };
        self.inner.remote_changes.insert(encode(&record)?)?;
        Ok(())
    }
}

impl SyncManagerInner {
    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Collection listener body: suppress echoes of applied remote
    /// writes, log everything else and schedule a debounced push.
    fn on_local_change(inner: &Arc<SyncManagerInner>, name: &str, kind: ChangeKind, payload: Bson) {
        if inner.consume_remote_change(name, kind, &payload) {
            return;
        }
        let record = ChangeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            collection: name.to_string(),
            time: now_millis(),
            seq: inner.seq.fetch_add(1, Ordering::SeqCst),
            kind,
            payload,
        };
        match bson::serialize_to_document(&record) {
            Ok(doc) => {
                if let Err(e) = inner.changes.insert(doc) {
                    tracing::error!(error = %e, "failed to log local change");
                    return;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to encode local change");
                return;
            }
        }
        SyncManagerInner::schedule_push(inner, name);
    }

    /// If the change matches a logged remote application, consume the
    /// log entry and report the echo.
    fn consume_remote_change(&self, name: &str, kind: ChangeKind, payload: &Bson) -> bool {
        let target = payload_target_id(kind, payload);
        let kind_str = match kind {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Remove => "remove",
        };
        let candidates = match self
            .remote_changes
            .find(&doc! { "collection": name, "kind": kind_str }, FindOptions::default())
            .and_then(|cursor| cursor.fetch())
        {
            Ok(docs) => docs,
            Err(_) => return false,
        };
        for candidate in candidates {
            let Some(record) = decode::<ChangeRecord>(candidate) else {
                continue;
            };
            if record.target_id() == target {
                let _ = self.remote_changes.remove_one(&doc! { "id": record.id.as_str() });
                return true;
            }
        }
        false
    }

    /// First write starts the window; writes inside it coalesce into
    /// one `sync(…, onlyWithChanges)` when the timer fires.
    fn schedule_push(inner: &Arc<SyncManagerInner>, name: &str) {
        {
            let mut pending = inner
                .debounce_pending
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            if !pending.insert(name.to_string()) {
                return;
            }
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // no runtime to debounce on; the next explicit sync will
            // pick the change up
            inner
                .debounce_pending
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(name);
            return;
        };
        let weak: Weak<SyncManagerInner> = Arc::downgrade(inner);
        let name = name.to_string();
        let debounce = inner.debounce;
        runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner
                .debounce_pending
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&name);
            let manager = SyncManager { inner };
            let _ = manager
                .sync_with(
                    &name,
                    SyncOptions {
                        only_with_changes: true,
                        ..Default::default()
                    },
                )
                .await;
        });
    }
}

// ── Helpers ─────────────────────────────────────────────────────

fn materialize_snapshot(previous: &[Document], data: &LoadResponse) -> Vec<Document> {
    match data {
        LoadResponse::Items(items) => items.clone(),
        LoadResponse::Changes(changes) => {
            let mut items = previous.to_vec();
            let position = |items: &Vec<Document>, id: &Bson| {
                items
                    .iter()
                    .position(|d| d.get("id").is_some_and(|v| ripple_query::value_eq(v, id)))
            };
            for doc in changes.added.iter().chain(changes.modified.iter()) {
                let Some(id) = doc.get("id").cloned() else {
                    continue;
                };
                match position(&items, &id) {
                    Some(i) => items[i] = doc.clone(),
                    None => items.push(doc.clone()),
                }
            }
            for doc in &changes.removed {
                let Some(id) = doc.get("id").cloned() else {
                    continue;
                };
                if let Some(i) = position(&items, &id) {
                    items.remove(i);
                }
            }
            items
        }
    }
}

/// The full-document `$set` used to log replacements.
fn set_modifier(item: &Document) -> Document {
    let mut fields = Document::new();
    for (k, v) in item {
        if k != "id" {
            fields.insert(k.clone(), v.clone());
        }
    }
    doc! { "$set": fields }
}

fn payload_target_id(kind: ChangeKind, payload: &Bson) -> Option<Bson> {
    match kind {
        ChangeKind::Insert | ChangeKind::Update => match payload {
            Bson::Document(doc) => doc.get("id").cloned(),
            _ => None,
        },
        ChangeKind::Remove => Some(payload.clone()),
    }
}

fn encode<T: Serialize>(record: &T) -> Result<Document, SyncError> {
    bson::serialize_to_document(record)
        .map_err(|e| SyncError::Db(DbError::Persistence(e.to_string())))
}

fn decode<T: DeserializeOwned>(doc: Document) -> Option<T> {
    bson::deserialize_from_document(doc).ok()
}
