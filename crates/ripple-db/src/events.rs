use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bson::Document;

/// Everything a collection announces to the outside world, as one
/// tagged channel: item-level mutations, operation-level summaries,
/// observer lifecycle, persistence lifecycle, and debug traces.
#[derive(Debug, Clone)]
pub enum Event {
    // item-level
    Added(Document),
    Changed {
        item: Document,
        modifier: Option<Document>,
    },
    Removed(Document),
    // op-level
    Insert(Document),
    UpdateOne {
        selector: Document,
        modifier: Document,
    },
    UpdateMany {
        selector: Document,
        modifier: Document,
    },
    ReplaceOne {
        selector: Document,
        replacement: Document,
    },
    RemoveOne {
        selector: Document,
    },
    RemoveMany {
        selector: Document,
    },
    // observer lifecycle
    ObserverCreated,
    ObserverDisposed,
    // persistence lifecycle
    PersistenceInit,
    PersistenceReceived,
    PersistenceTransmitted,
    PersistencePullStarted,
    PersistencePullCompleted,
    PersistencePushStarted,
    PersistencePushCompleted,
    PersistenceError(String),
    // debug traces, emitted only in debug mode
    Debug {
        op: &'static str,
        call_site: String,
    },
}

pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Listener registry. Emission never holds the registry lock, and a
/// panicking listener is logged and skipped rather than aborting the
/// emit loop.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, listener: Listener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, listener));
        }
        ListenerId(id)
    }

    pub fn off(&self, id: ListenerId) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|(lid, _)| *lid != id.0);
        }
    }

    pub fn emit(&self, event: &Event) {
        let snapshot: Vec<Listener> = match self.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
            Err(_) => return,
        };
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::error!(event = ?event_name(event), "event listener panicked");
            }
        }
    }

    pub fn clear(&self) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.clear();
        }
    }
}

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::Added(_) => "added",
        Event::Changed { .. } => "changed",
        Event::Removed(_) => "removed",
        Event::Insert(_) => "insert",
        Event::UpdateOne { .. } => "updateOne",
        Event::UpdateMany { .. } => "updateMany",
        Event::ReplaceOne { .. } => "replaceOne",
        Event::RemoveOne { .. } => "removeOne",
        Event::RemoveMany { .. } => "removeMany",
        Event::ObserverCreated => "observer.created",
        Event::ObserverDisposed => "observer.disposed",
        Event::PersistenceInit => "persistence.init",
        Event::PersistenceReceived => "persistence.received",
        Event::PersistenceTransmitted => "persistence.transmitted",
        Event::PersistencePullStarted => "persistence.pullStarted",
        Event::PersistencePullCompleted => "persistence.pullCompleted",
        Event::PersistencePushStarted => "persistence.pushStarted",
        Event::PersistencePushCompleted => "persistence.pushCompleted",
        Event::PersistenceError(_) => "persistence.error",
        Event::Debug { .. } => "_debug",
    }
}
