use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};

use crate::error::DbError;
use crate::persistence::PersistenceError;

/// How long a worker gets to report ready before init fails.
pub const WORKER_INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A method call sent to a worker host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    pub id: u64,
    pub worker_id: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Bson>,
}

/// Result state carried by a `queryUpdate` push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryState {
    Loading,
    Ready,
    Error,
}

/// Messages a worker host sends back: call responses plus the two
/// push notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    #[serde(rename_all = "camelCase")]
    Response {
        id: u64,
        worker_id: String,
        #[serde(default)]
        data: Option<Bson>,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Ready { worker_id: String },
    #[serde(rename_all = "camelCase")]
    QueryUpdate {
        worker_id: String,
        collection_name: String,
        selector: Document,
        options: Document,
        state: QueryState,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        items: Option<Vec<Document>>,
    },
}

/// Outbound side of the worker wire; implementations serialize the
/// request onto whatever channel reaches the worker.
pub trait WorkerTransport: Send + Sync {
    fn post(&self, request: &WorkerRequest) -> Result<(), PersistenceError>;
}

pub type QueryUpdateHandler = Arc<dyn Fn(&WorkerMessage) + Send + Sync>;

/// Client side of the worker transport: correlates responses to
/// pending calls by (workerId, messageId) and rejects everything
/// in flight with `WorkerDisposed` on teardown.
pub struct WorkerLink {
    worker_id: String,
    transport: Arc<dyn WorkerTransport>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Option<Bson>, DbError>>>>,
    ready_tx: watch::Sender<bool>,
    query_update: Mutex<Option<QueryUpdateHandler>>,
    disposed: AtomicBool,
}

impl WorkerLink {
    pub fn new(worker_id: impl Into<String>, transport: Arc<dyn WorkerTransport>) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            worker_id: worker_id.into(),
            transport,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            ready_tx,
            query_update: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn on_query_update(&self, handler: QueryUpdateHandler) {
        if let Ok(mut slot) = self.query_update.lock() {
            *slot = Some(handler);
        }
    }

    /// Feed an inbound message. Messages for another worker, or with
    /// an id no pending call owns, are ignored.
    pub fn handle_message(&self, message: &WorkerMessage) {
        match message {
            WorkerMessage::Response {
                id,
                worker_id,
                data,
                error,
            } => {
                if worker_id != &self.worker_id {
                    return;
                }
                let sender = self
                    .pending
                    .lock()
                    .ok()
                    .and_then(|mut pending| pending.remove(id));
                if let Some(sender) = sender {
                    let result = match error {
                        Some(message) => Err(DbError::Persistence(message.clone())),
                        None => Ok(data.clone()),
                    };
                    let _ = sender.send(result);
                }
            }
            WorkerMessage::Ready { worker_id } => {
                if worker_id == &self.worker_id {
                    self.ready_tx.send_replace(true);
                }
            }
            WorkerMessage::QueryUpdate { worker_id, .. } => {
                if worker_id != &self.worker_id {
                    return;
                }
                let handler = self.query_update.lock().ok().and_then(|slot| slot.clone());
                if let Some(handler) = handler {
                    handler(message);
                }
            }
        }
    }

    /// Await the worker's ready push, bounded by
    /// [`WORKER_INIT_TIMEOUT`].
    pub async fn wait_ready(&self) -> Result<(), DbError> {
        let mut rx = self.ready_tx.subscribe();
        let wait = async {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(WORKER_INIT_TIMEOUT, wait)
            .await
            .map_err(|_| DbError::Persistence("worker init timed out".into()))
    }

    /// Invoke a method on the worker and await its response.
    pub async fn call(&self, method: &str, args: Vec<Bson>) -> Result<Option<Bson>, DbError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(DbError::WorkerDisposed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }
        let request = WorkerRequest {
            id,
            worker_id: self.worker_id.clone(),
            method: method.to_string(),
            args,
        };
        if let Err(e) = self.transport.post(&request) {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&id);
            }
            return Err(DbError::Persistence(e.0));
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(DbError::WorkerDisposed),
        }
    }

    /// Announce collection teardown and reject all in-flight calls.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let request = WorkerRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            worker_id: self.worker_id.clone(),
            method: "unregisterCollection".to_string(),
            args: Vec::new(),
        };
        let _ = self.transport.post(&request);
        if let Ok(mut pending) = self.pending.lock() {
            for (_, sender) in pending.drain() {
                let _ = sender.send(Err(DbError::WorkerDisposed));
            }
        }
    }
}
