use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use bson::Document;

use crate::persistence::{Changeset, LoadResponse, OnChange, PersistenceAdapter, PersistenceError};

pub type AdapterFuture<T> = Pin<Box<dyn Future<Output = Result<T, PersistenceError>> + Send>>;

pub type PullFn = Box<dyn Fn() -> AdapterFuture<LoadResponse> + Send + Sync>;
pub type PushFn = Box<dyn Fn(Changeset, Vec<Document>) -> AdapterFuture<()> + Send + Sync>;
pub type RegisterRemoteChangeFn = Box<dyn Fn(OnChange) -> AdapterFuture<()> + Send + Sync>;

/// Wraps a `{pull, push?, registerRemoteChange?}` triple into a
/// persistence adapter, so a remote source plugs into the same
/// pipeline as any storage back-end.
pub struct ReplicationAdapter {
    pull: PullFn,
    push: Option<PushFn>,
    register_remote_change: Option<RegisterRemoteChangeFn>,
}

impl ReplicationAdapter {
    pub fn new(pull: PullFn) -> Self {
        Self {
            pull,
            push: None,
            register_remote_change: None,
        }
    }

    pub fn with_push(mut self, push: PushFn) -> Self {
        self.push = Some(push);
        self
    }

    pub fn with_register_remote_change(mut self, register: RegisterRemoteChangeFn) -> Self {
        self.register_remote_change = Some(register);
        self
    }
}

#[async_trait]
impl PersistenceAdapter for ReplicationAdapter {
    async fn register(&self, on_change: OnChange) -> Result<(), PersistenceError> {
        match &self.register_remote_change {
            Some(register) => register(on_change).await,
            None => Ok(()),
        }
    }

    async fn load(&self) -> Result<LoadResponse, PersistenceError> {
        (self.pull)().await
    }

    async fn save(
        &self,
        items: Vec<Document>,
        changes: Changeset,
    ) -> Result<(), PersistenceError> {
        match &self.push {
            Some(push) => push(changes, items).await,
            None => Err(PersistenceError::new("push not configured")),
        }
    }
}
