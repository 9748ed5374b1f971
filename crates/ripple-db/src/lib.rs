mod autofetch;
mod collection;
mod combined;
mod cursor;
mod error;
mod events;
mod index;
mod observer;
mod persistence;
mod planner;
mod protocol;
mod reactivity;
mod registry;
mod replication;
mod storage;

pub use autofetch::AutoFetchCollection;
pub use collection::{
    Collection, CollectionOptions, PrimaryKeyGenerator, Transform, TransformAll, UpdateOptions,
    ValidateHook,
};
pub use combined::CombinedAdapter;
pub use cursor::{Cursor, FindOptions, ObserverHandle};
pub use error::DbError;
pub use events::{Event, EventBus, Listener, ListenerId};
pub use index::{FieldIndex, IndexMatch, IndexRegistry, IoMode};
pub use observer::{Observer, ObserverCallbacks, documents_equal};
pub use persistence::{
    Changeset, LoadResponse, OnChange, PersistenceAdapter, PersistenceError, compute_changes,
};
pub use planner::{Candidates, Plan, plan};
pub use protocol::{
    QueryState, QueryUpdateHandler, WORKER_INIT_TIMEOUT, WorkerLink, WorkerMessage, WorkerRequest,
    WorkerTransport,
};
pub use reactivity::{Dependency, ReactivityAdapter};
pub use registry::CollectionRegistry;
pub use replication::{
    AdapterFuture, PullFn, PushFn, RegisterRemoteChangeFn, ReplicationAdapter,
};
pub use storage::StorageAdapter;
