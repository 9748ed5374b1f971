use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use bson::{Bson, Document};
use ripple_query::{Projection, Selector, SortSpec, canonical_string};

use crate::collection::{Collection, CollectionInner};
use crate::error::DbError;
use crate::observer::{Observer, ObserverCallbacks};
use crate::reactivity::Dependency;

/// Cursor options. `reactive` defaults to on; it only takes effect
/// when the collection carries a reactivity adapter reporting an
/// active scope.
#[derive(Clone)]
pub struct FindOptions {
    pub sort: Option<SortSpec>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    pub fields: Option<Projection>,
    pub reactive: bool,
    /// Subscribe per (document, field) instead of per cursor, so
    /// unrelated field changes don't invalidate the computation.
    pub field_tracking: bool,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            sort: None,
            skip: None,
            limit: None,
            fields: None,
            reactive: true,
            field_tracking: false,
        }
    }
}

type FieldDeps = Arc<Mutex<HashMap<(String, String), Arc<dyn Dependency>>>>;

struct ReactiveBinding {
    observer_id: u64,
    dependency: Arc<dyn Dependency>,
    field_deps: Option<FieldDeps>,
}

/// A lazy, restartable handle bound to (collection, selector,
/// options). Nothing evaluates until `fetch`/`count`; re-fetch always
/// reflects the current state.
pub struct Cursor {
    collection: Collection,
    selector: Selector,
    options: FindOptions,
    binding: Mutex<Option<ReactiveBinding>>,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor").finish_non_exhaustive()
    }
}

impl Cursor {
    pub(crate) fn new(collection: Collection, selector: Selector, options: FindOptions) -> Cursor {
        Cursor {
            collection,
            selector,
            options,
            binding: Mutex::new(None),
        }
    }

    /// Run the full pipeline: candidates → residual → transformAll →
    /// sort → skip → limit → project → transform. Establishes the
    /// reactive subscription when in scope.
    pub fn fetch(&self) -> Result<Vec<Document>, DbError> {
        let docs = materialize(&self.collection, &self.selector, &self.options)?;
        self.bind_reactive(&docs);
        Ok(docs)
    }

    /// Number of matching documents (after skip/limit).
    pub fn count(&self) -> Result<u64, DbError> {
        Ok(self.fetch()?.len() as u64)
    }

    /// Await persistence readiness, then fetch. Purely in-memory
    /// collections resolve immediately.
    pub async fn fetch_async(&self) -> Result<Vec<Document>, DbError> {
        self.collection.ready().await;
        self.fetch()
    }

    pub async fn count_async(&self) -> Result<u64, DbError> {
        self.collection.ready().await;
        self.count()
    }

    /// Register a diff observer over this cursor's results. The
    /// initial result set establishes the baseline (and fires `added`
    /// callbacks unless `skip_initial`).
    pub fn observe(
        &self,
        callbacks: ObserverCallbacks,
        skip_initial: bool,
    ) -> Result<ObserverHandle, DbError> {
        self.collection.ensure_active()?;
        let initial = materialize(&self.collection, &self.selector, &self.options)?;
        let observer = Observer::new(callbacks, skip_initial);
        let id = self
            .collection
            .register_observer(self.fetch_closure(), observer, None);
        self.collection.with_observer(id, |live| {
            if let Ok(mut observer) = live.observer.lock() {
                observer.check(&initial);
            }
        });
        Ok(ObserverHandle {
            collection: Arc::downgrade(&self.collection.inner),
            id,
        })
    }

    /// Tear down the reactive subscription. Fetching again
    /// re-establishes it.
    pub fn cleanup(&self) {
        let binding = match self.binding.lock() {
            Ok(mut binding) => binding.take(),
            Err(_) => None,
        };
        if let Some(binding) = binding {
            self.collection.unregister_observer(binding.observer_id);
        }
    }

    // ── Reactive binding ────────────────────────────────────────

    fn fetch_closure(
        &self,
    ) -> Box<dyn Fn(&Collection) -> Result<Vec<Document>, DbError> + Send + Sync> {
        let selector = self.selector.clone();
        let options = self.options.clone();
        Box::new(move |collection| materialize(collection, &selector, &options))
    }

    fn bind_reactive(&self, docs: &[Document]) {
        if !self.options.reactive {
            return;
        }
        let Some(adapter) = self.collection.inner.reactivity.clone() else {
            return;
        };
        if !adapter.is_in_scope() {
            return;
        }

        let Ok(mut binding) = self.binding.lock() else {
            return;
        };
        if binding.is_none() {
            let dependency = adapter.create_dependency();
            let field_deps: Option<FieldDeps> = self
                .options
                .field_tracking
                .then(|| Arc::new(Mutex::new(HashMap::new())));

            let observer_id = if let Some(deps) = &field_deps {
                // per-field invalidation: changed fields notify their
                // own dependency, membership changes the cursor's
                let deps = deps.clone();
                let cursor_dep = dependency.clone();
                let membership_dep = dependency.clone();
                let callbacks = ObserverCallbacks {
                    changed_field: Some(Box::new(move |doc, field, _, _| {
                        let key = (doc_key(doc), field.to_string());
                        if let Ok(deps) = deps.lock()
                            && let Some(dep) = deps.get(&key)
                        {
                            dep.notify();
                        }
                    })),
                    added: Some(Box::new(move |_| cursor_dep.notify())),
                    removed: Some(Box::new(move |_| membership_dep.notify())),
                    ..Default::default()
                };
                self.collection
                    .register_observer(self.fetch_closure(), Observer::new(callbacks, true), None)
            } else {
                self.collection.register_observer(
                    self.fetch_closure(),
                    Observer::new(ObserverCallbacks::default(), true),
                    Some(dependency.clone()),
                )
            };

            // seed the baseline so the next mutation diffs against
            // the result set we just handed out
            self.collection.with_observer(observer_id, |live| {
                if let Ok(mut observer) = live.observer.lock() {
                    observer.check(docs);
                }
            });

            // release the subscription with the reactive scope
            let weak = Arc::downgrade(&self.collection.inner);
            adapter.on_dispose(Box::new(move || {
                if let Some(collection) = Collection::upgrade(&weak) {
                    collection.unregister_observer(observer_id);
                }
            }));

            *binding = Some(ReactiveBinding {
                observer_id,
                dependency,
                field_deps,
            });
        }

        if let Some(binding) = binding.as_ref() {
            binding.dependency.depend();
            if let Some(deps) = &binding.field_deps
                && let Ok(mut deps) = deps.lock()
            {
                for doc in docs {
                    let key = doc_key(doc);
                    for (field, _) in doc {
                        let dep = deps
                            .entry((key.clone(), field.clone()))
                            .or_insert_with(|| adapter.create_dependency());
                        dep.depend();
                    }
                }
            }
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn doc_key(doc: &Document) -> String {
    canonical_string(doc.get("id").unwrap_or(&Bson::Null))
}

/// The cursor pipeline, shared with live observers so both sides see
/// identical results (transforms included).
pub(crate) fn materialize(
    collection: &Collection,
    selector: &Selector,
    options: &FindOptions,
) -> Result<Vec<Document>, DbError> {
    let mut docs = collection.query_raw(selector)?;

    if let Some(transform_all) = &collection.inner.transform_all {
        let requested = requested_fields(options);
        docs = transform_all(docs, &requested);
    }

    if let Some(sort) = &options.sort {
        docs.sort_by(|a, b| sort.compare(a, b));
    }

    let skip = options.skip.unwrap_or(0);
    if skip > 0 {
        docs.drain(..skip.min(docs.len()));
    }
    if let Some(limit) = options.limit {
        docs.truncate(limit);
    }

    if let Some(projection) = &options.fields {
        docs = docs.iter().map(|d| projection.apply(d)).collect();
    }

    if let Some(transform) = &collection.inner.transform {
        docs = docs.into_iter().map(|d| transform(d)).collect();
    }

    Ok(docs)
}

fn requested_fields(options: &FindOptions) -> Vec<String> {
    match &options.fields {
        Some(Projection::Include { fields, id }) => {
            let mut requested = fields.clone();
            if *id {
                requested.push("id".to_string());
            }
            requested
        }
        _ => Vec::new(),
    }
}

/// Owner handle for a registered observer; disposing (or dropping)
/// unregisters it from the collection.
pub struct ObserverHandle {
    collection: Weak<CollectionInner>,
    id: u64,
}

impl ObserverHandle {
    pub fn dispose(&self) {
        if let Some(collection) = Collection::upgrade(&self.collection) {
            collection.unregister_observer(self.id);
        }
    }

    /// Error state published by a failed requery, if any.
    pub fn query_error(&self) -> Option<DbError> {
        let collection = Collection::upgrade(&self.collection)?;
        collection
            .with_observer(self.id, |live| {
                live.observer
                    .lock()
                    .ok()
                    .and_then(|o| o.query_error().cloned())
            })
            .flatten()
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}
