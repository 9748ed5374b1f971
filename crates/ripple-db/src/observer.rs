use std::collections::{HashMap, HashSet};

use bson::{Bson, Document};
use ripple_query::{canonical_string, value_eq};

use crate::error::DbError;

type ItemFn = Box<dyn Fn(&Document) + Send + Sync>;
type PositionFn = Box<dyn Fn(&Document, Option<&Document>) + Send + Sync>;
type FieldFn = Box<dyn Fn(&Document, &str, Option<&Bson>, Option<&Bson>) + Send + Sync>;

/// Callbacks fired by [`Observer::check`]. All optional; `changed_field`
/// additionally receives before/after values per differing field.
#[derive(Default)]
pub struct ObserverCallbacks {
    pub added: Option<ItemFn>,
    pub added_before: Option<PositionFn>,
    pub changed: Option<ItemFn>,
    pub changed_field: Option<FieldFn>,
    pub moved_before: Option<PositionFn>,
    pub removed: Option<ItemFn>,
}

/// Diff engine between successive ordered result sets.
///
/// Stores the last observed list; each `check` call diffs the new list
/// against it and fires callbacks in the order removed → added →
/// changed → movedBefore. With `skip_initial`, the first call only
/// establishes the baseline.
pub struct Observer {
    last: Option<Vec<Document>>,
    callbacks: ObserverCallbacks,
    skip_initial: bool,
    error: Option<DbError>,
}

impl Observer {
    pub fn new(callbacks: ObserverCallbacks, skip_initial: bool) -> Self {
        Self {
            last: None,
            callbacks,
            skip_initial,
            error: None,
        }
    }

    /// A failed async requery parks the error here instead of
    /// panicking; consumers read it back via this accessor.
    pub fn query_error(&self) -> Option<&DbError> {
        self.error.as_ref()
    }

    pub fn set_query_error(&mut self, error: DbError) {
        self.error = Some(error);
    }

    /// Diff `new_items` against the last observed list and fire
    /// callbacks for the delta. Returns `true` when the lists differ
    /// (or on the initial non-skipped observation).
    pub fn check(&mut self, new_items: &[Document]) -> bool {
        self.error = None;
        let old_items = match self.last.take() {
            Some(items) => items,
            None => {
                if !self.skip_initial {
                    // first observation: everything is an add
                    for (i, doc) in new_items.iter().enumerate() {
                        if let Some(cb) = &self.callbacks.added {
                            cb(doc);
                        }
                        if let Some(cb) = &self.callbacks.added_before {
                            cb(doc, new_items.get(i + 1));
                        }
                    }
                }
                let changed = !self.skip_initial && !new_items.is_empty();
                self.last = Some(new_items.to_vec());
                return changed;
            }
        };

        let changed = self.diff(&old_items, new_items);
        self.last = Some(new_items.to_vec());
        changed
    }

    fn diff(&self, old_items: &[Document], new_items: &[Document]) -> bool {
        let mut any_change = false;
        let old_by_id: HashMap<String, &Document> =
            old_items.iter().map(|d| (doc_key(d), d)).collect();
        let new_ids: HashSet<String> = new_items.iter().map(doc_key).collect();

        // 1. removed
        for doc in old_items {
            if !new_ids.contains(&doc_key(doc)) {
                any_change = true;
                if let Some(cb) = &self.callbacks.removed {
                    cb(doc);
                }
            }
        }

        // 2. added / addedBefore
        for (i, doc) in new_items.iter().enumerate() {
            if old_by_id.contains_key(&doc_key(doc)) {
                continue;
            }
            any_change = true;
            if let Some(cb) = &self.callbacks.added {
                cb(doc);
            }
            if let Some(cb) = &self.callbacks.added_before {
                // next = first subsequent id in N that survived from O
                let next = new_items[i + 1..]
                    .iter()
                    .find(|d| old_by_id.contains_key(&doc_key(d)));
                cb(doc, next);
            }
        }

        // 3. changed / changedField
        for doc in new_items {
            let key = doc_key(doc);
            let Some(old) = old_by_id.get(&key) else {
                continue;
            };
            if !documents_equal(old, doc) {
                any_change = true;
                if let Some(cb) = &self.callbacks.changed {
                    cb(doc);
                }
                if let Some(cb) = &self.callbacks.changed_field {
                    for field in differing_fields(old, doc) {
                        cb(doc, &field, old.get(&field), doc.get(&field));
                    }
                }
            }
        }

        // 4. movedBefore: common ids whose successor (within the
        // common subsequence) changed
        {
            let old_common: Vec<String> = old_items
                .iter()
                .map(doc_key)
                .filter(|k| new_ids.contains(k))
                .collect();
            let new_common: Vec<&Document> = new_items
                .iter()
                .filter(|d| old_by_id.contains_key(&doc_key(d)))
                .collect();

            let old_successor: HashMap<&str, Option<&str>> = old_common
                .iter()
                .enumerate()
                .map(|(i, k)| (k.as_str(), old_common.get(i + 1).map(|s| s.as_str())))
                .collect();

            let new_keys: Vec<String> = new_common.iter().map(|d| doc_key(d)).collect();
            for (i, doc) in new_common.iter().enumerate() {
                let successor = new_keys.get(i + 1).map(|s| s.as_str());
                if old_successor.get(new_keys[i].as_str()) != Some(&successor) {
                    any_change = true;
                    if let Some(cb) = &self.callbacks.moved_before {
                        cb(doc, new_common.get(i + 1).copied());
                    }
                }
            }
        }

        any_change
    }
}

fn doc_key(doc: &Document) -> String {
    canonical_string(doc.get("id").unwrap_or(&Bson::Null))
}

/// Structural equality over all fields, key order irrelevant.
pub fn documents_equal(a: &Document, b: &Document) -> bool {
    a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| value_eq(v, w)))
}

fn differing_fields(old: &Document, new: &Document) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    for (k, v) in new {
        if !old.get(k).is_some_and(|w| value_eq(v, w)) {
            fields.push(k.clone());
        }
    }
    for (k, _) in old {
        if new.get(k).is_none() && !fields.contains(k) {
            fields.push(k.clone());
        }
    }
    fields
}
