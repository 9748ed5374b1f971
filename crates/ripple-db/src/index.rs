use std::collections::{BTreeSet, HashMap};

use bson::{Bson, Document};
use imbl::Vector;
use ripple_query::{FieldOp, FieldPredicate, canonical_string, lookup};

/// Whether an index provider answers from memory or from asynchronous
/// storage. Providers of both kinds must not serve one selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Sync,
    Async,
}

/// Candidate positions contributed by one field index.
#[derive(Debug, Clone)]
pub struct IndexMatch {
    pub positions: BTreeSet<usize>,
    /// Whether the whole field predicate was consumed. When `false`
    /// the planner keeps the field in the residual selector.
    pub consumed: bool,
}

/// Inverted map from canonicalized field value to document positions.
///
/// Array values are multikey: the array itself and each element get a
/// bucket entry. Documents without the field land in the `missing`
/// bucket (the absent sentinel).
pub struct FieldIndex {
    field: String,
    mode: IoMode,
    buckets: HashMap<String, BTreeSet<usize>>,
    missing: BTreeSet<usize>,
}

impl FieldIndex {
    pub fn new(field: impl Into<String>) -> Self {
        Self::with_mode(field, IoMode::Sync)
    }

    pub fn with_mode(field: impl Into<String>, mode: IoMode) -> Self {
        Self {
            field: field.into(),
            mode,
            buckets: HashMap::new(),
            missing: BTreeSet::new(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn mode(&self) -> IoMode {
        self.mode
    }

    fn clear(&mut self) {
        self.buckets.clear();
        self.missing.clear();
    }

    fn add(&mut self, doc: &Document, position: usize) {
        let lk = lookup(doc, &self.field);
        if !lk.exists {
            self.missing.insert(position);
            return;
        }
        for value in lk.values {
            self.buckets
                .entry(canonical_string(value))
                .or_default()
                .insert(position);
            if let Bson::Array(items) = value {
                for item in items {
                    self.buckets
                        .entry(canonical_string(item))
                        .or_default()
                        .insert(position);
                }
            }
        }
    }

    /// Union of all bucketed positions, `missing` included.
    pub fn all_positions(&self) -> BTreeSet<usize> {
        let mut all = self.missing.clone();
        for positions in self.buckets.values() {
            all.extend(positions.iter().copied());
        }
        all
    }

    fn eq_positions(&self, value: &Bson) -> BTreeSet<usize> {
        match value {
            Bson::Undefined => self.missing.clone(),
            Bson::Null => {
                let mut set = self.missing.clone();
                if let Some(bucket) = self.buckets.get(&canonical_string(&Bson::Null)) {
                    set.extend(bucket.iter().copied());
                }
                set
            }
            other => self
                .buckets
                .get(&canonical_string(other))
                .cloned()
                .unwrap_or_default(),
        }
    }

    /// Answer a field predicate with candidate positions, or `None`
    /// when no operator in the predicate is index-servable (`$regex`,
    /// ranges and the like fall back to residual evaluation).
    pub fn query(&self, pred: &FieldPredicate, universe: usize) -> Option<IndexMatch> {
        let mut positions: Option<BTreeSet<usize>> = None;
        let mut consumed = true;

        for op in &pred.ops {
            let contributed = match op {
                FieldOp::Eq(v) => Some(self.eq_positions(v)),
                FieldOp::In(values) => {
                    let mut set = BTreeSet::new();
                    for v in values {
                        set.extend(self.eq_positions(v));
                    }
                    Some(set)
                }
                FieldOp::Ne(v) => Some(complement(&self.eq_positions(v), universe)),
                FieldOp::Nin(values) => {
                    let mut matched = BTreeSet::new();
                    for v in values {
                        matched.extend(self.eq_positions(v));
                    }
                    Some(complement(&matched, universe))
                }
                FieldOp::Exists(true) => Some(complement(&self.missing, universe)),
                FieldOp::Exists(false) => Some(self.missing.clone()),
                _ => {
                    consumed = false;
                    None
                }
            };
            if let Some(set) = contributed {
                positions = Some(match positions {
                    None => set,
                    Some(prev) => prev.intersection(&set).copied().collect(),
                });
            }
        }

        positions.map(|positions| IndexMatch { positions, consumed })
    }
}

fn complement(set: &BTreeSet<usize>, universe: usize) -> BTreeSet<usize> {
    (0..universe).filter(|p| !set.contains(p)).collect()
}

// ── Registry ────────────────────────────────────────────────────

/// All indices of a collection: the mandatory id index plus any
/// user-declared field indices.
///
/// The id index is maintained incrementally on every mutation path,
/// batches included. Field indices are rebuilt wholesale on each
/// mutation; inside a batch they go stale and the planner bypasses
/// them until the rebuild at batch close.
pub struct IndexRegistry {
    len: usize,
    id_index: HashMap<String, usize>,
    fields: Vec<FieldIndex>,
    outdated: bool,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self {
            len: 0,
            id_index: HashMap::new(),
            fields: Vec::new(),
            outdated: false,
        }
    }

    pub fn create_index(&mut self, field: impl Into<String>) {
        self.fields.push(FieldIndex::new(field));
    }

    pub fn add_provider(&mut self, index: FieldIndex) {
        self.fields.push(index);
    }

    pub fn field(&self, name: &str) -> Option<&FieldIndex> {
        self.fields.iter().find(|idx| idx.field() == name)
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|i| i.field().to_string()).collect()
    }

    pub fn has_mixed_modes(&self) -> bool {
        self.fields.iter().any(|i| i.mode() == IoMode::Sync)
            && self.fields.iter().any(|i| i.mode() == IoMode::Async)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Full rebuild from the current item sequence. Clears the
    /// outdated flag set by batched mutations.
    pub fn rebuild(&mut self, items: &Vector<Document>) {
        self.len = items.len();
        self.id_index.clear();
        for index in &mut self.fields {
            index.clear();
        }
        for (position, doc) in items.iter().enumerate() {
            if let Some(id) = doc.get("id") {
                self.id_index.insert(canonical_string(id), position);
            }
            for index in &mut self.fields {
                index.add(doc, position);
            }
        }
        self.outdated = false;
    }

    pub fn mark_outdated(&mut self) {
        self.outdated = true;
    }

    pub fn is_outdated(&self) -> bool {
        self.outdated
    }

    // ── id index, maintained on every path ──────────────────────

    pub fn id_position(&self, id: &Bson) -> Option<usize> {
        self.id_index.get(&canonical_string(id)).copied()
    }

    pub fn contains_id(&self, id: &Bson) -> bool {
        self.id_index.contains_key(&canonical_string(id))
    }

    pub fn insert_id(&mut self, id: &Bson, position: usize) {
        self.id_index.insert(canonical_string(id), position);
        self.len = self.len.max(position + 1);
    }

    pub fn replace_id(&mut self, old: &Bson, new: &Bson, position: usize) {
        self.id_index.remove(&canonical_string(old));
        self.id_index.insert(canonical_string(new), position);
    }

    /// Splice-style removal: drop the id at `position` and shift every
    /// later position down by one.
    pub fn remove_position(&mut self, position: usize) {
        self.id_index.retain(|_, p| *p != position);
        for p in self.id_index.values_mut() {
            if *p > position {
                *p -= 1;
            }
        }
        self.len = self.len.saturating_sub(1);
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.id_index.clear();
        self.fields.clear();
        self.outdated = false;
    }
}

impl Default for IndexRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use ripple_query::Selector;

    fn items(docs: Vec<Document>) -> Vector<Document> {
        docs.into_iter().collect()
    }

    fn pred_for(selector: Document) -> FieldPredicate {
        match Selector::parse(&selector).unwrap() {
            Selector::Field(_, pred) => pred,
            other => panic!("expected field selector, got {other:?}"),
        }
    }

    fn seeded() -> (IndexRegistry, Vector<Document>) {
        let docs = items(vec![
            doc! { "id": "k1", "type": "kitten" },
            doc! { "id": "k2", "type": "kitten" },
            doc! { "id": "c1", "type": "crypto" },
            doc! { "id": "n1" },
        ]);
        let mut registry = IndexRegistry::new();
        registry.create_index("type");
        registry.rebuild(&docs);
        (registry, docs)
    }

    #[test]
    fn equality_hits_bucket() {
        let (registry, _) = seeded();
        let index = registry.field("type").unwrap();
        let m = index.query(&pred_for(doc! { "type": "kitten" }), 4).unwrap();
        assert_eq!(m.positions, BTreeSet::from([0, 1]));
        assert!(m.consumed);
    }

    #[test]
    fn in_unions_buckets() {
        let (registry, _) = seeded();
        let index = registry.field("type").unwrap();
        let m = index
            .query(&pred_for(doc! { "type": { "$in": ["kitten", "crypto"] } }), 4)
            .unwrap();
        assert_eq!(m.positions, BTreeSet::from([0, 1, 2]));
    }

    #[test]
    fn nin_subtracts_from_universe() {
        let (registry, _) = seeded();
        let index = registry.field("type").unwrap();
        let m = index
            .query(&pred_for(doc! { "type": { "$nin": ["kitten"] } }), 4)
            .unwrap();
        assert_eq!(m.positions, BTreeSet::from([2, 3]));
    }

    #[test]
    fn exists_false_reads_missing_bucket() {
        let (registry, _) = seeded();
        let index = registry.field("type").unwrap();
        let m = index
            .query(&pred_for(doc! { "type": { "$exists": false } }), 4)
            .unwrap();
        assert_eq!(m.positions, BTreeSet::from([3]));
    }

    #[test]
    fn null_equality_covers_missing() {
        let docs = items(vec![
            doc! { "id": "1", "v": Bson::Null },
            doc! { "id": "2", "v": 1 },
            doc! { "id": "3" },
        ]);
        let mut registry = IndexRegistry::new();
        registry.create_index("v");
        registry.rebuild(&docs);
        let m = registry
            .field("v")
            .unwrap()
            .query(&pred_for(doc! { "v": Bson::Null }), 3)
            .unwrap();
        assert_eq!(m.positions, BTreeSet::from([0, 2]));
    }

    #[test]
    fn regex_is_not_optimizable() {
        let (registry, _) = seeded();
        let index = registry.field("type").unwrap();
        assert!(index
            .query(&pred_for(doc! { "type": { "$regex": "kit" } }), 4)
            .is_none());
    }

    #[test]
    fn partially_consumed_predicate() {
        let (registry, _) = seeded();
        let index = registry.field("type").unwrap();
        let m = index
            .query(
                &pred_for(doc! { "type": { "$in": ["kitten"], "$regex": "k" } }),
                4,
            )
            .unwrap();
        assert_eq!(m.positions, BTreeSet::from([0, 1]));
        assert!(!m.consumed);
    }

    #[test]
    fn multikey_arrays_index_elements() {
        let docs = items(vec![
            doc! { "id": "1", "tags": ["a", "b"] },
            doc! { "id": "2", "tags": ["b"] },
        ]);
        let mut registry = IndexRegistry::new();
        registry.create_index("tags");
        registry.rebuild(&docs);
        let m = registry
            .field("tags")
            .unwrap()
            .query(&pred_for(doc! { "tags": "b" }), 2)
            .unwrap();
        assert_eq!(m.positions, BTreeSet::from([0, 1]));
    }

    #[test]
    fn id_index_tracks_splices() {
        let (mut registry, _) = seeded();
        assert_eq!(registry.id_position(&Bson::String("c1".into())), Some(2));
        registry.remove_position(0);
        assert_eq!(registry.id_position(&Bson::String("k1".into())), None);
        assert_eq!(registry.id_position(&Bson::String("c1".into())), Some(1));
        assert_eq!(registry.id_position(&Bson::String("n1".into())), Some(2));
    }

    #[test]
    fn bucket_union_covers_all_ids() {
        let (registry, docs) = seeded();
        let index = registry.field("type").unwrap();
        assert_eq!(index.all_positions().len(), docs.len());
    }

    #[test]
    fn mixed_modes_detected() {
        let mut registry = IndexRegistry::new();
        registry.create_index("a");
        assert!(!registry.has_mixed_modes());
        registry.add_provider(FieldIndex::with_mode("b", IoMode::Async));
        assert!(registry.has_mixed_modes());
    }
}
