use bson::{Bson, Document};
use ripple_query::{ModOp, Modifier, set_path, value_eq};

use crate::records::{ChangeKind, ChangeRecord};

/// Replay un-synced local changes on top of a pulled snapshot.
///
/// Tolerant by design: an insert whose id already exists merges its
/// fields, an update without a base document materializes `{id}` plus
/// the modifier's `$set` fields, a remove of an absent id is a no-op.
pub fn apply_changes(items: &[Document], changes: &[ChangeRecord]) -> Vec<Document> {
    let mut result: Vec<Document> = items.to_vec();

    for change in changes {
        match change.kind {
            ChangeKind::Insert => {
                let Bson::Document(payload) = &change.payload else {
                    continue;
                };
                match position_of(&result, payload.get("id")) {
                    Some(i) => {
                        for (k, v) in payload {
                            result[i].insert(k.clone(), v.clone());
                        }
                    }
                    None => result.push(payload.clone()),
                }
            }
            ChangeKind::Update => {
                let Bson::Document(payload) = &change.payload else {
                    continue;
                };
                let (Some(id), Some(Bson::Document(modifier))) =
                    (payload.get("id"), payload.get("modifier"))
                else {
                    continue;
                };
                let Ok(modifier) = Modifier::parse(modifier) else {
                    continue;
                };
                match position_of(&result, Some(id)) {
                    Some(i) => {
                        if let Ok(updated) = modifier.apply(&result[i], false) {
                            result[i] = updated;
                        }
                    }
                    None => {
                        // only the $set clause surfaces on a phantom
                        // insert; other operators have no base to act on
                        let mut base = Document::new();
                        base.insert("id".to_string(), id.clone());
                        for fm in &modifier.ops {
                            if let ModOp::Set(value) = &fm.op {
                                set_path(&mut base, &fm.field, value.clone());
                            }
                        }
                        result.push(base);
                    }
                }
            }
            ChangeKind::Remove => {
                if let Some(i) = position_of(&result, Some(&change.payload)) {
                    result.remove(i);
                }
            }
        }
    }

    result
}

fn position_of(items: &[Document], id: Option<&Bson>) -> Option<usize> {
    let id = id?;
    items
        .iter()
        .position(|d| d.get("id").is_some_and(|v| value_eq(v, id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn record(kind: ChangeKind, payload: Bson) -> ChangeRecord {
        ChangeRecord {
            id: "r".into(),
            collection: "c".into(),
            time: 0,
            seq: 0,
            kind,
            payload,
        }
    }

    #[test]
    fn update_applies_modifier_to_existing() {
        let snapshot = vec![doc! { "id": "1", "name": "John" }];
        let changes = vec![record(
            ChangeKind::Update,
            Bson::Document(doc! { "id": "1", "modifier": { "$set": { "name": "Local" } } }),
        )];
        let result = apply_changes(&snapshot, &changes);
        assert_eq!(result, vec![doc! { "id": "1", "name": "Local" }]);
    }

    #[test]
    fn update_without_base_materializes_document() {
        let changes = vec![record(
            ChangeKind::Update,
            Bson::Document(doc! { "id": "9", "modifier": { "$set": { "name": "ghost" } } }),
        )];
        let result = apply_changes(&[], &changes);
        assert_eq!(result, vec![doc! { "id": "9", "name": "ghost" }]);
    }

    #[test]
    fn phantom_update_materializes_only_set_fields() {
        let changes = vec![record(
            ChangeKind::Update,
            Bson::Document(doc! {
                "id": "9",
                "modifier": {
                    "$set": { "name": "x" },
                    "$inc": { "v": 1 },
                    "$push": { "tags": "t" }
                }
            }),
        )];
        let result = apply_changes(&[], &changes);
        assert_eq!(result, vec![doc! { "id": "9", "name": "x" }]);
    }

    #[test]
    fn phantom_update_without_set_yields_bare_id() {
        let changes = vec![record(
            ChangeKind::Update,
            Bson::Document(doc! { "id": "9", "modifier": { "$inc": { "v": 1 } } }),
        )];
        let result = apply_changes(&[], &changes);
        assert_eq!(result, vec![doc! { "id": "9" }]);
    }

    #[test]
    fn insert_merges_into_existing_id() {
        let snapshot = vec![doc! { "id": "1", "a": 1 }];
        let changes = vec![record(
            ChangeKind::Insert,
            Bson::Document(doc! { "id": "1", "b": 2 }),
        )];
        let result = apply_changes(&snapshot, &changes);
        assert_eq!(result, vec![doc! { "id": "1", "a": 1, "b": 2 }]);
    }

    #[test]
    fn insert_appends_fresh_id() {
        let result = apply_changes(
            &[doc! { "id": "1" }],
            &[record(ChangeKind::Insert, Bson::Document(doc! { "id": "2" }))],
        );
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn remove_tolerates_absence() {
        let snapshot = vec![doc! { "id": "1" }];
        let changes = vec![
            record(ChangeKind::Remove, Bson::String("1".into())),
            record(ChangeKind::Remove, Bson::String("missing".into())),
        ];
        assert!(apply_changes(&snapshot, &changes).is_empty());
    }

    #[test]
    fn changes_replay_in_order() {
        let changes = vec![
            record(ChangeKind::Insert, Bson::Document(doc! { "id": "1", "v": 1 })),
            record(
                ChangeKind::Update,
                Bson::Document(doc! { "id": "1", "modifier": { "$inc": { "v": 1 } } }),
            ),
            record(ChangeKind::Remove, Bson::String("1".into())),
            record(ChangeKind::Insert, Bson::Document(doc! { "id": "1", "v": 5 })),
        ];
        let result = apply_changes(&[], &changes);
        assert_eq!(result, vec![doc! { "id": "1", "v": 5 }]);
    }
}
