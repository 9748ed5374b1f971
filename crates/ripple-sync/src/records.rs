use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

/// One entry in the per-collection change log.
///
/// Payload shapes: `insert` carries the full document, `update`
/// carries `{ id, modifier }`, `remove` carries the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: String,
    pub collection: String,
    pub time: i64,
    /// Monotonic tiebreaker for entries sharing a millisecond.
    pub seq: i64,
    pub kind: ChangeKind,
    pub payload: Bson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Remove,
}

impl ChangeRecord {
    /// The id of the document this change touches.
    pub fn target_id(&self) -> Option<Bson> {
        match self.kind {
            ChangeKind::Insert => match &self.payload {
                Bson::Document(doc) => doc.get("id").cloned(),
                _ => None,
            },
            ChangeKind::Update => match &self.payload {
                Bson::Document(doc) => doc.get("id").cloned(),
                _ => None,
            },
            ChangeKind::Remove => Some(self.payload.clone()),
        }
    }
}

/// The accepted document set at a sync boundary. Only the most recent
/// snapshot per collection survives a successful sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub collection: String,
    pub time: i64,
    pub items: Vec<Document>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Active,
    Done,
    Error,
}

/// Start/end bookkeeping of one sync run. The most recent `done`
/// operation per collection is the high-water mark handed to `pull`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperationRecord {
    pub id: String,
    pub collection: String,
    pub instance_id: String,
    pub start: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn change_record_round_trips_through_bson() {
        let record = ChangeRecord {
            id: "c1".into(),
            collection: "todos".into(),
            time: 123,
            seq: 1,
            kind: ChangeKind::Update,
            payload: Bson::Document(doc! { "id": "1", "modifier": { "$set": { "done": true } } }),
        };
        let encoded = bson::serialize_to_document(&record).unwrap();
        assert_eq!(encoded.get_str("kind").unwrap(), "update");
        let decoded: ChangeRecord = bson::deserialize_from_document(encoded).unwrap();
        assert_eq!(decoded.kind, ChangeKind::Update);
        assert_eq!(decoded.target_id(), Some(Bson::String("1".into())));
    }

    #[test]
    fn target_id_per_kind() {
        let insert = ChangeRecord {
            id: "a".into(),
            collection: "c".into(),
            time: 0,
            seq: 0,
            kind: ChangeKind::Insert,
            payload: Bson::Document(doc! { "id": "x", "v": 1 }),
        };
        assert_eq!(insert.target_id(), Some(Bson::String("x".into())));

        let remove = ChangeRecord {
            kind: ChangeKind::Remove,
            payload: Bson::String("y".into()),
            ..insert.clone()
        };
        assert_eq!(remove.target_id(), Some(Bson::String("y".into())));
    }
}
