use bson::{Bson, Document};

use crate::error::QueryError;
use crate::path::{get_first, set_path, unset_path};

/// A field projection: either an inclusion list or an exclusion list,
/// never both. `id` is included by default in inclusion projections and
/// may be excluded explicitly with `"id": 0`.
#[derive(Debug, Clone)]
pub enum Projection {
    Include { fields: Vec<String>, id: bool },
    Exclude { fields: Vec<String> },
}

impl Projection {
    /// Parse a projection document. Mixing inclusions and exclusions
    /// (beyond the `id: 0` exception) fails with `InvalidProjection`.
    pub fn parse(doc: &Document) -> Result<Projection, QueryError> {
        let mut included: Vec<String> = Vec::new();
        let mut excluded: Vec<String> = Vec::new();
        let mut id_excluded = false;

        for (key, value) in doc {
            let include = match value {
                Bson::Int32(0) | Bson::Int64(0) | Bson::Boolean(false) => false,
                Bson::Double(d) if *d == 0.0 => false,
                _ => true,
            };
            if key == "id" && !include {
                id_excluded = true;
            } else if include {
                included.push(key.clone());
            } else {
                excluded.push(key.clone());
            }
        }

        if !included.is_empty() && !excluded.is_empty() {
            return Err(QueryError::InvalidProjection(
                "cannot mix inclusion and exclusion in one projection".into(),
            ));
        }

        if !included.is_empty() {
            return Ok(Projection::Include {
                fields: included,
                id: !id_excluded,
            });
        }

        if id_excluded {
            excluded.push("id".to_string());
        }
        Ok(Projection::Exclude { fields: excluded })
    }

    /// Apply the projection to a document, producing a new one.
    pub fn apply(&self, doc: &Document) -> Document {
        match self {
            Projection::Include { fields, id } => {
                let mut out = Document::new();
                if *id && let Some(v) = doc.get("id") {
                    out.insert("id".to_string(), v.clone());
                }
                for field in fields {
                    if let Some(v) = get_first(doc, field) {
                        set_path(&mut out, field, v.clone());
                    }
                }
                out
            }
            Projection::Exclude { fields } => {
                let mut out = doc.clone();
                for field in fields {
                    unset_path(&mut out, field);
                }
                out
            }
        }
    }

}
