use std::cmp::Ordering;

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::path::get_first;
use crate::value::value_cmp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// An ordered list of (field, direction) pairs parsed from a sort
/// document such as `{ "age": -1, "name": 1 }`.
#[derive(Debug, Clone, Default)]
pub struct SortSpec {
    pub fields: Vec<(String, SortDirection)>,
}

impl SortSpec {
    pub fn parse(doc: &Document) -> Result<SortSpec, QueryError> {
        let mut fields = Vec::with_capacity(doc.len());
        for (key, value) in doc {
            let direction = match value {
                Bson::Int32(1) | Bson::Int64(1) => SortDirection::Asc,
                Bson::Int32(-1) | Bson::Int64(-1) => SortDirection::Desc,
                Bson::Double(d) if *d == 1.0 => SortDirection::Asc,
                Bson::Double(d) if *d == -1.0 => SortDirection::Desc,
                _ => {
                    return Err(QueryError::InvalidSelector(format!(
                        "sort direction for '{key}' must be 1 or -1"
                    )));
                }
            };
            fields.push((key.clone(), direction));
        }
        Ok(SortSpec { fields })
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field-by-field comparison. Missing values sort before present
    /// ones; values of incomparable types are treated as equal so a
    /// stable sort preserves their original order.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for (field, direction) in &self.fields {
            let ord = compare_documents(a, b, field);
            let ord = match direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Compare two documents on a single field, missing-first.
pub fn compare_documents(a: &Document, b: &Document, field: &str) -> Ordering {
    match (get_first(a, field), get_first(b, field)) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => value_cmp(x, y).unwrap_or(Ordering::Equal),
    }
}
