use std::cmp::Ordering;
use std::fmt::Write as _;

use bson::Bson;

/// Structural equality between two BSON values.
///
/// Numbers compare across Int32/Int64/Double; `NaN` is unequal to
/// everything including itself. Dates compare by instant. Arrays are
/// ordered; document key order is irrelevant.
pub fn value_eq(a: &Bson, b: &Bson) -> bool {
    match (a, b) {
        (Bson::Null, Bson::Null) => true,
        (Bson::Boolean(x), Bson::Boolean(y)) => x == y,
        (Bson::String(x), Bson::String(y)) => x == y,
        (Bson::DateTime(x), Bson::DateTime(y)) => x.timestamp_millis() == y.timestamp_millis(),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x == y,
        (Bson::Array(x), Bson::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(l, r)| value_eq(l, r))
        }
        (Bson::Document(x), Bson::Document(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| value_eq(v, w)))
        }
        (Bson::RegularExpression(x), Bson::RegularExpression(y)) => {
            x.pattern == y.pattern && x.options == y.options
        }
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

/// Ordering between two BSON values, or `None` when the types are not
/// comparable. Numbers compare as IEEE-754 doubles (`NaN` → `None`),
/// strings lexicographically, dates by instant, booleans false < true.
pub fn value_cmp(a: &Bson, b: &Bson) -> Option<Ordering> {
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => {
            Some(x.timestamp_millis().cmp(&y.timestamp_millis()))
        }
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

fn as_f64(v: &Bson) -> Option<f64> {
    match v {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

// ── Canonical serialization ─────────────────────────────────────

/// Canonical string form of a BSON value: numbers collapse across
/// integer widths, dates render as ISO-8601, documents render with
/// sorted keys. Two values with equal canonical strings are equal under
/// [`value_eq`], which makes this suitable as an index bucket key.
pub fn canonical_string(value: &Bson) -> String {
    let mut out = String::new();
    write_canonical(&mut out, value);
    out
}

fn write_canonical(out: &mut String, value: &Bson) {
    match value {
        Bson::Null | Bson::Undefined => out.push_str("null"),
        Bson::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        Bson::Int32(n) => {
            let _ = write!(out, "{n}");
        }
        Bson::Int64(n) => {
            let _ = write!(out, "{n}");
        }
        Bson::Double(n) => write_canonical_number(out, *n),
        Bson::String(s) => write_escaped(out, s),
        Bson::DateTime(dt) => {
            out.push('"');
            match dt.try_to_rfc3339_string() {
                Ok(s) => out.push_str(&s),
                Err(_) => {
                    let _ = write!(out, "{}", dt.timestamp_millis());
                }
            }
            out.push('"');
        }
        Bson::ObjectId(oid) => {
            let _ = write!(out, "\"{}\"", oid.to_hex());
        }
        Bson::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Bson::Document(doc) => {
            let mut keys: Vec<&String> = doc.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(out, key);
                out.push(':');
                write_canonical(out, doc.get(key.as_str()).unwrap_or(&Bson::Null));
            }
            out.push('}');
        }
        Bson::RegularExpression(re) => {
            let _ = write!(out, "/{}/{}", re.pattern, re.options);
        }
        other => {
            let _ = write!(out, "{other}");
        }
    }
}

/// Integral doubles print without a fractional part so `5`, `5i64` and
/// `5.0` share one bucket.
fn write_canonical_number(out: &mut String, n: f64) {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        let _ = write!(out, "{}", n as i64);
    } else {
        let _ = write!(out, "{n}");
    }
}

fn write_escaped(out: &mut String, s: &str) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn numbers_compare_across_widths() {
        assert!(value_eq(&Bson::Int32(5), &Bson::Int64(5)));
        assert!(value_eq(&Bson::Int64(5), &Bson::Double(5.0)));
        assert!(!value_eq(&Bson::Int32(5), &Bson::Double(5.5)));
    }

    #[test]
    fn nan_is_unequal_to_itself() {
        assert!(!value_eq(&Bson::Double(f64::NAN), &Bson::Double(f64::NAN)));
        assert_eq!(
            value_cmp(&Bson::Double(f64::NAN), &Bson::Double(1.0)),
            None
        );
    }

    #[test]
    fn document_equality_ignores_key_order() {
        let a = Bson::Document(doc! { "x": 1, "y": 2 });
        let b = Bson::Document(doc! { "y": 2, "x": 1 });
        assert!(value_eq(&a, &b));
    }

    #[test]
    fn arrays_are_ordered() {
        let a = Bson::Array(vec![Bson::Int32(1), Bson::Int32(2)]);
        let b = Bson::Array(vec![Bson::Int32(2), Bson::Int32(1)]);
        assert!(!value_eq(&a, &b));
    }

    #[test]
    fn cross_type_comparison_is_none() {
        assert_eq!(value_cmp(&Bson::Int32(1), &Bson::String("1".into())), None);
    }

    #[test]
    fn canonical_collapses_numeric_widths() {
        assert_eq!(
            canonical_string(&Bson::Int32(5)),
            canonical_string(&Bson::Double(5.0))
        );
        assert_ne!(
            canonical_string(&Bson::Double(5.5)),
            canonical_string(&Bson::Int32(5))
        );
    }

    #[test]
    fn canonical_documents_sort_keys() {
        let a = Bson::Document(doc! { "b": 1, "a": 2 });
        let b = Bson::Document(doc! { "a": 2, "b": 1 });
        assert_eq!(canonical_string(&a), canonical_string(&b));
    }

    #[test]
    fn canonical_distinguishes_null_and_string_null() {
        assert_ne!(
            canonical_string(&Bson::Null),
            canonical_string(&Bson::String("null".into()))
        );
    }
}
