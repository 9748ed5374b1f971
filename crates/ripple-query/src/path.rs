use bson::{Bson, Document};

/// Result of resolving a dot-notated path against a document.
///
/// `values` holds every value reachable at the path: intermediate
/// arrays fan out element-wise, so `"tags.name"` against an array of
/// sub-documents yields one value per element. `exists` reports whether
/// the path physically resolved at least once (a `null` value counts).
pub struct PathLookup<'a> {
    pub values: Vec<&'a Bson>,
    pub exists: bool,
}

/// Resolve a dot-notated field path. Numeric components address array
/// indices; non-numeric components applied to an array traverse into
/// each sub-document element.
pub fn lookup<'a>(doc: &'a Document, path: &str) -> PathLookup<'a> {
    let mut segments = path.split('.');
    let first = match segments.next() {
        Some(s) => s,
        None => return PathLookup { values: vec![], exists: false },
    };

    let mut candidates: Vec<&'a Bson> = match doc.get(first) {
        Some(v) => vec![v],
        None => vec![],
    };

    for segment in segments {
        let mut next: Vec<&'a Bson> = Vec::new();
        for candidate in candidates {
            match candidate {
                Bson::Document(sub) => {
                    if let Some(v) = sub.get(segment) {
                        next.push(v);
                    }
                }
                Bson::Array(items) => {
                    if let Ok(idx) = segment.parse::<usize>()
                        && let Some(v) = items.get(idx)
                    {
                        next.push(v);
                    }
                    for item in items {
                        if let Bson::Document(sub) = item
                            && let Some(v) = sub.get(segment)
                        {
                            next.push(v);
                        }
                    }
                }
                _ => {}
            }
        }
        candidates = next;
    }

    let exists = !candidates.is_empty();
    PathLookup { values: candidates, exists }
}

/// First value at the path, if any.
pub fn get_first<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    lookup(doc, path).values.into_iter().next()
}

// ── Mutation ────────────────────────────────────────────────────

/// Set the value at a dot-notated path, creating intermediate
/// containers as needed. A numeric next segment creates an array
/// (padded with nulls); anything else creates a document.
pub fn set_path(doc: &mut Document, path: &str, value: Bson) {
    let segments: Vec<&str> = path.split('.').collect();
    set_in_doc(doc, &segments, value);
}

fn set_in_doc(doc: &mut Document, segments: &[&str], value: Bson) {
    let head = segments[0];
    let rest = &segments[1..];
    if rest.is_empty() {
        doc.insert(head.to_string(), value);
        return;
    }
    if !matches!(doc.get(head), Some(Bson::Document(_)) | Some(Bson::Array(_))) {
        doc.insert(head.to_string(), empty_container(rest[0]));
    }
    if let Some(child) = doc.get_mut(head) {
        set_in_bson(child, rest, value);
    }
}

fn set_in_bson(target: &mut Bson, segments: &[&str], value: Bson) {
    let head = segments[0];
    let rest = &segments[1..];
    match target {
        Bson::Document(doc) => set_in_doc(doc, segments, value),
        Bson::Array(items) => {
            let Ok(idx) = head.parse::<usize>() else {
                return;
            };
            while items.len() <= idx {
                items.push(Bson::Null);
            }
            if rest.is_empty() {
                items[idx] = value;
                return;
            }
            if !matches!(items[idx], Bson::Document(_) | Bson::Array(_)) {
                items[idx] = empty_container(rest[0]);
            }
            set_in_bson(&mut items[idx], rest, value);
        }
        _ => {}
    }
}

fn empty_container(next_segment: &str) -> Bson {
    if is_index(next_segment) {
        Bson::Array(Vec::new())
    } else {
        Bson::Document(Document::new())
    }
}

fn is_index(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

/// Remove the value at a dot-notated path. Removing an array element
/// nulls it out rather than shifting the remainder.
pub fn unset_path(doc: &mut Document, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    unset_in_doc(doc, &segments);
}

fn unset_in_doc(doc: &mut Document, segments: &[&str]) {
    let head = segments[0];
    let rest = &segments[1..];
    if rest.is_empty() {
        doc.remove(head);
        return;
    }
    if let Some(child) = doc.get_mut(head) {
        unset_in_bson(child, rest);
    }
}

fn unset_in_bson(target: &mut Bson, segments: &[&str]) {
    let head = segments[0];
    let rest = &segments[1..];
    match target {
        Bson::Document(doc) => unset_in_doc(doc, segments),
        Bson::Array(items) => {
            let Ok(idx) = head.parse::<usize>() else {
                return;
            };
            if idx >= items.len() {
                return;
            }
            if rest.is_empty() {
                items[idx] = Bson::Null;
                return;
            }
            unset_in_bson(&mut items[idx], rest);
        }
        _ => {}
    }
}

/// Move the value at `from` to `to`. Returns `false` when `from` does
/// not resolve.
pub fn rename_path(doc: &mut Document, from: &str, to: &str) -> bool {
    let Some(value) = get_first(doc, from).cloned() else {
        return false;
    };
    unset_path(doc, from);
    set_path(doc, to, value);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn lookup_top_level() {
        let d = doc! { "name": "John" };
        let r = lookup(&d, "name");
        assert!(r.exists);
        assert_eq!(r.values, vec![&Bson::String("John".into())]);
    }

    #[test]
    fn lookup_nested() {
        let d = doc! { "address": { "city": "Austin" } };
        assert_eq!(
            get_first(&d, "address.city"),
            Some(&Bson::String("Austin".into()))
        );
    }

    #[test]
    fn lookup_missing_is_not_exists() {
        let d = doc! { "a": 1 };
        assert!(!lookup(&d, "b").exists);
        assert!(!lookup(&d, "a.b").exists);
    }

    #[test]
    fn lookup_null_counts_as_exists() {
        let d = doc! { "a": Bson::Null };
        assert!(lookup(&d, "a").exists);
    }

    #[test]
    fn lookup_array_fans_out() {
        let d = doc! { "items": [{ "n": 1 }, { "n": 2 }] };
        let r = lookup(&d, "items.n");
        assert_eq!(r.values.len(), 2);
    }

    #[test]
    fn lookup_array_index() {
        let d = doc! { "items": [10, 20, 30] };
        assert_eq!(get_first(&d, "items.1"), Some(&Bson::Int32(20)));
    }

    #[test]
    fn set_creates_intermediate_documents() {
        let mut d = doc! {};
        set_path(&mut d, "a.b.c", Bson::Int32(1));
        assert_eq!(d, doc! { "a": { "b": { "c": 1 } } });
    }

    #[test]
    fn set_numeric_segment_creates_array() {
        let mut d = doc! {};
        set_path(&mut d, "a.2", Bson::Int32(9));
        assert_eq!(d, doc! { "a": [Bson::Null, Bson::Null, Bson::Int32(9)] });
    }

    #[test]
    fn set_overwrites_scalar_intermediate() {
        let mut d = doc! { "a": 1 };
        set_path(&mut d, "a.b", Bson::Int32(2));
        assert_eq!(d, doc! { "a": { "b": 2 } });
    }

    #[test]
    fn unset_removes_document_key() {
        let mut d = doc! { "a": { "b": 1, "c": 2 } };
        unset_path(&mut d, "a.b");
        assert_eq!(d, doc! { "a": { "c": 2 } });
    }

    #[test]
    fn unset_nulls_array_element() {
        let mut d = doc! { "a": [1, 2, 3] };
        unset_path(&mut d, "a.1");
        assert_eq!(d, doc! { "a": [Bson::Int32(1), Bson::Null, Bson::Int32(3)] });
    }

    #[test]
    fn rename_moves_value() {
        let mut d = doc! { "old": 5 };
        assert!(rename_path(&mut d, "old", "fresh.inner"));
        assert_eq!(d, doc! { "fresh": { "inner": 5 } });
    }

    #[test]
    fn rename_missing_is_noop() {
        let mut d = doc! { "a": 1 };
        assert!(!rename_path(&mut d, "missing", "b"));
        assert_eq!(d, doc! { "a": 1 });
    }
}
