use bson::{Bson, Document};
use regex::Regex;

use crate::path::{self, PathLookup};
use crate::selector::{
    ElemPredicate, ExprNode, ExprOp, ExprOperand, FieldOp, FieldPredicate, Selector, TextSearch,
    TypeSpec,
};
use crate::value::{value_cmp, value_eq};

impl Selector {
    /// Returns `true` if the document satisfies this selector.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Selector::And(children) => children.iter().all(|c| c.matches(doc)),
            Selector::Or(children) => children.iter().any(|c| c.matches(doc)),
            Selector::Nor(children) => !children.iter().any(|c| c.matches(doc)),
            Selector::Field(field, pred) => pred.matches_field(doc, field),
            Selector::Expr(node) => node.matches(doc),
            Selector::Text(text) => text.matches(doc),
        }
    }
}

impl FieldPredicate {
    pub fn matches_field(&self, doc: &Document, field: &str) -> bool {
        let lk = path::lookup(doc, field);
        self.matches_lookup(&lk)
    }

    fn matches_lookup(&self, lk: &PathLookup<'_>) -> bool {
        self.ops.iter().all(|op| op.matches_lookup(lk))
    }

    /// Evaluate against a single bare value, as `$elemMatch` does for
    /// scalar array elements.
    pub fn matches_value(&self, value: &Bson) -> bool {
        let lk = PathLookup {
            values: vec![value],
            exists: true,
        };
        self.matches_lookup(&lk)
    }
}

impl FieldOp {
    fn matches_lookup(&self, lk: &PathLookup<'_>) -> bool {
        match self {
            FieldOp::Eq(target) => eq_matches(lk, target),
            FieldOp::Ne(target) => !eq_matches(lk, target),
            FieldOp::Gt(target) => ordered_matches(lk, target, |o| o.is_gt()),
            FieldOp::Gte(target) => ordered_matches(lk, target, |o| o.is_ge()),
            FieldOp::Lt(target) => ordered_matches(lk, target, |o| o.is_lt()),
            FieldOp::Lte(target) => ordered_matches(lk, target, |o| o.is_le()),
            FieldOp::In(targets) => targets.iter().any(|t| eq_matches(lk, t)),
            FieldOp::Nin(targets) => !targets.iter().any(|t| eq_matches(lk, t)),
            FieldOp::Exists(expected) => lk.exists == *expected,
            FieldOp::Regex(re) => any_value(lk, |v| regex_matches(re, v)),
            FieldOp::Mod(divisor, remainder) => any_value(lk, |v| match as_i64(v) {
                Some(n) => n % divisor == *remainder,
                None => false,
            }),
            FieldOp::All(targets) => all_matches(lk, targets),
            FieldOp::ElemMatch(elem) => lk.values.iter().any(|v| elem_matches(elem, v)),
            FieldOp::Size(n) => lk
                .values
                .iter()
                .any(|v| matches!(v, Bson::Array(items) if items.len() == *n)),
            FieldOp::Type(specs) => lk
                .values
                .iter()
                .any(|v| specs.iter().any(|spec| type_matches(spec, v))),
            FieldOp::Not(inner) => !inner.matches_lookup(lk),
        }
    }
}

// ── Per-operator semantics ──────────────────────────────────────

/// Equality with MongoDB array fan-out: the target equals the value
/// itself, or any element of an array value. `null` also matches an
/// absent field; `undefined` only matches absence.
fn eq_matches(lk: &PathLookup<'_>, target: &Bson) -> bool {
    if matches!(target, Bson::Undefined) {
        return !lk.exists;
    }
    if matches!(target, Bson::Null) {
        return !lk.exists || lk.values.iter().any(|v| eq_or_contains(v, target));
    }
    lk.values.iter().any(|v| eq_or_contains(v, target))
}

fn eq_or_contains(value: &Bson, target: &Bson) -> bool {
    if value_eq(value, target) {
        return true;
    }
    match value {
        Bson::Array(items) => items.iter().any(|e| value_eq(e, target)),
        _ => false,
    }
}

fn ordered_matches(
    lk: &PathLookup<'_>,
    target: &Bson,
    pred: fn(std::cmp::Ordering) -> bool,
) -> bool {
    any_value(lk, |v| match value_cmp(v, target) {
        Some(ord) => pred(ord),
        None => false,
    })
}

/// Apply a scalar test to each value, descending one level into array
/// values (MongoDB element-wise semantics).
fn any_value(lk: &PathLookup<'_>, test: impl Fn(&Bson) -> bool) -> bool {
    lk.values.iter().any(|v| {
        if test(v) {
            return true;
        }
        match v {
            Bson::Array(items) => items.iter().any(&test),
            _ => false,
        }
    })
}

/// `$all`: an array value must contain every target; a scalar value
/// matches only if every target equals it. An empty target list
/// matches nothing.
fn all_matches(lk: &PathLookup<'_>, targets: &[Bson]) -> bool {
    if targets.is_empty() {
        return false;
    }
    lk.values.iter().any(|v| match v {
        Bson::Array(items) => targets
            .iter()
            .all(|t| items.iter().any(|e| value_eq(e, t))),
        scalar => targets.iter().all(|t| value_eq(scalar, t)),
    })
}

fn elem_matches(elem: &ElemPredicate, value: &Bson) -> bool {
    let Bson::Array(items) = value else {
        return false;
    };
    items.iter().any(|item| match elem {
        ElemPredicate::Selector(sel) => match item {
            Bson::Document(sub) => sel.matches(sub),
            _ => false,
        },
        ElemPredicate::Predicate(pred) => pred.matches_value(item),
    })
}

/// Regex against the value converted to string. Non-string scalars use
/// their display form.
fn regex_matches(re: &Regex, value: &Bson) -> bool {
    match value {
        Bson::String(s) => re.is_match(s),
        Bson::Int32(n) => re.is_match(&n.to_string()),
        Bson::Int64(n) => re.is_match(&n.to_string()),
        Bson::Double(n) => re.is_match(&n.to_string()),
        Bson::Boolean(b) => re.is_match(if *b { "true" } else { "false" }),
        _ => false,
    }
}

fn type_matches(spec: &TypeSpec, value: &Bson) -> bool {
    match spec {
        TypeSpec::Double => matches!(value, Bson::Double(_)),
        TypeSpec::String => matches!(value, Bson::String(_)),
        TypeSpec::Object => matches!(value, Bson::Document(_)),
        TypeSpec::Array => matches!(value, Bson::Array(_)),
        TypeSpec::Boolean => matches!(value, Bson::Boolean(_)),
        TypeSpec::Null => matches!(value, Bson::Null),
        TypeSpec::Date => matches!(value, Bson::DateTime(_)),
        TypeSpec::Int => matches!(value, Bson::Int32(_)),
        TypeSpec::Long => matches!(value, Bson::Int64(_)),
        TypeSpec::Number => matches!(value, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)),
        TypeSpec::ObjectId => matches!(value, Bson::ObjectId(_)),
    }
}

fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        Bson::Double(n) if n.fract() == 0.0 => Some(*n as i64),
        _ => None,
    }
}

// ── $expr ───────────────────────────────────────────────────────

impl ExprNode {
    fn matches(&self, doc: &Document) -> bool {
        let lhs = resolve_operand(&self.lhs, doc);
        let rhs = resolve_operand(&self.rhs, doc);
        match self.op {
            ExprOp::Eq => value_eq(&lhs, &rhs),
            ExprOp::Ne => !value_eq(&lhs, &rhs),
            ExprOp::Gt => value_cmp(&lhs, &rhs).is_some_and(|o| o.is_gt()),
            ExprOp::Gte => value_cmp(&lhs, &rhs).is_some_and(|o| o.is_ge()),
            ExprOp::Lt => value_cmp(&lhs, &rhs).is_some_and(|o| o.is_lt()),
            ExprOp::Lte => value_cmp(&lhs, &rhs).is_some_and(|o| o.is_le()),
        }
    }
}

fn resolve_operand(operand: &ExprOperand, doc: &Document) -> Bson {
    match operand {
        ExprOperand::Field(field) => path::get_first(doc, field).cloned().unwrap_or(Bson::Null),
        ExprOperand::Literal(v) => v.clone(),
    }
}

// ── $text ───────────────────────────────────────────────────────

impl TextSearch {
    /// Matches when any search token appears in the document-level
    /// stringification, with case/diacritic folding per the options.
    fn matches(&self, doc: &Document) -> bool {
        let mut haystack = String::new();
        collect_strings(doc, &mut haystack);
        let haystack = self.fold(&haystack);
        self.search
            .split_whitespace()
            .any(|token| haystack.contains(&self.fold(token)))
    }

    fn fold(&self, s: &str) -> String {
        let mut out = String::with_capacity(s.len());
        for ch in s.chars() {
            let ch = if self.diacritic_sensitive {
                ch
            } else {
                fold_diacritic(ch)
            };
            if self.case_sensitive {
                out.push(ch);
            } else {
                out.extend(ch.to_lowercase());
            }
        }
        out
    }
}

fn collect_strings(doc: &Document, out: &mut String) {
    for (_, value) in doc {
        collect_value_strings(value, out);
    }
}

fn collect_value_strings(value: &Bson, out: &mut String) {
    match value {
        Bson::String(s) => {
            out.push_str(s);
            out.push(' ');
        }
        Bson::Array(items) => {
            for item in items {
                collect_value_strings(item, out);
            }
        }
        Bson::Document(sub) => collect_strings(sub, out),
        _ => {}
    }
}

fn fold_diacritic(ch: char) -> char {
    match ch {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => 'A',
        'è' | 'é' | 'ê' | 'ë' => 'e',
        'È' | 'É' | 'Ê' | 'Ë' => 'E',
        'ì' | 'í' | 'î' | 'ï' => 'i',
        'Ì' | 'Í' | 'Î' | 'Ï' => 'I',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' => 'o',
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' => 'O',
        'ù' | 'ú' | 'û' | 'ü' => 'u',
        'Ù' | 'Ú' | 'Û' | 'Ü' => 'U',
        'ý' | 'ÿ' => 'y',
        'ñ' => 'n',
        'Ñ' => 'N',
        'ç' => 'c',
        'Ç' => 'C',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn sel(d: Document) -> Selector {
        Selector::parse(&d).unwrap()
    }

    #[test]
    fn empty_selector_matches_everything() {
        assert!(sel(doc! {}).matches(&doc! { "a": 1 }));
        assert!(sel(doc! {}).matches(&doc! {}));
    }

    #[test]
    fn implicit_eq() {
        let s = sel(doc! { "name": "John" });
        assert!(s.matches(&doc! { "id": "1", "name": "John" }));
        assert!(!s.matches(&doc! { "id": "2", "name": "Jane" }));
    }

    #[test]
    fn null_matches_null_or_absent() {
        let s = sel(doc! { "name": Bson::Null });
        assert!(s.matches(&doc! { "name": Bson::Null }));
        assert!(s.matches(&doc! {}));
        assert!(!s.matches(&doc! { "name": "x" }));
    }

    #[test]
    fn undefined_matches_absent_only() {
        let s = sel(doc! { "id": Bson::Undefined });
        assert!(!s.matches(&doc! { "id": "1" }));
        assert!(!s.matches(&doc! { "id": Bson::Null }));
        assert!(s.matches(&doc! {}));
    }

    #[test]
    fn exists_false_matches_absent_only() {
        let s = sel(doc! { "name": { "$exists": false } });
        assert!(s.matches(&doc! {}));
        assert!(!s.matches(&doc! { "name": Bson::Null }));
    }

    #[test]
    fn comparison_operators() {
        let s = sel(doc! { "age": { "$gte": 21, "$lt": 65 } });
        assert!(s.matches(&doc! { "age": 21 }));
        assert!(s.matches(&doc! { "age": 64 }));
        assert!(!s.matches(&doc! { "age": 65 }));
        assert!(!s.matches(&doc! { "age": 20 }));
        assert!(!s.matches(&doc! {}));
    }

    #[test]
    fn comparison_is_type_scoped() {
        let s = sel(doc! { "age": { "$gt": 5 } });
        assert!(!s.matches(&doc! { "age": "10" }));
    }

    #[test]
    fn in_and_nin() {
        let s = sel(doc! { "type": { "$in": ["kitten", "puppy"] } });
        assert!(s.matches(&doc! { "type": "kitten" }));
        assert!(!s.matches(&doc! { "type": "crypto" }));

        let s = sel(doc! { "type": { "$nin": ["kitten"] } });
        assert!(!s.matches(&doc! { "type": "kitten" }));
        assert!(s.matches(&doc! { "type": "crypto" }));
        assert!(s.matches(&doc! {}));
    }

    #[test]
    fn in_with_null_matches_absent() {
        let s = sel(doc! { "x": { "$in": [Bson::Null, 1] } });
        assert!(s.matches(&doc! {}));
        assert!(s.matches(&doc! { "x": 1 }));
        assert!(!s.matches(&doc! { "x": 2 }));
    }

    #[test]
    fn eq_fans_out_over_arrays() {
        let s = sel(doc! { "tags": "rust" });
        assert!(s.matches(&doc! { "tags": ["go", "rust"] }));
        assert!(!s.matches(&doc! { "tags": ["go"] }));
    }

    #[test]
    fn dotted_path_through_array_of_documents() {
        let s = sel(doc! { "items.sku": "a-1" });
        assert!(s.matches(&doc! { "items": [{ "sku": "b-2" }, { "sku": "a-1" }] }));
        assert!(!s.matches(&doc! { "items": [{ "sku": "b-2" }] }));
    }

    #[test]
    fn logical_operators() {
        let s = sel(doc! { "$or": [{ "a": 1 }, { "b": 2 }] });
        assert!(s.matches(&doc! { "a": 1 }));
        assert!(s.matches(&doc! { "b": 2 }));
        assert!(!s.matches(&doc! { "a": 2 }));

        let s = sel(doc! { "$nor": [{ "a": 1 }, { "b": 2 }] });
        assert!(!s.matches(&doc! { "a": 1 }));
        assert!(s.matches(&doc! { "a": 3 }));
    }

    #[test]
    fn not_inverts_field_expression() {
        let s = sel(doc! { "age": { "$not": { "$gt": 30 } } });
        assert!(s.matches(&doc! { "age": 20 }));
        assert!(!s.matches(&doc! { "age": 31 }));
        // $not over an absent field matches (the inner predicate fails)
        assert!(s.matches(&doc! {}));
    }

    #[test]
    fn regex_matching() {
        let s = sel(doc! { "email": { "$regex": "^admin@", "$options": "i" } });
        assert!(s.matches(&doc! { "email": "Admin@example.com" }));
        assert!(!s.matches(&doc! { "email": "user@example.com" }));
        assert!(!s.matches(&doc! { "email": 42 }));
    }

    #[test]
    fn regex_value_as_field_expression() {
        let re = bson::Regex {
            pattern: "tten$".try_into().unwrap(),
            options: "".try_into().unwrap(),
        };
        let s = sel(doc! { "type": re });
        assert!(s.matches(&doc! { "type": "kitten" }));
        assert!(!s.matches(&doc! { "type": "crypto" }));
    }

    #[test]
    fn mod_operator() {
        let s = sel(doc! { "n": { "$mod": [4, 0] } });
        assert!(s.matches(&doc! { "n": 8 }));
        assert!(!s.matches(&doc! { "n": 7 }));
    }

    #[test]
    fn all_operator() {
        let s = sel(doc! { "tags": { "$all": ["a", "b"] } });
        assert!(s.matches(&doc! { "tags": ["a", "b", "c"] }));
        assert!(!s.matches(&doc! { "tags": ["a", "c"] }));
    }

    #[test]
    fn elem_match_with_selector() {
        let s = sel(doc! { "results": { "$elemMatch": { "score": { "$gt": 80 }, "ok": true } } });
        assert!(s.matches(&doc! { "results": [{ "score": 90, "ok": true }] }));
        // no single element satisfies both conditions
        assert!(!s.matches(&doc! {
            "results": [{ "score": 90, "ok": false }, { "score": 50, "ok": true }]
        }));
    }

    #[test]
    fn elem_match_with_scalar_predicate() {
        let s = sel(doc! { "scores": { "$elemMatch": { "$gte": 80, "$lt": 90 } } });
        assert!(s.matches(&doc! { "scores": [75, 85] }));
        assert!(!s.matches(&doc! { "scores": [75, 95] }));
    }

    #[test]
    fn size_operator() {
        let s = sel(doc! { "tags": { "$size": 2 } });
        assert!(s.matches(&doc! { "tags": ["a", "b"] }));
        assert!(!s.matches(&doc! { "tags": ["a"] }));
        assert!(!s.matches(&doc! { "tags": "ab" }));
    }

    #[test]
    fn type_operator() {
        let s = sel(doc! { "v": { "$type": "string" } });
        assert!(s.matches(&doc! { "v": "x" }));
        assert!(!s.matches(&doc! { "v": 1 }));

        let s = sel(doc! { "v": { "$type": "number" } });
        assert!(s.matches(&doc! { "v": 1 }));
        assert!(s.matches(&doc! { "v": 1.5 }));
    }

    #[test]
    fn expr_compares_two_fields() {
        let s = sel(doc! { "$expr": { "$gt": ["$spent", "$budget"] } });
        assert!(s.matches(&doc! { "spent": 120, "budget": 100 }));
        assert!(!s.matches(&doc! { "spent": 80, "budget": 100 }));
    }

    #[test]
    fn text_search_is_case_and_diacritic_insensitive() {
        let s = sel(doc! { "$text": { "$search": "cafe" } });
        assert!(s.matches(&doc! { "name": "Café Olé" }));

        let s = sel(doc! { "$text": { "$search": "CAFE", "$caseSensitive": true } });
        assert!(!s.matches(&doc! { "name": "café" }));
    }

    #[test]
    fn deep_structural_equality_ignores_key_order() {
        let s = sel(doc! { "address": { "city": "Austin", "zip": "78701" } });
        assert!(s.matches(&doc! { "address": { "zip": "78701", "city": "Austin" } }));
    }
}
