use bson::{Bson, Document};

use crate::error::QueryError;
use crate::path::{get_first, rename_path, set_path, unset_path};
use crate::selector::{FieldPredicate, Selector, is_operator_doc, parse_operator_doc};
use crate::value::value_eq;

/// A single field-level modifier operator.
#[derive(Debug, Clone)]
pub enum ModOp {
    /// Set a field to a value. Creates the field if it doesn't exist.
    Set(Bson),
    /// Set only when applied with `is_upsert` and no prior document.
    SetOnInsert(Bson),
    /// Remove a field from the document.
    Unset,
    /// Add a numeric amount (negative for decrement).
    Inc(Bson),
    /// Multiply a numeric field. A missing field becomes 0.
    Mul(Bson),
    /// Move a field to a new path.
    Rename(String),
    /// Keep the smaller of the current and given value.
    Min(Bson),
    /// Keep the larger of the current and given value.
    Max(Bson),
    /// Set the field to the current instant.
    CurrentDate,
    /// Append values to an array field (`$each` folded at parse time).
    Push(Vec<Bson>),
    /// Append values not already present.
    AddToSet(Vec<Bson>),
    /// Remove array elements matching a criterion.
    Pull(PullSpec),
    /// Remove every listed value from an array field.
    PullAll(Vec<Bson>),
    /// Drop the first (`-1`) or last (`1`) array element.
    Pop(PopFrom),
}

#[derive(Debug, Clone)]
pub enum PullSpec {
    Equals(Bson),
    /// Operator criterion over scalar elements, e.g. `{ $gt: 5 }`.
    Predicate(FieldPredicate),
    /// Selector criterion over document elements.
    Matches(Selector),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopFrom {
    First,
    Last,
}

#[derive(Debug, Clone)]
pub struct FieldMod {
    pub field: String,
    pub op: ModOp,
}

/// A parsed modifier: an ordered list of (field, operator) pairs plus
/// the original document it was parsed from (carried through change
/// events).
#[derive(Debug, Clone)]
pub struct Modifier {
    pub ops: Vec<FieldMod>,
    source: Document,
}

impl Modifier {
    /// Parse a BSON modifier document.
    ///
    /// Every top-level key must be a recognized `$` operator whose
    /// value is a sub-document mapping dot-notated field paths to
    /// operands. Bare fields and unknown operators fail with
    /// `InvalidModifier`.
    pub fn parse(doc: &Document) -> Result<Modifier, QueryError> {
        let mut ops = Vec::new();

        for (key, value) in doc {
            match key.as_str() {
                "$set" => parse_fields(value, key, &mut ops, |v| Ok(ModOp::Set(v.clone())))?,
                "$setOnInsert" => {
                    parse_fields(value, key, &mut ops, |v| Ok(ModOp::SetOnInsert(v.clone())))?
                }
                "$unset" => parse_fields(value, key, &mut ops, |_| Ok(ModOp::Unset))?,
                "$inc" => parse_fields(value, key, &mut ops, |v| {
                    require_numeric(v, "$inc").map(ModOp::Inc)
                })?,
                "$mul" => parse_fields(value, key, &mut ops, |v| {
                    require_numeric(v, "$mul").map(ModOp::Mul)
                })?,
                "$rename" => parse_fields(value, key, &mut ops, |v| match v {
                    Bson::String(name) => Ok(ModOp::Rename(name.clone())),
                    _ => Err(QueryError::InvalidModifier(
                        "$rename value must be a string".into(),
                    )),
                })?,
                "$min" => parse_fields(value, key, &mut ops, |v| Ok(ModOp::Min(v.clone())))?,
                "$max" => parse_fields(value, key, &mut ops, |v| Ok(ModOp::Max(v.clone())))?,
                "$currentDate" => parse_fields(value, key, &mut ops, parse_current_date)?,
                "$push" => parse_fields(value, key, &mut ops, |v| {
                    Ok(ModOp::Push(parse_each(v, "$push")?))
                })?,
                "$addToSet" => parse_fields(value, key, &mut ops, |v| {
                    Ok(ModOp::AddToSet(parse_each(v, "$addToSet")?))
                })?,
                "$pull" => parse_fields(value, key, &mut ops, |v| {
                    Ok(ModOp::Pull(parse_pull(v)?))
                })?,
                "$pullAll" => parse_fields(value, key, &mut ops, |v| match v {
                    Bson::Array(items) => Ok(ModOp::PullAll(items.clone())),
                    _ => Err(QueryError::InvalidModifier(
                        "$pullAll value must be an array".into(),
                    )),
                })?,
                "$pop" => parse_fields(value, key, &mut ops, parse_pop)?,
                k => {
                    return Err(QueryError::InvalidModifier(format!(
                        "unknown modifier operator: {k}"
                    )));
                }
            }
        }

        if ops.is_empty() {
            return Err(QueryError::InvalidModifier("empty modifier document".into()));
        }

        Ok(Modifier {
            ops,
            source: doc.clone(),
        })
    }

    /// The original modifier document, as carried on change events.
    pub fn as_document(&self) -> &Document {
        &self.source
    }

    /// Apply this modifier to a document, producing a new one.
    ///
    /// The input is never mutated. Field operators (`$set`, `$inc`, …)
    /// apply before array operators; within each phase, operators run
    /// in declaration order.
    pub fn apply(&self, doc: &Document, is_upsert: bool) -> Result<Document, QueryError> {
        let mut out = doc.clone();

        for fm in &self.ops {
            match &fm.op {
                ModOp::Set(v) => set_path(&mut out, &fm.field, v.clone()),
                ModOp::SetOnInsert(v) => {
                    if is_upsert {
                        set_path(&mut out, &fm.field, v.clone());
                    }
                }
                ModOp::Unset => unset_path(&mut out, &fm.field),
                ModOp::Inc(amount) => {
                    let next = numeric_binop(
                        get_first(&out, &fm.field),
                        amount,
                        &fm.field,
                        "$inc",
                        |a, b| a + b,
                        |a, b| a + b,
                    )?;
                    set_path(&mut out, &fm.field, next);
                }
                ModOp::Mul(factor) => {
                    let next = numeric_binop(
                        get_first(&out, &fm.field),
                        factor,
                        &fm.field,
                        "$mul",
                        |a, b| a * b,
                        |a, b| a * b,
                    )?;
                    set_path(&mut out, &fm.field, next);
                }
                ModOp::Rename(to) => {
                    rename_path(&mut out, &fm.field, to);
                }
                ModOp::Min(v) => {
                    let keep_current = get_first(&out, &fm.field)
                        .is_some_and(|cur| crate::value::value_cmp(cur, v).is_some_and(|o| o.is_le()));
                    if !keep_current {
                        set_path(&mut out, &fm.field, v.clone());
                    }
                }
                ModOp::Max(v) => {
                    let keep_current = get_first(&out, &fm.field)
                        .is_some_and(|cur| crate::value::value_cmp(cur, v).is_some_and(|o| o.is_ge()));
                    if !keep_current {
                        set_path(&mut out, &fm.field, v.clone());
                    }
                }
                ModOp::CurrentDate => {
                    set_path(&mut out, &fm.field, Bson::DateTime(bson::DateTime::now()));
                }
                // array operators run in the second phase
                _ => {}
            }
        }

        for fm in &self.ops {
            match &fm.op {
                ModOp::Push(values) => {
                    let mut items = take_array(&out, &fm.field, "$push")?;
                    items.extend(values.iter().cloned());
                    set_path(&mut out, &fm.field, Bson::Array(items));
                }
                ModOp::AddToSet(values) => {
                    let mut items = take_array(&out, &fm.field, "$addToSet")?;
                    for v in values {
                        if !items.iter().any(|e| value_eq(e, v)) {
                            items.push(v.clone());
                        }
                    }
                    set_path(&mut out, &fm.field, Bson::Array(items));
                }
                ModOp::Pull(spec) => {
                    if let Some(Bson::Array(items)) = get_first(&out, &fm.field) {
                        let kept: Vec<Bson> = items
                            .iter()
                            .filter(|e| !pull_matches(spec, e))
                            .cloned()
                            .collect();
                        set_path(&mut out, &fm.field, Bson::Array(kept));
                    }
                }
                ModOp::PullAll(values) => {
                    if let Some(Bson::Array(items)) = get_first(&out, &fm.field) {
                        let kept: Vec<Bson> = items
                            .iter()
                            .filter(|e| !values.iter().any(|v| value_eq(e, v)))
                            .cloned()
                            .collect();
                        set_path(&mut out, &fm.field, Bson::Array(kept));
                    }
                }
                ModOp::Pop(from) => {
                    if let Some(Bson::Array(items)) = get_first(&out, &fm.field) {
                        let mut items = items.clone();
                        match from {
                            PopFrom::First if !items.is_empty() => {
                                items.remove(0);
                            }
                            PopFrom::Last => {
                                items.pop();
                            }
                            _ => {}
                        }
                        set_path(&mut out, &fm.field, Bson::Array(items));
                    }
                }
                _ => {}
            }
        }

        Ok(out)
    }
}

// ── Parse helpers ───────────────────────────────────────────────

/// Parse an operator sub-document where each key is a field path.
fn parse_fields(
    value: &Bson,
    operator: &str,
    ops: &mut Vec<FieldMod>,
    make: impl Fn(&Bson) -> Result<ModOp, QueryError>,
) -> Result<(), QueryError> {
    let Bson::Document(sub) = value else {
        return Err(QueryError::InvalidModifier(format!(
            "{operator} value must be a document"
        )));
    };
    for (field, operand) in sub {
        ops.push(FieldMod {
            field: field.clone(),
            op: make(operand)?,
        });
    }
    Ok(())
}

fn require_numeric(value: &Bson, operator: &str) -> Result<Bson, QueryError> {
    match value {
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => Ok(value.clone()),
        _ => Err(QueryError::InvalidModifier(format!(
            "{operator} value must be numeric"
        ))),
    }
}

fn parse_current_date(value: &Bson) -> Result<ModOp, QueryError> {
    match value {
        Bson::Boolean(true) => Ok(ModOp::CurrentDate),
        Bson::Document(spec) => match spec.get("$type") {
            Some(Bson::String(t)) if t == "date" || t == "timestamp" => Ok(ModOp::CurrentDate),
            _ => Err(QueryError::InvalidModifier(
                "$currentDate type spec must be {\"$type\": \"date\"}".into(),
            )),
        },
        _ => Err(QueryError::InvalidModifier(
            "$currentDate value must be true or a type spec".into(),
        )),
    }
}

/// Fold `{ $each: [...] }` into a flat value list.
fn parse_each(value: &Bson, operator: &str) -> Result<Vec<Bson>, QueryError> {
    if let Bson::Document(sub) = value
        && let Some(each) = sub.get("$each")
    {
        return match each {
            Bson::Array(items) => Ok(items.clone()),
            _ => Err(QueryError::InvalidModifier(format!(
                "{operator} $each value must be an array"
            ))),
        };
    }
    Ok(vec![value.clone()])
}

fn parse_pull(value: &Bson) -> Result<PullSpec, QueryError> {
    match value {
        Bson::Document(sub) if is_operator_doc(sub) => {
            Ok(PullSpec::Predicate(parse_operator_doc(sub)?))
        }
        Bson::Document(sub) => Ok(PullSpec::Matches(Selector::parse(sub)?)),
        other => Ok(PullSpec::Equals(other.clone())),
    }
}

fn parse_pop(value: &Bson) -> Result<ModOp, QueryError> {
    match value {
        Bson::Int32(1) | Bson::Int64(1) => Ok(ModOp::Pop(PopFrom::Last)),
        Bson::Int32(-1) | Bson::Int64(-1) => Ok(ModOp::Pop(PopFrom::First)),
        _ => Err(QueryError::InvalidModifier("$pop value must be 1 or -1".into())),
    }
}

// ── Apply helpers ───────────────────────────────────────────────

/// Numeric binop preserving integer width when both sides are
/// integers. A missing field counts as 0.
fn numeric_binop(
    current: Option<&Bson>,
    operand: &Bson,
    field: &str,
    operator: &str,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> Result<Bson, QueryError> {
    let current = current.cloned().unwrap_or(Bson::Int32(0));
    match (&current, operand) {
        (Bson::Double(a), _) | (_, Bson::Double(a)) => {
            let a = *a;
            let b = match if matches!(&current, Bson::Double(_)) { operand } else { &current } {
                Bson::Int32(n) => *n as f64,
                Bson::Int64(n) => *n as f64,
                Bson::Double(n) => *n,
                _ => {
                    return Err(QueryError::InvalidModifier(format!(
                        "{operator} target '{field}' is not numeric"
                    )));
                }
            };
            Ok(Bson::Double(float_op(a, b)))
        }
        (a, b) => {
            let (Some(a), Some(b)) = (as_i64(a), as_i64(b)) else {
                return Err(QueryError::InvalidModifier(format!(
                    "{operator} target '{field}' is not numeric"
                )));
            };
            let result = int_op(a, b);
            let both_i32 = matches!(&current, Bson::Int32(_)) && matches!(operand, Bson::Int32(_));
            if both_i32 && i32::try_from(result).is_ok() {
                Ok(Bson::Int32(result as i32))
            } else {
                Ok(Bson::Int64(result))
            }
        }
    }
}

fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        _ => None,
    }
}

/// Current array at the path, an empty one when missing. A non-array
/// value fails the operator.
fn take_array(doc: &Document, field: &str, operator: &str) -> Result<Vec<Bson>, QueryError> {
    match get_first(doc, field) {
        Some(Bson::Array(items)) => Ok(items.clone()),
        None => Ok(Vec::new()),
        Some(_) => Err(QueryError::InvalidModifier(format!(
            "{operator} target '{field}' is not an array"
        ))),
    }
}

fn pull_matches(spec: &PullSpec, element: &Bson) -> bool {
    match spec {
        PullSpec::Equals(v) => value_eq(element, v),
        PullSpec::Predicate(pred) => pred.matches_value(element),
        PullSpec::Matches(sel) => match element {
            Bson::Document(sub) => sel.matches(sub),
            _ => false,
        },
    }
}
