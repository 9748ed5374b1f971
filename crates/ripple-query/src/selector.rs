use bson::{Bson, Document};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::QueryError;

/// A parsed selector: a tree of logical combinators over per-field
/// predicates. `And(vec![])` is the empty selector and matches every
/// document.
#[derive(Debug, Clone)]
pub enum Selector {
    And(Vec<Selector>),
    Or(Vec<Selector>),
    Nor(Vec<Selector>),
    Field(String, FieldPredicate),
    Expr(ExprNode),
    Text(TextSearch),
}

/// Conjunction of operators applied to one field path.
#[derive(Debug, Clone)]
pub struct FieldPredicate {
    pub ops: Vec<FieldOp>,
}

#[derive(Debug, Clone)]
pub enum FieldOp {
    Eq(Bson),
    Ne(Bson),
    Gt(Bson),
    Gte(Bson),
    Lt(Bson),
    Lte(Bson),
    In(Vec<Bson>),
    Nin(Vec<Bson>),
    Exists(bool),
    Regex(Regex),
    Mod(i64, i64),
    All(Vec<Bson>),
    ElemMatch(Box<ElemPredicate>),
    Size(usize),
    Type(Vec<TypeSpec>),
    Not(Box<FieldPredicate>),
}

/// `$elemMatch` body: a full selector when the array holds documents,
/// a bare operator predicate when it holds scalars.
#[derive(Debug, Clone)]
pub enum ElemPredicate {
    Selector(Selector),
    Predicate(FieldPredicate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TypeSpec {
    Double,
    String,
    Object,
    Array,
    Boolean,
    Null,
    Date,
    Int,
    Long,
    Number,
    ObjectId,
}

/// Declarative `$expr` comparison between field references and literals.
#[derive(Debug, Clone)]
pub struct ExprNode {
    pub op: ExprOp,
    pub lhs: ExprOperand,
    pub rhs: ExprOperand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExprOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone)]
pub enum ExprOperand {
    /// `"$path"` reference into the document under evaluation.
    Field(String),
    Literal(Bson),
}

/// `$text` search options.
#[derive(Debug, Clone)]
pub struct TextSearch {
    pub search: String,
    pub case_sensitive: bool,
    pub diacritic_sensitive: bool,
}

impl Selector {
    /// The empty selector, matching every document.
    pub fn all() -> Selector {
        Selector::And(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Selector::And(children) if children.is_empty())
    }

    /// Parse a selector from an arbitrary BSON value. The root must be
    /// a document; anything else (null, scalars, arrays) fails with
    /// `InvalidSelector`. This is the wire-facing entry point.
    pub fn parse_value(value: &Bson) -> Result<Selector, QueryError> {
        match value {
            Bson::Document(doc) => Selector::parse(doc),
            other => Err(QueryError::InvalidSelector(format!(
                "selector root must be a document, got {}",
                type_name(other)
            ))),
        }
    }

    /// Parse a selector document. Bare fields are implicit `$eq`;
    /// multiple top-level entries form a conjunction.
    pub fn parse(doc: &Document) -> Result<Selector, QueryError> {
        let mut children = Vec::new();

        for (key, value) in doc {
            match key.as_str() {
                "$and" => children.push(parse_logical_array(value, Selector::And)?),
                "$or" => children.push(parse_logical_array(value, Selector::Or)?),
                "$nor" => children.push(parse_logical_array(value, Selector::Nor)?),
                "$expr" => children.push(Selector::Expr(parse_expr(value)?)),
                "$text" => children.push(Selector::Text(parse_text(value)?)),
                "$where" => {
                    return Err(QueryError::InvalidSelector(
                        "$where is not supported: selectors are declarative values, \
                         not callables"
                            .into(),
                    ));
                }
                k if k.starts_with('$') => {
                    return Err(QueryError::InvalidSelector(format!(
                        "unknown top-level operator: {k}"
                    )));
                }
                field => children.push(Selector::Field(
                    field.to_string(),
                    parse_field_predicate(value)?,
                )),
            }
        }

        match children.len() {
            1 => Ok(children.pop().unwrap_or_else(Selector::all)),
            _ => Ok(Selector::And(children)),
        }
    }
}

fn parse_logical_array(
    value: &Bson,
    make: fn(Vec<Selector>) -> Selector,
) -> Result<Selector, QueryError> {
    let Bson::Array(items) = value else {
        return Err(QueryError::InvalidSelector(
            "$and/$or/$nor value must be an array".into(),
        ));
    };
    if items.is_empty() {
        return Err(QueryError::InvalidSelector(
            "$and/$or/$nor array must not be empty".into(),
        ));
    }
    let mut children = Vec::with_capacity(items.len());
    for item in items {
        let Bson::Document(sub) = item else {
            return Err(QueryError::InvalidSelector(
                "$and/$or/$nor array elements must be documents".into(),
            ));
        };
        children.push(Selector::parse(sub)?);
    }
    Ok(make(children))
}

// ── Field predicates ────────────────────────────────────────────

/// A field value is an operator document when every key starts with `$`.
pub(crate) fn is_operator_doc(doc: &Document) -> bool {
    !doc.is_empty() && doc.keys().all(|k| k.starts_with('$'))
}

fn parse_field_predicate(value: &Bson) -> Result<FieldPredicate, QueryError> {
    match value {
        Bson::Document(sub) if is_operator_doc(sub) => parse_operator_doc(sub),
        Bson::RegularExpression(re) => Ok(FieldPredicate {
            ops: vec![FieldOp::Regex(compile_regex(re.pattern.as_str(), re.options.as_str())?)],
        }),
        other => Ok(FieldPredicate {
            ops: vec![FieldOp::Eq(other.clone())],
        }),
    }
}

pub(crate) fn parse_operator_doc(doc: &Document) -> Result<FieldPredicate, QueryError> {
    // $regex carries its $options sibling, so it is resolved up front.
    let regex_op = match (doc.get("$regex"), doc.get("$options")) {
        (Some(pattern), options) => {
            let Bson::String(pat) = pattern else {
                return Err(QueryError::InvalidSelector(
                    "$regex value must be a string".into(),
                ));
            };
            let opts = match options {
                None => "",
                Some(Bson::String(s)) => s.as_str(),
                Some(_) => {
                    return Err(QueryError::InvalidSelector(
                        "$options value must be a string".into(),
                    ));
                }
            };
            Some(FieldOp::Regex(compile_regex(pat, opts)?))
        }
        (None, Some(_)) => {
            return Err(QueryError::InvalidSelector("$options without $regex".into()));
        }
        (None, None) => None,
    };

    let mut ops = Vec::new();
    if let Some(op) = regex_op {
        ops.push(op);
    }

    for (key, value) in doc {
        let op = match key.as_str() {
            "$regex" | "$options" => continue,
            "$eq" => FieldOp::Eq(value.clone()),
            "$ne" => FieldOp::Ne(value.clone()),
            "$gt" => FieldOp::Gt(value.clone()),
            "$gte" => FieldOp::Gte(value.clone()),
            "$lt" => FieldOp::Lt(value.clone()),
            "$lte" => FieldOp::Lte(value.clone()),
            "$in" => FieldOp::In(parse_value_array(value, "$in")?),
            "$nin" => FieldOp::Nin(parse_value_array(value, "$nin")?),
            "$exists" => FieldOp::Exists(parse_truthy(value)),
            "$mod" => parse_mod(value)?,
            "$all" => FieldOp::All(parse_value_array(value, "$all")?),
            "$elemMatch" => parse_elem_match(value)?,
            "$size" => parse_size(value)?,
            "$type" => FieldOp::Type(parse_type_spec(value)?),
            "$not" => parse_not(value)?,
            k => {
                return Err(QueryError::InvalidSelector(format!(
                    "unknown field operator: {k}"
                )));
            }
        };
        ops.push(op);
    }

    Ok(FieldPredicate { ops })
}

fn parse_value_array(value: &Bson, op: &str) -> Result<Vec<Bson>, QueryError> {
    match value {
        Bson::Array(items) => Ok(items.clone()),
        _ => Err(QueryError::InvalidSelector(format!(
            "{op} value must be an array"
        ))),
    }
}

fn parse_truthy(value: &Bson) -> bool {
    !matches!(
        value,
        Bson::Boolean(false) | Bson::Null | Bson::Undefined | Bson::Int32(0) | Bson::Int64(0)
    ) && !matches!(value, Bson::Double(d) if *d == 0.0)
}

fn parse_mod(value: &Bson) -> Result<FieldOp, QueryError> {
    let Bson::Array(items) = value else {
        return Err(QueryError::InvalidSelector(
            "$mod value must be a [divisor, remainder] array".into(),
        ));
    };
    let (Some(divisor), Some(remainder)) = (items.first(), items.get(1)) else {
        return Err(QueryError::InvalidSelector(
            "$mod requires divisor and remainder".into(),
        ));
    };
    let divisor = as_i64(divisor)
        .ok_or_else(|| QueryError::InvalidSelector("$mod divisor must be numeric".into()))?;
    let remainder = as_i64(remainder)
        .ok_or_else(|| QueryError::InvalidSelector("$mod remainder must be numeric".into()))?;
    if divisor == 0 {
        return Err(QueryError::InvalidSelector("$mod divisor must not be 0".into()));
    }
    Ok(FieldOp::Mod(divisor, remainder))
}

fn parse_elem_match(value: &Bson) -> Result<FieldOp, QueryError> {
    let Bson::Document(sub) = value else {
        return Err(QueryError::InvalidSelector(
            "$elemMatch value must be a document".into(),
        ));
    };
    let elem = if is_operator_doc(sub) {
        ElemPredicate::Predicate(parse_operator_doc(sub)?)
    } else {
        ElemPredicate::Selector(Selector::parse(sub)?)
    };
    Ok(FieldOp::ElemMatch(Box::new(elem)))
}

fn parse_size(value: &Bson) -> Result<FieldOp, QueryError> {
    match as_i64(value) {
        Some(n) if n >= 0 => Ok(FieldOp::Size(n as usize)),
        _ => Err(QueryError::InvalidSelector(
            "$size value must be a non-negative integer".into(),
        )),
    }
}

fn parse_not(value: &Bson) -> Result<FieldOp, QueryError> {
    let inner = match value {
        Bson::Document(sub) if is_operator_doc(sub) => parse_operator_doc(sub)?,
        Bson::RegularExpression(re) => FieldPredicate {
            ops: vec![FieldOp::Regex(compile_regex(re.pattern.as_str(), re.options.as_str())?)],
        },
        _ => {
            return Err(QueryError::InvalidSelector(
                "$not value must be an operator document or a regex".into(),
            ));
        }
    };
    Ok(FieldOp::Not(Box::new(inner)))
}

fn parse_type_spec(value: &Bson) -> Result<Vec<TypeSpec>, QueryError> {
    match value {
        Bson::Array(items) => items.iter().map(parse_single_type).collect(),
        other => Ok(vec![parse_single_type(other)?]),
    }
}

fn parse_single_type(value: &Bson) -> Result<TypeSpec, QueryError> {
    let spec = match value {
        Bson::String(alias) => match alias.as_str() {
            "double" => TypeSpec::Double,
            "string" => TypeSpec::String,
            "object" => TypeSpec::Object,
            "array" => TypeSpec::Array,
            "bool" => TypeSpec::Boolean,
            "null" => TypeSpec::Null,
            "date" => TypeSpec::Date,
            "int" => TypeSpec::Int,
            "long" => TypeSpec::Long,
            "number" => TypeSpec::Number,
            "objectId" => TypeSpec::ObjectId,
            other => {
                return Err(QueryError::InvalidSelector(format!(
                    "unknown $type alias: {other}"
                )));
            }
        },
        other => match as_i64(other) {
            Some(1) => TypeSpec::Double,
            Some(2) => TypeSpec::String,
            Some(3) => TypeSpec::Object,
            Some(4) => TypeSpec::Array,
            Some(7) => TypeSpec::ObjectId,
            Some(8) => TypeSpec::Boolean,
            Some(9) => TypeSpec::Date,
            Some(10) => TypeSpec::Null,
            Some(16) => TypeSpec::Int,
            Some(18) => TypeSpec::Long,
            Some(code) => {
                return Err(QueryError::InvalidSelector(format!(
                    "unknown $type code: {code}"
                )));
            }
            None => {
                return Err(QueryError::InvalidSelector(
                    "$type value must be a string alias or numeric code".into(),
                ));
            }
        },
    };
    Ok(spec)
}

// ── $expr / $text ───────────────────────────────────────────────

fn parse_expr(value: &Bson) -> Result<ExprNode, QueryError> {
    let Bson::Document(doc) = value else {
        return Err(QueryError::InvalidSelector("$expr value must be a document".into()));
    };
    if doc.len() != 1 {
        return Err(QueryError::InvalidSelector(
            "$expr takes exactly one comparison operator".into(),
        ));
    }
    let (key, operands) = match doc.iter().next() {
        Some(pair) => pair,
        None => {
            return Err(QueryError::InvalidSelector("$expr document is empty".into()));
        }
    };
    let op = match key.as_str() {
        "$eq" => ExprOp::Eq,
        "$ne" => ExprOp::Ne,
        "$gt" => ExprOp::Gt,
        "$gte" => ExprOp::Gte,
        "$lt" => ExprOp::Lt,
        "$lte" => ExprOp::Lte,
        other => {
            return Err(QueryError::InvalidSelector(format!(
                "unsupported $expr operator: {other}"
            )));
        }
    };
    let Bson::Array(args) = operands else {
        return Err(QueryError::InvalidSelector(
            "$expr operator value must be a two-element array".into(),
        ));
    };
    let (Some(lhs), Some(rhs), true) = (args.first(), args.get(1), args.len() == 2) else {
        return Err(QueryError::InvalidSelector(
            "$expr operator value must be a two-element array".into(),
        ));
    };
    Ok(ExprNode {
        op,
        lhs: parse_expr_operand(lhs),
        rhs: parse_expr_operand(rhs),
    })
}

fn parse_expr_operand(value: &Bson) -> ExprOperand {
    match value {
        Bson::String(s) if s.starts_with('$') => ExprOperand::Field(s[1..].to_string()),
        other => ExprOperand::Literal(other.clone()),
    }
}

fn parse_text(value: &Bson) -> Result<TextSearch, QueryError> {
    let Bson::Document(doc) = value else {
        return Err(QueryError::InvalidSelector("$text value must be a document".into()));
    };
    let search = match doc.get("$search") {
        Some(Bson::String(s)) => s.clone(),
        _ => {
            return Err(QueryError::InvalidSelector(
                "$text requires a string $search".into(),
            ));
        }
    };
    let flag = |key: &str| matches!(doc.get(key), Some(Bson::Boolean(true)));
    Ok(TextSearch {
        search,
        case_sensitive: flag("$caseSensitive"),
        diacritic_sensitive: flag("$diacriticSensitive"),
    })
}

// ── Helpers ─────────────────────────────────────────────────────

/// Fold MongoDB-style regex options into an inline flag group.
pub(crate) fn compile_regex(pattern: &str, options: &str) -> Result<Regex, QueryError> {
    let full = if options.is_empty() {
        pattern.to_string()
    } else {
        let mut prefix = String::with_capacity(4 + options.len() + pattern.len());
        prefix.push_str("(?");
        for ch in options.chars() {
            match ch {
                'i' | 's' | 'm' | 'x' => prefix.push(ch),
                c => {
                    return Err(QueryError::InvalidSelector(format!(
                        "unknown regex option: {c}"
                    )));
                }
            }
        }
        prefix.push(')');
        prefix.push_str(pattern);
        prefix
    };
    Regex::new(&full)
        .map_err(|e| QueryError::InvalidSelector(format!("invalid regex pattern: {e}")))
}

fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        Bson::Double(n) if n.fract() == 0.0 => Some(*n as i64),
        _ => None,
    }
}

fn type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Null => "null",
        Bson::Undefined => "undefined",
        Bson::Boolean(_) => "boolean",
        Bson::Array(_) => "array",
        Bson::String(_) => "string",
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => "number",
        _ => "value",
    }
}
