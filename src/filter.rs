//! Filter translation for list-with-filter queries.
//!
//! Callers send filters as `field operator value` text. The translator types
//! each value according to the schema's declared kind so the storage layer
//! compares numbers as numbers and booleans as booleans.
//!
//! Conversion is deliberately permissive: an `int` or `float` value that does
//! not parse becomes zero instead of an error, and a `boolean` value is true
//! only for the exact text `true`.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::schema::{PropertyTypes, ValueKind};

/// A typed literal produced from the raw filter text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FilterValue {
    /// Integer literal; unparseable text becomes zero.
    Int(i64),
    /// Floating-point literal; unparseable text becomes zero.
    Float(f64),
    /// True only for the literal `true`.
    Bool(bool),
    /// Raw text, for string and undeclared properties.
    Text(String),
}

impl FilterValue {
    /// Converts `raw` according to `kind`. Total: never fails.
    #[must_use]
    pub fn convert(kind: ValueKind, raw: &str) -> Self {
        match kind {
            ValueKind::Int => Self::Int(raw.parse().unwrap_or(0)),
            ValueKind::Float => Self::Float(raw.parse().unwrap_or(0.0)),
            ValueKind::Boolean => Self::Bool(raw == "true"),
            ValueKind::String | ValueKind::Unknown => Self::Text(raw.to_string()),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Bool(_) | Self::Text(_) => None,
        }
    }
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

/// One translated predicate, handed to the storage layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedPredicate {
    /// Property path as written by the caller.
    pub field: String,
    /// Operator as written by the caller; interpreted by storage.
    pub operator: String,
    /// Typed literal.
    pub value: FilterValue,
}

impl fmt::Display for TypedPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.operator, self.value)
    }
}

/// Parses one `field operator value` expression.
///
/// The value is everything after the second space, so it may itself contain
/// spaces. Returns `None` for expressions with fewer than three parts.
#[must_use]
pub fn parse_filter(expr: &str, property_types: &PropertyTypes) -> Option<TypedPredicate> {
    let mut parts = expr.splitn(3, ' ');
    let (field, operator, raw) = (parts.next()?, parts.next()?, parts.next()?);
    let value = FilterValue::convert(property_types.kind_of(field), raw);
    Some(TypedPredicate {
        field: field.to_string(),
        operator: operator.to_string(),
        value,
    })
}

/// Translates filter expressions into typed predicates, preserving order and
/// silently dropping malformed expressions.
pub fn translate<S: AsRef<str>>(filters: &[S], property_types: &PropertyTypes) -> Vec<TypedPredicate> {
    filters
        .iter()
        .filter_map(|f| parse_filter(f.as_ref(), property_types))
        .collect()
}

/// Comparison operators understood by the reference store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    /// `eq`, `=`, `==`
    Eq,
    /// `ne`, `!=`
    Ne,
    /// `gt`, `>`
    Gt,
    /// `ge`, `>=`
    Ge,
    /// `lt`, `<`
    Lt,
    /// `le`, `<=`
    Le,
    /// `co`: substring match on text.
    Contains,
    /// `sw`: prefix match on text.
    StartsWith,
    /// `ew`: suffix match on text.
    EndsWith,
}

impl FilterOperator {
    /// Parses SCIM-style keywords and their symbolic aliases.
    #[must_use]
    pub fn parse(op: &str) -> Option<Self> {
        Some(match op.to_ascii_lowercase().as_str() {
            "eq" | "=" | "==" => Self::Eq,
            "ne" | "!=" => Self::Ne,
            "gt" | ">" => Self::Gt,
            "ge" | ">=" => Self::Ge,
            "lt" | "<" => Self::Lt,
            "le" | "<=" => Self::Le,
            "co" => Self::Contains,
            "sw" => Self::StartsWith,
            "ew" => Self::EndsWith,
            _ => return None,
        })
    }

    /// Applies the operator to a stored value and a filter literal.
    ///
    /// Values of incompatible shapes never match (except under `ne`).
    #[must_use]
    pub fn matches(self, stored: &serde_json::Value, literal: &FilterValue) -> bool {
        match self {
            Self::Contains | Self::StartsWith | Self::EndsWith => {
                let (Some(s), FilterValue::Text(needle)) = (stored.as_str(), literal) else {
                    return false;
                };
                match self {
                    Self::Contains => s.contains(needle.as_str()),
                    Self::StartsWith => s.starts_with(needle.as_str()),
                    _ => s.ends_with(needle.as_str()),
                }
            }
            _ => {
                let ordering = compare(stored, literal);
                match self {
                    Self::Eq => ordering == Some(Ordering::Equal),
                    Self::Ne => ordering != Some(Ordering::Equal),
                    Self::Gt => ordering == Some(Ordering::Greater),
                    Self::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
                    Self::Lt => ordering == Some(Ordering::Less),
                    Self::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
                    Self::Contains | Self::StartsWith | Self::EndsWith => false,
                }
            }
        }
    }
}

fn compare(stored: &serde_json::Value, literal: &FilterValue) -> Option<Ordering> {
    match literal {
        FilterValue::Int(_) | FilterValue::Float(_) => {
            stored.as_f64()?.partial_cmp(&literal.as_f64()?)
        }
        FilterValue::Bool(b) => stored.as_bool().map(|s| s.cmp(b)),
        FilterValue::Text(t) => stored.as_str().map(|s| s.cmp(t.as_str())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn types() -> PropertyTypes {
        PropertyTypes::new()
            .with("age", ValueKind::Int)
            .with("score", ValueKind::Float)
            .with("vip", ValueKind::Boolean)
            .with("city", ValueKind::String)
    }

    #[test]
    fn int_filter_is_typed() {
        let out = translate(&["age > 30"], &types());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, FilterValue::Int(30));
        assert_eq!(out[0].to_string(), "age > 30");
    }

    #[test]
    fn invalid_int_becomes_zero() {
        let out = translate(&["age > abc"], &types());
        assert_eq!(out[0].value, FilterValue::Int(0));
        assert_eq!(out[0].to_string(), "age > 0");
    }

    #[test]
    fn float_and_bool_conversion() {
        let out = translate(&["score ge 4.5", "score lt nope", "vip eq true", "vip eq TRUE"], &types());
        assert_eq!(out[0].value, FilterValue::Float(4.5));
        assert_eq!(out[1].value, FilterValue::Float(0.0));
        assert_eq!(out[2].value, FilterValue::Bool(true));
        assert_eq!(out[3].value, FilterValue::Bool(false));
    }

    #[test]
    fn strings_and_unknown_pass_through() {
        let out = translate(&["city eq New York", "nickname sw Al"], &types());
        assert_eq!(out[0].value, FilterValue::Text("New York".to_string()));
        assert_eq!(out[0].to_string(), "city eq New York");
        assert_eq!(out[1].value, FilterValue::Text("Al".to_string()));
    }

    #[test]
    fn malformed_filters_are_dropped_in_order() {
        let out = translate(&["age", "age >", "age > 1", "", "city eq x"], &types());
        let rendered: Vec<String> = out.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["age > 1", "city eq x"]);
    }

    #[test]
    fn operator_aliases() {
        assert_eq!(FilterOperator::parse(">"), Some(FilterOperator::Gt));
        assert_eq!(FilterOperator::parse("GE"), Some(FilterOperator::Ge));
        assert_eq!(FilterOperator::parse("co"), Some(FilterOperator::Contains));
        assert_eq!(FilterOperator::parse("~"), None);
    }

    #[test]
    fn operator_matching() {
        assert!(FilterOperator::Gt.matches(&json!(31), &FilterValue::Int(30)));
        assert!(!FilterOperator::Gt.matches(&json!(30), &FilterValue::Int(30)));
        assert!(FilterOperator::Le.matches(&json!(2.5), &FilterValue::Float(2.5)));
        assert!(FilterOperator::Eq.matches(&json!(true), &FilterValue::Bool(true)));
        assert!(FilterOperator::StartsWith.matches(&json!("Alice"), &FilterValue::Text("Al".into())));
        assert!(FilterOperator::Contains.matches(&json!("Alice"), &FilterValue::Text("lic".into())));
        assert!(!FilterOperator::Eq.matches(&json!("30"), &FilterValue::Int(30)));
        assert!(FilterOperator::Ne.matches(&json!("30"), &FilterValue::Int(30)));
    }
}
