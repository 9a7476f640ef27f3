//! Query expression AST for predsql.
//!
//! This module defines the node algebra produced by the query-building
//! surface and consumed by the converter. The AST is:
//! - Immutable (children are shared through `Arc`, never mutated)
//! - Acyclic (every composition step wraps the previous root)
//! - Closed (operators are an enum; unknown names fail when parsed)

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::error::{Error, Result};

/// Shared pointer to an AST node.
pub type NodeRef = Arc<Node>;

/// Core expression node. Recursive to support arbitrary nesting.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Root of a query chain: the table the handle was created for.
    Source,
    /// Literal value.
    Constant(Value),
    /// Member access on the query parameter, e.g. `m.age`.
    Column(String),
    /// Member access on a closed-over value, evaluated at compile time.
    Captured(Captured),
    /// Binary operation: `left op right`.
    Binary {
        op: BinaryOperator,
        left: NodeRef,
        right: NodeRef,
    },
    /// Unary operation: `NOT operand` or a type conversion.
    Unary { op: UnaryOperator, operand: NodeRef },
    /// Named query operator applied to its arguments. The first argument
    /// of a chaining operator is the source it extends.
    Call { op: Operator, args: Vec<NodeRef> },
    /// `param => body`.
    Lambda { param: String, body: NodeRef },
    /// The lambda parameter itself (identity projection).
    Param(String),
    /// Constructed-object literal whose arguments are member accesses.
    Construct(Vec<NodeRef>),
}

impl Node {
    pub fn call(op: Operator, args: Vec<NodeRef>) -> NodeRef {
        Arc::new(Node::Call { op, args })
    }

    /// Build a call node from an operator name, failing on names outside the
    /// supported set.
    pub fn call_named(name: &str, args: Vec<NodeRef>) -> Result<NodeRef> {
        Ok(Self::call(name.parse()?, args))
    }

    pub fn lambda(param: impl Into<String>, body: NodeRef) -> NodeRef {
        Arc::new(Node::Lambda {
            param: param.into(),
            body,
        })
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    // Comparison
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    // Logical
    And,
    Or,
}

impl BinaryOperator {
    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOperator::And | BinaryOperator::Or)
    }

    pub fn is_equality(self) -> bool {
        matches!(self, BinaryOperator::Eq | BinaryOperator::NotEq)
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    /// Type conversion; evaluable operands are folded and bound.
    Convert,
}

/// The named query operators the converter dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Where,
    First,
    FirstOrDefault,
    Single,
    SingleOrDefault,
    Take,
    Skip,
    OrderBy,
    OrderByDescending,
    Any,
    Count,
    Select,
    Contains,
}

impl Operator {
    pub const ALL: [Operator; 13] = [
        Operator::Where,
        Operator::First,
        Operator::FirstOrDefault,
        Operator::Single,
        Operator::SingleOrDefault,
        Operator::Take,
        Operator::Skip,
        Operator::OrderBy,
        Operator::OrderByDescending,
        Operator::Any,
        Operator::Count,
        Operator::Select,
        Operator::Contains,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Operator::Where => "Where",
            Operator::First => "First",
            Operator::FirstOrDefault => "FirstOrDefault",
            Operator::Single => "Single",
            Operator::SingleOrDefault => "SingleOrDefault",
            Operator::Take => "Take",
            Operator::Skip => "Skip",
            Operator::OrderBy => "OrderBy",
            Operator::OrderByDescending => "OrderByDescending",
            Operator::Any => "Any",
            Operator::Count => "Count",
            Operator::Select => "Select",
            Operator::Contains => "Contains",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Operator::ALL
            .into_iter()
            .find(|op| op.name() == s)
            .ok_or_else(|| Error::UnsupportedOperator(s.to_string()))
    }
}

/// What a compiled query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultMode {
    #[default]
    All,
    Count,
    Any,
    Project,
}

/// A closed-over value plus the member chain read from it.
///
/// `Captured::new(filter).member("owner").member("id")` stands for
/// `filter.owner.id` in the host expression and folds to a single value
/// when the query is compiled.
#[derive(Debug, Clone, PartialEq)]
pub struct Captured {
    root: Value,
    path: Vec<String>,
}

impl Captured {
    pub fn new(root: impl Into<Value>) -> Self {
        Self {
            root: root.into(),
            path: Vec::new(),
        }
    }

    pub fn member(mut self, name: impl Into<String>) -> Self {
        self.path.push(name.into());
        self
    }

    /// Walk the member chain. A null link short-circuits to null.
    pub fn evaluate(&self) -> Result<Value> {
        let mut current = &self.root;
        for name in &self.path {
            match current {
                Value::Null => return Ok(Value::Null),
                Value::Record(fields) => {
                    current = fields.get(name).ok_or_else(|| {
                        Error::shape(format!("captured value has no member `{}`", name))
                    })?;
                }
                other => {
                    return Err(Error::shape(format!(
                        "cannot read member `{}` of a {} value",
                        name,
                        other.type_name()
                    )))
                }
            }
        }
        Ok(current.clone())
    }
}

/// Values bound as parameters and read back as result cells.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
    List(Vec<Value>),
    Record(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
            Value::TimestampTz(_) => "timestamptz",
            Value::Json(_) => "json",
            Value::List(_) => "list",
            Value::Record(_) => "record",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Convert to JSON for materialization into serde types.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Text(s) => Json::String(s.clone()),
            Value::Bytes(b) => Json::Array(b.iter().map(|&x| Json::from(x)).collect()),
            Value::Date(d) => Json::String(d.format("%Y-%m-%d").to_string()),
            Value::DateTime(dt) => Json::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Value::TimestampTz(dt) => Json::String(dt.to_rfc3339()),
            Value::Json(j) => j.clone(),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Record(fields) => Json::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Convert from JSON, as produced by serializing an entity.
    pub fn from_json(json: &serde_json::Value) -> Value {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            Json::String(s) => Value::Text(s.clone()),
            Json::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::Record(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "[{} bytes]", b.len()),
            Value::Date(d) => write!(f, "{}", d),
            Value::DateTime(dt) => write!(f, "{}", dt),
            Value::TimestampTz(dt) => write!(f, "{}", dt),
            Value::Json(j) => write!(f, "{}", j),
            Value::List(items) => {
                let items: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "{{{}}}", items.join(", "))
            }
            Value::Record(fields) => {
                let items: Vec<String> = fields.iter().map(|(k, v)| format!("{k}: {v}")).collect();
                write!(f, "{{{}}}", items.join(", "))
            }
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i8 => Int,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    u8 => Int,
    u16 => Int,
    u32 => Int,
    f32 => Float,
    f64 => Float,
    String => Text,
    &str => Text,
    Vec<u8> => Bytes,
    NaiveDate => Date,
    NaiveDateTime => DateTime,
    DateTime<Utc> => TimestampTz,
    serde_json::Value => Json,
    BTreeMap<String, Value> => Record,
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Value {
    fn from(items: [T; N]) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> FromIterator<T> for Value {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Value::List(iter.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_round_trips_through_name() {
        for op in Operator::ALL {
            assert_eq!(op.name().parse::<Operator>().unwrap(), op);
        }
    }

    #[test]
    fn test_unknown_operator_name_fails() {
        match "GroupBy".parse::<Operator>() {
            Err(Error::UnsupportedOperator(name)) => assert_eq!(name, "GroupBy"),
            other => panic!("expected UnsupportedOperator, got {:?}", other),
        }
        assert!(Node::call_named("Join", vec![]).is_err());
    }

    #[test]
    fn test_captured_member_chain() {
        let mut owner = BTreeMap::new();
        owner.insert("id".to_string(), Value::Int(7));
        let mut filter = BTreeMap::new();
        filter.insert("owner".to_string(), Value::Record(owner));

        let captured = Captured::new(filter).member("owner").member("id");
        assert_eq!(captured.evaluate().unwrap(), Value::Int(7));
    }

    #[test]
    fn test_captured_null_link_is_null() {
        let captured = Captured::new(Value::Null).member("owner").member("id");
        assert_eq!(captured.evaluate().unwrap(), Value::Null);
    }

    #[test]
    fn test_captured_missing_member_fails() {
        let captured = Captured::new(BTreeMap::new()).member("nope");
        assert!(matches!(
            captured.evaluate(),
            Err(Error::UnsupportedExpressionShape(_))
        ));
        assert!(Captured::new(5).member("x").evaluate().is_err());
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(3), Value::Int(3));
        assert_eq!(Value::from("a"), Value::Text("a".into()));
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(
            Value::from([1, 2]),
            Value::List(vec![Value::Int(1), Value::Int(2)])
        );
        let collected: Value = vec!["x", "y"].into_iter().collect();
        assert_eq!(collected.to_string(), "{x, y}");
    }

    #[test]
    fn test_json_conversion() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(Value::Date(date).to_json(), serde_json::json!("2024-02-29"));
        assert_eq!(Value::Int(4).to_json(), serde_json::json!(4));
        assert_eq!(
            Value::from_json(&serde_json::json!({"a": [1, 2.5, null]})),
            Value::Record(BTreeMap::from([(
                "a".to_string(),
                Value::List(vec![Value::Int(1), Value::Float(2.5), Value::Null])
            )]))
        );
    }
}
