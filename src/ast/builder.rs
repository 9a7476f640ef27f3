//! Host-side query-building surface.
//!
//! These helpers stand in for lambda expressions: `col("age").gt(18)`
//! builds the body of `m => m.age > 18`. Every combinator returns a new
//! [`Expr`]; existing expressions are never modified, so sub-expressions
//! can be shared freely between queries.
//!
//! ```ignore
//! use predsql::ast::{col, Captured};
//!
//! let adults = col("age").ge(18).and(!col("banned"));
//! let chosen = col("id").is_in(Captured::new([1, 2, 3]));
//! ```

use std::ops::Not;
use std::sync::Arc;

use super::types::*;

/// Name of the lambda parameter every built predicate is wrapped in.
pub const LAMBDA_PARAM: &str = "m";

/// A predicate or operand expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr(NodeRef);

impl Expr {
    pub fn from_node(node: NodeRef) -> Self {
        Self(node)
    }

    pub fn node(&self) -> &NodeRef {
        &self.0
    }

    pub fn into_node(self) -> NodeRef {
        self.0
    }

    /// Wrap the expression as the body of `m => <expr>`.
    pub fn into_lambda(self) -> NodeRef {
        Node::lambda(LAMBDA_PARAM, self.0)
    }

    fn binary(self, op: BinaryOperator, rhs: impl IntoExpr) -> Expr {
        Expr(Arc::new(Node::Binary {
            op,
            left: self.0,
            right: rhs.into_expr().0,
        }))
    }

    pub fn eq(self, rhs: impl IntoExpr) -> Expr {
        self.binary(BinaryOperator::Eq, rhs)
    }

    pub fn ne(self, rhs: impl IntoExpr) -> Expr {
        self.binary(BinaryOperator::NotEq, rhs)
    }

    pub fn lt(self, rhs: impl IntoExpr) -> Expr {
        self.binary(BinaryOperator::Lt, rhs)
    }

    pub fn le(self, rhs: impl IntoExpr) -> Expr {
        self.binary(BinaryOperator::LtEq, rhs)
    }

    pub fn gt(self, rhs: impl IntoExpr) -> Expr {
        self.binary(BinaryOperator::Gt, rhs)
    }

    pub fn ge(self, rhs: impl IntoExpr) -> Expr {
        self.binary(BinaryOperator::GtEq, rhs)
    }

    pub fn and(self, rhs: impl IntoExpr) -> Expr {
        self.binary(BinaryOperator::And, rhs)
    }

    pub fn or(self, rhs: impl IntoExpr) -> Expr {
        self.binary(BinaryOperator::Or, rhs)
    }

    /// Type conversion, e.g. widening a captured value to the column type.
    pub fn convert(self) -> Expr {
        Expr(Arc::new(Node::Unary {
            op: UnaryOperator::Convert,
            operand: self.0,
        }))
    }

    /// Membership test: `values.Contains(m.<self>)`.
    pub fn is_in(self, values: impl IntoExpr) -> Expr {
        Expr(Node::call(
            Operator::Contains,
            vec![values.into_expr().0, self.0],
        ))
    }
}

impl Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        Expr(Arc::new(Node::Unary {
            op: UnaryOperator::Not,
            operand: self.0,
        }))
    }
}

/// Anything usable as an operand of a predicate combinator.
pub trait IntoExpr {
    fn into_expr(self) -> Expr;
}

impl IntoExpr for Expr {
    fn into_expr(self) -> Expr {
        self
    }
}

impl IntoExpr for Captured {
    fn into_expr(self) -> Expr {
        Expr(Arc::new(Node::Captured(self)))
    }
}

impl IntoExpr for Value {
    fn into_expr(self) -> Expr {
        lit(self)
    }
}

macro_rules! literal_into_expr {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IntoExpr for $ty {
                fn into_expr(self) -> Expr {
                    lit(self)
                }
            }
        )*
    };
}

literal_into_expr!(bool, i32, i64, u32, f64, String, &str);

impl<T: Into<Value>> IntoExpr for Option<T> {
    fn into_expr(self) -> Expr {
        lit(self)
    }
}

/// Column on the query parameter.
pub fn col(name: impl Into<String>) -> Expr {
    Expr(Arc::new(Node::Column(name.into())))
}

/// Literal constant.
pub fn lit(value: impl Into<Value>) -> Expr {
    Expr(Arc::new(Node::Constant(value.into())))
}

/// The null literal.
pub fn null() -> Expr {
    lit(Value::Null)
}

/// Row-count literal for `Skip` and `Take`. Counts past `i64::MAX`
/// saturate; no result set can exceed that many rows.
pub fn row_count(n: u64) -> Expr {
    lit(i64::try_from(n).unwrap_or(i64::MAX))
}

/// Closed-over value, optionally read through a member chain.
pub fn captured(value: Captured) -> Expr {
    value.into_expr()
}

/// The three projection shapes `Select` accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// `m => m`
    Identity,
    /// `m => m.column`
    Column(String),
    /// `m => new { m.a, m.b }`
    Columns(Vec<String>),
}

impl Projection {
    pub fn column(name: impl Into<String>) -> Self {
        Projection::Column(name.into())
    }

    pub fn columns<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Projection::Columns(names.into_iter().map(Into::into).collect())
    }

    pub fn into_lambda(self) -> NodeRef {
        let body = match self {
            Projection::Identity => Arc::new(Node::Param(LAMBDA_PARAM.to_string())),
            Projection::Column(name) => col(name).into_node(),
            Projection::Columns(names) => Arc::new(Node::Construct(
                names.into_iter().map(|n| col(n).into_node()).collect(),
            )),
        };
        Node::lambda(LAMBDA_PARAM, body)
    }
}
