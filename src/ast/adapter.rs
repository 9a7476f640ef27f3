/// SQL predicate text → query expression.
///
/// Parses a boolean SQL expression with `sqlparser` and lowers it onto the
/// [`Expr`] algebra, so filters can be written as text (CLI, config) and
/// still go through the converter with bound parameters. Only the shapes
/// the converter understands are accepted: columns, literals, comparisons,
/// `AND`/`OR`/`NOT`, `IS [NOT] NULL` and `IN (...)` over literals.
use sqlparser::ast as sp;
use sqlparser::dialect::{Dialect as SqlDialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::parser::Parser as SqlParser;

use super::builder::{col, lit, null, Expr};
use super::dialect::Dialect;
use super::types::{Captured, Value};
use crate::error::{Error, Result};

/// Parses predicate text written in one dialect's identifier quoting.
pub struct SqlPredicateAdapter {
    dialect: Box<dyn SqlDialect>,
}

impl SqlPredicateAdapter {
    pub fn new(dialect: Dialect) -> Self {
        let dialect: Box<dyn SqlDialect> = match dialect {
            Dialect::SqlServer | Dialect::SqlServerLegacy => Box::new(MsSqlDialect {}),
            Dialect::Postgres => Box::new(PostgreSqlDialect {}),
            Dialect::MySql => Box::new(MySqlDialect {}),
        };
        Self { dialect }
    }

    /// Parse `text` as a WHERE-clause predicate.
    pub fn parse(&self, text: &str) -> Result<Expr> {
        let sql = format!("SELECT * FROM t WHERE {}", text);
        let mut statements = SqlParser::parse_sql(self.dialect.as_ref(), &sql)
            .map_err(|e| Error::shape(format!("cannot parse predicate `{}`: {}", text, e)))?;
        if statements.len() != 1 {
            return Err(Error::shape(format!(
                "expected one predicate, found {} statements",
                statements.len()
            )));
        }

        let query = match statements.remove(0) {
            sp::Statement::Query(query) => query,
            other => return Err(Error::shape(format!("not a predicate: {}", other))),
        };
        if query.order_by.is_some() || query.limit.is_some() || query.offset.is_some() {
            return Err(Error::shape(format!(
                "predicate `{}` carries ordering or paging clauses",
                text
            )));
        }
        let select = match *query.body {
            sp::SetExpr::Select(select) => select,
            other => return Err(Error::shape(format!("not a predicate: {}", other))),
        };
        let grouped = match &select.group_by {
            sp::GroupByExpr::Expressions(exprs, _) => !exprs.is_empty(),
            sp::GroupByExpr::All(_) => true,
        };
        if grouped || select.having.is_some() {
            return Err(Error::shape(format!(
                "predicate `{}` carries grouping clauses",
                text
            )));
        }

        let selection = select
            .selection
            .ok_or_else(|| Error::shape("empty predicate"))?;
        lower(selection)
    }
}

fn lower(expr: sp::Expr) -> Result<Expr> {
    match expr {
        sp::Expr::Identifier(ident) => Ok(col(ident.value)),
        // `m.age` and `t.age` both name the column `age`.
        sp::Expr::CompoundIdentifier(mut parts) => match parts.pop() {
            Some(ident) => Ok(col(ident.value)),
            None => Err(Error::shape("empty identifier")),
        },
        sp::Expr::Value(value) => Ok(lit(lower_value(value)?)),
        sp::Expr::Nested(inner) => lower(*inner),
        sp::Expr::BinaryOp { left, op, right } => {
            let left = lower(*left)?;
            let right = lower(*right)?;
            match op {
                sp::BinaryOperator::Eq => Ok(left.eq(right)),
                sp::BinaryOperator::NotEq => Ok(left.ne(right)),
                sp::BinaryOperator::Lt => Ok(left.lt(right)),
                sp::BinaryOperator::LtEq => Ok(left.le(right)),
                sp::BinaryOperator::Gt => Ok(left.gt(right)),
                sp::BinaryOperator::GtEq => Ok(left.ge(right)),
                sp::BinaryOperator::And => Ok(left.and(right)),
                sp::BinaryOperator::Or => Ok(left.or(right)),
                other => Err(Error::shape(format!("binary operator {}", other))),
            }
        }
        sp::Expr::UnaryOp { op, expr } => match (op, *expr) {
            (sp::UnaryOperator::Not, inner) => Ok(!lower(inner)?),
            (sp::UnaryOperator::Minus, sp::Expr::Value(sp::Value::Number(n, _))) => {
                Ok(lit(parse_number(&format!("-{}", n))?))
            }
            (op, _) => Err(Error::shape(format!("unary operator {}", op))),
        },
        sp::Expr::IsNull(inner) => Ok(lower(*inner)?.eq(null())),
        sp::Expr::IsNotNull(inner) => Ok(lower(*inner)?.ne(null())),
        sp::Expr::IsTrue(inner) => Ok(lower(*inner)?.eq(true)),
        sp::Expr::IsFalse(inner) => Ok(lower(*inner)?.eq(false)),
        sp::Expr::InList {
            expr,
            list,
            negated,
        } => {
            let values = list
                .into_iter()
                .map(|item| match item {
                    sp::Expr::Value(v) => lower_value(v),
                    sp::Expr::UnaryOp {
                        op: sp::UnaryOperator::Minus,
                        expr,
                    } => match *expr {
                        sp::Expr::Value(sp::Value::Number(n, _)) => {
                            parse_number(&format!("-{}", n))
                        }
                        other => Err(Error::shape(format!("IN list item -{}", other))),
                    },
                    other => Err(Error::shape(format!("IN list item {}", other))),
                })
                .collect::<Result<Vec<_>>>()?;
            let contains = lower(*expr)?.is_in(Captured::new(Value::List(values)));
            Ok(if negated { !contains } else { contains })
        }
        other => Err(Error::shape(format!("expression {}", other))),
    }
}

fn lower_value(value: sp::Value) -> Result<Value> {
    match value {
        sp::Value::Null => Ok(Value::Null),
        sp::Value::Boolean(b) => Ok(Value::Bool(b)),
        sp::Value::Number(n, _) => parse_number(&n),
        sp::Value::SingleQuotedString(s)
        | sp::Value::NationalStringLiteral(s)
        | sp::Value::EscapedStringLiteral(s) => Ok(Value::Text(s)),
        other => Err(Error::shape(format!("literal {}", other))),
    }
}

fn parse_number(n: &str) -> Result<Value> {
    if let Ok(i) = n.parse::<i64>() {
        Ok(Value::Int(i))
    } else if let Ok(f) = n.parse::<f64>() {
        Ok(Value::Float(f))
    } else {
        Err(Error::shape(format!("number {}", n)))
    }
}
