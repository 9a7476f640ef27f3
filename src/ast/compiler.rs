/// Query AST → parameterized SQL.
///
/// The converter walks a composed operator chain once, writing the WHERE
/// fragment into a buffer and collecting bound parameters in placeholder
/// order. Paging, ordering, projection and result mode are recorded in the
/// per-compile [`ConverterState`] and handed to the dialect, which assembles
/// the final statement. Null comparisons are emitted against a sentinel and
/// rewritten textually in a single finishing pass.
use std::fmt;

use tracing::debug;

use super::dialect::{Dialect, DialectConstants};
use super::types::*;
use crate::db::{ColumnKind, EntityMeta};
use crate::error::{Error, Result};

/// Ordering column (already quoted) and direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

/// Output of the tree walk, before statement assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    /// WHERE fragment, without the keyword. Empty when unfiltered.
    pub fragment: String,
    pub params: Vec<Value>,
    pub mode: ResultMode,
    /// Select list for `ResultMode::Project`.
    pub projection: Option<String>,
    pub skip: Option<u64>,
    pub take: Option<u64>,
    pub order: Option<OrderBy>,
}

/// A complete statement plus its parameters, ready to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Value>,
    pub mode: ResultMode,
    pub dialect: Dialect,
}

impl fmt::Display for CompiledQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

/// Mutable state for one compile. Created fresh per call and dropped after.
#[derive(Debug, Default)]
struct ConverterState {
    buf: String,
    params: Vec<Value>,
    /// Set once the first boolean node has been written; logical nodes
    /// nested after that point are parenthesized.
    bool_open: bool,
    /// Set once the first filter has been wrapped for chaining.
    chained: bool,
    skip: Option<u64>,
    take: Option<u64>,
    order: Option<OrderBy>,
    mode: ResultMode,
    projection: Option<String>,
}

impl ConverterState {
    fn into_translation(self, fragment: String) -> Translation {
        Translation {
            fragment,
            params: self.params,
            mode: self.mode,
            projection: self.projection,
            skip: self.skip,
            take: self.take,
            order: self.order,
        }
    }
}

/// Dialect-agnostic translator bound to one entity's column table.
pub struct Converter<'a> {
    dialect: Dialect,
    entity: &'a EntityMeta,
}

impl<'a> Converter<'a> {
    pub fn new(dialect: Dialect, entity: &'a EntityMeta) -> Self {
        Self { dialect, entity }
    }

    fn constants(&self) -> &'static DialectConstants {
        self.dialect.constants()
    }

    /// Walk a query chain into a fragment plus paging/ordering/mode state.
    pub fn translate(&self, root: &Node) -> Result<Translation> {
        let mut state = ConverterState::default();
        self.visit(root, &mut state)?;
        let fragment = self.finish(&state.buf);
        Ok(state.into_translation(fragment))
    }

    /// Translate a bare predicate for use in an UPDATE/DELETE WHERE clause.
    /// `bound` holds values already placed in the statement; placeholder
    /// numbering continues after them.
    pub fn translate_filter(&self, predicate: &Node, bound: Vec<Value>) -> Result<Translation> {
        let mut state = ConverterState {
            params: bound.into_iter().map(|v| self.dialect.param(v)).collect(),
            ..ConverterState::default()
        };
        self.clause(predicate, &mut state)?;
        let fragment = self.finish(&state.buf);
        Ok(state.into_translation(fragment))
    }

    /// Translate and assemble a full SELECT statement.
    pub fn compile(&self, root: &Node) -> Result<CompiledQuery> {
        let translation = self.translate(root)?;
        let query = self.dialect.render_select(self.entity, translation)?;
        debug!(
            dialect = %self.dialect,
            params = query.params.len(),
            sql = %query.sql,
            "compiled query"
        );
        Ok(query)
    }

    fn visit(&self, node: &Node, state: &mut ConverterState) -> Result<()> {
        match node {
            Node::Source => Ok(()),
            Node::Constant(value) => self.value(value.clone(), state),
            Node::Column(name) => {
                let column = self.column(name)?;
                state.buf.push_str(&column);
                Ok(())
            }
            Node::Captured(captured) => self.value(captured.evaluate()?, state),
            Node::Binary { op, left, right } => self.binary(*op, left, right, state),
            Node::Unary { op, operand } => self.unary(*op, operand, state),
            Node::Call { op, args } => self.call(*op, args, state),
            Node::Lambda { body, .. } => self.visit(body, state),
            Node::Param(_) => Err(Error::shape("lambda parameter used outside a projection")),
            Node::Construct(_) => Err(Error::shape("constructed object used outside a projection")),
        }
    }

    /// Visit a node that must produce a boolean predicate.
    fn predicate(&self, node: &Node, state: &mut ConverterState) -> Result<()> {
        match node {
            Node::Lambda { body, .. } => self.predicate(body, state),
            Node::Unary {
                op: UnaryOperator::Convert,
                operand,
            } => self.predicate(operand, state),
            Node::Column(name) if self.is_bool_column(name) => {
                self.bool_comparison(name, true, state)
            }
            Node::Constant(Value::Bool(b)) => {
                self.always(*b, state);
                Ok(())
            }
            Node::Captured(captured) => match captured.evaluate()? {
                Value::Bool(b) => {
                    self.always(b, state);
                    Ok(())
                }
                other => self.value(other, state),
            },
            _ => self.visit(node, state),
        }
    }

    /// Emit one filter clause. The context is reset so the clause's own top
    /// level is written bare.
    fn clause(&self, predicate: &Node, state: &mut ConverterState) -> Result<()> {
        state.bool_open = false;
        self.predicate(predicate, state)?;
        state.bool_open = true;
        Ok(())
    }

    fn binary(
        &self,
        op: BinaryOperator,
        left: &NodeRef,
        right: &NodeRef,
        state: &mut ConverterState,
    ) -> Result<()> {
        let (left, right) = if op.is_equality() && self.is_null(left)? && !self.is_null(right)? {
            (right, left)
        } else {
            (left, right)
        };

        let c = self.constants();
        let token = match op {
            BinaryOperator::Eq => c.eq,
            BinaryOperator::NotEq => c.not_eq,
            BinaryOperator::Lt => c.lt,
            BinaryOperator::LtEq => c.lt_eq,
            BinaryOperator::Gt => c.gt,
            BinaryOperator::GtEq => c.gt_eq,
            BinaryOperator::And => c.and,
            BinaryOperator::Or => c.or,
        };

        let wrap = op.is_logical() && state.bool_open;
        state.bool_open = true;
        if wrap {
            state.buf.push('(');
        }
        if op.is_logical() {
            self.predicate(left, state)?;
            state.buf.push_str(token);
            self.predicate(right, state)?;
        } else {
            self.visit(left, state)?;
            state.buf.push_str(token);
            self.visit(right, state)?;
        }
        if wrap {
            state.buf.push(')');
        }
        Ok(())
    }

    fn unary(
        &self,
        op: UnaryOperator,
        operand: &NodeRef,
        state: &mut ConverterState,
    ) -> Result<()> {
        match op {
            UnaryOperator::Not => match operand.as_ref() {
                Node::Column(name) if self.is_bool_column(name) => {
                    self.bool_comparison(name, false, state)
                }
                _ => {
                    state.buf.push_str("NOT (");
                    state.bool_open = false;
                    self.predicate(operand, state)?;
                    state.bool_open = true;
                    state.buf.push(')');
                    Ok(())
                }
            },
            UnaryOperator::Convert => match operand.as_ref() {
                Node::Constant(value) => self.value(value.clone(), state),
                Node::Captured(captured) => self.value(captured.evaluate()?, state),
                _ => self.visit(operand, state),
            },
        }
    }

    fn call(&self, op: Operator, args: &[NodeRef], state: &mut ConverterState) -> Result<()> {
        match op {
            Operator::Where => self.filter(op, args, state),
            Operator::First
            | Operator::FirstOrDefault
            | Operator::Single
            | Operator::SingleOrDefault => {
                self.filter(op, args, state)?;
                state.take = Some(1);
                Ok(())
            }
            Operator::Take => {
                self.source(op, args, state)?;
                state.take = Some(self.row_count(op, args)?);
                Ok(())
            }
            Operator::Skip => {
                self.source(op, args, state)?;
                state.skip = Some(self.row_count(op, args)?);
                Ok(())
            }
            Operator::OrderBy | Operator::OrderByDescending => {
                self.source(op, args, state)?;
                let selector = args
                    .get(1)
                    .ok_or_else(|| Error::shape(format!("{} without a key selector", op)))?;
                state.order = Some(OrderBy {
                    column: self.member(selector)?,
                    descending: op == Operator::OrderByDescending,
                });
                Ok(())
            }
            Operator::Any => {
                self.filter(op, args, state)?;
                state.mode = ResultMode::Any;
                state.take = Some(1);
                Ok(())
            }
            Operator::Count => {
                self.filter(op, args, state)?;
                state.mode = ResultMode::Count;
                Ok(())
            }
            Operator::Select => {
                self.source(op, args, state)?;
                let selector = args
                    .get(1)
                    .ok_or_else(|| Error::shape("Select without a projection"))?;
                state.projection = Some(self.projection(selector)?);
                state.mode = ResultMode::Project;
                Ok(())
            }
            Operator::Contains => self.contains(args, state),
        }
    }

    fn source(&self, op: Operator, args: &[NodeRef], state: &mut ConverterState) -> Result<()> {
        let source = args
            .first()
            .ok_or_else(|| Error::shape(format!("{} without a source", op)))?;
        self.visit(source, state)
    }

    /// Compile the source, then append the optional predicate: bare when it
    /// is the first filter, `(p1) AND (p2)` once filters are chained.
    fn filter(&self, op: Operator, args: &[NodeRef], state: &mut ConverterState) -> Result<()> {
        self.source(op, args, state)?;
        let Some(predicate) = args.get(1) else {
            return Ok(());
        };

        if state.buf.is_empty() {
            return self.clause(predicate, state);
        }
        if !state.chained {
            state.buf = format!("({})", state.buf);
            state.chained = true;
        }
        state.buf.push_str(self.constants().and);
        state.buf.push('(');
        self.clause(predicate, state)?;
        state.buf.push(')');
        Ok(())
    }

    fn row_count(&self, op: Operator, args: &[NodeRef]) -> Result<u64> {
        match args.get(1).map(|a| a.as_ref()) {
            Some(Node::Constant(Value::Int(n))) if *n >= 0 => Ok(*n as u64),
            _ => Err(Error::shape(format!(
                "{} expects a non-negative integer constant",
                op
            ))),
        }
    }

    fn projection(&self, selector: &Node) -> Result<String> {
        let (param, body) = match selector {
            Node::Lambda { param, body } => (Some(param.as_str()), body.as_ref()),
            other => (None, other),
        };
        match body {
            Node::Param(name) if param.map_or(true, |p| p == name.as_str()) => Ok("*".to_string()),
            Node::Construct(members) if members.is_empty() => Ok("0".to_string()),
            Node::Construct(members) => {
                let columns = members
                    .iter()
                    .map(|m| self.member(m))
                    .collect::<Result<Vec<_>>>()?;
                Ok(columns.join(", "))
            }
            Node::Column(_) | Node::Unary { .. } => self.member(body),
            _ => Err(Error::shape(
                "Select supports the parameter, a member, or an object of members",
            )),
        }
    }

    /// Resolve a key selector or projection member to a quoted column.
    fn member(&self, node: &Node) -> Result<String> {
        match node {
            Node::Lambda { body, .. } => self.member(body),
            Node::Unary {
                op: UnaryOperator::Convert,
                operand,
            } => self.member(operand),
            Node::Column(name) => self.column(name),
            _ => Err(Error::shape("expected a member access on the query parameter")),
        }
    }

    /// `item IN (@p0, @p1, ...)` over a collection known at compile time.
    fn contains(&self, args: &[NodeRef], state: &mut ConverterState) -> Result<()> {
        let [collection, item] = args else {
            return Err(Error::shape("Contains expects a collection and an item"));
        };

        let values = match collection.as_ref() {
            Node::Captured(captured) => captured.evaluate()?,
            Node::Constant(value) => value.clone(),
            _ => {
                return Err(Error::shape(
                    "Contains needs a collection evaluable at compile time",
                ))
            }
        };
        let items = match values {
            Value::List(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(Error::shape(format!(
                    "Contains over a {} value",
                    other.type_name()
                )))
            }
        };

        state.bool_open = true;
        if items.is_empty() {
            self.always(false, state);
            return Ok(());
        }

        let column = self.member(item)?;
        state.buf.push_str(&column);
        state.buf.push_str(" IN (");
        for (i, value) in items.into_iter().enumerate() {
            if i > 0 {
                state.buf.push_str(", ");
            }
            self.value(value, state)?;
        }
        state.buf.push(')');
        Ok(())
    }

    fn value(&self, value: Value, state: &mut ConverterState) -> Result<()> {
        match value {
            Value::Null => {
                state.buf.push_str(self.constants().null_sentinel);
                Ok(())
            }
            Value::List(_) | Value::Record(_) => Err(Error::shape(format!(
                "{} value used as a scalar operand",
                value.type_name()
            ))),
            other => {
                self.bind(other, state);
                Ok(())
            }
        }
    }

    fn bind(&self, value: Value, state: &mut ConverterState) {
        let placeholder = self.dialect.placeholder(state.params.len());
        state.params.push(self.dialect.param(value));
        state.buf.push_str(&placeholder);
    }

    fn always(&self, truth: bool, state: &mut ConverterState) {
        let c = self.constants();
        state.buf.push_str(if truth { c.always_true } else { c.always_false });
        state.bool_open = true;
    }

    fn bool_comparison(&self, name: &str, truth: bool, state: &mut ConverterState) -> Result<()> {
        let column = self.column(name)?;
        state.buf.push_str(&column);
        state.buf.push_str(self.constants().eq);
        self.bind(self.dialect.bool_value(truth), state);
        state.bool_open = true;
        Ok(())
    }

    /// Quoted column for a column or field name. Entities declared without
    /// columns accept any name.
    fn column(&self, name: &str) -> Result<String> {
        if self.entity.columns().is_empty() {
            return Ok(self.dialect.quote(name));
        }
        self.entity
            .find(name)
            .map(|c| self.dialect.quote(&c.name))
            .ok_or_else(|| Error::UnknownColumn {
                table: self.entity.table().to_string(),
                column: name.to_string(),
            })
    }

    fn is_bool_column(&self, name: &str) -> bool {
        self.entity
            .find(name)
            .is_some_and(|c| c.kind == ColumnKind::Bool)
    }

    fn is_null(&self, node: &Node) -> Result<bool> {
        Ok(match node {
            Node::Constant(value) => value.is_null(),
            Node::Captured(captured) => captured.evaluate()?.is_null(),
            Node::Unary {
                op: UnaryOperator::Convert,
                operand,
            } => self.is_null(operand)?,
            _ => false,
        })
    }

    /// Rewrite sentinel comparisons into SQL null tests.
    fn finish(&self, fragment: &str) -> String {
        let c = self.constants();
        let is_null = format!("{}{}", c.eq, c.null_sentinel);
        let not_null = format!("{}{}", c.not_eq, c.null_sentinel);

        let sql = fragment.replace(&is_null, " IS NULL");
        let sql = rewrite_negated_groups(&sql, c);
        let sql = sql.replace(&not_null, " IS NOT NULL");
        sql.replace(c.null_sentinel, c.null_literal)
    }
}

/// `(<operand> <> <NULL>)` → `NOT (<operand> IS NULL)`, for groups holding
/// a single comparison that are not already negated.
fn rewrite_negated_groups(sql: &str, c: &DialectConstants) -> String {
    let tail = format!("{}{})", c.not_eq, c.null_sentinel);
    let tokens = [c.eq, c.not_eq, c.lt, c.lt_eq, c.gt, c.gt_eq, c.and, c.or];

    let group_start = |before: &str| -> Option<usize> {
        let idx = before.rfind(|ch: char| ch == '(' || ch == ')')?;
        let operand = &before[idx + 1..];
        let simple = before[idx..].starts_with('(')
            && !tokens.iter().any(|t| operand.contains(t))
            && !before[..idx].ends_with("NOT ");
        simple.then_some(idx)
    };

    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find(&tail) {
        let before = &rest[..pos];
        match group_start(before) {
            Some(open) => {
                out.push_str(&before[..open]);
                out.push_str("NOT (");
                out.push_str(&before[open + 1..]);
                out.push_str(" IS NULL)");
            }
            None => out.push_str(&rest[..pos + tail.len()]),
        }
        rest = &rest[pos + tail.len()..];
    }
    out.push_str(rest);
    out
}
