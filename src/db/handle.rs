use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use super::provider::QueryProvider;
use super::schema::EntityMeta;
use crate::ast::{row_count, CompiledQuery, Expr, Node, NodeRef, Operator, Projection, Value};
use crate::error::{Error, Result};

/// A deferred query over one entity table.
///
/// Composition methods return a new handle whose tree extends this one;
/// nothing runs until a terminal method (`to_vec`, `first`, `count`, ...)
/// compiles the tree and performs exactly one round trip. `build` and
/// `build_terminal` expose the compile step without executing.
pub struct QueryHandle<T> {
    root: NodeRef,
    provider: Arc<QueryProvider>,
    entity: &'static EntityMeta,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for QueryHandle<T> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            provider: self.provider.clone(),
            entity: self.entity,
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for QueryHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("table", &self.entity.table())
            .field("root", &self.root)
            .finish()
    }
}

impl<T> QueryHandle<T> {
    pub fn new(provider: Arc<QueryProvider>, entity: &'static EntityMeta) -> Self {
        Self::from_root(Arc::new(Node::Source), provider, entity)
    }

    fn from_root(root: NodeRef, provider: Arc<QueryProvider>, entity: &'static EntityMeta) -> Self {
        Self {
            root,
            provider,
            entity,
            _marker: PhantomData,
        }
    }

    pub fn root(&self) -> &NodeRef {
        &self.root
    }

    fn chain<R>(&self, op: Operator, arg: NodeRef) -> QueryHandle<R> {
        let root = Node::call(op, vec![self.root.clone(), arg]);
        QueryHandle::from_root(root, self.provider.clone(), self.entity)
    }

    /// `Where`: keep rows matching `predicate`. Repeated filters combine
    /// with AND.
    pub fn filter(&self, predicate: Expr) -> Self {
        self.chain(Operator::Where, predicate.into_lambda())
    }

    pub fn order_by(&self, column: &str) -> Self {
        self.chain(Operator::OrderBy, crate::ast::col(column).into_lambda())
    }

    pub fn order_by_desc(&self, column: &str) -> Self {
        self.chain(
            Operator::OrderByDescending,
            crate::ast::col(column).into_lambda(),
        )
    }

    pub fn skip(&self, n: u64) -> Self {
        self.chain(Operator::Skip, row_count(n).into_node())
    }

    pub fn take(&self, n: u64) -> Self {
        self.chain(Operator::Take, row_count(n).into_node())
    }

    /// Project each row; `R` receives the projected columns.
    pub fn select<R>(&self, projection: Projection) -> QueryHandle<R> {
        self.chain(Operator::Select, projection.into_lambda())
    }

    /// Compile the composed tree without executing it.
    pub fn build(&self) -> Result<CompiledQuery> {
        self.provider.compile(self.entity, &self.root)
    }

    /// Compile the tree closed by a terminal operator, with an optional
    /// predicate.
    pub fn build_terminal(&self, op: Operator, predicate: Option<Expr>) -> Result<CompiledQuery> {
        let mut args = vec![self.root.clone()];
        args.extend(predicate.map(Expr::into_lambda));
        self.provider.compile(self.entity, &Node::call(op, args))
    }

    /// Number of matching rows.
    pub fn count(&self) -> Result<i64> {
        self.count_inner(None)
    }

    pub fn count_where(&self, predicate: Expr) -> Result<i64> {
        self.count_inner(Some(predicate))
    }

    fn count_inner(&self, predicate: Option<Expr>) -> Result<i64> {
        let query = self.build_terminal(Operator::Count, predicate)?;
        match self.provider.scalar(&query)? {
            Value::Null => Ok(0),
            other => other
                .as_i64()
                .ok_or_else(|| Error::DataAccess(format!("count returned {}", other))),
        }
    }

    /// Whether any row matches.
    pub fn any(&self) -> Result<bool> {
        self.any_inner(None)
    }

    pub fn any_where(&self, predicate: Expr) -> Result<bool> {
        self.any_inner(Some(predicate))
    }

    fn any_inner(&self, predicate: Option<Expr>) -> Result<bool> {
        let query = self.build_terminal(Operator::Any, predicate)?;
        Ok(self.provider.run(&query)?.row_count() > 0)
    }
}

impl<T: DeserializeOwned> QueryHandle<T> {
    /// Execute and materialize every row.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let query = self.build()?;
        self.provider.fetch(self.entity, &query)
    }

    fn one(&self, op: Operator, predicate: Option<Expr>) -> Result<Option<T>> {
        let query = self.build_terminal(op, predicate)?;
        let rows: Vec<T> = self.provider.fetch(self.entity, &query)?;
        Ok(rows.into_iter().next())
    }

    pub fn first(&self) -> Result<T> {
        self.one(Operator::First, None)?.ok_or(Error::NoRows)
    }

    pub fn first_where(&self, predicate: Expr) -> Result<T> {
        self.one(Operator::First, Some(predicate))?.ok_or(Error::NoRows)
    }

    pub fn first_or_default(&self) -> Result<Option<T>> {
        self.one(Operator::FirstOrDefault, None)
    }

    pub fn first_or_default_where(&self, predicate: Expr) -> Result<Option<T>> {
        self.one(Operator::FirstOrDefault, Some(predicate))
    }

    pub fn single(&self) -> Result<T> {
        self.one(Operator::Single, None)?.ok_or(Error::NoRows)
    }

    pub fn single_where(&self, predicate: Expr) -> Result<T> {
        self.one(Operator::Single, Some(predicate))?.ok_or(Error::NoRows)
    }

    pub fn single_or_default(&self) -> Result<Option<T>> {
        self.one(Operator::SingleOrDefault, None)
    }

    pub fn single_or_default_where(&self, predicate: Expr) -> Result<Option<T>> {
        self.one(Operator::SingleOrDefault, Some(predicate))
    }
}
