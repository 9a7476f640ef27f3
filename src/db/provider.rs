//! Connection providers and the execution provider.
//!
//! [`ProviderRegistry`] resolves a configured provider name to a connection
//! factory. [`QueryProvider`] owns one connection and performs the round
//! trip for compiled queries: lock, open if closed, execute, materialize.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use tracing::debug;

use super::connection::{Connection, ConnectionConfig, PgConnection};
use super::query::QueryResult;
use super::schema::EntityMeta;
use crate::ast::{CompiledQuery, Converter, Dialect, Node, Value};
use crate::error::{Error, Result};

/// Builds a connection from a saved configuration.
pub type ConnectionFactory = fn(&ConnectionConfig) -> Result<Box<dyn Connection>>;

/// Provider name → connection factory.
pub struct ProviderRegistry {
    factories: HashMap<String, ConnectionFactory>,
}

impl ProviderRegistry {
    /// A registry with no providers.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, factory: ConnectionFactory) {
        self.factories.insert(name.to_ascii_lowercase(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_ascii_lowercase())
    }

    /// Create an unopened connection for `config.provider`.
    pub fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let factory = self
            .factories
            .get(&config.provider.to_ascii_lowercase())
            .ok_or_else(|| Error::ProviderNotFound(config.provider.clone()))?;
        factory(config)
    }
}

impl Default for ProviderRegistry {
    /// PostgreSQL under its common provider names.
    fn default() -> Self {
        let mut registry = Self::empty();
        for name in ["postgres", "postgresql", "pg", "npgsql"] {
            registry.register(name, postgres_factory);
        }
        registry
    }
}

fn postgres_factory(config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
    Ok(Box::new(PgConnection::new(config.clone())?))
}

/// Compiles and executes queries on a single connection.
pub struct QueryProvider {
    connection: Mutex<Box<dyn Connection>>,
    dialect: Dialect,
}

impl QueryProvider {
    pub fn new(connection: Box<dyn Connection>) -> Self {
        let dialect = connection.dialect();
        Self {
            connection: Mutex::new(connection),
            dialect,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Compile a query chain for `entity` with this connection's dialect.
    pub fn compile(&self, entity: &EntityMeta, root: &Node) -> Result<CompiledQuery> {
        Converter::new(self.dialect, entity).compile(root)
    }

    /// Lock the connection, opening it first if it is closed.
    fn acquire(&self) -> Result<MutexGuard<'_, Box<dyn Connection>>> {
        let mut conn = self.connection.lock().map_err(|_| Error::LockPoisoned)?;
        if !conn.is_open() {
            conn.open()?;
        }
        Ok(conn)
    }

    /// Execute a compiled query.
    pub fn run(&self, query: &CompiledQuery) -> Result<QueryResult> {
        self.execute(&query.sql, &query.params)
    }

    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        debug!(sql, params = params.len(), "executing");
        let mut conn = self.acquire()?;
        let result = conn.execute(sql, params)?;
        debug!(rows = result.row_count(), "executed");
        Ok(result)
    }

    pub fn execute_non_query(&self, sql: &str, params: &[Value]) -> Result<u64> {
        debug!(sql, params = params.len(), "executing");
        let mut conn = self.acquire()?;
        let affected = conn.execute_non_query(sql, params)?;
        debug!(affected, "executed");
        Ok(affected)
    }

    /// Execute and materialize every row.
    pub fn fetch<R: DeserializeOwned>(
        &self,
        entity: &EntityMeta,
        query: &CompiledQuery,
    ) -> Result<Vec<R>> {
        let result = self.run(query)?;
        materialize(entity, &result)
    }

    /// Execute and decode the first column of the first row.
    pub fn scalar(&self, query: &CompiledQuery) -> Result<Value> {
        let result = self.run(query)?;
        Ok(result.scalar().cloned().unwrap_or(Value::Null))
    }

    pub fn close(&self) -> Result<()> {
        let mut conn = self.connection.lock().map_err(|_| Error::LockPoisoned)?;
        if conn.is_open() {
            conn.close()?;
        }
        Ok(())
    }
}

/// Materialize rows through the entity's column-to-field mapping. A row
/// with a single column that does not decode as an object decodes as the
/// bare cell, for single-member projections.
pub(crate) fn materialize<R: DeserializeOwned>(
    entity: &EntityMeta,
    result: &QueryResult,
) -> Result<Vec<R>> {
    let single = result.columns.len() == 1;
    result
        .records(entity)
        .into_iter()
        .zip(&result.rows)
        .map(|(record, row)| -> Result<R> {
            match serde_json::from_value(serde_json::Value::Object(record)) {
                Ok(value) => Ok(value),
                Err(_) if single => Ok(serde_json::from_value(row[0].to_json())?),
                Err(e) => Err(e.into()),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{users, RecordingConnection, User};

    #[test]
    fn test_registry_resolves_postgres_aliases() {
        let registry = ProviderRegistry::default();
        assert!(registry.contains("PostgreSQL"));
        assert!(registry.contains("npgsql"));

        let config = ConnectionConfig::default();
        let conn = registry.connect(&config).unwrap();
        assert_eq!(conn.dialect(), Dialect::Postgres);
        assert!(!conn.is_open());
    }

    #[test]
    fn test_registry_unknown_provider() {
        let config = ConnectionConfig {
            provider: "oracle".to_string(),
            ..ConnectionConfig::default()
        };
        match ProviderRegistry::default().connect(&config) {
            Err(Error::ProviderNotFound(name)) => assert_eq!(name, "oracle"),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("expected ProviderNotFound"),
        }
    }

    #[test]
    fn test_registry_custom_factory() {
        fn recording(_: &ConnectionConfig) -> Result<Box<dyn Connection>> {
            Ok(Box::new(RecordingConnection::new(Dialect::MySql).0))
        }
        let mut registry = ProviderRegistry::empty();
        registry.register("MySql", recording);
        let config = ConnectionConfig {
            provider: "mysql".to_string(),
            ..ConnectionConfig::default()
        };
        assert_eq!(registry.connect(&config).unwrap().dialect(), Dialect::MySql);
    }

    #[test]
    fn test_run_opens_lazily_once() {
        let (conn, log) = RecordingConnection::new(Dialect::SqlServer);
        let provider = QueryProvider::new(Box::new(conn));
        assert_eq!(log.lock().unwrap().opens, 0);

        provider.execute("SELECT 1", &[]).unwrap();
        provider.execute("SELECT 2", &[]).unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.opens, 1);
        assert_eq!(log.statements.len(), 2);
    }

    #[test]
    fn test_fetch_materializes_entities() {
        let rows = QueryResult::from_rows(
            &["id", "name", "email", "age", "active"],
            vec![vec![
                Value::Int(1),
                Value::from("ann"),
                Value::Null,
                Value::Int(30),
                Value::Bool(true),
            ]],
        );
        let (conn, _log) = RecordingConnection::new(Dialect::Postgres);
        let provider = QueryProvider::new(Box::new(conn.with_result(rows)));
        let query = provider.compile(users(), &Node::Source).unwrap();
        let fetched: Vec<User> = provider.fetch(users(), &query).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].name, "ann");
        assert_eq!(fetched[0].email, None);
    }

    #[test]
    fn test_single_column_rows_decode_as_cells() {
        let rows = QueryResult::from_rows(&["name"], vec![vec![Value::from("ann")]]);
        let names: Vec<String> = materialize(users(), &rows).unwrap();
        assert_eq!(names, vec!["ann".to_string()]);
    }

    #[test]
    fn test_scalar_of_empty_result_is_null() {
        let (conn, _log) = RecordingConnection::new(Dialect::Postgres);
        let provider = QueryProvider::new(Box::new(conn));
        let query = provider.compile(users(), &Node::Source).unwrap();
        assert_eq!(provider.scalar(&query).unwrap(), Value::Null);
    }

    #[test]
    fn test_close_only_when_open() {
        let (conn, log) = RecordingConnection::new(Dialect::Postgres);
        let provider = QueryProvider::new(Box::new(conn));
        provider.close().unwrap();
        assert_eq!(log.lock().unwrap().closes, 0);
        provider.execute("SELECT 1", &[]).unwrap();
        provider.close().unwrap();
        assert_eq!(log.lock().unwrap().closes, 1);
    }
}
