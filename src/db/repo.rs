use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value as Json;
use tracing::{debug, warn};

use super::connection::{Connection, ConnectionConfig};
use super::handle::QueryHandle;
use super::provider::{materialize, ProviderRegistry, QueryProvider};
use super::schema::{to_record, ColumnMeta, Entity};
use crate::ast::{Converter, Dialect, Expr, Value};
use crate::error::{Error, Result};

/// Typed CRUD access to one entity table over a single connection.
///
/// The connection opens on first use and closes when the repository is
/// dropped. Query handles created by [`Repository::query`] share the same
/// provider.
pub struct Repository<T: Entity> {
    provider: Arc<QueryProvider>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> Repository<T> {
    /// Resolve `config.provider` through `registry` and wrap the resulting
    /// (unopened) connection.
    pub fn open(config: &ConnectionConfig, registry: &ProviderRegistry) -> Result<Self> {
        Ok(Self::new(registry.connect(config)?))
    }

    pub fn new(connection: Box<dyn Connection>) -> Self {
        Self {
            provider: Arc::new(QueryProvider::new(connection)),
            _marker: PhantomData,
        }
    }

    pub fn provider(&self) -> &Arc<QueryProvider> {
        &self.provider
    }

    /// A fresh deferred query over the whole table.
    pub fn query(&self) -> QueryHandle<T> {
        QueryHandle::new(self.provider.clone(), T::meta())
    }

    /// Fetch by primary key. A null key or the integer `0` never matches.
    pub fn get(&self, key: impl Into<Value>) -> Result<Option<T>> {
        let meta = T::meta();
        let key_column = meta.require_key()?;
        let key = key.into();
        if matches!(key, Value::Null | Value::Int(0)) {
            return Ok(None);
        }

        let dialect = self.provider.dialect();
        let sql = dialect.select_by_key(meta.table(), &key_column.name);
        let result = self.provider.execute(&sql, &[dialect.param(key)])?;
        Ok(materialize::<T>(meta, &result)?.into_iter().next())
    }

    /// Insert `entity`. An auto-increment key is left to the database and
    /// the generated value is written back into `entity`.
    pub fn add(&self, entity: &mut T) -> Result<()> {
        let meta = T::meta();
        let mut record = to_record(entity)?;
        let generated = meta.key_column().filter(|k| k.is_auto_increment);

        let columns: Vec<&ColumnMeta> = meta
            .columns()
            .iter()
            .filter(|c| !(c.is_key && c.is_auto_increment))
            .collect();
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        let dialect = self.provider.dialect();
        let values = field_values(dialect, &columns, &record)?;

        let Some(key) = generated else {
            let sql = dialect.insert_statement(meta.table(), &names, None);
            self.provider.execute_non_query(&sql, &values)?;
            return Ok(());
        };

        let sql = dialect.insert_statement(meta.table(), &names, Some(&key.name));
        let result = self.provider.execute(&sql, &values)?;
        let id = result.scalar().and_then(Value::as_i64).ok_or_else(|| {
            Error::DataAccess(format!(
                "insert into `{}` did not return a generated key",
                meta.table()
            ))
        })?;
        debug!(table = meta.table(), id, "inserted");

        record.insert(key.field.clone(), Json::from(id));
        *entity = serde_json::from_value(Json::Object(record))?;
        Ok(())
    }

    /// Write every non-key column of `entity`, matched on its key.
    pub fn update(&self, entity: &T) -> Result<u64> {
        let meta = T::meta();
        let key = meta.require_key()?;
        let record = to_record(entity)?;

        let columns: Vec<&ColumnMeta> = meta.columns().iter().filter(|c| !c.is_key).collect();
        if columns.is_empty() {
            return Ok(0);
        }
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        let dialect = self.provider.dialect();
        let mut values = field_values(dialect, &columns, &record)?;
        values.push(field_value(dialect, key, &record)?);

        let sql = dialect.update_by_key(meta.table(), &names, &key.name);
        self.provider.execute_non_query(&sql, &values)
    }

    /// Delete the row matching `entity`'s key.
    pub fn remove(&self, entity: &T) -> Result<u64> {
        let meta = T::meta();
        let key = meta.require_key()?;
        let record = to_record(entity)?;
        let dialect = self.provider.dialect();
        let value = field_value(dialect, key, &record)?;

        let sql = dialect.delete_by_key(meta.table(), &key.name);
        self.provider.execute_non_query(&sql, &[value])
    }

    /// `UPDATE ... SET assignments WHERE predicate`. Assignments name
    /// entity fields or columns.
    pub fn batch_update(
        &self,
        predicate: Expr,
        assignments: Vec<(String, Value)>,
    ) -> Result<u64> {
        if assignments.is_empty() {
            return Ok(0);
        }
        let meta = T::meta();

        let mut names = Vec::with_capacity(assignments.len());
        let mut values = Vec::with_capacity(assignments.len());
        for (name, value) in assignments {
            let column = meta.find(&name).ok_or_else(|| Error::UnknownColumn {
                table: meta.table().to_string(),
                column: name.clone(),
            })?;
            names.push(column.name.as_str());
            values.push(value);
        }

        let dialect = self.provider.dialect();
        let filter =
            Converter::new(dialect, meta).translate_filter(&predicate.into_lambda(), values)?;
        let sql = dialect.update_where(meta.table(), &names, &filter.fragment);
        self.provider.execute_non_query(&sql, &filter.params)
    }

    /// `DELETE ... WHERE predicate`.
    pub fn batch_delete(&self, predicate: Expr) -> Result<u64> {
        let meta = T::meta();
        let dialect = self.provider.dialect();
        let filter =
            Converter::new(dialect, meta).translate_filter(&predicate.into_lambda(), Vec::new())?;
        let sql = dialect.delete_where(meta.table(), &filter.fragment);
        self.provider.execute_non_query(&sql, &filter.params)
    }

    pub fn close(&self) -> Result<()> {
        self.provider.close()
    }
}

impl<T: Entity> Drop for Repository<T> {
    fn drop(&mut self) {
        if let Err(e) = self.provider.close() {
            warn!(table = T::meta().table(), error = %e, "failed to close connection");
        }
    }
}

fn field_value(
    dialect: Dialect,
    column: &ColumnMeta,
    record: &serde_json::Map<String, Json>,
) -> Result<Value> {
    let value = column.value_from_json(record.get(&column.field).unwrap_or(&Json::Null))?;
    Ok(dialect.param(value))
}

fn field_values(
    dialect: Dialect,
    columns: &[&ColumnMeta],
    record: &serde_json::Map<String, Json>,
) -> Result<Vec<Value>> {
    columns.iter().map(|c| field_value(dialect, c, record)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::col;
    use crate::db::{ColumnKind, EntityMeta, QueryResult};
    use crate::testing::{RecordingConnection, User};
    use serde::{Deserialize, Serialize};
    use std::sync::OnceLock;

    fn ann() -> User {
        User {
            id: 0,
            name: "ann".to_string(),
            email: None,
            age: 30,
            active: true,
        }
    }

    #[test]
    fn test_add_writes_back_generated_key() {
        let (conn, log) = RecordingConnection::new(Dialect::Postgres);
        let conn = conn.with_result(QueryResult::from_rows(&["id"], vec![vec![Value::Int(42)]]));
        let repo: Repository<User> = Repository::new(Box::new(conn));

        let mut user = ann();
        repo.add(&mut user).unwrap();
        assert_eq!(user.id, 42);
        assert_eq!(user.name, "ann");

        let log = log.lock().unwrap();
        let (sql, params) = &log.statements[0];
        assert_eq!(
            sql,
            "INSERT INTO \"users\" (\"name\", \"email\", \"age\", \"active\") VALUES ($1, $2, $3, $4) RETURNING \"id\""
        );
        assert_eq!(
            params,
            &vec![Value::from("ann"), Value::Null, Value::Int(30), Value::Bool(true)]
        );
    }

    #[test]
    fn test_add_without_generated_key_fails() {
        let (conn, _log) = RecordingConnection::new(Dialect::Postgres);
        let repo: Repository<User> = Repository::new(Box::new(conn));
        let err = repo.add(&mut ann()).unwrap_err();
        assert!(matches!(err, Error::DataAccess(_)));
    }

    #[test]
    fn test_get_short_circuits_zero_key() {
        let (conn, log) = RecordingConnection::new(Dialect::SqlServer);
        let repo: Repository<User> = Repository::new(Box::new(conn));
        assert!(repo.get(0).unwrap().is_none());
        assert!(repo.get(Value::Null).unwrap().is_none());
        assert!(log.lock().unwrap().statements.is_empty());
    }

    #[test]
    fn test_get_by_key() {
        let (conn, log) = RecordingConnection::new(Dialect::SqlServer);
        let conn = conn.with_result(QueryResult::from_rows(
            &["id", "name", "email", "age", "active"],
            vec![vec![
                Value::Int(3),
                Value::from("cy"),
                Value::from("cy@example.com"),
                Value::Int(41),
                Value::Bool(false),
            ]],
        ));
        let repo: Repository<User> = Repository::new(Box::new(conn));
        let user = repo.get(3).unwrap().unwrap();
        assert_eq!(user.email.as_deref(), Some("cy@example.com"));

        let log = log.lock().unwrap();
        assert_eq!(log.statements[0].0, "SELECT * FROM [users] WHERE [id] = @p0");
        assert_eq!(log.statements[0].1, vec![Value::Int(3)]);
    }

    #[test]
    fn test_update_binds_key_last() {
        let (conn, log) = RecordingConnection::new(Dialect::MySql);
        let repo: Repository<User> = Repository::new(Box::new(conn.with_affected(1)));
        let user = User { id: 9, ..ann() };
        assert_eq!(repo.update(&user).unwrap(), 1);

        let log = log.lock().unwrap();
        assert_eq!(
            log.statements[0].0,
            "UPDATE `users` SET `name` = ?, `email` = ?, `age` = ?, `active` = ? WHERE `id` = ?"
        );
        assert_eq!(log.statements[0].1.last(), Some(&Value::Int(9)));
    }

    #[test]
    fn test_remove_by_key() {
        let (conn, log) = RecordingConnection::new(Dialect::SqlServer);
        let repo: Repository<User> = Repository::new(Box::new(conn.with_affected(1)));
        assert_eq!(repo.remove(&User { id: 4, ..ann() }).unwrap(), 1);
        let log = log.lock().unwrap();
        assert_eq!(log.statements[0].0, "DELETE FROM [users] WHERE [id] = @p0");
        assert_eq!(log.statements[0].1, vec![Value::Int(4)]);
    }

    #[test]
    fn test_batch_update_continues_numbering() {
        let (conn, log) = RecordingConnection::new(Dialect::SqlServer);
        let repo: Repository<User> = Repository::new(Box::new(conn.with_affected(5)));
        let affected = repo
            .batch_update(
                col("age").lt(18),
                vec![("active".to_string(), Value::Int(0))],
            )
            .unwrap();
        assert_eq!(affected, 5);

        let log = log.lock().unwrap();
        assert_eq!(
            log.statements[0].0,
            "UPDATE [users] SET [active] = @p0 WHERE [age] < @p1"
        );
        assert_eq!(log.statements[0].1, vec![Value::Int(0), Value::Int(18)]);
    }

    #[test]
    fn test_batch_update_rejects_unknown_field() {
        let (conn, log) = RecordingConnection::new(Dialect::SqlServer);
        let repo: Repository<User> = Repository::new(Box::new(conn));
        let err = repo
            .batch_update(col("age").lt(18), vec![("nickname".to_string(), Value::Null)])
            .unwrap_err();
        assert!(matches!(err, Error::UnknownColumn { .. }));
        assert_eq!(repo.batch_update(col("age").lt(18), vec![]).unwrap(), 0);
        assert!(log.lock().unwrap().statements.is_empty());
    }

    #[test]
    fn test_batch_delete() {
        let (conn, log) = RecordingConnection::new(Dialect::Postgres);
        let repo: Repository<User> = Repository::new(Box::new(conn.with_affected(2)));
        assert_eq!(repo.batch_delete(!col("active")).unwrap(), 2);
        let log = log.lock().unwrap();
        assert_eq!(log.statements[0].0, "DELETE FROM \"users\" WHERE \"active\" = $1");
        assert_eq!(log.statements[0].1, vec![Value::Bool(false)]);
    }

    #[derive(Serialize, Deserialize)]
    struct AuditEntry {
        message: String,
    }

    impl Entity for AuditEntry {
        fn meta() -> &'static EntityMeta {
            static META: OnceLock<EntityMeta> = OnceLock::new();
            META.get_or_init(|| EntityMeta::new("audit").column("message", ColumnKind::Text))
        }
    }

    #[test]
    fn test_key_operations_require_key() {
        let (conn, log) = RecordingConnection::new(Dialect::SqlServer);
        let repo: Repository<AuditEntry> = Repository::new(Box::new(conn));
        let entry = AuditEntry {
            message: "hi".to_string(),
        };
        assert!(matches!(repo.get(1), Err(Error::MissingPrimaryKey(_))));
        assert!(matches!(repo.update(&entry), Err(Error::MissingPrimaryKey(_))));
        assert!(matches!(repo.remove(&entry), Err(Error::MissingPrimaryKey(_))));

        // Inserts still work without a key.
        let mut entry = entry;
        repo.add(&mut entry).unwrap();
        assert_eq!(
            log.lock().unwrap().statements[0].0,
            "INSERT INTO [audit] ([message]) VALUES (@p0)"
        );
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Order {
        order_no: String,
        qty: i64,
    }

    impl Entity for Order {
        fn meta() -> &'static EntityMeta {
            static META: OnceLock<EntityMeta> = OnceLock::new();
            META.get_or_init(|| {
                EntityMeta::new("orders")
                    .key("order_no", ColumnKind::Text)
                    .column("qty", ColumnKind::Int)
            })
        }
    }

    #[test]
    fn test_get_queries_zero_like_text_keys() {
        let (mut conn, log) = RecordingConnection::new(Dialect::SqlServer);
        for key in ["000", "0"] {
            conn = conn.with_result(QueryResult::from_rows(
                &["order_no", "qty"],
                vec![vec![Value::from(key), Value::Int(5)]],
            ));
        }
        let repo: Repository<Order> = Repository::new(Box::new(conn));

        let order = repo.get("000").unwrap().unwrap();
        assert_eq!(order.order_no, "000");
        assert_eq!(order.qty, 5);
        assert!(repo.get("0").unwrap().is_some());

        let log = log.lock().unwrap();
        assert_eq!(log.statements.len(), 2);
        assert_eq!(
            log.statements[0].0,
            "SELECT * FROM [orders] WHERE [order_no] = @p0"
        );
        assert_eq!(log.statements[0].1, vec![Value::from("000")]);
    }

    #[test]
    fn test_bool_fields_bind_as_dialect_values() {
        let (conn, log) = RecordingConnection::new(Dialect::SqlServer);
        let conn = conn
            .with_result(QueryResult::from_rows(&["id"], vec![vec![Value::Int(7)]]))
            .with_affected(1);
        let repo: Repository<User> = Repository::new(Box::new(conn));

        let mut user = ann();
        repo.add(&mut user).unwrap();
        repo.update(&User { active: false, ..user }).unwrap();
        repo.batch_update(
            col("active"),
            vec![("active".to_string(), Value::Bool(false))],
        )
        .unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.statements[0].1.last(), Some(&Value::Int(1)));
        assert_eq!(log.statements[1].1[3], Value::Int(0));
        assert_eq!(
            log.statements[2].0,
            "UPDATE [users] SET [active] = @p0 WHERE [active] = @p1"
        );
        assert_eq!(log.statements[2].1, vec![Value::Int(0), Value::Int(1)]);
    }

    #[test]
    fn test_drop_closes_connection() {
        let (conn, log) = RecordingConnection::new(Dialect::Postgres);
        let repo: Repository<User> = Repository::new(Box::new(conn));
        repo.query().any().unwrap();
        drop(repo);
        let log = log.lock().unwrap();
        assert_eq!(log.opens, 1);
        assert_eq!(log.closes, 1);
    }
}
