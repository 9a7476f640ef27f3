//! Entity metadata: the table and column table each entity type declares
//! once, used by the converter for column lookups and by the provider for
//! materializing rows.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::connection::Connection;
use crate::ast::Value;
use crate::error::{Error, Result};

/// A type stored in one table.
///
/// ```ignore
/// impl Entity for User {
///     fn meta() -> &'static EntityMeta {
///         static META: OnceLock<EntityMeta> = OnceLock::new();
///         META.get_or_init(|| {
///             EntityMeta::new("users")
///                 .column("id", ColumnKind::Int)
///                 .column("name", ColumnKind::Text)
///         })
///     }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned {
    fn meta() -> &'static EntityMeta;
}

/// Declared column types. Drives boolean coercion in predicates and the
/// conversion of serialized entity fields into bound values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    Date,
    DateTime,
    Timestamp,
    Json,
}

impl ColumnKind {
    /// Map an `information_schema` data type name to a kind.
    pub fn from_sql_type(data_type: &str) -> Self {
        let t = data_type.to_ascii_lowercase();
        match t.as_str() {
            "boolean" | "bool" | "bit" => ColumnKind::Bool,
            "smallint" | "integer" | "int" | "bigint" | "tinyint" | "mediumint" => ColumnKind::Int,
            "real" | "double precision" | "double" | "float" | "numeric" | "decimal" | "money" => {
                ColumnKind::Float
            }
            "bytea" | "binary" | "varbinary" | "blob" | "image" => ColumnKind::Bytes,
            "date" => ColumnKind::Date,
            "timestamp with time zone" | "datetimeoffset" => ColumnKind::Timestamp,
            "json" | "jsonb" => ColumnKind::Json,
            _ if t.starts_with("timestamp") || t.starts_with("datetime") => ColumnKind::DateTime,
            _ => ColumnKind::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    /// Column name in the database.
    pub name: String,
    /// Field name in the serialized entity.
    pub field: String,
    pub kind: ColumnKind,
    pub is_key: bool,
    pub is_auto_increment: bool,
}

impl ColumnMeta {
    /// Convert a serialized field into the value bound for this column.
    pub fn value_from_json(&self, json: &serde_json::Value) -> Result<Value> {
        use serde_json::Value as Json;

        let mismatch = || {
            Error::Bind(format!(
                "field `{}` holds {} but column `{}` is {:?}",
                self.field, json, self.name, self.kind
            ))
        };
        let text = || json.as_str().ok_or_else(mismatch);

        if json.is_null() {
            return Ok(Value::Null);
        }
        Ok(match self.kind {
            ColumnKind::Bool => Value::Bool(json.as_bool().ok_or_else(mismatch)?),
            ColumnKind::Int => Value::Int(json.as_i64().ok_or_else(mismatch)?),
            ColumnKind::Float => Value::Float(json.as_f64().ok_or_else(mismatch)?),
            ColumnKind::Text => match json {
                Json::String(s) => Value::Text(s.clone()),
                other => Value::Text(other.to_string()),
            },
            ColumnKind::Bytes => {
                let bytes: Vec<u8> = serde_json::from_value(json.clone())?;
                Value::Bytes(bytes)
            }
            ColumnKind::Date => Value::Date(
                NaiveDate::parse_from_str(text()?, "%Y-%m-%d").map_err(|_| mismatch())?,
            ),
            ColumnKind::DateTime => Value::DateTime(
                text()?.parse::<NaiveDateTime>().map_err(|_| mismatch())?,
            ),
            ColumnKind::Timestamp => Value::TimestampTz(
                text()?.parse::<DateTime<Utc>>().map_err(|_| mismatch())?,
            ),
            ColumnKind::Json => Value::Json(json.clone()),
        })
    }
}

/// Table name plus ordered columns.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMeta {
    table: String,
    columns: Vec<ColumnMeta>,
    explicit_key: bool,
}

impl EntityMeta {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            explicit_key: false,
        }
    }

    /// Add a column whose field has the same name. Without a declared key,
    /// a column named `id` becomes the auto-increment key.
    pub fn column(self, name: &str, kind: ColumnKind) -> Self {
        self.mapped(name, name, kind)
    }

    /// Add a column stored under `name` and serialized as `field`.
    pub fn mapped(mut self, name: &str, field: &str, kind: ColumnKind) -> Self {
        let implicit_key = !self.explicit_key && name.eq_ignore_ascii_case("id");
        self.columns.push(ColumnMeta {
            name: name.to_string(),
            field: field.to_string(),
            kind,
            is_key: implicit_key,
            is_auto_increment: implicit_key,
        });
        self
    }

    /// Add the primary key column. The key is assigned by the caller.
    pub fn key(self, name: &str, kind: ColumnKind) -> Self {
        self.declare_key(name, kind, false)
    }

    /// Add the primary key column, generated by the database on insert.
    pub fn auto_key(self, name: &str, kind: ColumnKind) -> Self {
        self.declare_key(name, kind, true)
    }

    fn declare_key(mut self, name: &str, kind: ColumnKind, auto_increment: bool) -> Self {
        for column in &mut self.columns {
            column.is_key = false;
            column.is_auto_increment = false;
        }
        self.explicit_key = true;
        self.columns.push(ColumnMeta {
            name: name.to_string(),
            field: name.to_string(),
            kind,
            is_key: true,
            is_auto_increment: auto_increment,
        });
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    /// Look up a column by field name, then by column name.
    pub fn find(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns
            .iter()
            .find(|c| c.field == name)
            .or_else(|| self.columns.iter().find(|c| c.name == name))
            .or_else(|| {
                self.columns
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(name))
            })
    }

    pub fn key_column(&self) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.is_key)
    }

    /// The key column, or `MissingPrimaryKey` for key-based operations.
    pub fn require_key(&self) -> Result<&ColumnMeta> {
        self.key_column()
            .ok_or_else(|| Error::MissingPrimaryKey(self.table.clone()))
    }

    /// Field name a result column materializes into.
    pub fn field_for<'a>(&'a self, column: &'a str) -> &'a str {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(column))
            .map(|c| c.field.as_str())
            .unwrap_or(column)
    }
}

/// Serialize an entity into its field map.
pub(crate) fn to_record<T: Entity>(
    entity: &T,
) -> Result<serde_json::Map<String, serde_json::Value>> {
    match serde_json::to_value(entity)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(Error::DataAccess(format!(
            "entity for `{}` serialized to {} instead of an object",
            T::meta().table(),
            other
        ))),
    }
}

/// Read a table's column layout from `information_schema`, for ad-hoc
/// queries against tables without a declared entity.
pub fn describe_table(connection: &mut dyn Connection, table: &str) -> Result<EntityMeta> {
    let dialect = connection.dialect();
    let sql = format!(
        r#"
        SELECT
            CAST(c.column_name AS VARCHAR(128)) AS column_name,
            CAST(c.data_type AS VARCHAR(128)) AS data_type,
            CASE WHEN tc.constraint_type = 'PRIMARY KEY' THEN 1 ELSE 0 END AS is_primary_key,
            CAST(c.column_default AS VARCHAR(4000)) AS column_default
        FROM information_schema.columns c
        LEFT JOIN information_schema.key_column_usage kcu
            ON c.table_schema = kcu.table_schema
            AND c.table_name = kcu.table_name
            AND c.column_name = kcu.column_name
        LEFT JOIN information_schema.table_constraints tc
            ON kcu.constraint_name = tc.constraint_name
            AND kcu.table_schema = tc.table_schema
            AND tc.constraint_type = 'PRIMARY KEY'
        WHERE c.table_name = {}
        ORDER BY c.ordinal_position
        "#,
        dialect.placeholder(0)
    );

    if !connection.is_open() {
        connection.open()?;
    }
    let result = connection.execute(&sql, &[Value::from(table)])?;
    if result.rows.is_empty() {
        return Err(Error::DataAccess(format!("table `{}` not found", table)));
    }

    let mut meta = EntityMeta::new(table);
    for row in &result.rows {
        let text = |idx: usize| match row.get(idx) {
            Some(Value::Text(s)) => s.clone(),
            _ => String::new(),
        };
        let name = text(0);
        let kind = ColumnKind::from_sql_type(&text(1));
        let is_key = row.get(2).and_then(Value::as_i64).unwrap_or(0) == 1;
        let generated = text(3).starts_with("nextval(");

        meta = match (is_key, generated) {
            (true, true) => meta.auto_key(&name, kind),
            (true, false) => meta.key(&name, kind),
            _ => meta.column(&name, kind),
        };
    }
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Dialect;
    use crate::db::QueryResult;
    use crate::testing::{users, RecordingConnection, User};

    #[test]
    fn test_implicit_id_key() {
        let key = users().key_column().unwrap();
        assert_eq!(key.name, "id");
        assert!(key.is_auto_increment);
    }

    #[test]
    fn test_declared_key_replaces_implicit_id() {
        let meta = EntityMeta::new("orders")
            .column("id", ColumnKind::Int)
            .key("order_no", ColumnKind::Text);
        let key = meta.key_column().unwrap();
        assert_eq!(key.name, "order_no");
        assert!(!key.is_auto_increment);
        assert!(!meta.find("id").unwrap().is_key);
    }

    #[test]
    fn test_missing_key() {
        let meta = EntityMeta::new("log").column("line", ColumnKind::Text);
        assert!(matches!(
            meta.require_key(),
            Err(Error::MissingPrimaryKey(ref t)) if t == "log"
        ));
    }

    #[test]
    fn test_find_by_field_or_column() {
        let meta = EntityMeta::new("people").mapped("full_name", "name", ColumnKind::Text);
        assert_eq!(meta.find("name").unwrap().name, "full_name");
        assert_eq!(meta.find("full_name").unwrap().field, "name");
        assert_eq!(meta.field_for("FULL_NAME"), "name");
        assert_eq!(meta.field_for("other"), "other");
        assert!(meta.find("missing").is_none());
    }

    #[test]
    fn test_value_from_json_uses_column_kind() {
        let date = ColumnMeta {
            name: "born".into(),
            field: "born".into(),
            kind: ColumnKind::Date,
            is_key: false,
            is_auto_increment: false,
        };
        assert_eq!(
            date.value_from_json(&serde_json::json!("1990-05-01")).unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(1990, 5, 1).unwrap())
        );
        assert_eq!(
            date.value_from_json(&serde_json::Value::Null).unwrap(),
            Value::Null
        );
        assert!(matches!(
            date.value_from_json(&serde_json::json!(12)),
            Err(Error::Bind(_))
        ));
    }

    #[test]
    fn test_to_record() {
        let user = User {
            id: 3,
            name: "ann".into(),
            email: None,
            age: 40,
            active: true,
        };
        let record = to_record(&user).unwrap();
        assert_eq!(record["name"], serde_json::json!("ann"));
        assert!(record["email"].is_null());
    }

    #[test]
    fn test_sql_type_mapping() {
        assert_eq!(ColumnKind::from_sql_type("boolean"), ColumnKind::Bool);
        assert_eq!(ColumnKind::from_sql_type("bigint"), ColumnKind::Int);
        assert_eq!(
            ColumnKind::from_sql_type("timestamp without time zone"),
            ColumnKind::DateTime
        );
        assert_eq!(
            ColumnKind::from_sql_type("timestamp with time zone"),
            ColumnKind::Timestamp
        );
        assert_eq!(ColumnKind::from_sql_type("character varying"), ColumnKind::Text);
    }

    #[test]
    fn test_describe_table() {
        let result = QueryResult::from_rows(
            &["column_name", "data_type", "is_primary_key", "column_default"],
            vec![
                vec![
                    Value::from("id"),
                    Value::from("integer"),
                    Value::Int(1),
                    Value::from("nextval('pets_id_seq'::regclass)"),
                ],
                vec![
                    Value::from("tame"),
                    Value::from("boolean"),
                    Value::Int(0),
                    Value::Null,
                ],
            ],
        );
        let (conn, log) = RecordingConnection::new(Dialect::Postgres);
        let mut conn = conn.with_result(result);

        let meta = describe_table(&mut conn, "pets").unwrap();
        assert_eq!(meta.table(), "pets");
        assert!(meta.key_column().unwrap().is_auto_increment);
        assert_eq!(meta.find("tame").unwrap().kind, ColumnKind::Bool);

        let log = log.lock().unwrap();
        assert_eq!(log.opens, 1);
        assert!(log.statements[0].0.contains("c.table_name = $1"));
        assert_eq!(log.statements[0].1, vec![Value::from("pets")]);
    }
}
