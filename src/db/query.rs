use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value as Json};
use std::time::Duration;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{Column, Row};

use super::schema::EntityMeta;
use crate::ast::Value;
use crate::error::{Error, Result};

/// Rows returned by one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<Value>>,
    pub execution_time: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a result from column names and row values. Column types are
    /// taken from the first row.
    pub fn from_rows(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        let columns = columns
            .iter()
            .enumerate()
            .map(|(i, name)| ColumnInfo {
                name: name.to_string(),
                type_name: rows
                    .first()
                    .and_then(|r| r.get(i))
                    .map(|v| v.type_name().to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
            })
            .collect();
        Self {
            columns,
            rows,
            ..Self::default()
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// First column of the first row.
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|r| r.first())
    }

    /// Rows as JSON objects keyed by entity field name.
    pub fn records(&self, entity: &EntityMeta) -> Vec<Map<String, Json>> {
        let fields: Vec<&str> = self
            .columns
            .iter()
            .map(|c| entity.field_for(&c.name))
            .collect();
        self.rows
            .iter()
            .map(|row| {
                fields
                    .iter()
                    .zip(row)
                    .map(|(field, value)| (field.to_string(), value.to_json()))
                    .collect()
            })
            .collect()
    }
}

/// Convert PostgreSQL rows into a [`QueryResult`].
pub(crate) fn parse_rows(
    columns: &[Column],
    rows: &[Row],
    execution_time: Duration,
) -> QueryResult {
    let columns: Vec<ColumnInfo> = columns
        .iter()
        .map(|col| ColumnInfo {
            name: col.name().to_string(),
            type_name: col.type_().name().to_string(),
        })
        .collect();

    let rows = rows
        .iter()
        .map(|row| {
            row.columns()
                .iter()
                .enumerate()
                .map(|(i, col)| extract_value(row, i, col.type_()))
                .collect()
        })
        .collect();

    QueryResult {
        columns,
        rows,
        execution_time,
    }
}

fn cell<'a, T: FromSql<'a>>(row: &'a Row, idx: usize, wrap: impl FnOnce(T) -> Value) -> Value {
    row.try_get::<_, Option<T>>(idx)
        .ok()
        .flatten()
        .map(wrap)
        .unwrap_or(Value::Null)
}

fn extract_value(row: &Row, idx: usize, pg_type: &Type) -> Value {
    match *pg_type {
        Type::BOOL => cell(row, idx, Value::Bool),
        Type::INT2 => cell(row, idx, |v: i16| Value::Int(v.into())),
        Type::INT4 => cell(row, idx, |v: i32| Value::Int(v.into())),
        Type::INT8 => cell(row, idx, Value::Int),
        Type::OID => cell(row, idx, |v: u32| Value::Int(v.into())),
        Type::FLOAT4 => cell(row, idx, |v: f32| Value::Float(v.into())),
        Type::FLOAT8 => cell(row, idx, Value::Float),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::CHAR | Type::BPCHAR => {
            cell(row, idx, Value::Text)
        }
        Type::BYTEA => cell(row, idx, Value::Bytes),
        Type::DATE => cell(row, idx, Value::Date),
        Type::TIMESTAMP => cell(row, idx, Value::DateTime),
        Type::TIMESTAMPTZ => cell(row, idx, Value::TimestampTz),
        Type::JSON | Type::JSONB => cell(row, idx, Value::Json),
        // Fallback: try to get as string
        _ => cell(row, idx, Value::Text),
    }
}

/// A parameter boxed for `tokio_postgres`, typed after the prepared
/// statement's declared parameter type.
pub(crate) type PgParam = Box<dyn ToSql + Sync + Send>;

/// Convert bound values to the types the server inferred for each
/// placeholder. Nulls become typed `None`s.
pub(crate) fn bind_params(values: &[Value], types: &[Type]) -> Result<Vec<PgParam>> {
    if values.len() != types.len() {
        return Err(Error::Bind(format!(
            "statement expects {} parameters, got {}",
            types.len(),
            values.len()
        )));
    }
    values
        .iter()
        .zip(types)
        .map(|(value, ty)| bind_param(value, ty))
        .collect()
}

fn typed<T>(
    value: &Value,
    ty: &Type,
    convert: impl FnOnce(&Value) -> Option<T>,
) -> Result<Option<T>> {
    if value.is_null() {
        return Ok(None);
    }
    convert(value).map(Some).ok_or_else(|| {
        Error::Bind(format!(
            "cannot bind {} value `{}` as {}",
            value.type_name(),
            value,
            ty
        ))
    })
}

fn bind_param(value: &Value, ty: &Type) -> Result<PgParam> {
    let int = |v: &Value| v.as_i64();
    let float = |v: &Value| match v {
        Value::Float(f) => Some(*f),
        Value::Int(i) => Some(*i as f64),
        _ => None,
    };

    let param: PgParam = match *ty {
        Type::BOOL => Box::new(typed(value, ty, |v| match v {
            Value::Bool(b) => Some(*b),
            other => other.as_i64().map(|i| i != 0),
        })?),
        Type::INT2 => Box::new(typed(value, ty, |v| int(v).and_then(|i| i16::try_from(i).ok()))?),
        Type::INT4 => Box::new(typed(value, ty, |v| int(v).and_then(|i| i32::try_from(i).ok()))?),
        Type::INT8 => Box::new(typed(value, ty, int)?),
        Type::FLOAT4 => Box::new(typed(value, ty, |v| float(v).map(|f| f as f32))?),
        Type::FLOAT8 => Box::new(typed(value, ty, float)?),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::BPCHAR | Type::UNKNOWN => {
            Box::new(typed(value, ty, |v| match v {
                Value::Text(s) => Some(s.clone()),
                Value::Bytes(_) | Value::List(_) | Value::Record(_) => None,
                other => Some(other.to_string()),
            })?)
        }
        Type::BYTEA => Box::new(typed(value, ty, |v| match v {
            Value::Bytes(b) => Some(b.clone()),
            _ => None,
        })?),
        Type::DATE => Box::new(typed(value, ty, |v| match v {
            Value::Date(d) => Some(*d),
            Value::Text(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").ok(),
            _ => None,
        })?),
        Type::TIMESTAMP => Box::new(typed(value, ty, |v| match v {
            Value::DateTime(dt) => Some(*dt),
            Value::Text(s) => s.parse::<NaiveDateTime>().ok(),
            _ => None,
        })?),
        Type::TIMESTAMPTZ => Box::new(typed(value, ty, |v| match v {
            Value::TimestampTz(dt) => Some(*dt),
            Value::DateTime(dt) => Some(dt.and_utc()),
            Value::Text(s) => s.parse::<DateTime<Utc>>().ok(),
            _ => None,
        })?),
        Type::JSON | Type::JSONB => Box::new(typed(value, ty, |v| Some(v.to_json()))?),
        _ => {
            return Err(Error::Bind(format!(
                "unsupported parameter type {}",
                ty
            )))
        }
    };
    Ok(param)
}
