//! SQL dialect backends.
//!
//! A dialect owns everything the generic converter leaves open: identifier
//! quoting, parameter placeholders, boolean/null encodings, and how a
//! translated query is assembled into a full statement (in particular how
//! skip/take are expressed). Two families are covered:
//!
//! ```text
//! OFFSET/FETCH family   SqlServer, SqlServerLegacy (ROW_NUMBER emulation), Postgres
//! LIMIT family          MySql
//! ```
use std::fmt;

use super::compiler::{CompiledQuery, OrderBy, Translation};
use super::types::{ResultMode, Value};
use crate::db::EntityMeta;
use crate::error::{Error, Result};

/// MySQL has no "no limit" token; the documented idiom is the largest u64.
const MYSQL_NO_LIMIT: u64 = u64::MAX;

/// Alias of the row-number column in the paging subquery.
const ROW_NUMBER_ALIAS: &str = "__row_number";
const PAGED_ALIAS: &str = "__paged";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// SQL Server 2012+: native OFFSET/FETCH, which needs an ORDER BY.
    SqlServer,
    /// SQL Server without OFFSET/FETCH: TOP and ROW_NUMBER() paging.
    SqlServerLegacy,
    Postgres,
    MySql,
}

/// How skip/take are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paging {
    /// Trailing `OFFSET n ROWS FETCH NEXT m ROWS ONLY`.
    OffsetFetch { requires_order: bool },
    /// `TOP (n)` prefix, or a numbered subquery when skipping.
    RowNumber,
    /// Trailing `limit skip,take`.
    Limit,
}

/// Parameter placeholder generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// The same token for every parameter; bound purely by position.
    Positional(&'static str),
    /// `prefix` followed by the zero-based parameter index.
    Named(&'static str),
    /// `prefix` followed by the one-based parameter index.
    Numbered(&'static str),
}

/// Per-backend token table.
#[derive(Debug)]
pub struct DialectConstants {
    pub eq: &'static str,
    pub not_eq: &'static str,
    pub lt: &'static str,
    pub lt_eq: &'static str,
    pub gt: &'static str,
    pub gt_eq: &'static str,
    pub and: &'static str,
    pub or: &'static str,
    /// Marker emitted for null operands during the tree walk. Never valid
    /// SQL on its own; the finishing pass rewrites every occurrence.
    pub null_sentinel: &'static str,
    pub null_literal: &'static str,
    pub true_value: Value,
    pub false_value: Value,
    pub always_true: &'static str,
    pub always_false: &'static str,
    pub quote_open: char,
    pub quote_close: char,
    pub placeholder: PlaceholderStyle,
    pub paging: Paging,
}

static SQL_SERVER: DialectConstants = DialectConstants {
    eq: " = ",
    not_eq: " <> ",
    lt: " < ",
    lt_eq: " <= ",
    gt: " > ",
    gt_eq: " >= ",
    and: " AND ",
    or: " OR ",
    null_sentinel: "<NULL>",
    null_literal: "NULL",
    true_value: Value::Int(1),
    false_value: Value::Int(0),
    always_true: "1=1",
    always_false: "1=0",
    quote_open: '[',
    quote_close: ']',
    placeholder: PlaceholderStyle::Named("@p"),
    paging: Paging::OffsetFetch {
        requires_order: true,
    },
};

static SQL_SERVER_LEGACY: DialectConstants = DialectConstants {
    eq: " = ",
    not_eq: " <> ",
    lt: " < ",
    lt_eq: " <= ",
    gt: " > ",
    gt_eq: " >= ",
    and: " AND ",
    or: " OR ",
    null_sentinel: "<NULL>",
    null_literal: "NULL",
    true_value: Value::Int(1),
    false_value: Value::Int(0),
    always_true: "1=1",
    always_false: "1=0",
    quote_open: '[',
    quote_close: ']',
    placeholder: PlaceholderStyle::Named("@p"),
    paging: Paging::RowNumber,
};

static POSTGRES: DialectConstants = DialectConstants {
    eq: " = ",
    not_eq: " <> ",
    lt: " < ",
    lt_eq: " <= ",
    gt: " > ",
    gt_eq: " >= ",
    and: " AND ",
    or: " OR ",
    null_sentinel: "<NULL>",
    null_literal: "NULL",
    true_value: Value::Bool(true),
    false_value: Value::Bool(false),
    always_true: "TRUE",
    always_false: "FALSE",
    quote_open: '"',
    quote_close: '"',
    placeholder: PlaceholderStyle::Numbered("$"),
    paging: Paging::OffsetFetch {
        requires_order: false,
    },
};

static MYSQL: DialectConstants = DialectConstants {
    eq: " = ",
    not_eq: " <> ",
    lt: " < ",
    lt_eq: " <= ",
    gt: " > ",
    gt_eq: " >= ",
    and: " AND ",
    or: " OR ",
    null_sentinel: "<NULL>",
    null_literal: "NULL",
    true_value: Value::Int(1),
    false_value: Value::Int(0),
    always_true: "1=1",
    always_false: "1=0",
    quote_open: '`',
    quote_close: '`',
    placeholder: PlaceholderStyle::Positional("?"),
    paging: Paging::Limit,
};

impl Dialect {
    pub fn constants(&self) -> &'static DialectConstants {
        match self {
            Dialect::SqlServer => &SQL_SERVER,
            Dialect::SqlServerLegacy => &SQL_SERVER_LEGACY,
            Dialect::Postgres => &POSTGRES,
            Dialect::MySql => &MYSQL,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::SqlServer => "sqlserver",
            Dialect::SqlServerLegacy => "sqlserver-legacy",
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
        }
    }

    /// Pick the dialect for a provider name, accepting the common driver
    /// names as aliases.
    pub fn from_provider(provider: &str) -> Result<Dialect> {
        let normalized = provider.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "sqlserver" | "mssql" | "system.data.sqlclient" | "microsoft.data.sqlclient" => {
                Ok(Dialect::SqlServer)
            }
            "sqlserver-legacy" | "mssql2008" | "sqlserver2008" => Ok(Dialect::SqlServerLegacy),
            "postgres" | "postgresql" | "pg" | "npgsql" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" | "mysql.data.mysqlclient" | "mysqlconnector" => Ok(Dialect::MySql),
            _ => Err(Error::ProviderNotFound(provider.to_string())),
        }
    }

    /// Quote an identifier, doubling any embedded closing quote.
    pub fn quote(&self, ident: &str) -> String {
        let c = self.constants();
        let escaped = ident.replace(c.quote_close, &c.quote_close.to_string().repeat(2));
        format!("{}{}{}", c.quote_open, escaped, c.quote_close)
    }

    /// Placeholder for the parameter at `index` in binding order.
    pub fn placeholder(&self, index: usize) -> String {
        match self.constants().placeholder {
            PlaceholderStyle::Positional(token) => token.to_string(),
            PlaceholderStyle::Named(prefix) => format!("{}{}", prefix, index),
            PlaceholderStyle::Numbered(prefix) => format!("{}{}", prefix, index + 1),
        }
    }

    /// Bound value for a boolean in operand position.
    pub fn bool_value(&self, value: bool) -> Value {
        let c = self.constants();
        if value {
            c.true_value.clone()
        } else {
            c.false_value.clone()
        }
    }

    /// A value as this engine binds it. Booleans go through
    /// [`Dialect::bool_value`]; everything else binds unchanged.
    pub fn param(&self, value: Value) -> Value {
        match value {
            Value::Bool(b) => self.bool_value(b),
            other => other,
        }
    }

    /// Assemble a full SELECT from a translated query.
    pub fn render_select(
        &self,
        entity: &EntityMeta,
        translation: Translation,
    ) -> Result<CompiledQuery> {
        let table = self.quote(entity.table());
        let filter = if translation.fragment.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", translation.fragment)
        };

        let list = match translation.mode {
            ResultMode::All => "*".to_string(),
            ResultMode::Count => "COUNT(*)".to_string(),
            ResultMode::Any => "1".to_string(),
            ResultMode::Project => translation
                .projection
                .clone()
                .unwrap_or_else(|| "*".to_string()),
        };

        // Count ignores paging and ordering; Any always reads one row and
        // keeps the ordering only when a skip depends on it.
        let page = match translation.mode {
            ResultMode::Count => Page::default(),
            ResultMode::Any => {
                let skip = translation.skip.filter(|&s| s > 0);
                Page {
                    skip,
                    take: Some(1),
                    order: skip.and(translation.order.clone()),
                }
            }
            ResultMode::All | ResultMode::Project => Page {
                skip: translation.skip,
                take: translation.take,
                order: translation.order.clone(),
            },
        };

        let select = SelectParts {
            list: &list,
            table: &table,
            filter: &filter,
        };

        let sql = match self.constants().paging {
            Paging::Limit => self.limit_select(&select, &page),
            Paging::OffsetFetch { requires_order } => {
                self.offset_fetch_select(&select, &page, requires_order)?
            }
            Paging::RowNumber => self.row_number_select(&select, &page, entity)?,
        };

        Ok(CompiledQuery {
            sql,
            params: translation.params,
            mode: translation.mode,
            dialect: *self,
        })
    }

    fn limit_select(&self, select: &SelectParts<'_>, page: &Page) -> String {
        let mut sql = select.base();
        sql.push_str(&order_clause(page.order.as_ref()));
        if page.is_paged() {
            sql.push_str(&format!(
                " limit {},{}",
                page.skip.unwrap_or(0),
                page.take.unwrap_or(MYSQL_NO_LIMIT)
            ));
        }
        sql
    }

    fn offset_fetch_select(
        &self,
        select: &SelectParts<'_>,
        page: &Page,
        requires_order: bool,
    ) -> Result<String> {
        if page.is_paged() && page.order.is_none() && requires_order {
            // The native clause is unavailable without an ORDER BY.
            if page.skip.unwrap_or(0) > 0 {
                return Err(Error::MissingOrderForPaging);
            }
            return Ok(match page.take {
                Some(n) => select.top(n),
                None => select.base(),
            });
        }

        let mut sql = select.base();
        sql.push_str(&order_clause(page.order.as_ref()));
        if page.is_paged() {
            sql.push_str(&format!(" OFFSET {} ROWS", page.skip.unwrap_or(0)));
            if let Some(take) = page.take {
                sql.push_str(&format!(" FETCH NEXT {} ROWS ONLY", take));
            }
            sql.push(';');
        }
        Ok(sql)
    }

    fn row_number_select(
        &self,
        select: &SelectParts<'_>,
        page: &Page,
        entity: &EntityMeta,
    ) -> Result<String> {
        let skip = page.skip.unwrap_or(0);
        if skip == 0 {
            let mut sql = match page.take {
                Some(n) => select.top(n),
                None => select.base(),
            };
            sql.push_str(&order_clause(page.order.as_ref()));
            return Ok(sql);
        }

        let order = page.order.as_ref().ok_or(Error::MissingOrderForPaging)?;
        let row = self.quote(ROW_NUMBER_ALIAS);

        // Keep the row number out of `*` results by naming the entity columns.
        let outer = if select.list == "*" && !entity.columns().is_empty() {
            entity
                .columns()
                .iter()
                .map(|c| self.quote(&c.name))
                .collect::<Vec<_>>()
                .join(", ")
        } else {
            select.list.to_string()
        };

        let range = match page.take {
            Some(take) => format!("{} BETWEEN {} AND {}", row, skip + 1, skip + take),
            None => format!("{} > {}", row, skip),
        };

        Ok(format!(
            "SELECT {outer} FROM (SELECT *, ROW_NUMBER() OVER (ORDER BY {col}{dir}) AS {row} FROM {table}{filter}) AS {paged} WHERE {range} ORDER BY {row}",
            col = order.column,
            dir = if order.descending { " desc" } else { "" },
            table = select.table,
            filter = select.filter,
            paged = self.quote(PAGED_ALIAS),
        ))
    }

    fn placeholders(&self, start: usize, count: usize) -> Vec<String> {
        (start..start + count).map(|i| self.placeholder(i)).collect()
    }

    /// `INSERT` for the given columns. With `generated_key`, the statement
    /// also yields the generated key as the first column of the first row.
    pub fn insert_statement(
        &self,
        table: &str,
        columns: &[&str],
        generated_key: Option<&str>,
    ) -> String {
        let table = self.quote(table);
        let insert = if columns.is_empty() {
            match self {
                Dialect::MySql => format!("INSERT INTO {} () VALUES ()", table),
                _ => format!("INSERT INTO {} DEFAULT VALUES", table),
            }
        } else {
            let cols: Vec<String> = columns.iter().map(|c| self.quote(c)).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                cols.join(", "),
                self.placeholders(0, columns.len()).join(", ")
            )
        };

        match generated_key {
            None => insert,
            Some(key) => match self {
                Dialect::Postgres => format!("{} RETURNING {}", insert, self.quote(key)),
                Dialect::SqlServer | Dialect::SqlServerLegacy => format!(
                    "{}; SELECT CAST(SCOPE_IDENTITY() AS BIGINT) AS {};",
                    insert,
                    self.quote(key)
                ),
                Dialect::MySql => format!(
                    "{}; SELECT LAST_INSERT_ID() AS {};",
                    insert,
                    self.quote(key)
                ),
            },
        }
    }

    pub fn select_by_key(&self, table: &str, key: &str) -> String {
        format!(
            "SELECT * FROM {} WHERE {} = {}",
            self.quote(table),
            self.quote(key),
            self.placeholder(0)
        )
    }

    /// `UPDATE ... SET` over `columns`, keyed on `key`; the key is bound last.
    pub fn update_by_key(&self, table: &str, columns: &[&str], key: &str) -> String {
        let filter = format!("{} = {}", self.quote(key), self.placeholder(columns.len()));
        self.update_where(table, columns, &filter)
    }

    /// `UPDATE ... SET ... WHERE filter`; SET values bind first.
    pub fn update_where(&self, table: &str, columns: &[&str], filter: &str) -> String {
        let sets: Vec<String> = columns
            .iter()
            .zip(self.placeholders(0, columns.len()))
            .map(|(c, p)| format!("{} = {}", self.quote(c), p))
            .collect();
        let mut sql = format!("UPDATE {} SET {}", self.quote(table), sets.join(", "));
        if !filter.is_empty() {
            sql.push_str(&format!(" WHERE {}", filter));
        }
        sql
    }

    pub fn delete_by_key(&self, table: &str, key: &str) -> String {
        let filter = format!("{} = {}", self.quote(key), self.placeholder(0));
        self.delete_where(table, &filter)
    }

    pub fn delete_where(&self, table: &str, filter: &str) -> String {
        let mut sql = format!("DELETE FROM {}", self.quote(table));
        if !filter.is_empty() {
            sql.push_str(&format!(" WHERE {}", filter));
        }
        sql
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Default)]
struct Page {
    skip: Option<u64>,
    take: Option<u64>,
    order: Option<OrderBy>,
}

impl Page {
    fn is_paged(&self) -> bool {
        self.skip.is_some() || self.take.is_some()
    }
}

struct SelectParts<'a> {
    list: &'a str,
    table: &'a str,
    filter: &'a str,
}

impl SelectParts<'_> {
    fn base(&self) -> String {
        format!("SELECT {} FROM {}{}", self.list, self.table, self.filter)
    }

    fn top(&self, n: u64) -> String {
        format!("SELECT TOP ({}) {} FROM {}{}", n, self.list, self.table, self.filter)
    }
}

fn order_clause(order: Option<&OrderBy>) -> String {
    match order {
        Some(o) => format!(
            " ORDER BY {}{}",
            o.column,
            if o.descending { " desc" } else { "" }
        ),
        None => String::new(),
    }
}
