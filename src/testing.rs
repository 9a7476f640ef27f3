//! Fixtures shared by unit tests: a `users` entity and an in-memory
//! connection that records every statement it receives.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};

use crate::ast::{Dialect, Value};
use crate::db::{ColumnKind, Connection, Entity, EntityMeta, QueryResult};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub age: i64,
    pub active: bool,
}

impl Entity for User {
    fn meta() -> &'static EntityMeta {
        static META: OnceLock<EntityMeta> = OnceLock::new();
        META.get_or_init(|| {
            EntityMeta::new("users")
                .column("id", ColumnKind::Int)
                .column("name", ColumnKind::Text)
                .column("email", ColumnKind::Text)
                .column("age", ColumnKind::Int)
                .column("active", ColumnKind::Bool)
        })
    }
}

pub fn users() -> &'static EntityMeta {
    User::meta()
}

#[derive(Debug, Default)]
pub struct Recorded {
    pub statements: Vec<(String, Vec<Value>)>,
    pub opens: usize,
    pub closes: usize,
}

/// Replays queued results in order; an exhausted queue yields empty
/// results.
pub struct RecordingConnection {
    dialect: Dialect,
    open: bool,
    results: VecDeque<QueryResult>,
    affected: u64,
    log: Arc<Mutex<Recorded>>,
}

impl RecordingConnection {
    pub fn new(dialect: Dialect) -> (Self, Arc<Mutex<Recorded>>) {
        let log = Arc::new(Mutex::new(Recorded::default()));
        let conn = Self {
            dialect,
            open: false,
            results: VecDeque::new(),
            affected: 0,
            log: log.clone(),
        };
        (conn, log)
    }

    pub fn with_result(mut self, result: QueryResult) -> Self {
        self.results.push_back(result);
        self
    }

    pub fn with_affected(mut self, affected: u64) -> Self {
        self.affected = affected;
        self
    }

    fn record(&mut self, sql: &str, params: &[Value]) -> Result<()> {
        if !self.open {
            return Err(Error::DataAccess("connection is not open".to_string()));
        }
        let mut log = self.log.lock().map_err(|_| Error::LockPoisoned)?;
        log.statements.push((sql.to_string(), params.to_vec()));
        Ok(())
    }
}

impl Connection for RecordingConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn open(&mut self) -> Result<()> {
        self.open = true;
        self.log.lock().map_err(|_| Error::LockPoisoned)?.opens += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        self.log.lock().map_err(|_| Error::LockPoisoned)?.closes += 1;
        Ok(())
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.record(sql, params)?;
        Ok(self.results.pop_front().unwrap_or_default())
    }

    fn execute_non_query(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.record(sql, params)?;
        Ok(self.affected)
    }
}
