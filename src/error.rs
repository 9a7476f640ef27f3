//! Error types for predsql.
//!
//! Compile-time failures (unsupported operators, unsupported expression
//! shapes, paging without an ordering) are raised before any SQL is
//! produced. Data access failures from the connection propagate unchanged.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A named query operator outside the supported set.
    #[error("unsupported query operator `{0}`")]
    UnsupportedOperator(String),

    /// A node or argument the converter cannot translate.
    #[error("unsupported expression shape: {0}")]
    UnsupportedExpressionShape(String),

    /// `skip` on a dialect that needs an ORDER BY to page.
    #[error("skip requires an explicit ordering column on this dialect")]
    MissingOrderForPaging,

    /// Key-based operation on an entity without a primary key.
    #[error("entity `{0}` has no primary key")]
    MissingPrimaryKey(String),

    /// No connection provider registered under this name.
    #[error("no connection provider registered for `{0}`")]
    ProviderNotFound(String),

    #[error("unknown column `{column}` on `{table}`")]
    UnknownColumn { table: String, column: String },

    /// A terminal operation that requires a row got none.
    #[error("query returned no rows")]
    NoRows,

    #[error("connection lock poisoned")]
    LockPoisoned,

    #[error("failed to materialize row: {0}")]
    Materialize(#[from] serde_json::Error),

    #[error("cannot bind parameter: {0}")]
    Bind(String),

    #[error(transparent)]
    Database(#[from] tokio_postgres::Error),

    #[error("data access error: {0}")]
    DataAccess(String),
}

impl Error {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Error::UnsupportedExpressionShape(context.into())
    }

    /// True for errors raised while translating an expression, before any
    /// round trip to the database.
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedOperator(_)
                | Error::UnsupportedExpressionShape(_)
                | Error::MissingOrderForPaging
                | Error::UnknownColumn { .. }
        )
    }
}

/// A specialized `Result` type for predsql operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_operator_names_operator() {
        let err = Error::UnsupportedOperator("GroupBy".into());
        assert_eq!(err.to_string(), "unsupported query operator `GroupBy`");
        assert!(err.is_compile_error());
    }

    #[test]
    fn test_data_access_is_not_compile_error() {
        assert!(!Error::DataAccess("boom".into()).is_compile_error());
        assert!(!Error::NoRows.is_compile_error());
        assert!(Error::MissingOrderForPaging.is_compile_error());
    }
}
