mod connection;
mod handle;
mod provider;
mod query;
mod repo;
mod schema;

pub use connection::*;
pub use handle::QueryHandle;
pub use provider::{ConnectionFactory, ProviderRegistry, QueryProvider};
pub use query::{ColumnInfo, QueryResult};
pub use repo::Repository;
pub use schema::{describe_table, ColumnKind, ColumnMeta, Entity, EntityMeta};
