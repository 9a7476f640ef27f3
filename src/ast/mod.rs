/// Query expression algebra and SQL translation.
///
/// ```text
/// Expr / Projection builders   (builder.rs)
/// SQL predicate text           (adapter.rs)
///       ↓
/// Query AST                    (types.rs)
///       ↓
/// Generic converter            (compiler.rs)
///       ↓
/// Dialect backend              (dialect.rs)
///       ↓
/// CompiledQuery → db::QueryProvider
/// ```
pub mod adapter;
pub mod builder;
pub mod compiler;
pub mod dialect;
pub mod types;

pub use adapter::SqlPredicateAdapter;
pub use builder::{
    captured, col, lit, null, row_count, Expr, IntoExpr, Projection, LAMBDA_PARAM,
};
pub use compiler::{CompiledQuery, Converter, OrderBy, Translation};
pub use dialect::{Dialect, DialectConstants, Paging, PlaceholderStyle};
pub use types::*;
