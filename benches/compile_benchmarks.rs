//! Benchmarks for predicate compilation.
//!
//! Benchmarks cover:
//! - Converter: query chain → SQL per dialect
//! - Predicate text parsing (sqlparser → AST)
//! - Membership lists of growing size
//!
//! Run with: `cargo bench`

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use predsql::ast::{
    col, Captured, Converter, Dialect, Expr, Node, NodeRef, Operator, SqlPredicateAdapter,
};
use predsql::db::{ColumnKind, EntityMeta};

fn users() -> EntityMeta {
    EntityMeta::new("users")
        .column("id", ColumnKind::Int)
        .column("name", ColumnKind::Text)
        .column("email", ColumnKind::Text)
        .column("age", ColumnKind::Int)
        .column("active", ColumnKind::Bool)
}

fn chain(root: NodeRef, op: Operator, arg: NodeRef) -> NodeRef {
    Node::call(op, vec![root, arg])
}

fn filtered(predicate: Expr) -> NodeRef {
    chain(Arc::new(Node::Source), Operator::Where, predicate.into_lambda())
}

fn paged_query() -> NodeRef {
    let root = filtered(col("age").gt(18).and(col("active").eq(true)));
    let root = chain(root, Operator::OrderByDescending, col("id").into_lambda());
    let root = chain(root, Operator::Skip, predsql::ast::lit(10).into_node());
    chain(root, Operator::Take, predsql::ast::lit(5).into_node())
}

fn nested_query() -> NodeRef {
    let predicate = col("age")
        .gt(18)
        .and(col("name").ne("bob").or(col("email").eq(predsql::ast::null())))
        .and(!col("active"))
        .or(col("age").le(3).and(col("name").eq("ann")));
    filtered(predicate)
}

const PREDICATES: &[(&str, &str)] = &[
    ("simple", "age > 18"),
    ("logical", "age > 18 AND active = 1 OR name = 'ann'"),
    ("nulls", "email IS NULL AND NOT (name IS NOT NULL)"),
    ("in_list", "id IN (1, 2, 3, 4, 5, 6, 7, 8)"),
];

fn bench_compilation(c: &mut Criterion) {
    let mut group = c.benchmark_group("compilation");
    let meta = users();
    let queries = [("paged", paged_query()), ("nested", nested_query())];

    for dialect in [
        Dialect::SqlServer,
        Dialect::SqlServerLegacy,
        Dialect::Postgres,
        Dialect::MySql,
    ] {
        let converter = Converter::new(dialect, &meta);
        for (name, root) in &queries {
            group.bench_with_input(
                BenchmarkId::new(format!("compile_{}", dialect), name),
                root,
                |b, root| b.iter(|| converter.compile(black_box(root))),
            );
        }
    }

    group.finish();
}

fn bench_predicate_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("predicate_parsing");
    let adapter = SqlPredicateAdapter::new(Dialect::Postgres);

    for (name, text) in PREDICATES {
        group.bench_with_input(BenchmarkId::new("parse", name), text, |b, text| {
            b.iter(|| adapter.parse(black_box(text)))
        });
    }

    group.finish();
}

fn bench_membership(c: &mut Criterion) {
    let mut group = c.benchmark_group("membership");
    let meta = users();
    let converter = Converter::new(Dialect::SqlServer, &meta);

    for size in [10usize, 100, 1000] {
        let ids: predsql::ast::Value = (0..size as i64).collect();
        let root = filtered(col("id").is_in(Captured::new(ids)));
        group.bench_with_input(BenchmarkId::new("contains", size), &root, |b, root| {
            b.iter(|| converter.compile(black_box(root)))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_compilation,
    bench_predicate_parsing,
    bench_membership
);
criterion_main!(benches);
