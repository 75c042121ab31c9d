//! Criterion benchmarks for relationship discovery.
//!
//! Schemas are synthetic star layouts: one hub table referenced by every
//! other table, half of the references declared as foreign keys.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use ontodag_engine::discovery::{discover_foreign_keys, discover_pk_matches};
use ontodag_engine::ProgressReporter;
use ontodag_types::{ColumnSchema, RelationshipSet, SchemaSnapshot, TableSchema};
use tokio_util::sync::CancellationToken;

fn star_schema(tables: usize) -> SchemaSnapshot {
    let mut built = vec![TableSchema::new(
        "customers",
        vec![ColumnSchema::new("id", "bigint").not_null()],
    )
    .with_primary_key(["id"])];
    for i in 0..tables {
        let mut table = TableSchema::new(
            format!("events_{i}"),
            vec![
                ColumnSchema::new("id", "bigint").not_null(),
                ColumnSchema::new("customer_id", "bigint"),
                ColumnSchema::new(format!("events_{}_id", (i + 1) % tables), "bigint"),
                ColumnSchema::new("payload", "jsonb"),
            ],
        )
        .with_primary_key(["id"]);
        if i % 2 == 0 {
            table = table.with_foreign_key("customer_id", "customers", "id");
        }
        built.push(table);
    }
    SchemaSnapshot::new(built)
}

fn bench_discovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("discovery");
    let cancel = CancellationToken::new();
    let progress = ProgressReporter::detached();

    for size in [10, 100, 500] {
        let schema = star_schema(size);

        group.bench_with_input(BenchmarkId::new("foreign_keys", size), &schema, |b, schema| {
            b.iter(|| {
                discover_foreign_keys(schema, &RelationshipSet::new(), &cancel, &progress).unwrap()
            });
        });

        let fks = discover_foreign_keys(&schema, &RelationshipSet::new(), &cancel, &progress)
            .unwrap();
        let known: RelationshipSet = fks.iter().collect();
        group.bench_with_input(BenchmarkId::new("pk_match", size), &schema, |b, schema| {
            b.iter(|| discover_pk_matches(schema, &known, &cancel, &progress).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_discovery);
criterion_main!(benches);
