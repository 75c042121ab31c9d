//! Properties of relationship discovery over generated schemas.

use std::collections::HashSet;

use ontodag_engine::discovery::{discover_foreign_keys, discover_pk_matches};
use ontodag_engine::ProgressReporter;
use ontodag_types::{ColumnSchema, Relationship, RelationshipSet, SchemaSnapshot, TableSchema};
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

const STEMS: [&str; 6] = ["user", "order", "product", "category", "account", "invoice"];
const TYPES: [&str; 5] = ["integer", "bigint", "uuid", "text", "varchar(36)"];

fn table_name(stem: &str) -> String {
    match stem.strip_suffix('y') {
        Some(base) => format!("{base}ies"),
        None => format!("{stem}s"),
    }
}

/// A table per chosen stem, keyed by `id`, holding reference columns to
/// other stems and an optional declared foreign key for each.
fn schema_strategy() -> impl Strategy<Value = SchemaSnapshot> {
    let table = (
        0..STEMS.len(),
        0..TYPES.len(),
        prop::collection::vec((0..STEMS.len(), 0..TYPES.len(), any::<bool>()), 0..4),
    );
    prop::collection::vec(table, 1..6).prop_map(|tables| {
        let mut seen = HashSet::new();
        let mut built = Vec::new();
        for (stem, key_type, refs) in tables {
            if !seen.insert(stem) {
                continue;
            }
            let name = table_name(STEMS[stem]);
            let mut columns = vec![ColumnSchema::new("id", TYPES[key_type]).not_null()];
            let mut declared = Vec::new();
            let mut used = HashSet::new();
            for (target, column_type, declare) in refs {
                let column = format!("{}_id", STEMS[target]);
                if !used.insert(column.clone()) {
                    continue;
                }
                columns.push(ColumnSchema::new(column.clone(), TYPES[column_type]));
                if declare {
                    declared.push((column, table_name(STEMS[target])));
                }
            }
            let mut table = TableSchema::new(name, columns).with_primary_key(["id"]);
            for (column, target) in declared {
                table = table.with_foreign_key(column, target, "id");
            }
            built.push(table);
        }
        SchemaSnapshot::new(built)
    })
}

/// Foreign keys, then PK matches given those foreign keys.
fn run(schema: &SchemaSnapshot) -> (Vec<Relationship>, Vec<Relationship>) {
    let cancel = CancellationToken::new();
    let progress = ProgressReporter::detached();
    let fks = discover_foreign_keys(schema, &RelationshipSet::new(), &cancel, &progress).unwrap();
    let known: RelationshipSet = fks.iter().collect();
    let matches = discover_pk_matches(schema, &known, &cancel, &progress).unwrap();
    (fks, matches)
}

proptest! {
    #[test]
    fn pk_matches_never_overlap_foreign_keys(schema in schema_strategy()) {
        let (fks, matches) = run(&schema);
        let fk_sources: HashSet<_> = fks
            .iter()
            .map(|r| (r.source_table.clone(), r.source_column.clone()))
            .collect();
        for rel in &matches {
            prop_assert!(!fk_sources.contains(&(rel.source_table.clone(), rel.source_column.clone())));
            prop_assert!(rel.confidence < 1.0);
            prop_assert!(rel.confidence > 0.0);
        }
        for rel in &fks {
            prop_assert!((rel.confidence - 1.0).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn at_most_one_match_per_source_column(schema in schema_strategy()) {
        let (_, matches) = run(&schema);
        let mut sources = HashSet::new();
        for rel in &matches {
            prop_assert!(sources.insert((rel.source_table.clone(), rel.source_column.clone())));
        }
    }

    #[test]
    fn discovery_is_deterministic(schema in schema_strategy()) {
        let first = run(&schema);
        let second = run(&schema);
        prop_assert_eq!(first, second);
    }
}
