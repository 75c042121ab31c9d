//! Inference of undeclared references from naming and key types.
//!
//! A column such as `orders.customer_id` is matched against tables whose
//! name relates to the stem `customer` and whose single-column primary
//! key has a compatible type. At most one target is chosen per column:
//! exact name matches beat partial ones, then the higher type score wins,
//! then the lexicographically smallest table name.

use std::cmp::Ordering;

use ontodag_types::{
    Cardinality, ColumnSchema, InferenceMethod, Relationship, RelationshipKey, RelationshipSet,
    SchemaSnapshot, TableSchema,
};
use tokio_util::sync::CancellationToken;

use super::naming::{name_match, reference_stem, type_compatibility, NameMatch};
use crate::errors::StageError;
use crate::executor::ProgressReporter;

/// A table that can be referenced: it has a single-column primary key.
struct Target<'a> {
    table: &'a TableSchema,
    key: &'a ColumnSchema,
}

struct Candidate<'a> {
    target: &'a Target<'a>,
    name: NameMatch,
    type_score: f64,
}

impl Candidate<'_> {
    fn rank(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| other.type_score.total_cmp(&self.type_score))
            .then_with(|| self.target.table.name.cmp(&other.target.table.name))
    }

    fn confidence(&self) -> f64 {
        round2(self.name.base_confidence() * self.type_score)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Infer references for columns that follow an identifier-reference
/// naming convention but have no declared or known relationship.
///
/// `known` must hold every relationship already recorded for the
/// datasource (foreign-key results and manual ones): columns it covers
/// are not considered, so results are disjoint from it.
///
/// # Errors
///
/// Returns [`StageError::Cancelled`] if `cancel` fires; the check runs
/// once per table.
pub fn discover_pk_matches(
    schema: &SchemaSnapshot,
    known: &RelationshipSet,
    cancel: &CancellationToken,
    progress: &ProgressReporter,
) -> Result<Vec<Relationship>, StageError> {
    let targets: Vec<Target<'_>> = schema
        .tables
        .iter()
        .filter_map(|table| table.single_primary_key().map(|key| Target { table, key }))
        .collect();

    let total = schema.tables.len() as u64;
    let mut found = Vec::new();

    for (scanned, table) in (0u64..).zip(&schema.tables) {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }
        progress.report(scanned, total, format!("scanning {}", table.name));

        for column in &table.columns {
            if table.primary_key.contains(&column.name)
                || known.covers_source(&table.name, &column.name)
            {
                continue;
            }
            let Some(stem) = reference_stem(&column.name) else {
                continue;
            };

            let best = targets
                .iter()
                .filter_map(|target| {
                    let name = name_match(&stem, &target.table.name)?;
                    let type_score = type_compatibility(&column.data_type, &target.key.data_type)?;
                    let key = RelationshipKey {
                        source_table: table.name.clone(),
                        source_column: column.name.clone(),
                        target_table: target.table.name.clone(),
                        target_column: target.key.name.clone(),
                    };
                    (!known.contains(&key)).then_some(Candidate {
                        target,
                        name,
                        type_score,
                    })
                })
                .min_by(Candidate::rank);

            if let Some(best) = best {
                found.push(Relationship {
                    source_table: table.name.clone(),
                    source_column: column.name.clone(),
                    target_table: best.target.table.name.clone(),
                    target_column: best.target.key.name.clone(),
                    cardinality: Cardinality::for_reference(table.is_unique_column(&column.name)),
                    confidence: best.confidence(),
                    inference_method: InferenceMethod::PkMatch,
                });
            }
        }
    }

    progress.report(total, total, format!("scanned {total} tables"));
    Ok(found)
}
