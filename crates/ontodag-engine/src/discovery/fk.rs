//! Relationships from declared foreign-key constraints.

use std::collections::HashSet;

use ontodag_types::{
    Cardinality, InferenceMethod, Relationship, RelationshipKey, RelationshipSet, SchemaSnapshot,
};
use tokio_util::sync::CancellationToken;

use crate::errors::StageError;
use crate::executor::ProgressReporter;

/// Emit one relationship per declared foreign-key column pair.
///
/// Confidence is always 1.0. Cardinality is `1:1` when the referencing
/// column is unique, `N:1` otherwise; no reverse relationship is emitted.
/// Pairs present in `known` (manual relationships) are skipped.
///
/// # Errors
///
/// Returns [`StageError::Cancelled`] if `cancel` fires; the check runs
/// once per table.
pub fn discover_foreign_keys(
    schema: &SchemaSnapshot,
    known: &RelationshipSet,
    cancel: &CancellationToken,
    progress: &ProgressReporter,
) -> Result<Vec<Relationship>, StageError> {
    let total = schema.tables.len() as u64;
    let mut seen: HashSet<RelationshipKey> = HashSet::new();
    let mut found = Vec::new();

    for (scanned, table) in (0u64..).zip(&schema.tables) {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }
        progress.report(scanned, total, format!("scanning {}", table.name));

        for fk in &table.foreign_keys {
            let relationship = Relationship {
                source_table: table.name.clone(),
                source_column: fk.column.clone(),
                target_table: fk.references_table.clone(),
                target_column: fk.references_column.clone(),
                cardinality: Cardinality::for_reference(table.is_unique_column(&fk.column)),
                confidence: 1.0,
                inference_method: InferenceMethod::ForeignKey,
            };
            let key = relationship.key();
            if known.contains(&key) || !seen.insert(key) {
                continue;
            }
            found.push(relationship);
        }
    }

    progress.report(total, total, format!("scanned {total} tables"));
    Ok(found)
}
