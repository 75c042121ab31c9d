//! Relationship discovery stages.
//!
//! Each stage scans the full snapshot first and only then replaces its
//! method's inferred rows in one write, so a failed or cancelled scan
//! leaves the previously recorded relationships untouched.

use std::sync::Arc;

use ontodag_state::OntologyStore;
use ontodag_types::{InferenceMethod, Relationship, RelationshipSet, SchemaSnapshot};
use tokio_util::sync::CancellationToken;

use super::StageDeps;
use crate::discovery::{discover_foreign_keys, discover_pk_matches};
use crate::errors::StageError;
use crate::executor::{NodeExecutor, PipelineContext, ProgressReporter, StageOutput};

/// Whether discovery by `method` leaves pairs recorded by `other` alone.
/// Declared constraints only yield to manual pairs; pattern matches yield
/// to everything else.
fn defers_to(method: InferenceMethod, other: InferenceMethod) -> bool {
    match method {
        InferenceMethod::PkMatch => other != InferenceMethod::PkMatch,
        _ => other == InferenceMethod::Manual,
    }
}

/// Pairs that discovery by `method` must not report, from the store and
/// from earlier stages of this run.
async fn known_relationships(
    deps: &StageDeps,
    ctx: &PipelineContext,
    method: InferenceMethod,
) -> Result<RelationshipSet, StageError> {
    let project = ctx.project_id.clone();
    let datasource = ctx.datasource_id.clone();
    let stored = deps
        .store_call(move |s| s.relationships(&project, &datasource))
        .await?;
    let mut known: RelationshipSet = stored
        .iter()
        .filter(|r| defers_to(method, r.inference_method))
        .collect();
    known.extend(
        ctx.relationships
            .iter()
            .filter(|r| defers_to(method, r.inference_method)),
    );
    Ok(known)
}

async fn persist(
    deps: &StageDeps,
    ctx: &PipelineContext,
    method: InferenceMethod,
    relationships: Vec<Relationship>,
    schema: Arc<SchemaSnapshot>,
) -> Result<StageOutput, StageError> {
    let project = ctx.project_id.clone();
    let datasource = ctx.datasource_id.clone();
    let rows = relationships.clone();
    let inserted = deps
        .store_call(move |s| s.replace_inferred_relationships(&project, &datasource, method, &rows))
        .await?;
    tracing::info!(
        dag_id = ctx.dag_id.as_str(),
        datasource = ctx.datasource_id.as_str(),
        method = method.as_str(),
        discovered = relationships.len(),
        inserted,
        "Recorded inferred relationships"
    );
    Ok(StageOutput::Relationships {
        schema,
        method,
        relationships,
    })
}

/// Records declared foreign keys.
pub struct FkDiscoveryStage {
    deps: StageDeps,
}

impl FkDiscoveryStage {
    pub fn new(deps: StageDeps) -> Self {
        Self { deps }
    }
}

#[async_trait::async_trait]
impl NodeExecutor for FkDiscoveryStage {
    fn name(&self) -> &str {
        "FKDiscovery"
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        ctx: &PipelineContext,
        progress: &ProgressReporter,
    ) -> Result<StageOutput, StageError> {
        let (schema, _) = self.deps.schema(ctx).await?;
        let known = known_relationships(&self.deps, ctx, InferenceMethod::ForeignKey).await?;
        let found = discover_foreign_keys(&schema, &known, cancel, progress)?;
        persist(&self.deps, ctx, InferenceMethod::ForeignKey, found, schema).await
    }
}

/// Infers undeclared references by naming convention and key type.
pub struct PkMatchDiscoveryStage {
    deps: StageDeps,
}

impl PkMatchDiscoveryStage {
    pub fn new(deps: StageDeps) -> Self {
        Self { deps }
    }
}

#[async_trait::async_trait]
impl NodeExecutor for PkMatchDiscoveryStage {
    fn name(&self) -> &str {
        "PKMatchDiscovery"
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        ctx: &PipelineContext,
        progress: &ProgressReporter,
    ) -> Result<StageOutput, StageError> {
        let (schema, _) = self.deps.schema(ctx).await?;
        let known = known_relationships(&self.deps, ctx, InferenceMethod::PkMatch).await?;
        let found = discover_pk_matches(&schema, &known, cancel, progress)?;
        persist(&self.deps, ctx, InferenceMethod::PkMatch, found, schema).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{StaticSchema, UnconfiguredSchema};
    use ontodag_state::{SqliteStateStore, StateStore};
    use ontodag_types::{
        Cardinality, ColumnSchema, DagId, DatasourceId, ProjectId, TableSchema,
    };

    fn schema() -> SchemaSnapshot {
        SchemaSnapshot::new(vec![
            TableSchema::new("users", vec![ColumnSchema::new("id", "integer").not_null()])
                .with_primary_key(["id"]),
            TableSchema::new(
                "orders",
                vec![
                    ColumnSchema::new("id", "integer").not_null(),
                    ColumnSchema::new("user_id", "integer"),
                ],
            )
            .with_primary_key(["id"])
            .with_foreign_key("user_id", "users", "id"),
            TableSchema::new(
                "reviews",
                vec![
                    ColumnSchema::new("id", "integer").not_null(),
                    ColumnSchema::new("order_id", "integer"),
                ],
            )
            .with_primary_key(["id"]),
        ])
    }

    fn ctx() -> PipelineContext {
        PipelineContext::new(
            ProjectId::new("p"),
            DatasourceId::new("ds"),
            DagId::new("d"),
            None,
        )
    }

    fn setup() -> (StageDeps, Arc<dyn StateStore>) {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::in_memory().unwrap());
        let deps = StageDeps::new(Arc::clone(&store), Arc::new(StaticSchema(schema())));
        (deps, store)
    }

    #[tokio::test]
    async fn fk_then_pk_match_are_disjoint_and_persisted() {
        let (deps, store) = setup();
        let cancel = CancellationToken::new();
        let progress = ProgressReporter::detached();
        let mut ctx = ctx();

        let fk = FkDiscoveryStage::new(deps.clone())
            .execute(&cancel, &ctx, &progress)
            .await
            .unwrap();
        ctx.absorb(fk);
        let pk = PkMatchDiscoveryStage::new(deps)
            .execute(&cancel, &ctx, &progress)
            .await
            .unwrap();
        ctx.absorb(pk);

        let stored = store
            .relationships(&ProjectId::new("p"), &DatasourceId::new("ds"))
            .unwrap();
        assert_eq!(stored.len(), 2);
        let fk: Vec<_> = ctx.relationships_by(InferenceMethod::ForeignKey).collect();
        let pk: Vec<_> = ctx.relationships_by(InferenceMethod::PkMatch).collect();
        assert_eq!(fk.len(), 1);
        assert_eq!(fk[0].key().to_string(), "orders.user_id -> users.id");
        assert_eq!(pk.len(), 1);
        assert_eq!(pk[0].key().to_string(), "reviews.order_id -> orders.id");
    }

    #[tokio::test]
    async fn rerun_replaces_previous_inferred_rows() {
        let (deps, store) = setup();
        let stage = FkDiscoveryStage::new(deps);
        for _ in 0..2 {
            stage
                .execute(&CancellationToken::new(), &ctx(), &ProgressReporter::detached())
                .await
                .unwrap();
        }
        let stored = store
            .relationships(&ProjectId::new("p"), &DatasourceId::new("ds"))
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn manual_relationship_suppresses_inference() {
        let (deps, store) = setup();
        store
            .add_manual_relationship(
                &ProjectId::new("p"),
                &DatasourceId::new("ds"),
                &Relationship::manual("reviews", "order_id", "orders", "id", Cardinality::OneToOne),
            )
            .unwrap();
        let out = PkMatchDiscoveryStage::new(deps)
            .execute(&CancellationToken::new(), &ctx(), &ProgressReporter::detached())
            .await
            .unwrap();
        assert!(matches!(
            out,
            StageOutput::Relationships { relationships, .. } if relationships.is_empty()
        ));
    }

    #[tokio::test]
    async fn declared_key_replaces_earlier_pattern_match() {
        let (deps, store) = setup();
        let (project, datasource) = (ProjectId::new("p"), DatasourceId::new("ds"));
        // An earlier run matched the column before the constraint existed.
        let matched = Relationship {
            confidence: 0.9,
            inference_method: InferenceMethod::PkMatch,
            ..Relationship::manual("orders", "user_id", "users", "id", Cardinality::ManyToOne)
        };
        store
            .replace_inferred_relationships(
                &project,
                &datasource,
                InferenceMethod::PkMatch,
                &[matched],
            )
            .unwrap();

        let cancel = CancellationToken::new();
        let progress = ProgressReporter::detached();
        let mut ctx = ctx();
        let fk = FkDiscoveryStage::new(deps.clone())
            .execute(&cancel, &ctx, &progress)
            .await
            .unwrap();
        ctx.absorb(fk);
        assert_eq!(ctx.relationships_by(InferenceMethod::ForeignKey).count(), 1);
        let pk = PkMatchDiscoveryStage::new(deps)
            .execute(&cancel, &ctx, &progress)
            .await
            .unwrap();
        ctx.absorb(pk);

        let stored = store.relationships(&project, &datasource).unwrap();
        let user_ref = stored
            .iter()
            .find(|r| r.key().to_string() == "orders.user_id -> users.id")
            .unwrap();
        assert_eq!(user_ref.inference_method, InferenceMethod::ForeignKey);
        assert!((user_ref.confidence - 1.0).abs() < f64::EPSILON);
        assert!(ctx
            .relationships_by(InferenceMethod::PkMatch)
            .all(|r| r.source_column != "user_id"));
    }

    #[tokio::test]
    async fn cancelled_scan_writes_nothing() {
        let (deps, store) = setup();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = FkDiscoveryStage::new(deps)
            .execute(&cancel, &ctx(), &ProgressReporter::detached())
            .await;
        assert_eq!(result.unwrap_err(), StageError::Cancelled);
        assert!(store
            .relationships(&ProjectId::new("p"), &DatasourceId::new("ds"))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn schema_failure_fails_the_stage() {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::in_memory().unwrap());
        let deps = StageDeps::new(store, Arc::new(UnconfiguredSchema));
        let err = FkDiscoveryStage::new(deps)
            .execute(&CancellationToken::new(), &ctx(), &ProgressReporter::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Failed(msg) if msg.contains("schema discovery failed")));
    }
}
