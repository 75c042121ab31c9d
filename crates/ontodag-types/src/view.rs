//! Caller-facing DAG representation.
//!
//! This is the shape a polling UI consumes: a flattened DAG with node
//! names, statuses, progress and errors, and no storage identifiers
//! beyond the DAG id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::{Dag, DagNode, DagStatus, NodeProgress, NodeStatus};
use crate::ids::DagId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    pub name: String,
    /// Read together with the DAG status: under a `cancelled` DAG, a node
    /// still `running` is the one the cancellation interrupted. It keeps its
    /// last progress and no longer executes.
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<NodeProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&DagNode> for NodeView {
    fn from(node: &DagNode) -> Self {
        Self {
            name: node.name.clone(),
            status: node.status,
            progress: node.progress.clone(),
            error: node.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagView {
    pub dag_id: DagId,
    pub status: DagStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<String>,
    pub nodes: Vec<NodeView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Dag> for DagView {
    fn from(dag: &Dag) -> Self {
        Self {
            dag_id: dag.id.clone(),
            status: dag.status,
            current_node: dag.current_node.clone(),
            nodes: dag.nodes.iter().map(NodeView::from).collect(),
            started_at: dag.started_at,
            completed_at: dag.completed_at,
        }
    }
}

/// Envelope for a status lookup: `{"data": null}` when no DAG has ever
/// run for the datasource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub data: Option<DagView>,
}

impl From<Option<&Dag>> for StatusResponse {
    fn from(dag: Option<&Dag>) -> Self {
        Self {
            data: dag.map(DagView::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{DatasourceId, ProjectId};

    #[test]
    fn view_omits_unset_fields() {
        let dag = Dag::new_pending(
            ProjectId::new("p"),
            DatasourceId::new("ds"),
            &["FKDiscovery"],
            Utc::now(),
        );
        let json = serde_json::to_value(DagView::from(&dag)).unwrap();
        assert_eq!(json["status"], "pending");
        assert!(json.get("current_node").is_none());
        assert!(json.get("started_at").is_none());
        assert_eq!(json["nodes"][0]["name"], "FKDiscovery");
        assert!(json["nodes"][0].get("error").is_none());
    }

    #[test]
    fn failed_node_exposes_error() {
        let mut dag = Dag::new_pending(
            ProjectId::new("p"),
            DatasourceId::new("ds"),
            &["KnowledgeSeeding"],
            Utc::now(),
        );
        dag.nodes[0].status = NodeStatus::Failed;
        dag.nodes[0].error_message = Some("LLM request timed out".into());
        let json = serde_json::to_value(DagView::from(&dag)).unwrap();
        assert_eq!(json["nodes"][0]["status"], "failed");
        assert_eq!(json["nodes"][0]["error"], "LLM request timed out");
    }

    #[test]
    fn missing_dag_serializes_as_null_data() {
        let json = serde_json::to_string(&StatusResponse::from(None::<&Dag>)).unwrap();
        assert_eq!(json, r#"{"data":null}"#);
    }
}
