//! Persisted DAG and node model.
//!
//! A "DAG" here is a linear chain: node `order` defines execution order
//! and each node depends only on its predecessor having completed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{DagId, DatasourceId, NodeId, OntologyId, ProjectId};

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a whole DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DagStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl DagStatus {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the storage string back into a status.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// `completed`, `failed` and `cancelled` admit no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for DagStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a single node. There is no `skipped` state: a node
/// that is never reached stays `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl NodeStatus {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse the storage string back into a status.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Progress reported by a running node executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProgress {
    pub current: u64,
    pub total: u64,
    pub message: String,
}

impl NodeProgress {
    #[must_use]
    pub fn new(current: u64, total: u64, message: impl Into<String>) -> Self {
        Self {
            current,
            total,
            message: message.into(),
        }
    }
}

/// One stage within a DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagNode {
    pub id: NodeId,
    pub name: String,
    /// 1-based, contiguous and strictly increasing within a DAG.
    pub order: u32,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<NodeProgress>,
    /// Set only when `status == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl DagNode {
    /// A fresh, not-yet-reached node.
    #[must_use]
    pub fn pending(name: impl Into<String>, order: u32) -> Self {
        Self {
            id: NodeId::generate(),
            name: name.into(),
            order,
            status: NodeStatus::Pending,
            progress: None,
            error_message: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// One execution of the extraction pipeline for a (project, datasource) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dag {
    pub id: DagId,
    pub project_id: ProjectId,
    pub datasource_id: DatasourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ontology_id: Option<OntologyId>,
    pub status: DagStatus,
    /// Running node, or the last attempted node once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Heartbeat: bumped on every persisted mutation of the DAG or its nodes.
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub nodes: Vec<DagNode>,
}

impl Dag {
    /// Build a new `pending` DAG whose nodes follow `node_names` in order.
    #[must_use]
    pub fn new_pending<S: AsRef<str>>(
        project_id: ProjectId,
        datasource_id: DatasourceId,
        node_names: &[S],
        now: DateTime<Utc>,
    ) -> Self {
        let nodes = node_names
            .iter()
            .zip(1u32..)
            .map(|(name, order)| DagNode::pending(name.as_ref(), order))
            .collect();
        Self {
            id: DagId::generate(),
            project_id,
            datasource_id,
            ontology_id: None,
            status: DagStatus::Pending,
            current_node: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            nodes,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Look up a node by its 1-based order.
    #[must_use]
    pub fn node(&self, order: u32) -> Option<&DagNode> {
        self.nodes.iter().find(|n| n.order == order)
    }

    /// Look up a node by name.
    #[must_use]
    pub fn node_named(&self, name: &str) -> Option<&DagNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Check the structural invariants of a persisted DAG, returning every
    /// violation found.
    ///
    /// Used by tests and by the CLI's `status --check` output.
    #[must_use]
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        for (expected, node) in (1u32..).zip(&self.nodes) {
            if node.order != expected {
                violations.push(format!(
                    "node '{}' has order {} but expected {expected}",
                    node.name, node.order
                ));
            }
            if node.error_message.is_some() && node.status != NodeStatus::Failed {
                violations.push(format!(
                    "node '{}' carries an error but is {}",
                    node.name, node.status
                ));
            }
        }

        // Every node after the first non-completed node must still be pending.
        if let Some(frontier) = self
            .nodes
            .iter()
            .position(|n| n.status != NodeStatus::Completed)
        {
            for node in &self.nodes[frontier + 1..] {
                if node.status != NodeStatus::Pending {
                    violations.push(format!(
                        "node '{}' is {} after an unfinished predecessor",
                        node.name, node.status
                    ));
                }
            }
        }

        let any_started = self.nodes.iter().any(|n| n.status != NodeStatus::Pending);
        if any_started != self.current_node.is_some() {
            violations.push(format!(
                "current_node is {:?} but started nodes = {any_started}",
                self.current_node
            ));
        }

        let failed = self.nodes.iter().any(|n| n.status == NodeStatus::Failed);
        if failed && self.status != DagStatus::Failed {
            violations.push(format!("a node failed but the dag is {}", self.status));
        }

        if self.status == DagStatus::Completed
            && self.nodes.iter().any(|n| n.status != NodeStatus::Completed)
        {
            violations.push("dag completed with unfinished nodes".to_string());
        }

        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dag {
        Dag::new_pending(
            ProjectId::new("p"),
            DatasourceId::new("ds"),
            &["KnowledgeSeeding", "FKDiscovery", "PKMatchDiscovery"],
            Utc::now(),
        )
    }

    #[test]
    fn new_dag_has_contiguous_pending_nodes() {
        let dag = sample();
        assert_eq!(dag.status, DagStatus::Pending);
        let orders: Vec<u32> = dag.nodes.iter().map(|n| n.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        assert!(dag.nodes.iter().all(|n| n.status == NodeStatus::Pending));
        assert!(dag.current_node.is_none());
        assert!(dag.invariant_violations().is_empty());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!DagStatus::Pending.is_terminal());
        assert!(!DagStatus::Running.is_terminal());
        assert!(DagStatus::Completed.is_terminal());
        assert!(DagStatus::Failed.is_terminal());
        assert!(DagStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_strings_roundtrip() {
        for status in [
            DagStatus::Pending,
            DagStatus::Running,
            DagStatus::Completed,
            DagStatus::Failed,
            DagStatus::Cancelled,
        ] {
            assert_eq!(DagStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(NodeStatus::parse("skipped"), None);
    }

    #[test]
    fn detects_node_running_after_unfinished_predecessor() {
        let mut dag = sample();
        dag.status = DagStatus::Running;
        dag.current_node = Some("FKDiscovery".into());
        dag.nodes[1].status = NodeStatus::Running;
        let violations = dag.invariant_violations();
        assert_eq!(violations.len(), 1, "{violations:?}");
        assert!(violations[0].contains("FKDiscovery"));
    }

    #[test]
    fn detects_failed_node_under_running_dag() {
        let mut dag = sample();
        dag.status = DagStatus::Running;
        dag.current_node = Some("KnowledgeSeeding".into());
        dag.nodes[0].status = NodeStatus::Failed;
        dag.nodes[0].error_message = Some("boom".into());
        assert!(dag
            .invariant_violations()
            .iter()
            .any(|v| v.contains("dag is running")));
    }

    #[test]
    fn node_lookup() {
        let dag = sample();
        assert_eq!(dag.node(2).map(|n| n.name.as_str()), Some("FKDiscovery"));
        assert_eq!(dag.node_named("PKMatchDiscovery").map(|n| n.order), Some(3));
        assert!(dag.node(4).is_none());
    }
}
