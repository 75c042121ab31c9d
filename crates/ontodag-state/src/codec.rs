//! Row decoding shared by the SQL backends.
//!
//! Both backends store timestamps as fixed-width RFC 3339 UTC strings with
//! microsecond precision, so lexicographic order equals time order and
//! heartbeat cutoffs can be compared as text.

use chrono::{DateTime, SecondsFormat, Utc};
use ontodag_types::{
    Cardinality, Dag, DagNode, DagStatus, InferenceMethod, NodeId, NodeProgress, NodeStatus,
    Relationship,
};

use crate::error::{self, StateError};

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_ts() -> String {
    format_ts(Utc::now())
}

pub(crate) fn parse_ts(raw: &str) -> error::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StateError::Corrupt(format!("bad timestamp '{raw}': {e}")))
}

fn parse_opt_ts(raw: Option<&str>) -> error::Result<Option<DateTime<Utc>>> {
    raw.map(parse_ts).transpose()
}

pub(crate) fn parse_dag_status(raw: &str) -> error::Result<DagStatus> {
    DagStatus::parse(raw).ok_or_else(|| StateError::Corrupt(format!("unknown dag status '{raw}'")))
}

/// Raw `dags` row.
pub(crate) struct DagRow {
    pub id: String,
    pub project_id: String,
    pub datasource_id: String,
    pub ontology_id: Option<String>,
    pub status: String,
    pub current_node: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Raw `dag_nodes` row.
pub(crate) struct NodeRow {
    pub id: String,
    pub name: String,
    pub order: i64,
    pub status: String,
    pub progress_current: Option<i64>,
    pub progress_total: Option<i64>,
    pub progress_message: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl NodeRow {
    fn into_node(self) -> error::Result<DagNode> {
        let status = NodeStatus::parse(&self.status)
            .ok_or_else(|| StateError::Corrupt(format!("unknown node status '{}'", self.status)))?;
        let order = u32::try_from(self.order)
            .map_err(|_| StateError::Corrupt(format!("node order {} out of range", self.order)))?;
        let progress = match (self.progress_current, self.progress_total) {
            (Some(current), Some(total)) => Some(NodeProgress {
                current: u64::try_from(current).unwrap_or_default(),
                total: u64::try_from(total).unwrap_or_default(),
                message: self.progress_message.unwrap_or_default(),
            }),
            _ => None,
        };
        Ok(DagNode {
            id: NodeId::new(self.id),
            name: self.name,
            order,
            status,
            progress,
            error_message: self.error_message,
            started_at: parse_opt_ts(self.started_at.as_deref())?,
            completed_at: parse_opt_ts(self.completed_at.as_deref())?,
        })
    }
}

impl DagRow {
    pub(crate) fn into_dag(self, nodes: Vec<NodeRow>) -> error::Result<Dag> {
        let nodes = nodes
            .into_iter()
            .map(NodeRow::into_node)
            .collect::<error::Result<Vec<_>>>()?;
        Ok(Dag {
            id: self.id.into(),
            project_id: self.project_id.into(),
            datasource_id: self.datasource_id.into(),
            ontology_id: self.ontology_id.map(Into::into),
            status: parse_dag_status(&self.status)?,
            current_node: self.current_node,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            started_at: parse_opt_ts(self.started_at.as_deref())?,
            completed_at: parse_opt_ts(self.completed_at.as_deref())?,
            nodes,
        })
    }
}

/// Raw `relationships` row.
pub(crate) struct RelationshipRow {
    pub source_table: String,
    pub source_column: String,
    pub target_table: String,
    pub target_column: String,
    pub cardinality: String,
    pub confidence: f64,
    pub inference_method: String,
}

impl RelationshipRow {
    pub(crate) fn into_relationship(self) -> error::Result<Relationship> {
        let cardinality = Cardinality::parse(&self.cardinality).ok_or_else(|| {
            StateError::Corrupt(format!("unknown cardinality '{}'", self.cardinality))
        })?;
        let inference_method = InferenceMethod::parse(&self.inference_method).ok_or_else(|| {
            StateError::Corrupt(format!(
                "unknown inference method '{}'",
                self.inference_method
            ))
        })?;
        Ok(Relationship {
            source_table: self.source_table,
            source_column: self.source_column,
            target_table: self.target_table,
            target_column: self.target_column,
            cardinality,
            confidence: self.confidence,
            inference_method,
        })
    }
}

/// Progress counters are stored as signed 64-bit integers.
pub(crate) fn progress_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_are_fixed_width_and_roundtrip() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        let raw = format_ts(ts);
        assert_eq!(raw, "2026-01-15T10:00:00.000000Z");
        assert_eq!(parse_ts(&raw).unwrap(), ts);
    }

    #[test]
    fn timestamp_text_order_matches_time_order() {
        let earlier = format_ts(Utc.with_ymd_and_hms(2026, 1, 15, 9, 59, 59).unwrap());
        let later = format_ts(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap());
        assert!(earlier < later);
    }

    #[test]
    fn unknown_status_is_corrupt() {
        let err = parse_dag_status("paused").unwrap_err();
        assert!(matches!(err, StateError::Corrupt(_)));
    }

    #[test]
    fn node_row_without_progress_total_has_no_progress() {
        let row = NodeRow {
            id: "n".into(),
            name: "FKDiscovery".into(),
            order: 1,
            status: "running".into(),
            progress_current: Some(3),
            progress_total: None,
            progress_message: None,
            error_message: None,
            started_at: None,
            completed_at: None,
        };
        assert!(row.into_node().unwrap().progress.is_none());
    }
}
