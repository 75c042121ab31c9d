//! Relationship records produced by discovery stages or entered by users.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Multiplicity of a relationship from the source side to the target side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    #[serde(rename = "1:1")]
    OneToOne,
    #[serde(rename = "N:1")]
    ManyToOne,
    #[serde(rename = "1:N")]
    OneToMany,
    #[serde(rename = "N:M")]
    ManyToMany,
}

impl Cardinality {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneToOne => "1:1",
            Self::ManyToOne => "N:1",
            Self::OneToMany => "1:N",
            Self::ManyToMany => "N:M",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "1:1" => Some(Self::OneToOne),
            "N:1" => Some(Self::ManyToOne),
            "1:N" => Some(Self::OneToMany),
            "N:M" => Some(Self::ManyToMany),
            _ => None,
        }
    }

    /// A reference from a unique source column is one-to-one, otherwise
    /// many source rows point at one target row.
    #[must_use]
    pub fn for_reference(source_is_unique: bool) -> Self {
        if source_is_unique {
            Self::OneToOne
        } else {
            Self::ManyToOne
        }
    }
}

impl std::fmt::Display for Cardinality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a relationship came to be known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceMethod {
    /// Declared foreign-key constraint.
    ForeignKey,
    /// Naming/type convention match against a primary key.
    PkMatch,
    /// User-defined; never overwritten by discovery.
    Manual,
}

impl InferenceMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ForeignKey => "foreign_key",
            Self::PkMatch => "pk_match",
            Self::Manual => "manual",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "foreign_key" => Some(Self::ForeignKey),
            "pk_match" => Some(Self::PkMatch),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }

    /// Whether rows with this method are pipeline output.
    #[must_use]
    pub fn is_inferred(self) -> bool {
        !matches!(self, Self::Manual)
    }
}

impl std::fmt::Display for InferenceMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a relationship: the column pair it links.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationshipKey {
    pub source_table: String,
    pub source_column: String,
    pub target_table: String,
    pub target_column: String,
}

impl std::fmt::Display for RelationshipKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.source_table, self.source_column, self.target_table, self.target_column
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub source_table: String,
    pub source_column: String,
    pub target_table: String,
    pub target_column: String,
    pub cardinality: Cardinality,
    /// `1.0` for declared constraints, strictly below for heuristics.
    pub confidence: f64,
    pub inference_method: InferenceMethod,
}

impl Relationship {
    #[must_use]
    pub fn key(&self) -> RelationshipKey {
        RelationshipKey {
            source_table: self.source_table.clone(),
            source_column: self.source_column.clone(),
            target_table: self.target_table.clone(),
            target_column: self.target_column.clone(),
        }
    }

    /// A user-defined relationship.
    #[must_use]
    pub fn manual(
        source_table: impl Into<String>,
        source_column: impl Into<String>,
        target_table: impl Into<String>,
        target_column: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            source_table: source_table.into(),
            source_column: source_column.into(),
            target_table: target_table.into(),
            target_column: target_column.into(),
            cardinality,
            confidence: 1.0,
            inference_method: InferenceMethod::Manual,
        }
    }
}

/// Lookup set over known relationships, used to keep discovery from
/// re-reporting pairs that are already recorded.
#[derive(Debug, Clone, Default)]
pub struct RelationshipSet {
    keys: HashSet<RelationshipKey>,
    source_columns: HashSet<(String, String)>,
}

impl RelationshipSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, relationship: &Relationship) {
        self.source_columns.insert((
            relationship.source_table.clone(),
            relationship.source_column.clone(),
        ));
        self.keys.insert(relationship.key());
    }

    #[must_use]
    pub fn contains(&self, key: &RelationshipKey) -> bool {
        self.keys.contains(key)
    }

    /// Whether any relationship originates at `table.column`.
    #[must_use]
    pub fn covers_source(&self, table: &str, column: &str) -> bool {
        self.source_columns
            .contains(&(table.to_string(), column.to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<'a> FromIterator<&'a Relationship> for RelationshipSet {
    fn from_iter<I: IntoIterator<Item = &'a Relationship>>(iter: I) -> Self {
        let mut set = Self::new();
        for relationship in iter {
            set.insert(relationship);
        }
        set
    }
}

impl<'a> Extend<&'a Relationship> for RelationshipSet {
    fn extend<I: IntoIterator<Item = &'a Relationship>>(&mut self, iter: I) {
        for relationship in iter {
            self.insert(relationship);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders_to_users() -> Relationship {
        Relationship::manual("orders", "user_id", "users", "id", Cardinality::ManyToOne)
    }

    #[test]
    fn cardinality_wire_format() {
        assert_eq!(
            serde_json::to_string(&Cardinality::ManyToOne).unwrap(),
            "\"N:1\""
        );
        assert_eq!(Cardinality::parse("1:1"), Some(Cardinality::OneToOne));
        assert_eq!(Cardinality::for_reference(true), Cardinality::OneToOne);
        assert_eq!(Cardinality::for_reference(false), Cardinality::ManyToOne);
    }

    #[test]
    fn inference_method_wire_format() {
        assert_eq!(
            serde_json::to_string(&InferenceMethod::ForeignKey).unwrap(),
            "\"foreign_key\""
        );
        assert_eq!(InferenceMethod::parse("pk_match"), Some(InferenceMethod::PkMatch));
        assert!(!InferenceMethod::Manual.is_inferred());
    }

    #[test]
    fn set_tracks_keys_and_source_columns() {
        let set: RelationshipSet = [orders_to_users()].iter().collect();
        assert_eq!(set.len(), 1);
        assert!(set.contains(&orders_to_users().key()));
        assert!(set.covers_source("orders", "user_id"));
        assert!(!set.covers_source("orders", "id"));
    }

    #[test]
    fn key_display() {
        assert_eq!(orders_to_users().key().to_string(), "orders.user_id -> users.id");
    }
}
