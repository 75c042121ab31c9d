//! Opaque identifier newtypes.
//!
//! Every identifier is a string on the wire and in storage. Identifiers
//! minted by ontodag itself (DAGs, nodes, ontologies) are random UUIDs;
//! project and datasource identifiers are owned by the caller.

use serde::{Deserialize, Serialize};

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the inner string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl<S: Into<String>> From<S> for $name {
            fn from(value: S) -> Self {
                Self(value.into())
            }
        }
    };
}

macro_rules! generated_id {
    ($name:ident) => {
        impl $name {
            /// Mint a fresh random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }
        }
    };
}

opaque_id!(
    /// Owning tenant of a DAG and its derived ontology.
    ProjectId
);
opaque_id!(
    /// Target database connection the pipeline extracts from.
    DatasourceId
);
opaque_id!(
    /// One pipeline execution.
    DagId
);
opaque_id!(
    /// One stage row within a DAG.
    NodeId
);
opaque_id!(
    /// Persisted ontology artifact produced by a completed pipeline.
    OntologyId
);

generated_id!(DagId);
generated_id!(NodeId);
generated_id!(OntologyId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_as_str_agree() {
        let id = ProjectId::new("proj-1");
        assert_eq!(id.as_str(), "proj-1");
        assert_eq!(id.to_string(), "proj-1");
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = DagId::generate();
        let b = DagId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn serde_is_transparent() {
        let id = DatasourceId::new("ds");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"ds\"");
    }
}
