//! Schema snapshot types.
//!
//! A [`SchemaSnapshot`] is the table/column metadata of a datasource as
//! reported by the external schema discovery capability. Relationship
//! discovery stages take one snapshot and share it, so every stage of a
//! run sees the same schema.

use serde::{Deserialize, Serialize};

/// Column definition within a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    /// Declared database type as reported by the datasource (e.g. `"integer"`).
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Column carries a single-column uniqueness constraint.
    #[serde(default)]
    pub unique: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnSchema {
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            unique: false,
        }
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// One column pair of a declared foreign-key constraint. Composite
/// constraints appear as several entries sharing a constraint name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    #[serde(default)]
    pub constraint: String,
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

/// A base table with its columns and declared keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    #[must_use]
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_primary_key<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_foreign_key(
        mut self,
        column: impl Into<String>,
        references_table: impl Into<String>,
        references_column: impl Into<String>,
    ) -> Self {
        let column = column.into();
        let references_table = references_table.into();
        self.foreign_keys.push(ForeignKey {
            constraint: format!("{}_{}_fkey", self.name, column),
            column,
            references_table,
            references_column: references_column.into(),
        });
        self
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The primary key column when the key has exactly one column.
    #[must_use]
    pub fn single_primary_key(&self) -> Option<&ColumnSchema> {
        match self.primary_key.as_slice() {
            [only] => self.column(only),
            _ => None,
        }
    }

    /// A column is unique if it is declared unique or is the table's
    /// entire primary key.
    #[must_use]
    pub fn is_unique_column(&self, name: &str) -> bool {
        let declared = self.column(name).is_some_and(|c| c.unique);
        declared || matches!(self.primary_key.as_slice(), [only] if only == name)
    }
}

/// The full metadata of a datasource at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableSchema>,
}

impl SchemaSnapshot {
    #[must_use]
    pub fn new(tables: Vec<TableSchema>) -> Self {
        Self { tables }
    }

    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.tables.iter().map(|t| t.columns.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableSchema {
        TableSchema::new(
            "users",
            vec![
                ColumnSchema::new("id", "integer").not_null(),
                ColumnSchema::new("email", "text").unique(),
            ],
        )
        .with_primary_key(["id"])
    }

    #[test]
    fn single_primary_key_requires_one_column() {
        assert_eq!(users().single_primary_key().map(|c| c.name.as_str()), Some("id"));
        let composite = users().with_primary_key(["id", "email"]);
        assert!(composite.single_primary_key().is_none());
    }

    #[test]
    fn uniqueness_covers_declared_and_primary_key() {
        let t = users();
        assert!(t.is_unique_column("id"));
        assert!(t.is_unique_column("email"));
        assert!(!t.is_unique_column("missing"));
    }

    #[test]
    fn deserializes_with_defaults() {
        let json = r#"{"tables":[{"name":"t","columns":[{"name":"c","data_type":"text"}]}]}"#;
        let snapshot: SchemaSnapshot = serde_json::from_str(json).unwrap();
        let col = &snapshot.tables[0].columns[0];
        assert!(col.nullable);
        assert!(!col.unique);
        assert!(snapshot.tables[0].primary_key.is_empty());
    }

    #[test]
    fn foreign_key_builder_names_constraint() {
        let orders = TableSchema::new("orders", vec![ColumnSchema::new("user_id", "integer")])
            .with_foreign_key("user_id", "users", "id");
        assert_eq!(orders.foreign_keys[0].constraint, "orders_user_id_fkey");
    }
}
