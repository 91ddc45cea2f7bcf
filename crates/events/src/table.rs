//! Projection table descriptors and the startup schema check.
//!
//! A descriptor is the schema contract a projection declares for its target
//! table. Stores create the table from it, or compare an existing table
//! against it with [`TableDescriptor::check_compatible`]. This is a
//! precondition check, not a migration tool: drift is reported, never fixed.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Uuid,
    TextArray,
    Bool,
    Int64,
    Timestamp,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Uuid => "UUID",
            Self::TextArray => "TEXT[]",
            Self::Bool => "BOOLEAN",
            Self::Int64 => "BIGINT",
            Self::Timestamp => "TIMESTAMPTZ",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
}

impl Index {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Physical shape of an existing table, as reported by a store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("table {table}: {reason}")]
    InvalidDescriptor { table: String, reason: String },

    #[error("table {table}: primary key is ({found}), expected ({expected})")]
    PrimaryKeyMismatch {
        table: String,
        expected: String,
        found: String,
    },

    #[error("table {table}: missing column {column}")]
    MissingColumn { table: String, column: String },

    #[error("table {table}: column {column} is {found:?}, expected {expected:?}")]
    ColumnTypeMismatch {
        table: String,
        column: String,
        expected: ColumnType,
        found: ColumnType,
    },
}

/// Schema contract of a projection's target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    name: String,
    columns: Vec<ColumnDef>,
    primary_key: Vec<String>,
    indexes: Vec<Index>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>, primary_key: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: Index) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn indexes(&self) -> &[Index] {
        &self.indexes
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_key_column(&self, name: &str) -> bool {
        self.primary_key.iter().any(|k| k == name)
    }

    /// Internal consistency: key and index columns exist, no duplicates.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let invalid = |reason: String| SchemaError::InvalidDescriptor {
            table: self.name.clone(),
            reason,
        };

        let mut seen = BTreeSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(invalid(format!("duplicate column {}", column.name)));
            }
        }
        if self.primary_key.is_empty() {
            return Err(invalid("primary key is empty".to_string()));
        }
        for key in &self.primary_key {
            if self.column(key).is_none() {
                return Err(invalid(format!("primary key column {key} is not declared")));
            }
        }
        for index in &self.indexes {
            if let Some(missing) = index.columns.iter().find(|c| self.column(c).is_none()) {
                return Err(invalid(format!(
                    "index {} references undeclared column {missing}",
                    index.name
                )));
            }
        }
        Ok(())
    }

    /// Compare against the physical table. Extra physical columns are fine.
    pub fn check_compatible(&self, physical: &TableSchema) -> Result<(), SchemaError> {
        let expected: BTreeSet<&str> = self.primary_key.iter().map(String::as_str).collect();
        let found: BTreeSet<&str> = physical.primary_key.iter().map(String::as_str).collect();
        if expected != found {
            return Err(SchemaError::PrimaryKeyMismatch {
                table: self.name.clone(),
                expected: self.primary_key.join(", "),
                found: physical.primary_key.join(", "),
            });
        }

        for column in &self.columns {
            let Some(existing) = physical.columns.iter().find(|c| c.name == column.name) else {
                return Err(SchemaError::MissingColumn {
                    table: self.name.clone(),
                    column: column.name.clone(),
                });
            };
            if existing.column_type != column.column_type {
                return Err(SchemaError::ColumnTypeMismatch {
                    table: self.name.clone(),
                    column: column.name.clone(),
                    expected: column.column_type,
                    found: existing.column_type,
                });
            }
        }
        Ok(())
    }

    /// The schema a freshly created table has.
    pub fn to_schema(&self) -> TableSchema {
        TableSchema {
            columns: self.columns.clone(),
            primary_key: self.primary_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> TableDescriptor {
        TableDescriptor::new(
            "projections.members",
            vec![
                ColumnDef::new("instance_id", ColumnType::Uuid),
                ColumnDef::new("user_id", ColumnType::Uuid),
                ColumnDef::new("roles", ColumnType::TextArray),
            ],
            &["instance_id", "user_id"],
        )
        .with_index(Index::new("user_id", &["user_id"]))
    }

    #[test]
    fn fresh_schema_is_compatible() {
        let d = descriptor();
        d.validate().unwrap();
        d.check_compatible(&d.to_schema()).unwrap();
    }

    #[test]
    fn key_order_does_not_matter_but_key_set_does() {
        let d = descriptor();
        let mut physical = d.to_schema();
        physical.primary_key.reverse();
        d.check_compatible(&physical).unwrap();

        physical.primary_key = vec!["user_id".to_string()];
        assert!(matches!(
            d.check_compatible(&physical),
            Err(SchemaError::PrimaryKeyMismatch { .. })
        ));
    }

    #[test]
    fn missing_and_retyped_columns_are_drift() {
        let d = descriptor();

        let mut physical = d.to_schema();
        physical.columns.retain(|c| c.name != "roles");
        assert_eq!(
            d.check_compatible(&physical),
            Err(SchemaError::MissingColumn {
                table: "projections.members".to_string(),
                column: "roles".to_string(),
            })
        );

        let mut physical = d.to_schema();
        physical.columns[2].column_type = ColumnType::Text;
        assert!(matches!(
            d.check_compatible(&physical),
            Err(SchemaError::ColumnTypeMismatch { .. })
        ));
    }

    #[test]
    fn extra_physical_columns_are_tolerated() {
        let d = descriptor();
        let mut physical = d.to_schema();
        physical.columns.push(ColumnDef::new("legacy", ColumnType::Bool));
        d.check_compatible(&physical).unwrap();
    }

    #[test]
    fn descriptor_with_undeclared_key_is_invalid() {
        let d = TableDescriptor::new(
            "t",
            vec![ColumnDef::new("a", ColumnType::Text)],
            &["a", "b"],
        );
        assert!(matches!(d.validate(), Err(SchemaError::InvalidDescriptor { .. })));
    }
}
