//! Deferred table mutations produced by reducers.
//!
//! A [`Statement`] is an intent, never executed by the reducer that built it.
//! Every mutation is keyed by natural identity (upsert on the primary key,
//! update/delete by match conditions), which is what makes re-applying an
//! event after a redelivery converge to the same table state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use tenantview_core::{AggregateId, InstanceId, OrgId, UserId};

use crate::table::{ColumnType, TableDescriptor};

/// A column value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Text(String),
    Uuid(Uuid),
    Bool(bool),
    Int(i64),
    TextArray(Vec<String>),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Self::Text(_) => ColumnType::Text,
            Self::Uuid(_) => ColumnType::Uuid,
            Self::Bool(_) => ColumnType::Bool,
            Self::Int(_) => ColumnType::Int64,
            Self::TextArray(_) => ColumnType::TextArray,
            Self::Timestamp(_) => ColumnType::Timestamp,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Sequences are stored as BIGINT.
pub fn sequence_to_bigint(sequence: u64) -> Result<i64, StatementError> {
    i64::try_from(sequence).map_err(|_| StatementError::SequenceOutOfRange(sequence))
}

impl TryFrom<u64> for Value {
    type Error = StatementError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        sequence_to_bigint(value).map(Self::Int)
    }
}

impl From<Vec<String>> for Value {
    fn from(value: Vec<String>) -> Self {
        Self::TextArray(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

macro_rules! impl_value_from_id {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(value: $t) -> Self {
                    Self::Uuid(*value.as_uuid())
                }
            }
        )*
    };
}

impl_value_from_id!(InstanceId, OrgId, UserId, AggregateId);

/// `column = value` in a SET list or VALUES tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub column: String,
    pub value: Value,
}

impl Assignment {
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// `column = value` in a match predicate. Conditions are AND-ed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub column: String,
    pub value: Value,
}

impl Condition {
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    /// Insert, or overwrite the assigned columns of the row with the same key.
    Upsert {
        conflict: Vec<String>,
        values: Vec<Assignment>,
    },
    /// Set columns on every row matching the conditions (possibly none).
    Update {
        values: Vec<Assignment>,
        conditions: Vec<Condition>,
    },
    /// Remove every row matching the conditions (possibly many).
    Delete { conditions: Vec<Condition> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub table: String,
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatementError {
    #[error("statement targets table {found}, projection writes {expected}")]
    WrongTable { expected: String, found: String },

    #[error("table {table} has no column {column}")]
    UnknownColumn { table: String, column: String },

    #[error("column {column} is {expected:?}, value is {found:?}")]
    TypeMismatch {
        column: String,
        expected: ColumnType,
        found: ColumnType,
    },

    #[error("upsert conflict target ({found}) is not the primary key ({expected})")]
    ConflictTarget { expected: String, found: String },

    #[error("upsert does not assign key column {0}")]
    MissingKeyColumn(String),

    #[error("update assigns primary key column {0}")]
    KeyColumnUpdate(String),

    #[error("{0} without conditions would touch the whole table")]
    Unconditional(&'static str),

    #[error("sequence {0} does not fit a BIGINT column")]
    SequenceOutOfRange(u64),
}

impl Statement {
    pub fn upsert(table: impl Into<String>, conflict: &[&str], values: Vec<Assignment>) -> Self {
        Self {
            table: table.into(),
            operation: Operation::Upsert {
                conflict: conflict.iter().map(|c| c.to_string()).collect(),
                values,
            },
        }
    }

    pub fn update(
        table: impl Into<String>,
        values: Vec<Assignment>,
        conditions: Vec<Condition>,
    ) -> Self {
        Self {
            table: table.into(),
            operation: Operation::Update { values, conditions },
        }
    }

    pub fn delete(table: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Self {
            table: table.into(),
            operation: Operation::Delete { conditions },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.operation {
            Operation::Upsert { .. } => "upsert",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
        }
    }

    /// Check the statement against the table it will be applied to.
    pub fn validate(&self, table: &TableDescriptor) -> Result<(), StatementError> {
        if self.table != table.name() {
            return Err(StatementError::WrongTable {
                expected: table.name().to_string(),
                found: self.table.clone(),
            });
        }

        let check = |column: &str, value: &Value| -> Result<(), StatementError> {
            let def = table
                .column(column)
                .ok_or_else(|| StatementError::UnknownColumn {
                    table: table.name().to_string(),
                    column: column.to_string(),
                })?;
            if def.column_type != value.column_type() {
                return Err(StatementError::TypeMismatch {
                    column: column.to_string(),
                    expected: def.column_type,
                    found: value.column_type(),
                });
            }
            Ok(())
        };

        match &self.operation {
            Operation::Upsert { conflict, values } => {
                let mut target = conflict.clone();
                let mut key = table.primary_key().to_vec();
                target.sort();
                key.sort();
                if target != key {
                    return Err(StatementError::ConflictTarget {
                        expected: table.primary_key().join(", "),
                        found: conflict.join(", "),
                    });
                }
                for a in values {
                    check(&a.column, &a.value)?;
                }
                if let Some(missing) = table
                    .primary_key()
                    .iter()
                    .find(|k| !values.iter().any(|a| &a.column == *k))
                {
                    return Err(StatementError::MissingKeyColumn(missing.clone()));
                }
            }
            Operation::Update { values, conditions } => {
                if conditions.is_empty() {
                    return Err(StatementError::Unconditional("update"));
                }
                for a in values {
                    if table.is_key_column(&a.column) {
                        return Err(StatementError::KeyColumnUpdate(a.column.clone()));
                    }
                    check(&a.column, &a.value)?;
                }
                for c in conditions {
                    check(&c.column, &c.value)?;
                }
            }
            Operation::Delete { conditions } => {
                if conditions.is_empty() {
                    return Err(StatementError::Unconditional("delete"));
                }
                for c in conditions {
                    check(&c.column, &c.value)?;
                }
            }
        }
        Ok(())
    }
}
