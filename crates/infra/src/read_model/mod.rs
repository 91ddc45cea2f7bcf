//! Projection table storage and checkpoint persistence.
//!
//! A store owns the physical projection tables and the checkpoint table. The
//! one operation that matters is [`ProjectionStore::apply_statements`]: a
//! batch of statements and the checkpoint advance covering them commit as one
//! unit or not at all.

pub mod in_memory;
pub mod postgres;
pub mod sql;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use tenantview_core::InstanceId;
use tenantview_events::{
    CheckpointError, CheckpointUpdate, Checkpoints, SchemaError, Statement, StatementError,
    TableDescriptor,
};

use crate::engine::Retryable;

pub use in_memory::{InMemoryProjectionStore, Row};
pub use postgres::PostgresProjectionStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Commit or connection failure that may succeed on retry.
    #[error("transient storage failure in {operation}: {message}")]
    Transient {
        operation: &'static str,
        message: String,
    },

    /// The physical table does not match the descriptor.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Statement(#[from] StatementError),

    /// Another writer advanced a checkpoint this batch started from.
    #[error("checkpoint conflict for projection {projection}: {source}")]
    CheckpointConflict {
        projection: String,
        #[source]
        source: CheckpointError,
    },

    #[error("database error in {operation}: {message}")]
    Database {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn transient(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Transient {
            operation,
            message: message.into(),
        }
    }

    pub fn database(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Database {
            operation,
            message: message.into(),
        }
    }
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Durable per-(projection, instance) positions.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 0 when the projection never applied an event of the instance.
    async fn get_checkpoint(
        &self,
        projection: &str,
        instance_id: InstanceId,
    ) -> Result<u64, StoreError>;

    async fn get_checkpoints(&self, projection: &str) -> Result<Checkpoints, StoreError>;
}

#[async_trait]
pub trait ProjectionStore: CheckpointStore {
    /// Create the table (and its indexes) or verify the existing one.
    async fn ensure_table(&self, table: &TableDescriptor) -> Result<(), StoreError>;

    /// Execute `statements` in order and advance `checkpoint`, atomically.
    async fn apply_statements(
        &self,
        table: &TableDescriptor,
        statements: &[Statement],
        checkpoint: &CheckpointUpdate,
    ) -> Result<(), StoreError>;

    /// Drop every row of the table and every checkpoint of `projection`.
    async fn reset(&self, table: &TableDescriptor, projection: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> CheckpointStore for Arc<S>
where
    S: CheckpointStore + ?Sized,
{
    async fn get_checkpoint(
        &self,
        projection: &str,
        instance_id: InstanceId,
    ) -> Result<u64, StoreError> {
        (**self).get_checkpoint(projection, instance_id).await
    }

    async fn get_checkpoints(&self, projection: &str) -> Result<Checkpoints, StoreError> {
        (**self).get_checkpoints(projection).await
    }
}

#[async_trait]
impl<S> ProjectionStore for Arc<S>
where
    S: ProjectionStore + ?Sized,
{
    async fn ensure_table(&self, table: &TableDescriptor) -> Result<(), StoreError> {
        (**self).ensure_table(table).await
    }

    async fn apply_statements(
        &self,
        table: &TableDescriptor,
        statements: &[Statement],
        checkpoint: &CheckpointUpdate,
    ) -> Result<(), StoreError> {
        (**self).apply_statements(table, statements, checkpoint).await
    }

    async fn reset(&self, table: &TableDescriptor, projection: &str) -> Result<(), StoreError> {
        (**self).reset(table, projection).await
    }
}
