//! Reducers: one event in, zero or more statements out.
//!
//! Reducers never execute statements and never see checkpoints. The only
//! outside state a reducer may consult is the [`OwnerLookup`] capability on
//! its [`ReduceContext`], which answers "which org owns this user now". That
//! answer is a point-in-time snapshot taken when the event is reduced, not the
//! owner at the time the event was written; a concurrent ownership move can
//! race with the lookup.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use tenantview_core::{InstanceId, OrgId, UserId};

use crate::envelope::Event;
use crate::kind::EventKind;
use crate::statement::{Statement, StatementError};

/// The owner lookup could not answer (as opposed to answering "no such user").
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("owner lookup failed: {0}")]
pub struct LookupError(pub String);

/// Point-in-time lookup of a user's current resource owner.
#[async_trait]
pub trait OwnerLookup: Send + Sync {
    /// `Ok(None)` when the user is unknown in the instance.
    async fn current_owner(
        &self,
        instance_id: InstanceId,
        user_id: UserId,
    ) -> Result<Option<OrgId>, LookupError>;
}

#[async_trait]
impl<T> OwnerLookup for Arc<T>
where
    T: OwnerLookup + ?Sized,
{
    async fn current_owner(
        &self,
        instance_id: InstanceId,
        user_id: UserId,
    ) -> Result<Option<OrgId>, LookupError> {
        (**self).current_owner(instance_id, user_id).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReduceError {
    /// The payload is not the variant the reducer was registered for.
    #[error("reduce.wrong.event.type: expected {expected}, found {found}")]
    WrongEventType {
        expected: &'static str,
        found: String,
    },

    /// A referenced user could not be resolved (replication lag or deleted).
    #[error("user {user_id} not found in instance {instance_id}")]
    UserNotFound {
        instance_id: InstanceId,
        user_id: UserId,
    },

    #[error(transparent)]
    Lookup(#[from] LookupError),

    /// The event cannot be expressed as a statement (e.g. its sequence does
    /// not fit the table).
    #[error(transparent)]
    Statement(#[from] StatementError),
}

impl ReduceError {
    pub fn wrong_event_type(expected: &'static str, event: &Event) -> Self {
        Self::WrongEventType {
            expected,
            found: format!("{}/{}", event.aggregate_type(), event.event_type()),
        }
    }

    /// Dependency errors may heal with time; dispatch errors never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::WrongEventType { .. } | Self::Statement(_) => false,
            Self::UserNotFound { .. } | Self::Lookup(_) => true,
        }
    }
}

/// What a reducer may consult besides the event itself.
#[derive(Clone, Copy)]
pub struct ReduceContext<'a> {
    owners: &'a dyn OwnerLookup,
}

impl<'a> ReduceContext<'a> {
    pub fn new(owners: &'a dyn OwnerLookup) -> Self {
        Self { owners }
    }

    /// Resolve the org owning `user_id` right now.
    pub async fn resource_owner_of_user(
        &self,
        instance_id: InstanceId,
        user_id: UserId,
    ) -> Result<OrgId, ReduceError> {
        self.owners
            .current_owner(instance_id, user_id)
            .await?
            .ok_or(ReduceError::UserNotFound {
                instance_id,
                user_id,
            })
    }
}

impl core::fmt::Debug for ReduceContext<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReduceContext").finish_non_exhaustive()
    }
}

/// Object-safe reducer as stored in the registry.
#[async_trait]
pub trait Reducer: Send + Sync {
    async fn reduce(
        &self,
        event: &Event,
        ctx: &ReduceContext<'_>,
    ) -> Result<Vec<Statement>, ReduceError>;
}

/// Reducer over the concrete payload of one event kind.
///
/// Implement this when a reducer needs the context; plain functions can be
/// registered directly with [`crate::ReducerRegistryBuilder::on`].
#[async_trait]
pub trait Reduce<K: EventKind>: Send + Sync {
    async fn reduce(
        &self,
        event: &Event,
        payload: &K::Payload,
        ctx: &ReduceContext<'_>,
    ) -> Result<Vec<Statement>, ReduceError>;
}
