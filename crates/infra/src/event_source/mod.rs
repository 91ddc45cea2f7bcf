//! Event source boundary.
//!
//! The event log is owned elsewhere; projections only read from it. A source
//! answers two questions: "which subscribed events lie past these checkpoints"
//! and, through [`OwnerLookup`], "which org owns this user right now".

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use tenantview_events::{Checkpoints, DecodeError, Event, OwnerLookup, Subscription};

use crate::engine::Retryable;

pub use in_memory::InMemoryEventSource;
pub use postgres::PostgresEventSource;

#[derive(Debug, Error)]
pub enum SourceError {
    /// The source could not be reached; reading again may succeed.
    #[error("event source unavailable in {operation}: {message}")]
    Unavailable {
        operation: &'static str,
        message: String,
    },

    #[error("database error in {operation}: {message}")]
    Database {
        operation: &'static str,
        message: String,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("malformed event row: {0}")]
    Malformed(String),
}

impl SourceError {
    pub fn unavailable(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            operation,
            message: message.into(),
        }
    }
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// What one projection asks its source for.
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub subscriptions: Vec<Subscription>,
    /// Events at or below an instance's checkpoint are excluded.
    pub after: Checkpoints,
    pub limit: usize,
}

impl EventQuery {
    pub fn new(subscriptions: Vec<Subscription>, after: Checkpoints, limit: usize) -> Self {
        Self {
            subscriptions,
            after,
            limit,
        }
    }

    /// True when `event` is subscribed and past its instance's checkpoint.
    pub fn admits(&self, event: &Event) -> bool {
        !self.after.is_applied(event) && self.subscriptions.iter().any(|s| s.matches(event))
    }
}

#[async_trait]
pub trait EventSource: OwnerLookup {
    /// Subscribed events past `query.after`, ordered by `(sequence, instance)`,
    /// at most `query.limit` of them.
    async fn read_events_after(&self, query: &EventQuery) -> Result<Vec<Event>, SourceError>;

    /// Suspend until new events may be available or `timeout` elapses.
    async fn wait_for_events(&self, timeout: Duration);
}

#[async_trait]
impl<S> EventSource for Arc<S>
where
    S: EventSource + ?Sized,
{
    async fn read_events_after(&self, query: &EventQuery) -> Result<Vec<Event>, SourceError> {
        (**self).read_events_after(query).await
    }

    async fn wait_for_events(&self, timeout: Duration) {
        (**self).wait_for_events(timeout).await
    }
}

/// Sort key shared by every source implementation.
pub(crate) fn delivery_order(event: &Event) -> (u64, tenantview_core::InstanceId) {
    (event.sequence(), event.instance_id())
}
