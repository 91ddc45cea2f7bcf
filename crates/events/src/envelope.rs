use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tenantview_core::{AggregateId, AggregateType, InstanceId};

use crate::payload::EventPayload;

/// Envelope for an event: tenant + stream metadata around a payload.
///
/// Notes:
/// - **Multi-tenancy**: every event belongs to exactly one `instance_id`.
/// - **Ordering**: `sequence` is monotonic per instance and gap-free per
///   aggregate; projections consume in ascending order per instance.
/// - `event_type` is kept next to the payload the way the store keeps it, so a
///   mismatch between the two can be detected by reducers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    instance_id: InstanceId,

    aggregate_id: AggregateId,
    aggregate_type: AggregateType,

    /// Aggregate owning the emitting aggregate (the org for user events).
    resource_owner: AggregateId,

    sequence: u64,
    event_type: String,
    created_at: DateTime<Utc>,

    payload: E,
}

/// An event as consumed by projections.
pub type Event = EventEnvelope<EventPayload>;

impl<E> EventEnvelope<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        event_id: Uuid,
        instance_id: InstanceId,
        aggregate_id: AggregateId,
        aggregate_type: AggregateType,
        resource_owner: AggregateId,
        sequence: u64,
        event_type: impl Into<String>,
        created_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            instance_id,
            aggregate_id,
            aggregate_type,
            resource_owner,
            sequence,
            event_type: event_type.into(),
            created_at,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> AggregateType {
        self.aggregate_type
    }

    pub fn resource_owner(&self) -> AggregateId {
        self.resource_owner
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

impl Event {
    /// Build an event whose aggregate and event type are taken from the payload.
    ///
    /// The sequence is normally assigned by the event source; `with_sequence`
    /// sets it afterwards.
    pub fn new(
        instance_id: InstanceId,
        aggregate_id: AggregateId,
        resource_owner: AggregateId,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            instance_id,
            aggregate_id,
            aggregate_type: payload.aggregate_type(),
            resource_owner,
            sequence: 0,
            event_type: payload.event_type().to_string(),
            created_at: Utc::now(),
            payload,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}
