//! Closed set of event payloads consumed by the member projections.
//!
//! Payloads are grouped per aggregate type. The stored form is the payload
//! struct as JSON next to its `event_type` string; [`EventPayload::decode`] and
//! [`EventPayload::encode`] convert between the two.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use tenantview_core::{AggregateType, UserId};

/// Stable event type names.
pub mod event_types {
    pub const INSTANCE_MEMBER_ADDED: &str = "instance.member.added";
    pub const INSTANCE_MEMBER_CHANGED: &str = "instance.member.changed";
    pub const INSTANCE_MEMBER_CASCADE_REMOVED: &str = "instance.member.cascade.removed";
    pub const INSTANCE_MEMBER_REMOVED: &str = "instance.member.removed";
    pub const INSTANCE_REMOVED: &str = "instance.removed";

    pub const ORG_MEMBER_ADDED: &str = "org.member.added";
    pub const ORG_MEMBER_CHANGED: &str = "org.member.changed";
    pub const ORG_MEMBER_CASCADE_REMOVED: &str = "org.member.cascade.removed";
    pub const ORG_MEMBER_REMOVED: &str = "org.member.removed";
    pub const ORG_REMOVED: &str = "org.removed";

    pub const USER_ADDED: &str = "user.added";
    pub const USER_REMOVED: &str = "user.removed";
}

use event_types::*;

/// A user was granted membership of a scope with a set of roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberAdded {
    pub user_id: UserId,
    pub roles: Vec<String>,
}

/// The roles of an existing membership were replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberChanged {
    pub user_id: UserId,
    pub roles: Vec<String>,
}

/// A membership ended, either explicitly or as a cascade of another removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRemoved {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRemoved {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgRemoved {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAdded {
    pub username: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRemoved {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceEvent {
    MemberAdded(MemberAdded),
    MemberChanged(MemberChanged),
    MemberCascadeRemoved(MemberRemoved),
    MemberRemoved(MemberRemoved),
    InstanceRemoved(InstanceRemoved),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrgEvent {
    MemberAdded(MemberAdded),
    MemberChanged(MemberChanged),
    MemberCascadeRemoved(MemberRemoved),
    MemberRemoved(MemberRemoved),
    OrgRemoved(OrgRemoved),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserEvent {
    Added(UserAdded),
    Removed(UserRemoved),
}

/// Payload of any event a projection can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    Instance(InstanceEvent),
    Org(OrgEvent),
    User(UserEvent),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown event type {event_type} for aggregate {aggregate_type}")]
    UnknownEventType {
        aggregate_type: AggregateType,
        event_type: String,
    },

    #[error("malformed payload for {event_type}: {source}")]
    Payload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

fn parse<T: serde::de::DeserializeOwned>(
    event_type: &str,
    payload: JsonValue,
) -> Result<T, DecodeError> {
    serde_json::from_value(payload).map_err(|source| DecodeError::Payload {
        event_type: event_type.to_string(),
        source,
    })
}

impl EventPayload {
    pub fn aggregate_type(&self) -> AggregateType {
        match self {
            Self::Instance(_) => AggregateType::Instance,
            Self::Org(_) => AggregateType::Org,
            Self::User(_) => AggregateType::User,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Instance(e) => match e {
                InstanceEvent::MemberAdded(_) => INSTANCE_MEMBER_ADDED,
                InstanceEvent::MemberChanged(_) => INSTANCE_MEMBER_CHANGED,
                InstanceEvent::MemberCascadeRemoved(_) => INSTANCE_MEMBER_CASCADE_REMOVED,
                InstanceEvent::MemberRemoved(_) => INSTANCE_MEMBER_REMOVED,
                InstanceEvent::InstanceRemoved(_) => INSTANCE_REMOVED,
            },
            Self::Org(e) => match e {
                OrgEvent::MemberAdded(_) => ORG_MEMBER_ADDED,
                OrgEvent::MemberChanged(_) => ORG_MEMBER_CHANGED,
                OrgEvent::MemberCascadeRemoved(_) => ORG_MEMBER_CASCADE_REMOVED,
                OrgEvent::MemberRemoved(_) => ORG_MEMBER_REMOVED,
                OrgEvent::OrgRemoved(_) => ORG_REMOVED,
            },
            Self::User(e) => match e {
                UserEvent::Added(_) => USER_ADDED,
                UserEvent::Removed(_) => USER_REMOVED,
            },
        }
    }

    /// Decode a stored `(aggregate_type, event_type, json)` triple.
    pub fn decode(
        aggregate_type: AggregateType,
        event_type: &str,
        payload: JsonValue,
    ) -> Result<Self, DecodeError> {
        let decoded = match (aggregate_type, event_type) {
            (AggregateType::Instance, INSTANCE_MEMBER_ADDED) => {
                Self::Instance(InstanceEvent::MemberAdded(parse(event_type, payload)?))
            }
            (AggregateType::Instance, INSTANCE_MEMBER_CHANGED) => {
                Self::Instance(InstanceEvent::MemberChanged(parse(event_type, payload)?))
            }
            (AggregateType::Instance, INSTANCE_MEMBER_CASCADE_REMOVED) => {
                Self::Instance(InstanceEvent::MemberCascadeRemoved(parse(event_type, payload)?))
            }
            (AggregateType::Instance, INSTANCE_MEMBER_REMOVED) => {
                Self::Instance(InstanceEvent::MemberRemoved(parse(event_type, payload)?))
            }
            (AggregateType::Instance, INSTANCE_REMOVED) => {
                Self::Instance(InstanceEvent::InstanceRemoved(parse(event_type, payload)?))
            }
            (AggregateType::Org, ORG_MEMBER_ADDED) => {
                Self::Org(OrgEvent::MemberAdded(parse(event_type, payload)?))
            }
            (AggregateType::Org, ORG_MEMBER_CHANGED) => {
                Self::Org(OrgEvent::MemberChanged(parse(event_type, payload)?))
            }
            (AggregateType::Org, ORG_MEMBER_CASCADE_REMOVED) => {
                Self::Org(OrgEvent::MemberCascadeRemoved(parse(event_type, payload)?))
            }
            (AggregateType::Org, ORG_MEMBER_REMOVED) => {
                Self::Org(OrgEvent::MemberRemoved(parse(event_type, payload)?))
            }
            (AggregateType::Org, ORG_REMOVED) => {
                Self::Org(OrgEvent::OrgRemoved(parse(event_type, payload)?))
            }
            (AggregateType::User, USER_ADDED) => {
                Self::User(UserEvent::Added(parse(event_type, payload)?))
            }
            (AggregateType::User, USER_REMOVED) => {
                Self::User(UserEvent::Removed(parse(event_type, payload)?))
            }
            _ => {
                return Err(DecodeError::UnknownEventType {
                    aggregate_type,
                    event_type: event_type.to_string(),
                });
            }
        };
        Ok(decoded)
    }

    /// Encode into the stored JSON form (the event type is stored separately).
    pub fn encode(&self) -> Result<JsonValue, serde_json::Error> {
        match self {
            Self::Instance(e) => match e {
                InstanceEvent::MemberAdded(p) => serde_json::to_value(p),
                InstanceEvent::MemberChanged(p) => serde_json::to_value(p),
                InstanceEvent::MemberCascadeRemoved(p) | InstanceEvent::MemberRemoved(p) => {
                    serde_json::to_value(p)
                }
                InstanceEvent::InstanceRemoved(p) => serde_json::to_value(p),
            },
            Self::Org(e) => match e {
                OrgEvent::MemberAdded(p) => serde_json::to_value(p),
                OrgEvent::MemberChanged(p) => serde_json::to_value(p),
                OrgEvent::MemberCascadeRemoved(p) | OrgEvent::MemberRemoved(p) => {
                    serde_json::to_value(p)
                }
                OrgEvent::OrgRemoved(p) => serde_json::to_value(p),
            },
            Self::User(e) => match e {
                UserEvent::Added(p) => serde_json::to_value(p),
                UserEvent::Removed(p) => serde_json::to_value(p),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_member_added() {
        let user_id = UserId::new();
        let payload = EventPayload::decode(
            AggregateType::Instance,
            INSTANCE_MEMBER_ADDED,
            json!({ "user_id": user_id, "roles": ["IAM_OWNER"] }),
        )
        .unwrap();

        assert_eq!(
            payload,
            EventPayload::Instance(InstanceEvent::MemberAdded(MemberAdded {
                user_id,
                roles: vec!["IAM_OWNER".to_string()],
            }))
        );
        assert_eq!(payload.event_type(), INSTANCE_MEMBER_ADDED);
    }

    #[test]
    fn event_type_must_belong_to_aggregate() {
        let err = EventPayload::decode(AggregateType::User, ORG_REMOVED, json!({})).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownEventType { .. }));
    }

    #[test]
    fn malformed_payload_names_the_event_type() {
        let err = EventPayload::decode(
            AggregateType::Org,
            ORG_MEMBER_CHANGED,
            json!({ "roles": "not-a-list" }),
        )
        .unwrap_err();
        match err {
            DecodeError::Payload { event_type, .. } => assert_eq!(event_type, ORG_MEMBER_CHANGED),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn encode_matches_decode_for_cascade_removal() {
        let payload = EventPayload::Org(OrgEvent::MemberCascadeRemoved(MemberRemoved {
            user_id: UserId::new(),
        }));
        let json = payload.encode().unwrap();
        let decoded =
            EventPayload::decode(AggregateType::Org, payload.event_type(), json).unwrap();
        assert_eq!(decoded, payload);
    }
}
