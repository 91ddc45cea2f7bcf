//! Typed event kinds.
//!
//! Each kind is a zero-sized marker naming one `(aggregate type, event type)`
//! pair and the payload variant that belongs to it. Reducers are registered per
//! kind, so the registry key and the payload a reducer receives cannot drift
//! apart at registration time.

use tenantview_core::AggregateType;

use crate::payload::{
    EventPayload, InstanceEvent, InstanceRemoved, MemberAdded, MemberChanged, MemberRemoved,
    OrgEvent, OrgRemoved, UserAdded, UserEvent, UserRemoved, event_types,
};

pub trait EventKind: Send + Sync + 'static {
    const AGGREGATE_TYPE: AggregateType;
    const EVENT_TYPE: &'static str;

    type Payload: Send + Sync + 'static;

    /// Borrow the concrete payload, or `None` if the variant does not match.
    fn extract(payload: &EventPayload) -> Option<&Self::Payload>;
}

macro_rules! event_kind {
    ($kind:ident, $aggregate:ident, $event_type:expr, $payload:ty, $pattern:pat => $bound:ident) => {
        #[derive(Debug, Copy, Clone, Default)]
        pub struct $kind;

        impl EventKind for $kind {
            const AGGREGATE_TYPE: AggregateType = AggregateType::$aggregate;
            const EVENT_TYPE: &'static str = $event_type;

            type Payload = $payload;

            fn extract(payload: &EventPayload) -> Option<&Self::Payload> {
                match payload {
                    $pattern => Some($bound),
                    _ => None,
                }
            }
        }
    };
}

event_kind!(
    InstanceMemberAdded,
    Instance,
    event_types::INSTANCE_MEMBER_ADDED,
    MemberAdded,
    EventPayload::Instance(InstanceEvent::MemberAdded(p)) => p
);
event_kind!(
    InstanceMemberChanged,
    Instance,
    event_types::INSTANCE_MEMBER_CHANGED,
    MemberChanged,
    EventPayload::Instance(InstanceEvent::MemberChanged(p)) => p
);
event_kind!(
    InstanceMemberCascadeRemoved,
    Instance,
    event_types::INSTANCE_MEMBER_CASCADE_REMOVED,
    MemberRemoved,
    EventPayload::Instance(InstanceEvent::MemberCascadeRemoved(p)) => p
);
event_kind!(
    InstanceMemberRemoved,
    Instance,
    event_types::INSTANCE_MEMBER_REMOVED,
    MemberRemoved,
    EventPayload::Instance(InstanceEvent::MemberRemoved(p)) => p
);
event_kind!(
    InstanceRemovedKind,
    Instance,
    event_types::INSTANCE_REMOVED,
    InstanceRemoved,
    EventPayload::Instance(InstanceEvent::InstanceRemoved(p)) => p
);

event_kind!(
    OrgMemberAdded,
    Org,
    event_types::ORG_MEMBER_ADDED,
    MemberAdded,
    EventPayload::Org(OrgEvent::MemberAdded(p)) => p
);
event_kind!(
    OrgMemberChanged,
    Org,
    event_types::ORG_MEMBER_CHANGED,
    MemberChanged,
    EventPayload::Org(OrgEvent::MemberChanged(p)) => p
);
event_kind!(
    OrgMemberCascadeRemoved,
    Org,
    event_types::ORG_MEMBER_CASCADE_REMOVED,
    MemberRemoved,
    EventPayload::Org(OrgEvent::MemberCascadeRemoved(p)) => p
);
event_kind!(
    OrgMemberRemoved,
    Org,
    event_types::ORG_MEMBER_REMOVED,
    MemberRemoved,
    EventPayload::Org(OrgEvent::MemberRemoved(p)) => p
);
event_kind!(
    OrgRemovedKind,
    Org,
    event_types::ORG_REMOVED,
    OrgRemoved,
    EventPayload::Org(OrgEvent::OrgRemoved(p)) => p
);

event_kind!(
    UserAddedKind,
    User,
    event_types::USER_ADDED,
    UserAdded,
    EventPayload::User(UserEvent::Added(p)) => p
);
event_kind!(
    UserRemovedKind,
    User,
    event_types::USER_REMOVED,
    UserRemoved,
    EventPayload::User(UserEvent::Removed(p)) => p
);
