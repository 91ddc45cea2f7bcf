//! `projections.instance_members`: who is a member of which instance, with
//! which roles.

use tenantview_events::{
    Event, InstanceRemoved, MemberChanged, MemberRemoved, OrgRemoved, Projection, ReduceError,
    ReducerRegistry, Statement, TableDescriptor, UserRemoved,
    kind::{
        InstanceMemberAdded, InstanceMemberCascadeRemoved, InstanceMemberChanged,
        InstanceMemberRemoved, InstanceRemovedKind, OrgRemovedKind, UserRemovedKind,
    },
};

use super::DefinitionError;
use super::member::{AddMember, MemberTable};

pub const NAME: &str = "instance_members";
pub const TABLE: &str = "projections.instance_members";

/// The instance ID doubles as the scope key.
pub const SCOPE_COLUMN: &str = "id";

const MEMBERS: MemberTable = MemberTable::new(TABLE, SCOPE_COLUMN);

pub fn table() -> TableDescriptor {
    MEMBERS.descriptor()
}

pub fn reducers() -> Result<ReducerRegistry, DefinitionError> {
    ReducerRegistry::builder()
        .on_resolved::<InstanceMemberAdded, _>(AddMember::new(MEMBERS))
        .on::<InstanceMemberChanged, _>(member_changed)
        .on::<InstanceMemberCascadeRemoved, _>(member_removed)
        .on::<InstanceMemberRemoved, _>(member_removed)
        .on::<InstanceRemovedKind, _>(instance_removed)
        .on::<OrgRemovedKind, _>(org_removed)
        .on::<UserRemovedKind, _>(user_removed)
        .build()
        .map_err(DefinitionError::from)
}

pub fn projection() -> Result<Projection, DefinitionError> {
    Projection::new(NAME, table(), reducers()?).map_err(DefinitionError::from)
}

fn member_changed(event: &Event, payload: &MemberChanged) -> Result<Vec<Statement>, ReduceError> {
    Ok(vec![MEMBERS.change(event, payload.user_id, &payload.roles)?])
}

fn member_removed(event: &Event, payload: &MemberRemoved) -> Result<Vec<Statement>, ReduceError> {
    Ok(vec![MEMBERS.remove(event, payload.user_id)])
}

fn instance_removed(event: &Event, _: &InstanceRemoved) -> Result<Vec<Statement>, ReduceError> {
    Ok(vec![MEMBERS.remove_instance(event)])
}

fn org_removed(event: &Event, _: &OrgRemoved) -> Result<Vec<Statement>, ReduceError> {
    Ok(vec![MEMBERS.remove_user_owner(event)])
}

fn user_removed(event: &Event, _: &UserRemoved) -> Result<Vec<Statement>, ReduceError> {
    Ok(vec![MEMBERS.remove_user(event)])
}
