//! `projections.org_members`: memberships of organizations.

use tenantview_events::{
    Event, InstanceRemoved, MemberChanged, MemberRemoved, OrgRemoved, Projection, ReduceError,
    ReducerRegistry, Statement, TableDescriptor, UserRemoved,
    kind::{
        InstanceRemovedKind, OrgMemberAdded, OrgMemberCascadeRemoved, OrgMemberChanged,
        OrgMemberRemoved, OrgRemovedKind, UserRemovedKind,
    },
};

use super::DefinitionError;
use super::member::{AddMember, MemberTable};

pub const NAME: &str = "org_members";
pub const TABLE: &str = "projections.org_members";
pub const SCOPE_COLUMN: &str = "org_id";

const MEMBERS: MemberTable = MemberTable::new(TABLE, SCOPE_COLUMN);

pub fn table() -> TableDescriptor {
    MEMBERS.descriptor()
}

pub fn reducers() -> Result<ReducerRegistry, DefinitionError> {
    ReducerRegistry::builder()
        .on_resolved::<OrgMemberAdded, _>(AddMember::new(MEMBERS))
        .on::<OrgMemberChanged, _>(member_changed)
        .on::<OrgMemberCascadeRemoved, _>(member_removed)
        .on::<OrgMemberRemoved, _>(member_removed)
        .on::<OrgRemovedKind, _>(org_removed)
        .on::<InstanceRemovedKind, _>(instance_removed)
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

/// The org's own memberships go, and so do memberships elsewhere of users the
/// org owned.
fn org_removed(event: &Event, _: &OrgRemoved) -> Result<Vec<Statement>, ReduceError> {
    Ok(vec![
        MEMBERS.remove_scope(event),
        MEMBERS.remove_user_owner(event),
    ])
}

fn instance_removed(event: &Event, _: &InstanceRemoved) -> Result<Vec<Statement>, ReduceError> {
    Ok(vec![MEMBERS.remove_instance(event)])
}

fn user_removed(event: &Event, _: &UserRemoved) -> Result<Vec<Statement>, ReduceError> {
    Ok(vec![MEMBERS.remove_user(event)])
}
