//! Shared shape of membership tables.
//!
//! Every membership projection stores one row per (instance, scope, user) with
//! the same columns; only the table name and the scope column differ.

use async_trait::async_trait;

use tenantview_core::{OrgId, UserId};
use tenantview_events::{
    Assignment, ColumnDef, ColumnType, Condition, Event, EventKind, Index, MemberAdded, Reduce,
    ReduceContext, ReduceError, Statement, StatementError, TableDescriptor, Value,
};

pub const CREATION_DATE: &str = "creation_date";
pub const CHANGE_DATE: &str = "change_date";
pub const USER_ID: &str = "user_id";
pub const USER_RESOURCE_OWNER: &str = "user_resource_owner";
pub const ROLES: &str = "roles";
pub const SEQUENCE: &str = "sequence";
pub const RESOURCE_OWNER: &str = "resource_owner";
pub const INSTANCE_ID: &str = "instance_id";

/// Statement builders for one membership table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemberTable {
    table: &'static str,
    scope: &'static str,
}

impl MemberTable {
    pub const fn new(table: &'static str, scope: &'static str) -> Self {
        Self { table, scope }
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn scope_column(&self) -> &'static str {
        self.scope
    }

    pub fn descriptor(&self) -> TableDescriptor {
        TableDescriptor::new(
            self.table,
            vec![
                ColumnDef::new(CREATION_DATE, ColumnType::Timestamp),
                ColumnDef::new(CHANGE_DATE, ColumnType::Timestamp),
                ColumnDef::new(USER_ID, ColumnType::Uuid),
                ColumnDef::new(USER_RESOURCE_OWNER, ColumnType::Uuid),
                ColumnDef::new(ROLES, ColumnType::TextArray),
                ColumnDef::new(SEQUENCE, ColumnType::Int64),
                ColumnDef::new(RESOURCE_OWNER, ColumnType::Uuid),
                ColumnDef::new(INSTANCE_ID, ColumnType::Uuid),
                ColumnDef::new(self.scope, ColumnType::Uuid),
            ],
            &[INSTANCE_ID, self.scope, USER_ID],
        )
        .with_index(Index::new(USER_ID, &[USER_ID]))
        .with_index(Index::new(USER_RESOURCE_OWNER, &[USER_RESOURCE_OWNER]))
    }

    /// Insert the membership, or overwrite it if the key already exists.
    /// The scope is the emitting aggregate.
    pub fn add(
        &self,
        event: &Event,
        user_id: UserId,
        user_resource_owner: OrgId,
        roles: &[String],
    ) -> Result<Statement, StatementError> {
        Ok(Statement::upsert(
            self.table,
            &[INSTANCE_ID, self.scope, USER_ID],
            vec![
                Assignment::new(INSTANCE_ID, event.instance_id()),
                Assignment::new(self.scope, event.aggregate_id()),
                Assignment::new(USER_ID, user_id),
                Assignment::new(USER_RESOURCE_OWNER, user_resource_owner),
                Assignment::new(ROLES, roles.to_vec()),
                Assignment::new(CREATION_DATE, event.created_at()),
                Assignment::new(CHANGE_DATE, event.created_at()),
                Assignment::new(SEQUENCE, Value::try_from(event.sequence())?),
                Assignment::new(RESOURCE_OWNER, event.resource_owner()),
            ],
        ))
    }

    /// Replace the roles of an existing membership. No-op if it is gone.
    pub fn change(
        &self,
        event: &Event,
        user_id: UserId,
        roles: &[String],
    ) -> Result<Statement, StatementError> {
        Ok(Statement::update(
            self.table,
            vec![
                Assignment::new(ROLES, roles.to_vec()),
                Assignment::new(CHANGE_DATE, event.created_at()),
                Assignment::new(SEQUENCE, Value::try_from(event.sequence())?),
            ],
            self.member_key(event, user_id),
        ))
    }

    pub fn remove(&self, event: &Event, user_id: UserId) -> Statement {
        Statement::delete(self.table, self.member_key(event, user_id))
    }

    /// Every membership of the scope the event was emitted by.
    pub fn remove_scope(&self, event: &Event) -> Statement {
        Statement::delete(
            self.table,
            vec![
                Condition::new(INSTANCE_ID, event.instance_id()),
                Condition::new(self.scope, event.aggregate_id()),
            ],
        )
    }

    /// Every membership of users owned by the org that emitted the event.
    pub fn remove_user_owner(&self, event: &Event) -> Statement {
        Statement::delete(
            self.table,
            vec![
                Condition::new(INSTANCE_ID, event.instance_id()),
                Condition::new(USER_RESOURCE_OWNER, event.aggregate_id()),
            ],
        )
    }

    /// Every membership of the user that emitted the event.
    pub fn remove_user(&self, event: &Event) -> Statement {
        Statement::delete(
            self.table,
            vec![
                Condition::new(INSTANCE_ID, event.instance_id()),
                Condition::new(USER_ID, event.aggregate_id()),
            ],
        )
    }

    /// Tenant teardown.
    pub fn remove_instance(&self, event: &Event) -> Statement {
        Statement::delete(
            self.table,
            vec![Condition::new(INSTANCE_ID, event.instance_id())],
        )
    }

    fn member_key(&self, event: &Event, user_id: UserId) -> Vec<Condition> {
        vec![
            Condition::new(INSTANCE_ID, event.instance_id()),
            Condition::new(self.scope, event.aggregate_id()),
            Condition::new(USER_ID, user_id),
        ]
    }
}

/// Reducer for every "member added" kind.
///
/// The user's owning org is looked up when the event is reduced, not when it
/// was written, so an ownership move racing the add is not reflected.
#[derive(Debug, Copy, Clone)]
pub struct AddMember {
    members: MemberTable,
}

impl AddMember {
    pub const fn new(members: MemberTable) -> Self {
        Self { members }
    }
}

#[async_trait]
impl<K> Reduce<K> for AddMember
where
    K: EventKind<Payload = MemberAdded>,
{
    async fn reduce(
        &self,
        event: &Event,
        payload: &K::Payload,
        ctx: &ReduceContext<'_>,
    ) -> Result<Vec<Statement>, ReduceError> {
        let owner = ctx
            .resource_owner_of_user(event.instance_id(), payload.user_id)
            .await?;
        Ok(vec![self.members.add(event, payload.user_id, owner, &payload.roles)?])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tenantview_core::InstanceId;
    use tenantview_events::{
        EventPayload, InstanceEvent, LookupError, Operation, OwnerLookup, kind::InstanceMemberAdded,
    };

    const MEMBERS: MemberTable = MemberTable::new("projections.test_members", "scope_id");

    /// Owner lookup answering the same org for every user.
    pub(crate) struct FixedOwner(pub Option<OrgId>);

    #[async_trait]
    impl OwnerLookup for FixedOwner {
        async fn current_owner(
            &self,
            _instance_id: InstanceId,
            _user_id: UserId,
        ) -> Result<Option<OrgId>, LookupError> {
            Ok(self.0)
        }
    }

    fn added(instance: InstanceId, user: UserId) -> Event {
        Event::new(
            instance,
            instance.into(),
            instance.into(),
            EventPayload::Instance(InstanceEvent::MemberAdded(MemberAdded {
                user_id: user,
                roles: vec!["IAM_OWNER".to_string()],
            })),
        )
        .with_sequence(3)
    }

    #[test]
    fn descriptor_keys_on_instance_scope_and_user() {
        let descriptor = MEMBERS.descriptor();
        descriptor.validate().unwrap();
        assert_eq!(descriptor.primary_key(), ["instance_id", "scope_id", "user_id"]);
        assert_eq!(descriptor.indexes().len(), 2);
    }

    #[test]
    fn builders_produce_valid_statements() {
        let descriptor = MEMBERS.descriptor();
        let event = added(InstanceId::new(), UserId::new());
        let user = UserId::new();

        for statement in [
            MEMBERS.add(&event, user, OrgId::new(), &["ORG_OWNER".to_string()]).unwrap(),
            MEMBERS.change(&event, user, &[]).unwrap(),
            MEMBERS.remove(&event, user),
            MEMBERS.remove_scope(&event),
            MEMBERS.remove_user_owner(&event),
            MEMBERS.remove_user(&event),
            MEMBERS.remove_instance(&event),
        ] {
            statement.validate(&descriptor).unwrap();
        }
    }

    #[test]
    fn owner_fan_out_matches_on_user_resource_owner() {
        let instance = InstanceId::new();
        let org = OrgId::new();
        let event = Event::new(
            instance,
            org.into(),
            org.into(),
            EventPayload::Instance(InstanceEvent::MemberRemoved(
                tenantview_events::MemberRemoved {
                    user_id: UserId::new(),
                },
            )),
        );

        let Operation::Delete { conditions } = MEMBERS.remove_user_owner(&event).operation else {
            panic!("expected delete");
        };
        assert_eq!(conditions[1].column, USER_RESOURCE_OWNER);
        assert_eq!(conditions[1].value, Value::from(org));
    }

    #[tokio::test]
    async fn add_resolves_the_current_owner() {
        let owner = OrgId::new();
        let lookup = FixedOwner(Some(owner));
        let ctx = ReduceContext::new(&lookup);
        let instance = InstanceId::new();
        let user = UserId::new();
        let event = added(instance, user);
        let EventPayload::Instance(InstanceEvent::MemberAdded(payload)) = event.payload() else {
            panic!("expected member added");
        };

        let statements = Reduce::<InstanceMemberAdded>::reduce(&AddMember::new(MEMBERS), &event, payload, &ctx)
            .await
            .unwrap();

        assert_eq!(statements, vec![MEMBERS.add(&event, user, owner, &payload.roles).unwrap()]);
    }

    #[tokio::test]
    async fn sequence_beyond_bigint_is_not_written() {
        let lookup = FixedOwner(Some(OrgId::new()));
        let ctx = ReduceContext::new(&lookup);
        let user = UserId::new();
        let event = added(InstanceId::new(), user).with_sequence(u64::MAX);
        let EventPayload::Instance(InstanceEvent::MemberAdded(payload)) = event.payload() else {
            panic!("expected member added");
        };

        assert_eq!(
            MEMBERS.change(&event, user, &[]),
            Err(StatementError::SequenceOutOfRange(u64::MAX))
        );
        let err = Reduce::<InstanceMemberAdded>::reduce(&AddMember::new(MEMBERS), &event, payload, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ReduceError::Statement(StatementError::SequenceOutOfRange(_))));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn add_for_unknown_user_fails() {
        let lookup = FixedOwner(None);
        let ctx = ReduceContext::new(&lookup);
        let event = added(InstanceId::new(), UserId::new());
        let EventPayload::Instance(InstanceEvent::MemberAdded(payload)) = event.payload() else {
            panic!("expected member added");
        };

        let err = Reduce::<InstanceMemberAdded>::reduce(&AddMember::new(MEMBERS), &event, payload, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ReduceError::UserNotFound { .. }));
    }
}
