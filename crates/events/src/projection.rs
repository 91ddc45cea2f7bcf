use crate::registry::{ReducerRegistry, Subscription};
use crate::table::{SchemaError, TableDescriptor};

/// A projection builds one read-model table from the event log.
///
/// A projection is data, not behavior: a unique name (the checkpoint key), the
/// descriptor of the table it owns, and the registry mapping each subscribed
/// event to a reducer. The infra engine drives it.
///
/// ## Idempotency
///
/// Events are delivered at least once. Two things make redelivery harmless:
///
/// - **Checkpoints**: the engine skips events at or below the instance's
///   checkpoint, and commits checkpoint and statements in one transaction.
/// - **Keyed statements**: reducers only emit upserts on the primary key and
///   condition-matched updates/deletes, so re-applying converges.
///
/// ## Disposability
///
/// The table can be dropped and rebuilt by resetting the projection's
/// checkpoints and replaying from sequence 0. Events are the source of truth.
///
/// ## Tenant isolation
///
/// Every reducer scopes its statements by `instance_id`; a projection never
/// touches rows of an instance other than the event's, except for instance
/// teardown which is scoped to exactly that instance.
#[derive(Debug)]
pub struct Projection {
    name: String,
    table: TableDescriptor,
    reducers: ReducerRegistry,
}

impl Projection {
    /// Fails when the table descriptor is internally inconsistent.
    pub fn new(
        name: impl Into<String>,
        table: TableDescriptor,
        reducers: ReducerRegistry,
    ) -> Result<Self, SchemaError> {
        table.validate()?;
        Ok(Self {
            name: name.into(),
            table,
            reducers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &TableDescriptor {
        &self.table
    }

    pub fn reducers(&self) -> &ReducerRegistry {
        &self.reducers
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.reducers.subscriptions()
    }
}
