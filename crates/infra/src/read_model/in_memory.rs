use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use tenantview_core::InstanceId;
use tenantview_events::{
    CheckpointUpdate, Checkpoints, Condition, Operation, Statement, StatementError,
    TableDescriptor, TableSchema, Value,
};

use super::{CheckpointStore, ProjectionStore, StoreError};

/// A materialized row: column name to value. Unassigned columns are absent.
pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default)]
struct Table {
    schema: TableSchema,
    /// Keyed by the primary-key values in descriptor order.
    rows: BTreeMap<Vec<Value>, Row>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, Table>,
    checkpoints: HashMap<String, Checkpoints>,
}

/// In-memory projection store for tests/dev.
///
/// Batches are applied to a copy of the table and swapped in on success, so a
/// failing statement leaves neither rows nor checkpoints changed.
#[derive(Debug, Default)]
pub struct InMemoryProjectionStore {
    state: RwLock<State>,
    failing_commits: AtomicU32,
    commits: AtomicU64,
}

impl InMemoryProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pretend `name` already exists with the given physical shape.
    pub fn install_schema(&self, name: impl Into<String>, schema: TableSchema) {
        self.write().tables.insert(
            name.into(),
            Table {
                schema,
                rows: BTreeMap::new(),
            },
        );
    }

    /// Make the next `n` commits fail as transient.
    pub fn fail_next_commits(&self, n: u32) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Move a checkpoint behind the engine's back (a second writer).
    pub fn set_checkpoint(&self, projection: &str, instance_id: InstanceId, sequence: u64) {
        let mut state = self.write();
        let current = state
            .checkpoints
            .get(projection)
            .cloned()
            .unwrap_or_default();
        let moved = Checkpoints::from_positions(
            current
                .iter()
                .filter(|(i, _)| *i != instance_id)
                .chain(std::iter::once((instance_id, sequence))),
        );
        state.checkpoints.insert(projection.to_string(), moved);
    }

    /// Snapshot of every row, in primary-key order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.read()
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.read().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Number of successful `apply_statements` calls.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }
}

fn matches(row: &Row, conditions: &[Condition]) -> bool {
    conditions
        .iter()
        .all(|c| row.get(&c.column) == Some(&c.value))
}

fn apply(
    table: &TableDescriptor,
    rows: &mut BTreeMap<Vec<Value>, Row>,
    statement: &Statement,
) -> Result<(), StoreError> {
    match &statement.operation {
        Operation::Upsert { values, .. } => {
            let mut key = Vec::with_capacity(table.primary_key().len());
            for column in table.primary_key() {
                let value = values
                    .iter()
                    .find(|a| &a.column == column)
                    .ok_or_else(|| StatementError::MissingKeyColumn(column.clone()))?;
                key.push(value.value.clone());
            }
            let row = rows.entry(key).or_default();
            for assignment in values {
                row.insert(assignment.column.clone(), assignment.value.clone());
            }
        }
        Operation::Update { values, conditions } => {
            for row in rows.values_mut().filter(|r| matches(r, conditions)) {
                for assignment in values {
                    row.insert(assignment.column.clone(), assignment.value.clone());
                }
            }
        }
        Operation::Delete { conditions } => {
            rows.retain(|_, row| !matches(row, conditions));
        }
    }
    Ok(())
}

#[async_trait]
impl CheckpointStore for InMemoryProjectionStore {
    async fn get_checkpoint(
        &self,
        projection: &str,
        instance_id: InstanceId,
    ) -> Result<u64, StoreError> {
        Ok(self
            .read()
            .checkpoints
            .get(projection)
            .map_or(0, |c| c.position(instance_id)))
    }

    async fn get_checkpoints(&self, projection: &str) -> Result<Checkpoints, StoreError> {
        Ok(self
            .read()
            .checkpoints
            .get(projection)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ProjectionStore for InMemoryProjectionStore {
    async fn ensure_table(&self, table: &TableDescriptor) -> Result<(), StoreError> {
        table.validate()?;
        let mut state = self.write();
        if let Some(existing) = state.tables.get(table.name()) {
            table.check_compatible(&existing.schema)?;
            return Ok(());
        }
        state.tables.insert(
            table.name().to_string(),
            Table {
                schema: table.to_schema(),
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn apply_statements(
        &self,
        table: &TableDescriptor,
        statements: &[Statement],
        checkpoint: &CheckpointUpdate,
    ) -> Result<(), StoreError> {
        if self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::transient(
                "apply_statements",
                "injected commit failure",
            ));
        }

        let mut state = self.write();
        let mut rows = state
            .tables
            .get(table.name())
            .map(|t| t.rows.clone())
            .ok_or_else(|| {
                StoreError::database(
                    "apply_statements",
                    format!("relation {} does not exist", table.name()),
                )
            })?;
        for statement in statements {
            statement.validate(table)?;
            apply(table, &mut rows, statement)?;
        }

        let mut checkpoints = state
            .checkpoints
            .get(checkpoint.projection())
            .cloned()
            .unwrap_or_default();
        checkpoints
            .apply(checkpoint)
            .map_err(|source| StoreError::CheckpointConflict {
                projection: checkpoint.projection().to_string(),
                source,
            })?;

        if let Some(target) = state.tables.get_mut(table.name()) {
            target.rows = rows;
        }
        state
            .checkpoints
            .insert(checkpoint.projection().to_string(), checkpoints);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reset(&self, table: &TableDescriptor, projection: &str) -> Result<(), StoreError> {
        let mut state = self.write();
        if let Some(target) = state.tables.get_mut(table.name()) {
            target.rows.clear();
        }
        state.checkpoints.remove(projection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenantview_core::{OrgId, UserId};
    use tenantview_events::{Assignment, ColumnDef, ColumnType, SchemaError};

    const TABLE: &str = "projections.members";

    fn descriptor() -> TableDescriptor {
        TableDescriptor::new(
            TABLE,
            vec![
                ColumnDef::new("instance_id", ColumnType::Uuid),
                ColumnDef::new("user_id", ColumnType::Uuid),
                ColumnDef::new("owner", ColumnType::Uuid),
                ColumnDef::new("roles", ColumnType::TextArray),
            ],
            &["instance_id", "user_id"],
        )
    }

    fn add(instance: InstanceId, user: UserId, owner: OrgId) -> Statement {
        Statement::upsert(
            TABLE,
            &["instance_id", "user_id"],
            vec![
                Assignment::new("instance_id", instance),
                Assignment::new("user_id", user),
                Assignment::new("owner", owner),
                Assignment::new("roles", vec!["IAM_OWNER".to_string()]),
            ],
        )
    }

    fn advance(instance: InstanceId, from: u64, to: u64) -> CheckpointUpdate {
        let mut update = CheckpointUpdate::new("members");
        update.record(instance, from, to).unwrap();
        update
    }

    #[tokio::test]
    async fn upsert_overwrites_instead_of_duplicating() {
        let store = InMemoryProjectionStore::new();
        let table = descriptor();
        store.ensure_table(&table).await.unwrap();
        let (instance, user) = (InstanceId::new(), UserId::new());
        let second_owner = OrgId::new();

        store
            .apply_statements(&table, &[add(instance, user, OrgId::new())], &advance(instance, 0, 1))
            .await
            .unwrap();
        store
            .apply_statements(&table, &[add(instance, user, second_owner)], &advance(instance, 1, 2))
            .await
            .unwrap();

        let rows = store.rows(TABLE);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["owner"], Value::from(second_owner));
        assert_eq!(store.get_checkpoint("members", instance).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn failed_batch_changes_nothing() {
        let store = InMemoryProjectionStore::new();
        let table = descriptor();
        store.ensure_table(&table).await.unwrap();
        let instance = InstanceId::new();
        let invalid = Statement::delete(TABLE, vec![]);

        let err = store
            .apply_statements(
                &table,
                &[add(instance, UserId::new(), OrgId::new()), invalid],
                &advance(instance, 0, 2),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Statement(StatementError::Unconditional(_))));
        assert_eq!(store.row_count(TABLE), 0);
        assert_eq!(store.get_checkpoint("members", instance).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fan_out_delete_and_noop_update() {
        let store = InMemoryProjectionStore::new();
        let table = descriptor();
        store.ensure_table(&table).await.unwrap();
        let instance = InstanceId::new();
        let (gone, kept) = (OrgId::new(), OrgId::new());
        let absent_user = UserId::new();

        let statements = vec![
            add(instance, UserId::new(), gone),
            add(instance, UserId::new(), gone),
            add(instance, UserId::new(), kept),
            Statement::update(
                TABLE,
                vec![Assignment::new("roles", Vec::<String>::new())],
                vec![
                    Condition::new("instance_id", instance),
                    Condition::new("user_id", absent_user),
                ],
            ),
            Statement::delete(
                TABLE,
                vec![
                    Condition::new("instance_id", instance),
                    Condition::new("owner", gone),
                ],
            ),
        ];
        store
            .apply_statements(&table, &statements, &advance(instance, 0, 5))
            .await
            .unwrap();

        let rows = store.rows(TABLE);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["owner"], Value::from(kept));
    }

    #[tokio::test]
    async fn stale_checkpoint_is_a_conflict() {
        let store = InMemoryProjectionStore::new();
        let table = descriptor();
        store.ensure_table(&table).await.unwrap();
        let instance = InstanceId::new();
        store.set_checkpoint("members", instance, 4);

        let err = store
            .apply_statements(&table, &[add(instance, UserId::new(), OrgId::new())], &advance(instance, 0, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CheckpointConflict { .. }));
        assert_eq!(store.row_count(TABLE), 0);
    }

    #[tokio::test]
    async fn injected_commit_failures_are_transient_and_counted_down() {
        let store = InMemoryProjectionStore::new();
        let table = descriptor();
        store.ensure_table(&table).await.unwrap();
        store.fail_next_commits(1);
        let instance = InstanceId::new();

        let err = store
            .apply_statements(&table, &[], &advance(instance, 0, 1))
            .await
            .unwrap_err();
        assert!(crate::engine::Retryable::is_retryable(&err));

        store
            .apply_statements(&table, &[], &advance(instance, 0, 1))
            .await
            .unwrap();
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn drifted_schema_is_rejected() {
        let store = InMemoryProjectionStore::new();
        let table = descriptor();
        let mut physical = table.to_schema();
        physical.primary_key = vec!["user_id".to_string()];
        store.install_schema(TABLE, physical);

        let err = store.ensure_table(&table).await.unwrap_err();
        assert!(matches!(err, StoreError::Schema(SchemaError::PrimaryKeyMismatch { .. })));
    }

    #[tokio::test]
    async fn reset_clears_rows_and_checkpoints() {
        let store = InMemoryProjectionStore::new();
        let table = descriptor();
        store.ensure_table(&table).await.unwrap();
        let instance = InstanceId::new();
        store
            .apply_statements(&table, &[add(instance, UserId::new(), OrgId::new())], &advance(instance, 0, 3))
            .await
            .unwrap();

        store.reset(&table, "members").await.unwrap();
        assert_eq!(store.row_count(TABLE), 0);
        assert!(store.get_checkpoints("members").await.unwrap().is_empty());
        store.ensure_table(&table).await.unwrap();
    }
}
