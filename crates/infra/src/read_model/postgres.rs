//! Postgres-backed projection store.
//!
//! Projection tables live wherever their descriptor names them (normally the
//! `projections` schema). Checkpoints live in `projections.current_sequences`,
//! one row per (projection, instance).
//!
//! ## Atomicity
//!
//! `apply_statements` runs every statement and every checkpoint advance in one
//! transaction. A checkpoint advance is a compare-and-set on the position the
//! batch started from; if another writer moved it, the transaction rolls back
//! and `StoreError::CheckpointConflict` is returned.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database (class `08`, `40001`, `40P01`, `57P01`) | `Transient` (retried) |
//! | Io, PoolTimedOut, Tls | `Transient` (retried) |
//! | Anything else | `Database` (projection pauses) |

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgConnection, PgPool, Postgres, Row};
use tracing::{Span, debug, instrument};
use uuid::Uuid;

use tenantview_core::InstanceId;
use tenantview_events::{
    CheckpointAdvance, CheckpointError, CheckpointUpdate, Checkpoints, ColumnDef, ColumnType,
    Statement, TableDescriptor, TableSchema, Value, sequence_to_bigint,
};

use super::sql::{self, CHECKPOINT_SCHEMA};
use super::{CheckpointStore, ProjectionStore, StoreError};
use crate::event_source::postgres::is_transient_code;

#[derive(Debug, Clone)]
pub struct PostgresProjectionStore {
    pool: Arc<PgPool>,
}

impl PostgresProjectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn execute(&self, operation: &'static str, statement: &str) -> Result<(), StoreError> {
        sqlx::query(statement)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(())
    }

    /// Physical shape of `table`, or `None` if it does not exist.
    ///
    /// Columns of types no descriptor can declare are left out, so a declared
    /// column of such a type is reported as missing.
    async fn introspect(&self, table: &str) -> Result<Option<TableSchema>, StoreError> {
        let schema = sql::schema_of(table).unwrap_or("public");
        let relation = sql::relation_of(table);

        let column_rows = sqlx::query(
            r#"
            SELECT column_name, data_type, udt_name
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(schema)
        .bind(relation)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("introspect_columns", e))?;

        if column_rows.is_empty() {
            return Ok(None);
        }

        let mut columns = Vec::with_capacity(column_rows.len());
        for row in column_rows {
            let name: String = row.try_get("column_name").map_err(read_error)?;
            let data_type: String = row.try_get("data_type").map_err(read_error)?;
            let udt_name: String = row.try_get("udt_name").map_err(read_error)?;
            if let Some(column_type) = column_type(&data_type, &udt_name) {
                columns.push(ColumnDef::new(name, column_type));
            }
        }

        let primary_key = sqlx::query(
            r#"
            SELECT kcu.column_name
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON kcu.constraint_name = tc.constraint_name
                AND kcu.table_schema = tc.table_schema
                AND kcu.table_name = tc.table_name
            WHERE tc.constraint_type = 'PRIMARY KEY'
                AND tc.table_schema = $1
                AND tc.table_name = $2
            ORDER BY kcu.ordinal_position
            "#,
        )
        .bind(schema)
        .bind(relation)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("introspect_primary_key", e))?
        .iter()
        .map(|row| row.try_get::<String, _>("column_name").map_err(read_error))
        .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(TableSchema {
            columns,
            primary_key,
        }))
    }
}

#[async_trait]
impl CheckpointStore for PostgresProjectionStore {
    async fn get_checkpoint(
        &self,
        projection: &str,
        instance_id: InstanceId,
    ) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT current_sequence
            FROM projections.current_sequences
            WHERE projection_name = $1 AND instance_id = $2
            "#,
        )
        .bind(projection)
        .bind(instance_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_checkpoint", e))?;

        match row {
            Some(row) => position(row.try_get("current_sequence").map_err(read_error)?),
            None => Ok(0),
        }
    }

    async fn get_checkpoints(&self, projection: &str) -> Result<Checkpoints, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT instance_id, current_sequence
            FROM projections.current_sequences
            WHERE projection_name = $1
            "#,
        )
        .bind(projection)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_checkpoints", e))?;

        let mut positions = Vec::with_capacity(rows.len());
        for row in rows {
            let instance: Uuid = row.try_get("instance_id").map_err(read_error)?;
            let sequence = position(row.try_get("current_sequence").map_err(read_error)?)?;
            positions.push((InstanceId::from_uuid(instance), sequence));
        }
        Ok(Checkpoints::from_positions(positions))
    }
}

#[async_trait]
impl ProjectionStore for PostgresProjectionStore {
    #[instrument(skip_all, fields(table = table.name()), err)]
    async fn ensure_table(&self, table: &TableDescriptor) -> Result<(), StoreError> {
        table.validate()?;

        if let Some(schema) = sql::schema_of(table.name()) {
            self.execute("create_schema", &sql::create_schema(schema))
                .await?;
        }
        match self.introspect(table.name()).await? {
            Some(physical) => table.check_compatible(&physical)?,
            None => {
                debug!("creating projection table");
                self.execute("create_table", &sql::create_table(table))
                    .await?;
            }
        }
        for index in sql::create_indexes(table) {
            self.execute("create_index", &index).await?;
        }

        self.execute("create_schema", &sql::create_schema(CHECKPOINT_SCHEMA))
            .await?;
        self.execute("create_checkpoint_table", &sql::create_checkpoint_table())
            .await
    }

    #[instrument(
        skip_all,
        fields(
            projection = checkpoint.projection(),
            statements = statements.len(),
            instances = checkpoint.advances().len(),
        ),
        err
    )]
    async fn apply_statements(
        &self,
        table: &TableDescriptor,
        statements: &[Statement],
        checkpoint: &CheckpointUpdate,
    ) -> Result<(), StoreError> {
        for statement in statements {
            statement.validate(table)?;
        }
        let rendered: Vec<sql::SqlStatement> = statements.iter().map(sql::render).collect();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        for statement in &rendered {
            let mut query = sqlx::query(&statement.sql);
            for param in &statement.params {
                query = bind_value(query, param);
            }
            query
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("apply_statement", e))?;
        }

        for (instance_id, advance) in checkpoint.advances() {
            advance_checkpoint(&mut tx, checkpoint.projection(), *instance_id, advance).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(())
    }

    #[instrument(skip_all, fields(table = table.name(), projection = projection, rows = tracing::field::Empty), err)]
    async fn reset(&self, table: &TableDescriptor, projection: &str) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let deleted = sqlx::query(&format!("DELETE FROM {}", sql::quote_ident(table.name())))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("reset_table", e))?;
        sqlx::query("DELETE FROM projections.current_sequences WHERE projection_name = $1")
            .bind(projection)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("reset_checkpoints", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Span::current().record("rows", deleted.rows_affected());
        Ok(())
    }
}

/// Checkpoints are BIGINT; larger sequences are rejected, never wrapped.
fn bigint_bounds(advance: &CheckpointAdvance) -> Result<(i64, i64), StoreError> {
    Ok((sequence_to_bigint(advance.from)?, sequence_to_bigint(advance.to)?))
}

/// Compare-and-set one checkpoint from `advance.from` to `advance.to`.
async fn advance_checkpoint(
    conn: &mut PgConnection,
    projection: &str,
    instance_id: InstanceId,
    advance: &CheckpointAdvance,
) -> Result<(), StoreError> {
    let (from, to) = bigint_bounds(advance)?;
    let result = if advance.from == 0 {
        sqlx::query(
            r#"
            INSERT INTO projections.current_sequences AS cs
                (projection_name, instance_id, current_sequence, last_updated)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (projection_name, instance_id) DO UPDATE
                SET current_sequence = EXCLUDED.current_sequence, last_updated = now()
                WHERE cs.current_sequence = 0
            "#,
        )
        .bind(projection)
        .bind(instance_id.as_uuid())
        .bind(to)
        .execute(&mut *conn)
        .await
    } else {
        sqlx::query(
            r#"
            UPDATE projections.current_sequences
            SET current_sequence = $3, last_updated = now()
            WHERE projection_name = $1 AND instance_id = $2 AND current_sequence = $4
            "#,
        )
        .bind(projection)
        .bind(instance_id.as_uuid())
        .bind(to)
        .bind(from)
        .execute(&mut *conn)
        .await
    }
    .map_err(|e| map_sqlx_error("advance_checkpoint", e))?;

    if result.rows_affected() == 1 {
        return Ok(());
    }

    let stored = sqlx::query(
        "SELECT current_sequence FROM projections.current_sequences \
         WHERE projection_name = $1 AND instance_id = $2",
    )
    .bind(projection)
    .bind(instance_id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("read_checkpoint", e))?
    .map(|row| row.try_get::<i64, _>("current_sequence"))
    .transpose()
    .map_err(read_error)?
    .map_or(Ok(0), position)?;

    Err(StoreError::CheckpointConflict {
        projection: projection.to_string(),
        source: CheckpointError::Conflict {
            instance_id,
            expected: advance.from,
            stored,
        },
    })
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Text(v) => query.bind(v),
        Value::Uuid(v) => query.bind(v),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::TextArray(v) => query.bind(v),
        Value::Timestamp(v) => query.bind(*v),
    }
}

/// Map an `information_schema.columns` type to a descriptor type.
fn column_type(data_type: &str, udt_name: &str) -> Option<ColumnType> {
    match (data_type, udt_name) {
        ("text", _) => Some(ColumnType::Text),
        ("uuid", _) => Some(ColumnType::Uuid),
        ("boolean", _) => Some(ColumnType::Bool),
        ("bigint", _) => Some(ColumnType::Int64),
        ("timestamp with time zone", _) => Some(ColumnType::Timestamp),
        ("ARRAY", "_text") => Some(ColumnType::TextArray),
        _ => None,
    }
}

fn position(stored: i64) -> Result<u64, StoreError> {
    u64::try_from(stored)
        .map_err(|_| StoreError::database("read_checkpoint", format!("negative checkpoint {stored}")))
}

fn read_error(err: sqlx::Error) -> StoreError {
    StoreError::database("decode_row", err.to_string())
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_string();
            match db_err.code().as_deref() {
                Some(code) if is_transient_code(code) => StoreError::transient(operation, message),
                _ => StoreError::database(operation, message),
            }
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_) => {
            StoreError::transient(operation, err.to_string())
        }
        _ => StoreError::database(operation, err.to_string()),
    }
}
