//! Postgres-backed event source.
//!
//! Reads the `events` table written by the event log. The table is owned by
//! the log; this module never writes to it.
//!
//! ## Error Mapping
//!
//! | SQLx Error | SourceError / LookupError |
//! |------------|---------------------------|
//! | Database (class `08`, `40001`, `40P01`, `57P01`) | `Unavailable` (retried) |
//! | Io, PoolTimedOut, Tls | `Unavailable` (retried) |
//! | Column decode failures | `Malformed` |
//! | Anything else | `Database` (projection pauses) |

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};
use uuid::Uuid;

use tenantview_core::{AggregateId, AggregateType, InstanceId, OrgId, UserId};
use tenantview_events::{
    Event, EventPayload, LookupError, OwnerLookup, event_types, sequence_to_bigint,
};

use super::{EventQuery, EventSource, SourceError};

/// Event source over the shared `events` table.
///
/// Expected columns: `event_id UUID`, `instance_id UUID`, `aggregate_id UUID`,
/// `aggregate_type TEXT`, `resource_owner UUID`, `sequence BIGINT`,
/// `event_type TEXT`, `created_at TIMESTAMPTZ`, `payload JSONB`.
///
/// There is no notification channel; `wait_for_events` sleeps for the poll
/// interval.
#[derive(Debug, Clone)]
pub struct PostgresEventSource {
    pool: Arc<PgPool>,
}

impl PostgresEventSource {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl EventSource for PostgresEventSource {
    #[instrument(
        skip_all,
        fields(limit = query.limit, instances = query.after.len(), events = tracing::field::Empty),
        err
    )]
    async fn read_events_after(&self, query: &EventQuery) -> Result<Vec<Event>, SourceError> {
        let (instances, positions): (Vec<Uuid>, Vec<i64>) = query
            .after
            .iter()
            .map(|(instance, position)| {
                sequence_to_bigint(position)
                    .map(|position| (*instance.as_uuid(), position))
                    .map_err(|e| SourceError::Malformed(format!("checkpoint of {instance}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .unzip();
        let (aggregate_types, subscribed_types): (Vec<String>, Vec<String>) = query
            .subscriptions
            .iter()
            .map(|s| (s.aggregate_type.as_str().to_string(), s.event_type.to_string()))
            .unzip();

        let rows = sqlx::query(
            r#"
            WITH positions AS (
                SELECT * FROM unnest($1::uuid[], $2::bigint[]) AS p(instance_id, position)
            ),
            subscribed AS (
                SELECT * FROM unnest($3::text[], $4::text[]) AS s(aggregate_type, event_type)
            )
            SELECT
                e.event_id,
                e.instance_id,
                e.aggregate_id,
                e.aggregate_type,
                e.resource_owner,
                e.sequence,
                e.event_type,
                e.created_at,
                e.payload
            FROM events e
            JOIN subscribed s
                ON s.aggregate_type = e.aggregate_type AND s.event_type = e.event_type
            LEFT JOIN positions p ON p.instance_id = e.instance_id
            WHERE e.sequence > COALESCE(p.position, 0)
            ORDER BY e.sequence ASC, e.instance_id ASC
            LIMIT $5
            "#,
        )
        .bind(&instances)
        .bind(&positions)
        .bind(&aggregate_types)
        .bind(&subscribed_types)
        .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_events_after", e))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            events.push(EventRow::from_row(&row)?.into_event()?);
        }

        Span::current().record("events", events.len());
        Ok(events)
    }

    async fn wait_for_events(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }
}

/// `$4` is `user.removed`, which carries no new owner.
const CURRENT_OWNER_SQL: &str = r#"
    SELECT resource_owner
    FROM events
    WHERE instance_id = $1 AND aggregate_type = $2 AND aggregate_id = $3
      AND event_type <> $4
    ORDER BY sequence DESC
    LIMIT 1
"#;

#[async_trait]
impl OwnerLookup for PostgresEventSource {
    /// The latest user event that carries an owner decides. Removed users
    /// keep their last owner; only users without events have none.
    async fn current_owner(
        &self,
        instance_id: InstanceId,
        user_id: UserId,
    ) -> Result<Option<OrgId>, LookupError> {
        let row = sqlx::query(CURRENT_OWNER_SQL)
            .bind(instance_id.as_uuid())
            .bind(AggregateType::User.as_str())
            .bind(user_id.as_uuid())
            .bind(event_types::USER_REMOVED)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| LookupError(map_sqlx_error("current_owner", e).to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let owner: Uuid = row
            .try_get("resource_owner")
            .map_err(|e| LookupError(format!("failed to read resource_owner: {e}")))?;
        Ok(Some(OrgId::from_uuid(owner)))
    }
}

/// Map SQLx errors to SourceError.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> SourceError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let message = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some(code) if is_transient_code(code) => SourceError::unavailable(operation, message),
                _ => SourceError::Database { operation, message },
            }
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_) => {
            SourceError::unavailable(operation, err.to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
            SourceError::Malformed(format!("{operation}: {err}"))
        }
        _ => SourceError::Database {
            operation,
            message: err.to_string(),
        },
    }
}

/// SQLSTATEs worth retrying: connection exceptions, serialization failures,
/// deadlocks, admin shutdown.
pub(crate) fn is_transient_code(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "40001" | "40P01" | "57P01")
}

// SQLx row types

#[derive(Debug)]
struct EventRow {
    event_id: Uuid,
    instance_id: Uuid,
    aggregate_id: Uuid,
    aggregate_type: String,
    resource_owner: Uuid,
    sequence: i64,
    event_type: String,
    created_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl EventRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, SourceError> {
        let read = |e: sqlx::Error| SourceError::Malformed(format!("failed to read event row: {e}"));
        Ok(Self {
            event_id: row.try_get("event_id").map_err(read)?,
            instance_id: row.try_get("instance_id").map_err(read)?,
            aggregate_id: row.try_get("aggregate_id").map_err(read)?,
            aggregate_type: row.try_get("aggregate_type").map_err(read)?,
            resource_owner: row.try_get("resource_owner").map_err(read)?,
            sequence: row.try_get("sequence").map_err(read)?,
            event_type: row.try_get("event_type").map_err(read)?,
            created_at: row.try_get("created_at").map_err(read)?,
            payload: row.try_get("payload").map_err(read)?,
        })
    }

    fn into_event(self) -> Result<Event, SourceError> {
        let aggregate_type = AggregateType::from_str(&self.aggregate_type)
            .map_err(|e| SourceError::Malformed(e.to_string()))?;
        let sequence = u64::try_from(self.sequence)
            .map_err(|_| SourceError::Malformed(format!("negative sequence {}", self.sequence)))?;
        let payload = EventPayload::decode(aggregate_type, &self.event_type, self.payload)?;

        Ok(Event::from_parts(
            self.event_id,
            InstanceId::from_uuid(self.instance_id),
            AggregateId::from_uuid(self.aggregate_id),
            aggregate_type,
            AggregateId::from_uuid(self.resource_owner),
            sequence,
            self.event_type,
            self.created_at,
            payload,
        ))
    }
}
