//! Projection engine.
//!
//! One engine drives one projection: it reads subscribed events past the
//! projection's checkpoints, reduces each into statements, and commits the
//! statements of a batch together with the checkpoint advance covering them.
//!
//! ```text
//! Idle ──start()──► CatchingUp ──caught up──► SteadyState
//!                        │                         │
//!                        └──── fatal error ────────┴──► Paused
//! ```
//!
//! ## Guarantees
//!
//! - Events of an instance are reduced and committed in ascending sequence
//!   order; nothing is reordered inside a batch.
//! - A checkpoint never advances past an event whose statements did not commit.
//! - Redelivered events (at or below the checkpoint) are skipped.
//! - A non-retryable failure commits the events staged before the failing one,
//!   then pauses. Restarting resumes at the failing event.
//!
//! The engine holds no locks across batches and is not shared; concurrency
//! comes from running several engines (see [`spawn`]).

pub mod config;
pub mod retry;
pub mod worker;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use tenantview_core::InstanceId;
use tenantview_events::{
    CheckpointError, CheckpointUpdate, Checkpoints, Event, Projection, ReduceContext,
    ReduceError, RegistryError, Statement, StatementError,
};

use crate::event_source::{EventQuery, EventSource, SourceError};
use crate::read_model::{ProjectionStore, StoreError};

pub use config::{BackoffStrategy, ConfigError, EngineConfig, RetryPolicy};
pub use retry::{Retryable, with_retry};
pub use worker::{ProjectionHandle, spawn};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    CatchingUp,
    SteadyState,
    Paused,
}

/// Result of one read/reduce/commit cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Committed {
        events: usize,
        statements: usize,
        skipped: usize,
    },
    /// No subscribed event past the checkpoints.
    CaughtUp,
    /// Another writer moved a checkpoint. The batch was dropped and the
    /// checkpoints reloaded.
    Conflict,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no reducer for event {sequence} of instance {instance_id}: {source}")]
    Dispatch {
        instance_id: InstanceId,
        sequence: u64,
        #[source]
        source: RegistryError,
    },

    #[error("reducing {event_type} (instance {instance_id}, sequence {sequence}) failed: {source}")]
    Reduce {
        instance_id: InstanceId,
        sequence: u64,
        event_type: String,
        #[source]
        source: ReduceError,
    },

    #[error("statement from {event_type} (instance {instance_id}, sequence {sequence}) rejected: {source}")]
    Statement {
        instance_id: InstanceId,
        sequence: u64,
        event_type: String,
        #[source]
        source: StatementError,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("projection {0} has not been started")]
    NotStarted(String),

    #[error("projection {projection} is paused")]
    Paused { projection: String },

    #[error("projection {projection} stopped in state {state:?}")]
    Stopped {
        projection: String,
        state: EngineState,
    },

    #[error("projection worker panicked: {0}")]
    WorkerPanicked(String),
}

impl Retryable for EngineError {
    /// Only infrastructure hiccups that outlived their retry budget; anything
    /// tied to a specific event is permanent.
    fn is_retryable(&self) -> bool {
        match self {
            Self::Source(err) => err.is_retryable(),
            Self::Store(err) => err.is_retryable(),
            _ => false,
        }
    }
}

pub struct ProjectionEngine<S, T> {
    projection: Projection,
    source: S,
    store: T,
    config: EngineConfig,
    checkpoints: Option<Checkpoints>,
    state: watch::Sender<EngineState>,
}

impl<S, T> ProjectionEngine<S, T>
where
    S: EventSource,
    T: ProjectionStore,
{
    pub fn new(projection: Projection, source: S, store: T, config: EngineConfig) -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        Self {
            projection,
            source,
            store,
            config,
            checkpoints: None,
            state,
        }
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// In-memory view of the committed checkpoints; `None` before `start`.
    pub fn checkpoints(&self) -> Option<&Checkpoints> {
        self.checkpoints.as_ref()
    }

    fn set_state(&self, next: EngineState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(projection = self.projection.name(), from = ?previous, to = ?next, "projection state changed");
        }
    }

    fn pause(&self, err: &EngineError) {
        error!(projection = self.projection.name(), error = %err, "projection paused");
        self.set_state(EngineState::Paused);
    }

    /// Verify or create the table, load checkpoints, begin catching up.
    ///
    /// Schema drift is fatal and not retried.
    #[instrument(skip_all, fields(projection = self.projection.name()), err)]
    pub async fn start(&mut self) -> Result<(), EngineError> {
        let table = self.projection.table();
        let name = self.projection.name();

        let started: Result<Checkpoints, StoreError> = async {
            with_retry(&self.config.retry, "ensure_table", |_| {
                self.store.ensure_table(table)
            })
            .await?;
            with_retry(&self.config.retry, "get_checkpoints", |_| {
                self.store.get_checkpoints(name)
            })
            .await
        }
        .await;

        match started {
            Ok(checkpoints) => {
                info!(instances = checkpoints.len(), "projection started");
                self.checkpoints = Some(checkpoints);
                self.set_state(EngineState::CatchingUp);
                Ok(())
            }
            Err(err) => {
                let err = EngineError::from(err);
                self.pause(&err);
                Err(err)
            }
        }
    }

    /// Drop every row and checkpoint of the projection and replay from the
    /// start. Also the way out of `Paused` once the cause is fixed.
    #[instrument(skip_all, fields(projection = self.projection.name()), err)]
    pub async fn reset(&mut self) -> Result<(), EngineError> {
        let table = self.projection.table();
        self.store.ensure_table(table).await?;
        self.store.reset(table, self.projection.name()).await?;
        self.checkpoints = Some(Checkpoints::new());
        info!("projection reset, replaying from the beginning");
        self.set_state(EngineState::CatchingUp);
        Ok(())
    }

    /// One read/reduce/commit cycle.
    pub async fn run_batch(&mut self) -> Result<BatchOutcome, EngineError> {
        if self.state() == EngineState::Paused {
            return Err(EngineError::Paused {
                projection: self.projection.name().to_string(),
            });
        }
        let Some(checkpoints) = self.checkpoints.clone() else {
            return Err(EngineError::NotStarted(self.projection.name().to_string()));
        };

        let query = EventQuery::new(
            self.projection.subscriptions(),
            checkpoints.clone(),
            self.config.batch_size,
        );
        let events = with_retry(&self.config.retry, "read_events_after", |_| {
            self.source.read_events_after(&query)
        })
        .await?;

        if events.is_empty() {
            if self.state() == EngineState::CatchingUp {
                self.set_state(EngineState::SteadyState);
            }
            return Ok(BatchOutcome::CaughtUp);
        }

        let budget = Instant::now();
        let mut update = CheckpointUpdate::new(self.projection.name());
        let mut staged: Vec<Statement> = Vec::new();
        let mut applied = 0;
        let mut skipped = 0;
        let mut failure = None;

        for event in &events {
            if applied > 0 && budget.elapsed() >= self.config.batch_timeout {
                debug!(applied, "batch time budget spent");
                break;
            }

            let instance_id = event.instance_id();
            let position = update
                .advances()
                .get(&instance_id)
                .map_or(checkpoints.position(instance_id), |advance| advance.to);
            if event.sequence() <= position {
                debug!(%instance_id, sequence = event.sequence(), "skipping duplicate delivery");
                skipped += 1;
                continue;
            }

            match self.reduce(event).await {
                Ok(statements) => {
                    update.record(instance_id, checkpoints.position(instance_id), event.sequence())?;
                    staged.extend(statements);
                    applied += 1;
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if !update.is_empty() {
            let table = self.projection.table();
            let committed = with_retry(&self.config.retry, "apply_statements", |_| {
                self.store.apply_statements(table, &staged, &update)
            })
            .await;

            match committed {
                Ok(()) => {
                    if let Some(current) = self.checkpoints.as_mut() {
                        current.apply(&update)?;
                    }
                }
                Err(StoreError::CheckpointConflict { projection, source }) => {
                    warn!(projection = %projection, error = %source, "checkpoint moved by another writer, reloading");
                    let reloaded = self.store.get_checkpoints(self.projection.name()).await?;
                    self.checkpoints = Some(reloaded);
                    return Ok(BatchOutcome::Conflict);
                }
                Err(err) => {
                    let err = EngineError::from(err);
                    if !err.is_retryable() {
                        self.pause(&err);
                    }
                    return Err(err);
                }
            }
        }

        if let Some(err) = failure {
            self.pause(&err);
            return Err(err);
        }

        debug!(
            events = applied,
            statements = staged.len(),
            skipped,
            "batch committed"
        );
        if events.len() < self.config.batch_size && self.state() == EngineState::CatchingUp {
            self.set_state(EngineState::SteadyState);
        }
        Ok(BatchOutcome::Committed {
            events: applied,
            statements: staged.len(),
            skipped,
        })
    }

    /// Dispatch one event and check what its reducer produced.
    async fn reduce(&self, event: &Event) -> Result<Vec<Statement>, EngineError> {
        let instance_id = event.instance_id();
        let sequence = event.sequence();

        let reducer = self
            .projection
            .reducers()
            .lookup(event.aggregate_type(), event.event_type())
            .map_err(|source| EngineError::Dispatch {
                instance_id,
                sequence,
                source,
            })?;

        let ctx = ReduceContext::new(&self.source);
        let statements = with_retry(&self.config.retry, "reduce", |_| reducer.reduce(event, &ctx))
            .await
            .map_err(|source| EngineError::Reduce {
                instance_id,
                sequence,
                event_type: event.event_type().to_string(),
                source,
            })?;

        for statement in &statements {
            statement
                .validate(self.projection.table())
                .map_err(|source| EngineError::Statement {
                    instance_id,
                    sequence,
                    event_type: event.event_type().to_string(),
                    source,
                })?;
        }
        Ok(statements)
    }

    /// Consume until `shutdown` flips to true (or its sender is dropped).
    ///
    /// Shutdown is observed between batches and while waiting, so a batch
    /// that started committing always finishes.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        if self.checkpoints.is_none() {
            self.start().await?;
        }

        while !stop_requested(&shutdown) {
            let wait = match self.run_batch().await {
                Ok(BatchOutcome::CaughtUp) => true,
                Ok(_) => false,
                Err(err) if err.is_retryable() => {
                    warn!(error = %err, "batch failed, retrying after poll interval");
                    true
                }
                Err(err) => return Err(err),
            };
            if wait {
                tokio::select! {
                    _ = self.source.wait_for_events(self.config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        self.set_state(EngineState::Idle);
        Ok(())
    }
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

impl<S, T> std::fmt::Debug for ProjectionEngine<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionEngine")
            .field("projection", &self.projection.name())
            .field("state", &*self.state.borrow())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tenantview_core::{OrgId, UserId};
    use tenantview_events::{EventPayload, InstanceEvent, MemberAdded, UserAdded, UserEvent};

    use crate::event_source::InMemoryEventSource;
    use crate::projections::instance_members;
    use crate::read_model::InMemoryProjectionStore;

    type Engine = ProjectionEngine<Arc<InMemoryEventSource>, Arc<InMemoryProjectionStore>>;

    fn engine(config: EngineConfig) -> (Engine, Arc<InMemoryEventSource>, Arc<InMemoryProjectionStore>) {
        let source = Arc::new(InMemoryEventSource::new());
        let store = Arc::new(InMemoryProjectionStore::new());
        let engine = ProjectionEngine::new(
            instance_members::projection().unwrap(),
            source.clone(),
            store.clone(),
            config,
        );
        (engine, source, store)
    }

    fn add_member(source: &InMemoryEventSource, instance: InstanceId) -> UserId {
        let user = UserId::new();
        source.push(Event::new(
            instance,
            user.into(),
            OrgId::new().into(),
            EventPayload::User(UserEvent::Added(UserAdded {
                username: "grace".to_string(),
            })),
        ));
        source.push(Event::new(
            instance,
            instance.into(),
            instance.into(),
            EventPayload::Instance(InstanceEvent::MemberAdded(MemberAdded {
                user_id: user,
                roles: vec!["IAM_OWNER".to_string()],
            })),
        ));
        user
    }

    #[tokio::test]
    async fn batch_before_start_is_rejected() {
        let (mut engine, _, _) = engine(EngineConfig::default());
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(matches!(engine.run_batch().await, Err(EngineError::NotStarted(_))));
    }

    #[tokio::test]
    async fn catches_up_then_reports_steady_state() {
        let (mut engine, source, store) = engine(EngineConfig::default());
        let instance = InstanceId::new();
        add_member(&source, instance);

        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::CatchingUp);

        let outcome = engine.run_batch().await.unwrap();
        assert_eq!(
            outcome,
            BatchOutcome::Committed {
                events: 1,
                statements: 1,
                skipped: 0
            }
        );
        assert_eq!(engine.state(), EngineState::SteadyState);
        assert_eq!(engine.run_batch().await.unwrap(), BatchOutcome::CaughtUp);
        assert_eq!(store.row_count(instance_members::TABLE), 1);
        assert_eq!(engine.checkpoints().unwrap().position(instance), 2);
    }

    #[tokio::test]
    async fn batch_size_bounds_each_commit() {
        let (mut engine, source, store) = engine(EngineConfig::default().with_batch_size(2));
        let instance = InstanceId::new();
        for _ in 0..3 {
            add_member(&source, instance);
        }

        engine.start().await.unwrap();
        let mut batches = 0;
        while engine.run_batch().await.unwrap() != BatchOutcome::CaughtUp {
            batches += 1;
        }
        assert_eq!(batches, 2);
        assert_eq!(store.commit_count(), 2);
        assert_eq!(store.row_count(instance_members::TABLE), 3);
    }

    #[tokio::test]
    async fn spent_time_budget_commits_early() {
        let config = EngineConfig::default().with_batch_timeout(Duration::ZERO);
        let (mut engine, source, _) = engine(config);
        let instance = InstanceId::new();
        add_member(&source, instance);
        add_member(&source, instance);

        engine.start().await.unwrap();
        let outcome = engine.run_batch().await.unwrap();
        assert!(matches!(outcome, BatchOutcome::Committed { events: 1, .. }));
    }

    #[test]
    fn only_infrastructure_errors_are_retryable() {
        let transient = EngineError::from(StoreError::transient("commit", "connection reset"));
        assert!(transient.is_retryable());

        let paused = EngineError::Paused {
            projection: "p".to_string(),
        };
        assert!(!paused.is_retryable());

        let reduce = EngineError::Reduce {
            instance_id: InstanceId::new(),
            sequence: 1,
            event_type: "instance.member.added".to_string(),
            source: ReduceError::UserNotFound {
                instance_id: InstanceId::new(),
                user_id: UserId::new(),
            },
        };
        assert!(!reduce.is_retryable());
    }

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&EngineState::SteadyState).unwrap(),
            "\"steady_state\""
        );
    }
}
