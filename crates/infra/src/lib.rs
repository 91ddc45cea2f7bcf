//! Infrastructure layer: event sources, projection stores, the projection
//! engine and the concrete projections it runs.

pub mod engine;
pub mod event_source;
pub mod projections;
pub mod read_model;


pub use engine::{
    BatchOutcome, EngineConfig, EngineError, EngineState, ProjectionEngine, ProjectionHandle,
    RetryPolicy, spawn,
};
pub use event_source::{EventQuery, EventSource, InMemoryEventSource, PostgresEventSource, SourceError};
pub use read_model::{
    CheckpointStore, InMemoryProjectionStore, PostgresProjectionStore, ProjectionStore, StoreError,
};
