//! Event model and the pure half of the projection pipeline.
//!
//! Events come in as [`Event`]s, a [`ReducerRegistry`] turns each one into
//! [`Statement`]s, and [`Checkpoints`] track how far a projection got. Nothing
//! here performs IO; the infra crate executes statements and moves events.

pub mod checkpoint;
pub mod envelope;
pub mod kind;
pub mod payload;
pub mod projection;
pub mod reducer;
pub mod registry;
pub mod statement;
pub mod table;

pub use checkpoint::{CheckpointAdvance, CheckpointError, CheckpointUpdate, Checkpoints};
pub use envelope::{Event, EventEnvelope};
pub use kind::EventKind;
pub use payload::{
    DecodeError, EventPayload, InstanceEvent, InstanceRemoved, MemberAdded, MemberChanged,
    MemberRemoved, OrgEvent, OrgRemoved, UserAdded, UserEvent, UserRemoved, event_types,
};
pub use projection::Projection;
pub use reducer::{LookupError, OwnerLookup, Reduce, ReduceContext, ReduceError, Reducer};
pub use registry::{RegistryError, ReducerRegistry, ReducerRegistryBuilder, Subscription};
pub use statement::{
    Assignment, Condition, Operation, Statement, StatementError, Value, sequence_to_bigint,
};
pub use table::{ColumnDef, ColumnType, Index, SchemaError, TableDescriptor, TableSchema};
