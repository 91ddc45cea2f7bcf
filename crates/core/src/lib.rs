//! `tenantview-core`: identifiers and aggregate kinds shared by every layer.
//!
//! This crate contains **pure** primitives (no IO, no async).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::AggregateType;
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, InstanceId, OrgId, UserId};
