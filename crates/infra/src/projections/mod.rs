//! Projection definitions (read model builders).
//!
//! A definition is data: a name, a table descriptor and a reducer registry.
//! Running one is the engine's job. All definitions here are:
//! - **Rebuildable**: the table can be reset and replayed from sequence 0
//! - **Tenant-isolated**: every statement is scoped by `instance_id`
//! - **Idempotent**: keyed upserts and condition-matched updates/deletes

pub mod instance_members;
pub mod member;
pub mod org_members;

use thiserror::Error;

use tenantview_events::{Projection, RegistryError, SchemaError};

pub use member::{AddMember, MemberTable};

/// A projection definition is internally inconsistent (a programming error).
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Every membership projection, each to be run by its own engine.
pub fn all() -> Result<Vec<Projection>, DefinitionError> {
    Ok(vec![instance_members::projection()?, org_members::projection()?])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projections_write_disjoint_tables() {
        let projections = all().unwrap();
        assert_eq!(projections.len(), 2);
        assert_ne!(projections[0].name(), projections[1].name());
        assert_ne!(projections[0].table().name(), projections[1].table().name());
    }
}
