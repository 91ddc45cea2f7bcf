//! Checkpoint bookkeeping (projection progress).
//!
//! A checkpoint is the highest sequence a projection has applied for one
//! instance. Checkpoints only move forward, and they move in the same
//! transaction as the statements they cover. Stores persist them; this module
//! only tracks positions and validates advances without making storage
//! assumptions.

use std::collections::BTreeMap;

use thiserror::Error;

use tenantview_core::InstanceId;

use crate::envelope::Event;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    #[error("checkpoint for instance {instance_id} would move from {last} to {found}")]
    NonMonotonic {
        instance_id: InstanceId,
        last: u64,
        found: u64,
    },

    /// Someone else advanced the checkpoint since it was read.
    #[error("checkpoint for instance {instance_id} is at {stored}, expected {expected}")]
    Conflict {
        instance_id: InstanceId,
        expected: u64,
        stored: u64,
    },
}

/// Per-instance positions of one projection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoints {
    positions: BTreeMap<InstanceId, u64>,
}

impl Checkpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_positions(positions: impl IntoIterator<Item = (InstanceId, u64)>) -> Self {
        Self {
            positions: positions.into_iter().collect(),
        }
    }

    /// Last applied sequence, 0 for an instance never seen.
    pub fn position(&self, instance_id: InstanceId) -> u64 {
        self.positions.get(&instance_id).copied().unwrap_or(0)
    }

    /// True when the event is at or behind the instance's checkpoint.
    pub fn is_applied(&self, event: &Event) -> bool {
        event.sequence() <= self.position(event.instance_id())
    }

    pub fn iter(&self) -> impl Iterator<Item = (InstanceId, u64)> + '_ {
        self.positions.iter().map(|(i, s)| (*i, *s))
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Apply a committed update, enforcing the from-position of each advance.
    pub fn apply(&mut self, update: &CheckpointUpdate) -> Result<(), CheckpointError> {
        for (instance_id, advance) in update.advances() {
            let stored = self.position(*instance_id);
            if stored != advance.from {
                return Err(CheckpointError::Conflict {
                    instance_id: *instance_id,
                    expected: advance.from,
                    stored,
                });
            }
        }
        for (instance_id, advance) in update.advances() {
            self.positions.insert(*instance_id, advance.to);
        }
        Ok(())
    }
}

/// Move of one instance's checkpoint within a batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CheckpointAdvance {
    pub from: u64,
    pub to: u64,
}

/// Checkpoint moves committed together with a batch of statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointUpdate {
    projection: String,
    advances: BTreeMap<InstanceId, CheckpointAdvance>,
}

impl CheckpointUpdate {
    pub fn new(projection: impl Into<String>) -> Self {
        Self {
            projection: projection.into(),
            advances: BTreeMap::new(),
        }
    }

    pub fn projection(&self) -> &str {
        &self.projection
    }

    /// Record that `sequence` was applied for `instance_id`.
    ///
    /// `from` is the position read before the batch; it only matters for the
    /// first event of an instance in this update.
    pub fn record(
        &mut self,
        instance_id: InstanceId,
        from: u64,
        sequence: u64,
    ) -> Result<(), CheckpointError> {
        let advance = self
            .advances
            .entry(instance_id)
            .or_insert(CheckpointAdvance { from, to: from });
        if sequence <= advance.to {
            return Err(CheckpointError::NonMonotonic {
                instance_id,
                last: advance.to,
                found: sequence,
            });
        }
        advance.to = sequence;
        Ok(())
    }

    pub fn advances(&self) -> &BTreeMap<InstanceId, CheckpointAdvance> {
        &self.advances
    }

    pub fn is_empty(&self) -> bool {
        self.advances.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{EventPayload, InstanceEvent, InstanceRemoved};
    use proptest::prelude::*;

    fn event(instance_id: InstanceId, sequence: u64) -> Event {
        Event::new(
            instance_id,
            instance_id.into(),
            instance_id.into(),
            EventPayload::Instance(InstanceEvent::InstanceRemoved(InstanceRemoved {})),
        )
        .with_sequence(sequence)
    }

    #[test]
    fn unseen_instance_starts_at_zero() {
        let checkpoints = Checkpoints::new();
        let instance = InstanceId::new();
        assert_eq!(checkpoints.position(instance), 0);
        assert!(!checkpoints.is_applied(&event(instance, 1)));
    }

    #[test]
    fn positions_are_tracked_per_instance() {
        let a = InstanceId::new();
        let b = InstanceId::new();
        let checkpoints = Checkpoints::from_positions([(a, 5), (b, 2)]);

        assert!(checkpoints.is_applied(&event(a, 5)));
        assert!(!checkpoints.is_applied(&event(a, 6)));
        assert!(checkpoints.is_applied(&event(b, 1)));
        assert!(!checkpoints.is_applied(&event(b, 3)));
    }

    #[test]
    fn record_rejects_regression() {
        let instance = InstanceId::new();
        let mut update = CheckpointUpdate::new("p");
        update.record(instance, 3, 4).unwrap();
        update.record(instance, 3, 7).unwrap();

        let err = update.record(instance, 3, 7).unwrap_err();
        assert!(matches!(err, CheckpointError::NonMonotonic { last: 7, found: 7, .. }));
        assert_eq!(
            update.advances()[&instance],
            CheckpointAdvance { from: 3, to: 7 }
        );
    }

    #[test]
    fn apply_detects_a_concurrent_writer() {
        let instance = InstanceId::new();
        let mut checkpoints = Checkpoints::from_positions([(instance, 10)]);

        let mut stale = CheckpointUpdate::new("p");
        stale.record(instance, 8, 9).unwrap();
        assert_eq!(
            checkpoints.apply(&stale),
            Err(CheckpointError::Conflict {
                instance_id: instance,
                expected: 8,
                stored: 10,
            })
        );
        assert_eq!(checkpoints.position(instance), 10);

        let mut fresh = CheckpointUpdate::new("p");
        fresh.record(instance, 10, 12).unwrap();
        checkpoints.apply(&fresh).unwrap();
        assert_eq!(checkpoints.position(instance), 12);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn applied_updates_never_move_backwards(steps in proptest::collection::vec(1u64..20, 1..30)) {
            let instance = InstanceId::new();
            let mut checkpoints = Checkpoints::new();
            let mut last = 0;

            for step in steps {
                let from = checkpoints.position(instance);
                let mut update = CheckpointUpdate::new("p");
                update.record(instance, from, from + step).unwrap();
                checkpoints.apply(&update).unwrap();

                let now = checkpoints.position(instance);
                prop_assert!(now > last);
                last = now;
            }
        }
    }
}
