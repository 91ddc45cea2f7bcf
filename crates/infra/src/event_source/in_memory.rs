use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use tenantview_core::{InstanceId, OrgId, UserId};
use tenantview_events::{Event, EventPayload, LookupError, OwnerLookup, UserEvent};

use super::{EventQuery, EventSource, SourceError, delivery_order};

#[derive(Debug, Default)]
struct Log {
    events: Vec<Event>,
    heads: HashMap<InstanceId, u64>,
    owners: HashMap<(InstanceId, UserId), OrgId>,
    failing_reads: u32,
}

impl Log {
    /// Removed users keep their last owner: memberships added before the
    /// removal still resolve when replayed.
    fn index_owner(&mut self, event: &Event) {
        if let EventPayload::User(UserEvent::Added(_)) = event.payload() {
            let key = (event.instance_id(), UserId::from(event.aggregate_id()));
            self.owners.insert(key, OrgId::from(event.resource_owner()));
        }
    }
}

/// In-memory event log.
///
/// Intended for tests/dev. `push` assigns gap-free per-instance sequences the
/// way the real log does; `insert` stores an event verbatim, which is how
/// redeliveries and out-of-order histories are simulated.
#[derive(Debug, Default)]
pub struct InMemoryEventSource {
    log: RwLock<Log>,
    appended: Notify,
}

impl InMemoryEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Log> {
        self.log.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Log> {
        self.log.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append with the next sequence of the event's instance.
    pub fn push(&self, event: Event) -> Event {
        let stored = {
            let mut log = self.write();
            let head = log.heads.entry(event.instance_id()).or_insert(0);
            *head += 1;
            let stored = event.with_sequence(*head);
            log.index_owner(&stored);
            log.events.push(stored.clone());
            stored
        };
        self.appended.notify_waiters();
        stored
    }

    /// Store an event with the sequence it already carries.
    pub fn insert(&self, event: Event) {
        {
            let mut log = self.write();
            let head = log.heads.entry(event.instance_id()).or_insert(0);
            *head = (*head).max(event.sequence());
            log.index_owner(&event);
            log.events.push(event);
        }
        self.appended.notify_waiters();
    }

    /// Move a user to another org without an event (ownership race scenarios).
    pub fn set_owner(&self, instance_id: InstanceId, user_id: UserId, owner: OrgId) {
        self.write().owners.insert((instance_id, user_id), owner);
    }

    /// Make the next `n` reads fail as unavailable.
    pub fn fail_next_reads(&self, n: u32) {
        self.write().failing_reads = n;
    }

    pub fn len(&self) -> usize {
        self.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn head(&self, instance_id: InstanceId) -> u64 {
        self.read().heads.get(&instance_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl OwnerLookup for InMemoryEventSource {
    async fn current_owner(
        &self,
        instance_id: InstanceId,
        user_id: UserId,
    ) -> Result<Option<OrgId>, LookupError> {
        Ok(self.read().owners.get(&(instance_id, user_id)).copied())
    }
}

#[async_trait]
impl EventSource for InMemoryEventSource {
    async fn read_events_after(&self, query: &EventQuery) -> Result<Vec<Event>, SourceError> {
        {
            let mut log = self.write();
            if log.failing_reads > 0 {
                log.failing_reads -= 1;
                return Err(SourceError::unavailable(
                    "read_events_after",
                    "injected read failure",
                ));
            }
        }

        let mut events: Vec<Event> = self
            .read()
            .events
            .iter()
            .filter(|e| query.admits(e))
            .cloned()
            .collect();
        events.sort_by_key(delivery_order);
        events.truncate(query.limit);
        Ok(events)
    }

    async fn wait_for_events(&self, timeout: Duration) {
        // A push racing this call is picked up after `timeout` at the latest.
        let _ = tokio::time::timeout(timeout, self.appended.notified()).await;
    }
}
