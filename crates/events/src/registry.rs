//! Reducer registry: `(aggregate type, event type) -> reducer`.
//!
//! Built once per projection through [`ReducerRegistry::builder`] and
//! immutable afterwards, so lookups need no locking. Each projection owns its
//! own registry; there is no process-wide table.

use std::collections::HashMap;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use tenantview_core::AggregateType;

use crate::envelope::Event;
use crate::kind::EventKind;
use crate::reducer::{Reduce, ReduceContext, ReduceError, Reducer};
use crate::statement::Statement;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The projection receives this pair but nothing was wired for it.
    #[error("no reducer registered for {aggregate_type}/{event_type}")]
    NotFound {
        aggregate_type: AggregateType,
        event_type: String,
    },

    #[error("reducer for {aggregate_type}/{event_type} registered twice")]
    Duplicate {
        aggregate_type: AggregateType,
        event_type: &'static str,
    },
}

/// One `(aggregate type, event type)` pair a projection consumes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Subscription {
    pub aggregate_type: AggregateType,
    pub event_type: &'static str,
}

impl Subscription {
    pub fn matches(&self, event: &Event) -> bool {
        self.aggregate_type == event.aggregate_type() && self.event_type == event.event_type()
    }
}

/// Adapter for plain reducer functions over a kind's payload.
struct FnReducer<K, F> {
    reduce: F,
    _kind: PhantomData<fn() -> K>,
}

#[async_trait]
impl<K, F> Reducer for FnReducer<K, F>
where
    K: EventKind,
    F: Fn(&Event, &K::Payload) -> Result<Vec<Statement>, ReduceError> + Send + Sync + 'static,
{
    async fn reduce(
        &self,
        event: &Event,
        _ctx: &ReduceContext<'_>,
    ) -> Result<Vec<Statement>, ReduceError> {
        let payload = K::extract(event.payload())
            .ok_or_else(|| ReduceError::wrong_event_type(K::EVENT_TYPE, event))?;
        (self.reduce)(event, payload)
    }
}

/// Adapter for [`Reduce`] implementations that use the context.
struct ResolvedReducer<K, R> {
    reducer: R,
    _kind: PhantomData<fn() -> K>,
}

#[async_trait]
impl<K, R> Reducer for ResolvedReducer<K, R>
where
    K: EventKind,
    R: Reduce<K> + 'static,
{
    async fn reduce(
        &self,
        event: &Event,
        ctx: &ReduceContext<'_>,
    ) -> Result<Vec<Statement>, ReduceError> {
        let payload = K::extract(event.payload())
            .ok_or_else(|| ReduceError::wrong_event_type(K::EVENT_TYPE, event))?;
        self.reducer.reduce(event, payload, ctx).await
    }
}

type Reducers = HashMap<AggregateType, HashMap<&'static str, Box<dyn Reducer>>>;

#[derive(Default)]
pub struct ReducerRegistryBuilder {
    reducers: Reducers,
    duplicate: Option<RegistryError>,
}

impl ReducerRegistryBuilder {
    /// Register a pure function for kind `K`.
    pub fn on<K, F>(self, reduce: F) -> Self
    where
        K: EventKind,
        F: Fn(&Event, &K::Payload) -> Result<Vec<Statement>, ReduceError> + Send + Sync + 'static,
    {
        self.register::<K>(Box::new(FnReducer::<K, F> {
            reduce,
            _kind: PhantomData,
        }))
    }

    /// Register a reducer that consults the [`ReduceContext`].
    pub fn on_resolved<K, R>(self, reducer: R) -> Self
    where
        K: EventKind,
        R: Reduce<K> + 'static,
    {
        self.register::<K>(Box::new(ResolvedReducer::<K, R> {
            reducer,
            _kind: PhantomData,
        }))
    }

    fn register<K: EventKind>(mut self, reducer: Box<dyn Reducer>) -> Self {
        let previous = self
            .reducers
            .entry(K::AGGREGATE_TYPE)
            .or_default()
            .insert(K::EVENT_TYPE, reducer);
        if previous.is_some() && self.duplicate.is_none() {
            self.duplicate = Some(RegistryError::Duplicate {
                aggregate_type: K::AGGREGATE_TYPE,
                event_type: K::EVENT_TYPE,
            });
        }
        self
    }

    pub fn build(self) -> Result<ReducerRegistry, RegistryError> {
        match self.duplicate {
            Some(err) => Err(err),
            None => Ok(ReducerRegistry {
                reducers: self.reducers,
            }),
        }
    }
}

pub struct ReducerRegistry {
    reducers: Reducers,
}

impl ReducerRegistry {
    pub fn builder() -> ReducerRegistryBuilder {
        ReducerRegistryBuilder::default()
    }

    pub fn lookup(
        &self,
        aggregate_type: AggregateType,
        event_type: &str,
    ) -> Result<&dyn Reducer, RegistryError> {
        self.reducers
            .get(&aggregate_type)
            .and_then(|by_type| by_type.get(event_type))
            .map(|r| r.as_ref())
            .ok_or_else(|| RegistryError::NotFound {
                aggregate_type,
                event_type: event_type.to_string(),
            })
    }

    /// Every registered pair, in a stable order.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .reducers
            .iter()
            .flat_map(|(aggregate_type, by_type)| {
                by_type.keys().map(|event_type| Subscription {
                    aggregate_type: *aggregate_type,
                    event_type: *event_type,
                })
            })
            .collect();
        subs.sort();
        subs
    }

    pub fn len(&self) -> usize {
        self.reducers.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl core::fmt::Debug for ReducerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReducerRegistry")
            .field("subscriptions", &self.subscriptions())
            .finish()
    }
}
