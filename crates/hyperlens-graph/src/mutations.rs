//! Write operations for the knowledge graph.
//!
//! Every mutation is tracked as a [`PendingMutation`] that moves from
//! `optimistic` to `confirmed` (and is then dropped from the pending set) or
//! to `failed` (and is kept for inspection and [`retry`](MutationDispatcher::retry)).
//! Creates are shown in the query cache before the server answers and are
//! reconciled or rolled back when it does. Nothing is retried automatically.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use tokio::sync::{broadcast, oneshot, watch};

use hyperlens_core::events::{EventPayload, SyncEvent};
use hyperlens_core::{
    Entity, EntityId, MutationKind, MutationStatus, Payload, PendingMutation, SchemaError,
    SchemaRegistry, SpaceId, VisibilityMode,
};

use crate::client::{MutationTransport, TransportError};
use crate::queries::QueryCache;
use crate::space::{ConnectionContext, ResolveError, SpaceResolver};

/// Errors from dispatching a mutation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutationError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Publish target space id is empty")]
    MissingTarget,

    #[error("A mutation of {entity_type} {key} is already in flight")]
    ConcurrentMutation { entity_type: String, key: EntityId },

    #[error("Remote mutation failed: {0}")]
    Transport(#[from] TransportError),

    #[error("No failed mutation with id {0}")]
    UnknownMutation(EntityId),

    #[error("Mutation dispatcher has been shut down")]
    Closed,
}

/// Handle to a dispatched mutation.
///
/// Dropping the ticket does not cancel the mutation.
#[derive(Debug)]
pub struct MutationTicket {
    local_id: EntityId,
    outcome: oneshot::Receiver<Result<Entity, MutationError>>,
}

impl MutationTicket {
    /// Placeholder id of the optimistic entity (and key of the pending mutation).
    pub fn local_id(&self) -> &EntityId {
        &self.local_id
    }

    /// Wait for the server: the confirmed entity, or the failure.
    pub async fn outcome(self) -> Result<Entity, MutationError> {
        self.outcome.await.unwrap_or(Err(MutationError::Closed))
    }
}

/// In-flight exclusivity key: (entity type, local id or publish source id).
type MutationKey = (String, EntityId);

/// Dispatches creates and publishes. Clone is cheap (inner Arc).
#[derive(Clone)]
pub struct MutationDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: Arc<SchemaRegistry>,
    resolver: SpaceResolver,
    transport: Arc<dyn MutationTransport>,
    cache: QueryCache,
    events: broadcast::Sender<SyncEvent>,
    state: Mutex<DispatchState>,
}

#[derive(Default)]
struct DispatchState {
    mutations: HashMap<EntityId, Tracked>,
    in_flight: HashSet<MutationKey>,
    closed: bool,
}

struct Tracked {
    record: watch::Sender<PendingMutation>,
    key: MutationKey,
}

impl MutationDispatcher {
    pub(crate) fn new(
        registry: Arc<SchemaRegistry>,
        resolver: SpaceResolver,
        transport: Arc<dyn MutationTransport>,
        cache: QueryCache,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                registry,
                resolver,
                transport,
                cache,
                events,
                state: Mutex::new(DispatchState::default()),
            }),
        }
    }

    /// Create an entity in a private space.
    ///
    /// Validation and space resolution errors are returned immediately. On
    /// return the optimistic entity is already visible in every matching
    /// cache entry; the remote create completes in the background. An empty
    /// `space_id` means the session's own private space.
    pub fn create(
        &self,
        entity_type: &str,
        payload: Payload,
        space_id: &SpaceId,
    ) -> Result<MutationTicket, MutationError> {
        self.inner.registry.validate(entity_type, &payload)?;
        let target = Some(space_id).filter(|s| !s.is_empty());
        let context = self
            .inner
            .resolver
            .resolve(target, VisibilityMode::Private)?;

        let local_id = EntityId::local();
        let record = PendingMutation {
            local_id: local_id.clone(),
            kind: MutationKind::Create,
            entity_type: entity_type.to_string(),
            target_space_id: context.space_id.clone(),
            payload,
            status: MutationStatus::Optimistic,
            server_id: None,
            error: None,
            created_at: Utc::now(),
        };
        let key = (entity_type.to_string(), local_id);
        self.dispatch(record, key, context)
    }

    /// Copy an entity into a public space as a new entity.
    ///
    /// The source entity and its space are left untouched. On success, cached
    /// queries of the type in the target space are invalidated.
    pub fn publish(
        &self,
        entity: &Entity,
        target_space_id: &SpaceId,
    ) -> Result<MutationTicket, MutationError> {
        if target_space_id.is_empty() {
            return Err(MutationError::MissingTarget);
        }

        let payload = entity.to_payload();
        self.inner
            .registry
            .validate(&entity.entity_type, &payload)?;
        let context = self
            .inner
            .resolver
            .resolve_for_write(target_space_id, VisibilityMode::Public)?;

        let record = PendingMutation {
            local_id: EntityId::local(),
            kind: MutationKind::Publish {
                source: entity.id.clone(),
            },
            entity_type: entity.entity_type.clone(),
            target_space_id: context.space_id.clone(),
            payload,
            status: MutationStatus::Optimistic,
            server_id: None,
            error: None,
            created_at: Utc::now(),
        };
        let key = (entity.entity_type.clone(), entity.id.clone());
        self.dispatch(record, key, context)
    }

    /// Re-dispatch a failed mutation under the same local id.
    pub fn retry(&self, local_id: &EntityId) -> Result<MutationTicket, MutationError> {
        let mut record = {
            let state = self.inner.lock();
            let tracked = state
                .mutations
                .get(local_id)
                .ok_or_else(|| MutationError::UnknownMutation(local_id.clone()))?;
            if state.in_flight.contains(&tracked.key) {
                return Err(MutationError::ConcurrentMutation {
                    entity_type: tracked.key.0.clone(),
                    key: tracked.key.1.clone(),
                });
            }
            let record = tracked.record.borrow().clone();
            if record.status != MutationStatus::Failed {
                return Err(MutationError::UnknownMutation(local_id.clone()));
            }
            record
        };

        let (context, key) = match &record.kind {
            MutationKind::Create => (
                self.inner
                    .resolver
                    .resolve(Some(&record.target_space_id), VisibilityMode::Private)?,
                (record.entity_type.clone(), record.local_id.clone()),
            ),
            MutationKind::Publish { source } => (
                self.inner
                    .resolver
                    .resolve_for_write(&record.target_space_id, VisibilityMode::Public)?,
                (record.entity_type.clone(), source.clone()),
            ),
        };

        tracing::info!(local_id = %record.local_id, entity_type = %record.entity_type, "Retrying mutation");
        record.status = MutationStatus::Optimistic;
        record.error = None;
        self.dispatch(record, key, context)
    }

    /// Snapshot of one tracked mutation.
    pub fn mutation(&self, local_id: &EntityId) -> Option<PendingMutation> {
        let state = self.inner.lock();
        state
            .mutations
            .get(local_id)
            .map(|t| t.record.borrow().clone())
    }

    /// All tracked mutations (in flight or failed), oldest first.
    pub fn pending(&self) -> Vec<PendingMutation> {
        let state = self.inner.lock();
        let mut out: Vec<PendingMutation> = state
            .mutations
            .values()
            .map(|t| t.record.borrow().clone())
            .collect();
        out.sort_by_key(|m| m.created_at);
        out
    }

    /// Watch one mutation. The receiver keeps the final state after the
    /// mutation is confirmed and leaves the pending set.
    pub fn subscribe(&self, local_id: &EntityId) -> Option<watch::Receiver<PendingMutation>> {
        let state = self.inner.lock();
        state.mutations.get(local_id).map(|t| t.record.subscribe())
    }

    pub(crate) fn close(&self) {
        let mut state = self.inner.lock();
        state.closed = true;
        state.mutations.clear();
        state.in_flight.clear();
    }

    fn dispatch(
        &self,
        record: PendingMutation,
        key: MutationKey,
        context: ConnectionContext,
    ) -> Result<MutationTicket, MutationError> {
        {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            if state.closed {
                return Err(MutationError::Closed);
            }
            if !state.in_flight.insert(key.clone()) {
                tracing::warn!(entity_type = %key.0, key = %key.1, "Concurrent mutation rejected");
                return Err(MutationError::ConcurrentMutation {
                    entity_type: key.0,
                    key: key.1,
                });
            }
            match state.mutations.get_mut(&record.local_id) {
                Some(tracked) => {
                    tracked.record.send_replace(record.clone());
                    tracked.key = key;
                }
                None => {
                    let (tx, _) = watch::channel(record.clone());
                    state
                        .mutations
                        .insert(record.local_id.clone(), Tracked { record: tx, key });
                }
            }
        }

        if record.kind == MutationKind::Create {
            let optimistic = Entity::from_payload(
                record.local_id.clone(),
                &record.entity_type,
                record.target_space_id.clone(),
                &record.payload,
            );
            let entries = self.inner.cache.insert_optimistic(optimistic);
            tracing::debug!(local_id = %record.local_id, entries, "Optimistic entity inserted");
        }

        self.inner.emit(EventPayload::MutationStarted {
            local_id: record.local_id.clone(),
            entity_type: record.entity_type.clone(),
            space_id: record.target_space_id.clone(),
        });

        let (reply, outcome) = oneshot::channel();
        let inner: Weak<DispatcherInner> = Arc::downgrade(&self.inner);
        let transport = self.inner.transport.clone();
        let local_id = record.local_id.clone();

        tokio::spawn(async move {
            let result = transport
                .create(&record.entity_type, &record.payload, &context)
                .await;
            match inner.upgrade() {
                Some(inner) => inner.settle(&record.local_id, result, reply),
                None => tracing::debug!(local_id = %record.local_id, "Dispatcher dropped before mutation settled"),
            }
        });

        Ok(MutationTicket { local_id, outcome })
    }
}

impl DispatcherInner {
    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, payload: EventPayload) {
        // Sending fails only when nobody is subscribed.
        let _ = self.events.send(SyncEvent::new(payload));
    }

    /// Reconcile the cache and the pending set with the server's answer.
    fn settle(
        &self,
        local_id: &EntityId,
        result: Result<Entity, TransportError>,
        reply: oneshot::Sender<Result<Entity, MutationError>>,
    ) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.closed {
            let _ = reply.send(Err(MutationError::Closed));
            return;
        }
        let Some(tracked) = state.mutations.get(local_id) else {
            let _ = reply.send(Err(MutationError::Closed));
            return;
        };
        state.in_flight.remove(&tracked.key);
        let record = tracked.record.borrow().clone();

        let outcome = match result {
            Ok(entity) => {
                match &record.kind {
                    MutationKind::Create => self.cache.confirm_optimistic(local_id, &entity),
                    MutationKind::Publish { .. } => {
                        self.cache
                            .invalidate_space(&record.entity_type, &record.target_space_id);
                    }
                }
                tracked.record.send_modify(|m| {
                    m.status = MutationStatus::Confirmed;
                    m.server_id = Some(entity.id.clone());
                    m.error = None;
                });
                state.mutations.remove(local_id);

                tracing::info!(local_id = %local_id, server_id = %entity.id, entity_type = %record.entity_type, "Mutation confirmed");
                self.emit(EventPayload::MutationConfirmed {
                    local_id: local_id.clone(),
                    server_id: entity.id.clone(),
                });
                Ok(entity)
            }
            Err(e) => {
                if record.kind == MutationKind::Create {
                    self.cache.rollback_optimistic(local_id);
                }
                let message = e.to_string();
                tracked.record.send_modify(|m| {
                    m.status = MutationStatus::Failed;
                    m.error = Some(message.clone());
                });

                tracing::warn!(local_id = %local_id, entity_type = %record.entity_type, error = %message, "Mutation failed");
                self.emit(EventPayload::MutationFailed {
                    local_id: local_id.clone(),
                    message,
                });
                Err(MutationError::Transport(e))
            }
        };

        // The caller may have dropped the ticket.
        let _ = reply.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_reply_reads_as_closed() {
        let (reply, outcome) = oneshot::channel::<Result<Entity, MutationError>>();
        drop(reply);
        let ticket = MutationTicket {
            local_id: EntityId::local(),
            outcome,
        };
        assert_eq!(ticket.outcome().await.unwrap_err(), MutationError::Closed);
    }

    #[test]
    fn concurrent_mutation_names_the_key() {
        let err = MutationError::ConcurrentMutation {
            entity_type: "Project".into(),
            key: EntityId::new("p-1"),
        };
        assert_eq!(
            err.to_string(),
            "A mutation of Project p-1 is already in flight"
        );
    }
}
