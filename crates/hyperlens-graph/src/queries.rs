//! Query cache: in-flight and settled query results keyed by fingerprint.
//!
//! Each fingerprint moves through `absent -> pending -> {success, error}`,
//! and back to `pending` on refetch, invalidation, or retry. At most one
//! fetch is started per fingerprint by `get`; responses are applied in send
//! order using a per-fingerprint sequence number. Fetches run on spawned
//! tokio tasks and results are published through `watch` channels, so no
//! caller ever blocks on the network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{TimeDelta, Utc};
use tokio::sync::{broadcast, watch};

use hyperlens_core::events::{EventPayload, SyncEvent};
use hyperlens_core::{
    CacheEntry, CacheFailure, CacheStatus, Entity, EntityId, FailureKind, Fingerprint,
    QueryDescriptor, Relation, SchemaError, SchemaRegistry, SpaceId,
};

use crate::client::{QueryTransport, TransportError};
use crate::fingerprint;
use crate::space::{ConnectionContext, ResolveError, SpaceResolver};

/// Errors surfaced synchronously by cache operations.
///
/// Fetch failures are not errors here: they land in the entry's `error` state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Query cache has been shut down")]
    Closed,
}

/// Process-wide query cache. Clone is cheap (inner Arc).
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    registry: Arc<SchemaRegistry>,
    resolver: SpaceResolver,
    transport: Arc<dyn QueryTransport>,
    stale_after: Option<TimeDelta>,
    events: broadcast::Sender<SyncEvent>,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<Fingerprint, Slot>,
    /// Optimistic entities awaiting confirmation, in creation order.
    optimistic: Vec<Entity>,
    closed: bool,
}

struct Slot {
    descriptor: QueryDescriptor,
    context: ConnectionContext,
    /// Sequence number of the most recently sent request.
    issued_seq: u64,
    /// Sequence number of the most recently applied response.
    applied_seq: u64,
    entry: watch::Sender<CacheEntry>,
}

impl Slot {
    /// Whether an entity created in some space belongs in this query's results.
    fn admits(&self, entity: &Entity) -> bool {
        self.descriptor.entity_type == entity.entity_type
            && self.context.space_id == entity.space_id
            && self.descriptor.filter.matches(entity)
    }
}

/// A fetch to spawn once the state lock is released.
struct FetchJob {
    fingerprint: Fingerprint,
    seq: u64,
    descriptor: QueryDescriptor,
    context: ConnectionContext,
}

impl QueryCache {
    pub(crate) fn new(
        registry: Arc<SchemaRegistry>,
        resolver: SpaceResolver,
        transport: Arc<dyn QueryTransport>,
        stale_after: Option<TimeDelta>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                registry,
                resolver,
                transport,
                stale_after,
                events,
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Current entry for the descriptor.
    ///
    /// Starts a fetch when the fingerprint is absent or its successful entry
    /// is stale; otherwise joins whatever is cached or in flight. Returns
    /// immediately, usually with a `pending` entry on first use.
    pub fn get(&self, descriptor: &QueryDescriptor) -> Result<CacheEntry, CacheError> {
        self.lookup(descriptor).map(|(entry, _)| entry)
    }

    /// Like [`get`](Self::get), returning a receiver that observes every
    /// subsequent change of the entry.
    pub fn subscribe(
        &self,
        descriptor: &QueryDescriptor,
    ) -> Result<watch::Receiver<CacheEntry>, CacheError> {
        self.lookup(descriptor).map(|(_, rx)| rx)
    }

    /// `get`, then wait until the entry settles.
    pub async fn fetch(&self, descriptor: &QueryDescriptor) -> Result<CacheEntry, CacheError> {
        let (_, rx) = self.lookup(descriptor)?;
        settled(rx).await
    }

    /// Current entry without starting anything.
    ///
    /// `None` also when the descriptor's space cannot be resolved, e.g. a
    /// private query with nobody signed in.
    pub fn peek(&self, descriptor: &QueryDescriptor) -> Option<CacheEntry> {
        let context = self
            .inner
            .resolver
            .resolve(descriptor.space_id.as_ref(), descriptor.mode)
            .ok()?;
        let fingerprint = fingerprint::build_resolved(descriptor, &context.space_id);
        let state = self.inner.lock();
        state
            .slots
            .get(&fingerprint)
            .map(|slot| slot.entry.borrow().clone())
    }

    /// Number of cached fingerprints.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Refresh ──────────────────────────────────────────────────

    /// Explicit refetch (or retry after an error). Always sends a new request;
    /// its response supersedes any earlier one still in flight.
    pub fn refetch(&self, descriptor: &QueryDescriptor) -> Result<CacheEntry, CacheError> {
        let context = self.inner.prepare(descriptor)?;
        let fingerprint = fingerprint::build_resolved(descriptor, &context.space_id);

        let (entry, job) = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(CacheError::Closed);
            }
            let job = self
                .inner
                .begin_fetch(&mut state, fingerprint.clone(), descriptor, context);
            let entry = state.slots[&fingerprint].entry.borrow().clone();
            (entry, job)
        };

        self.spawn_fetch(job);
        Ok(entry)
    }

    /// `refetch`, then wait until the entry settles.
    pub async fn refetch_settled(
        &self,
        descriptor: &QueryDescriptor,
    ) -> Result<CacheEntry, CacheError> {
        self.refetch(descriptor)?;
        let rx = self.subscribe(descriptor)?;
        settled(rx).await
    }

    /// Move every entry of `entity_type` back to pending and refetch it.
    /// Returns the number of entries invalidated.
    pub fn invalidate(&self, entity_type: &str) -> usize {
        self.invalidate_where(entity_type, None)
    }

    /// Like [`invalidate`](Self::invalidate), limited to entries resolved to `space_id`.
    pub fn invalidate_space(&self, entity_type: &str, space_id: &SpaceId) -> usize {
        self.invalidate_where(entity_type, Some(space_id))
    }

    fn invalidate_where(&self, entity_type: &str, space_id: Option<&SpaceId>) -> usize {
        let jobs: Vec<FetchJob> = {
            let mut state = self.inner.lock();
            if state.closed {
                return 0;
            }
            let targets: Vec<(Fingerprint, QueryDescriptor, ConnectionContext)> = state
                .slots
                .iter()
                .filter(|(_, slot)| {
                    slot.descriptor.entity_type == entity_type
                        && space_id.map_or(true, |s| &slot.context.space_id == s)
                })
                .map(|(fp, slot)| (fp.clone(), slot.descriptor.clone(), slot.context.clone()))
                .collect();

            targets
                .into_iter()
                .map(|(fp, descriptor, context)| {
                    self.inner.begin_fetch(&mut state, fp, &descriptor, context)
                })
                .collect()
        };

        let count = jobs.len();
        tracing::debug!(entity_type, space_id = ?space_id, entries = count, "Invalidated");
        self.inner.emit(EventPayload::Invalidated {
            entity_type: entity_type.to_string(),
            space_id: space_id.cloned(),
            entries: count,
        });

        for job in jobs {
            self.spawn_fetch(job);
        }
        count
    }

    /// Drop all entries. In-flight responses are ignored from now on and
    /// subscribers observe the channel closing.
    pub(crate) fn close(&self) {
        let mut state = self.inner.lock();
        state.closed = true;
        state.slots.clear();
        state.optimistic.clear();
    }

    // ── Optimistic entities (driven by the mutation dispatcher) ──

    /// Show a not-yet-confirmed entity in every entry that would contain it.
    pub(crate) fn insert_optimistic(&self, entity: Entity) -> usize {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        if state.closed {
            return 0;
        }

        let mut touched = 0;
        for slot in state.slots.values().filter(|slot| slot.admits(&entity)) {
            let shaped = shape(&self.inner.registry, &slot.descriptor, entity.clone());
            slot.entry.send_modify(|entry| entry.data.push(shaped));
            touched += 1;
        }
        state.optimistic.push(entity);
        touched
    }

    /// Swap the placeholder id for the server's everywhere it appears.
    pub(crate) fn confirm_optimistic(&self, local_id: &EntityId, confirmed: &Entity) {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        state.optimistic.retain(|e| &e.id != local_id);

        for slot in state.slots.values() {
            let shaped = shape(&self.inner.registry, &slot.descriptor, confirmed.clone());
            slot.entry.send_if_modified(|entry| {
                let mut changed = false;
                for entity in entry.data.iter_mut() {
                    if &entity.id == local_id {
                        *entity = shaped.clone();
                        changed = true;
                        continue;
                    }
                    for relation in entity.relations.values_mut() {
                        changed |= relation.replace_id(local_id, &confirmed.id);
                    }
                }
                if changed {
                    // A refetch may already have delivered the confirmed entity.
                    let mut seen = false;
                    entry.data.retain(|e| {
                        if e.id != confirmed.id {
                            return true;
                        }
                        let keep = !seen;
                        seen = true;
                        keep
                    });
                }
                changed
            });
        }
    }

    /// Remove a rejected entity (and references to it) from every entry.
    pub(crate) fn rollback_optimistic(&self, local_id: &EntityId) {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        state.optimistic.retain(|e| &e.id != local_id);

        for slot in state.slots.values() {
            slot.entry.send_if_modified(|entry| {
                let before = entry.data.len();
                entry.data.retain(|e| &e.id != local_id);
                let mut changed = entry.data.len() != before;
                for entity in entry.data.iter_mut() {
                    for relation in entity.relations.values_mut() {
                        changed |= relation.remove_id(local_id);
                    }
                }
                changed
            });
        }
    }

    // ── Internals ────────────────────────────────────────────────

    fn lookup(
        &self,
        descriptor: &QueryDescriptor,
    ) -> Result<(CacheEntry, watch::Receiver<CacheEntry>), CacheError> {
        let context = self.inner.prepare(descriptor)?;
        let fingerprint = fingerprint::build_resolved(descriptor, &context.space_id);

        let (entry, rx, job) = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(CacheError::Closed);
            }

            let reusable = state
                .slots
                .get(&fingerprint)
                .is_some_and(|slot| !self.inner.is_stale(&slot.entry.borrow()));
            let job = if reusable {
                None
            } else {
                Some(
                    self.inner
                        .begin_fetch(&mut state, fingerprint.clone(), descriptor, context),
                )
            };

            let slot = &state.slots[&fingerprint];
            let entry = slot.entry.borrow().clone();
            (entry, slot.entry.subscribe(), job)
        };

        if let Some(job) = job {
            self.spawn_fetch(job);
        }
        Ok((entry, rx))
    }

    fn spawn_fetch(&self, job: FetchJob) {
        let inner: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let transport = self.inner.transport.clone();

        tokio::spawn(async move {
            let result = transport.query(&job.descriptor, &job.context).await;
            match inner.upgrade() {
                Some(inner) => inner.apply(&job.fingerprint, job.seq, result),
                None => tracing::debug!(
                    fingerprint = %job.fingerprint,
                    seq = job.seq,
                    "Cache dropped before response arrived"
                ),
            }
        });
    }
}

impl CacheInner {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, payload: EventPayload) {
        // Sending fails only when nobody is subscribed.
        let _ = self.events.send(SyncEvent::new(payload));
    }

    /// Validate a descriptor against the schema and resolve its space.
    fn prepare(&self, descriptor: &QueryDescriptor) -> Result<ConnectionContext, CacheError> {
        self.registry
            .validate_filter(&descriptor.entity_type, &descriptor.filter)?;
        self.registry
            .validate_includes(&descriptor.entity_type, &descriptor.include)?;
        Ok(self
            .resolver
            .resolve(descriptor.space_id.as_ref(), descriptor.mode)?)
    }

    fn is_stale(&self, entry: &CacheEntry) -> bool {
        match (self.stale_after, entry.status, entry.last_updated_at) {
            (Some(max_age), CacheStatus::Success, Some(at)) => Utc::now() - at >= max_age,
            _ => false,
        }
    }

    /// Create or reuse the slot, move it to pending, and allocate the next sequence number.
    fn begin_fetch(
        &self,
        state: &mut CacheState,
        fingerprint: Fingerprint,
        descriptor: &QueryDescriptor,
        context: ConnectionContext,
    ) -> FetchJob {
        let slot = state.slots.entry(fingerprint.clone()).or_insert_with(|| {
            let (entry, _) = watch::channel(CacheEntry::pending(
                fingerprint.clone(),
                &descriptor.entity_type,
            ));
            Slot {
                descriptor: descriptor.clone(),
                context: context.clone(),
                issued_seq: 0,
                applied_seq: 0,
                entry,
            }
        });

        slot.context = context;
        slot.issued_seq += 1;
        slot.entry.send_modify(|entry| {
            entry.status = CacheStatus::Pending;
            entry.error = None;
        });

        tracing::debug!(fingerprint = %fingerprint, seq = slot.issued_seq, entity_type = %descriptor.entity_type, "Fetch started");
        self.emit(EventPayload::QueryStarted {
            fingerprint: fingerprint.clone(),
            entity_type: descriptor.entity_type.clone(),
            seq: slot.issued_seq,
        });

        FetchJob {
            fingerprint,
            seq: slot.issued_seq,
            descriptor: slot.descriptor.clone(),
            context: slot.context.clone(),
        }
    }

    /// Apply a fetch result, unless a newer response was applied already.
    fn apply(
        &self,
        fingerprint: &Fingerprint,
        seq: u64,
        result: Result<Vec<Entity>, TransportError>,
    ) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.closed {
            return;
        }
        let Some(slot) = state.slots.get_mut(fingerprint) else {
            return;
        };

        if seq < slot.applied_seq {
            tracing::debug!(fingerprint = %fingerprint, seq, latest = slot.applied_seq, "Discarding stale response");
            self.emit(EventPayload::ResponseDiscarded {
                fingerprint: fingerprint.clone(),
                seq,
                latest: slot.applied_seq,
            });
            return;
        }
        slot.applied_seq = seq;
        // A newer request is still in flight; this response is provisional.
        let superseded = seq < slot.issued_seq;

        let outcome = result
            .map_err(|e| CacheFailure {
                kind: e.kind(),
                message: e.to_string(),
            })
            .and_then(|entities| self.shape_response(&slot.descriptor, entities));

        let mut entry = slot.entry.borrow().clone();
        match outcome {
            Ok(mut data) => {
                for pending in state.optimistic.iter().filter(|e| slot.admits(e)) {
                    if !data.iter().any(|e| e.id == pending.id) {
                        data.push(shape(&self.registry, &slot.descriptor, pending.clone()));
                    }
                }
                entry.data = data;
                entry.error = None;
                entry.status = if superseded {
                    CacheStatus::Pending
                } else {
                    CacheStatus::Success
                };
            }
            Err(failure) if superseded => {
                tracing::warn!(
                    fingerprint = %fingerprint,
                    seq,
                    error = %failure.message,
                    "Fetch failed; a newer request is still in flight"
                );
                return;
            }
            Err(failure) => {
                tracing::warn!(fingerprint = %fingerprint, seq, error = %failure.message, "Fetch failed");
                entry.status = CacheStatus::Error;
                entry.error = Some(failure);
            }
        }
        entry.revision = seq;
        entry.last_updated_at = Some(Utc::now());

        let status = entry.status;
        let count = entry.data.len();
        slot.entry.send_replace(entry);

        tracing::debug!(fingerprint = %fingerprint, seq, ?status, count, "Response applied");
        self.emit(EventPayload::QuerySettled {
            fingerprint: fingerprint.clone(),
            seq,
            status,
            count,
        });
    }

    /// Check response entities against the query's type and normalise relations.
    fn shape_response(
        &self,
        descriptor: &QueryDescriptor,
        entities: Vec<Entity>,
    ) -> Result<Vec<Entity>, CacheFailure> {
        if let Some(foreign) = entities
            .iter()
            .find(|e| e.entity_type != descriptor.entity_type)
        {
            return Err(CacheFailure {
                kind: FailureKind::InvalidResponse,
                message: format!(
                    "entity {} is a {}, expected {}",
                    foreign.id, foreign.entity_type, descriptor.entity_type
                ),
            });
        }

        Ok(entities
            .into_iter()
            .take(descriptor.limit as usize)
            .map(|e| shape(&self.registry, descriptor, e))
            .collect())
    }
}

/// Make relation state explicit: included relations are loaded (possibly
/// empty), all other declared relations are not loaded.
fn shape(registry: &SchemaRegistry, descriptor: &QueryDescriptor, mut entity: Entity) -> Entity {
    let Ok(declared) = registry.resolve(&descriptor.entity_type) else {
        return entity;
    };
    for name in declared.relation_names() {
        let relation = entity.relations.entry(name.to_string()).or_default();
        if !descriptor.include.contains(name) {
            *relation = Relation::NotLoaded;
        } else if !relation.is_loaded() {
            *relation = Relation::Loaded(Vec::new());
        }
    }
    entity
}

async fn settled(mut rx: watch::Receiver<CacheEntry>) -> Result<CacheEntry, CacheError> {
    let entry = rx
        .wait_for(|entry| !entry.is_pending())
        .await
        .map_err(|_| CacheError::Closed)?;
    Ok((*entry).clone())
}
