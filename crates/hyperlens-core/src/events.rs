//! Event types for cache and mutation notifications.
//!
//! Every state change of the query cache and the mutation dispatcher is
//! broadcast as a `SyncEvent`, so observers (UI layers, loggers, the CLI's
//! watch mode) can follow the whole process from one stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{CacheStatus, EntityId, Fingerprint, SpaceId};

/// Unique identifier for an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// An event emitted by the cache or the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl SyncEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// The event payload, tagged by type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type")]
pub enum EventPayload {
    // ── Query events ──────────────────────────────────────────
    /// A fetch was sent for a fingerprint.
    QueryStarted {
        fingerprint: Fingerprint,
        entity_type: String,
        seq: u64,
    },
    /// A response (or failure) was applied to the cache.
    QuerySettled {
        fingerprint: Fingerprint,
        seq: u64,
        status: CacheStatus,
        count: usize,
    },
    /// A response arrived after a newer one had been applied.
    ResponseDiscarded {
        fingerprint: Fingerprint,
        seq: u64,
        latest: u64,
    },
    /// Entries were invalidated and refetched.
    Invalidated {
        entity_type: String,
        space_id: Option<SpaceId>,
        entries: usize,
    },

    // ── Mutation events ───────────────────────────────────────
    /// A mutation was dispatched; its entity is visible optimistically.
    MutationStarted {
        local_id: EntityId,
        entity_type: String,
        space_id: SpaceId,
    },
    /// The server accepted the mutation.
    MutationConfirmed {
        local_id: EntityId,
        server_id: EntityId,
    },
    /// The server rejected the mutation or could not be reached.
    MutationFailed { local_id: EntityId, message: String },
}
