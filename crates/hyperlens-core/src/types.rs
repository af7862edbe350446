//! Core domain types for the Hyperlens entity cache.
//!
//! These types describe entities of the external knowledge graph, the
//! payloads used to create them, the descriptors used to query them, and the
//! cache/mutation states the rendering layer observes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Page size used when a query does not specify one.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

const LOCAL_ID_PREFIX: &str = "local-";

// ── Identifiers ───────────────────────────────────────────────────

/// Globally unique identifier of an entity.
///
/// Server-assigned ids are opaque strings. Ids minted locally for optimistic
/// entities carry a `local-` prefix until the server confirms them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a placeholder id for an entity the server has not seen yet.
    pub fn local() -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a space (an isolated visibility/ownership scope).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SpaceId(pub String);

impl SpaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpaceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Whether a query or mutation targets a public or a private space.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum VisibilityMode {
    Public,
    Private,
}

impl fmt::Display for VisibilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => f.write_str("public"),
            Self::Private => f.write_str("private"),
        }
    }
}

/// A space as listed for the current session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpaceSummary {
    pub id: SpaceId,
    pub name: String,
    pub mode: VisibilityMode,
}

// ── Scalar Values ─────────────────────────────────────────────────

/// Primitive kind of a scalar field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveKind {
    String,
    Number,
    Boolean,
    Date,
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Date => "date",
        };
        f.write_str(name)
    }
}

/// A typed scalar value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ScalarValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
}

impl ScalarValue {
    pub fn kind(&self) -> PrimitiveKind {
        match self {
            Self::String(_) => PrimitiveKind::String,
            Self::Number(_) => PrimitiveKind::Number,
            Self::Boolean(_) => PrimitiveKind::Boolean,
            Self::Date(_) => PrimitiveKind::Date,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for ScalarValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<f64> for ScalarValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for ScalarValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<DateTime<Utc>> for ScalarValue {
    fn from(d: DateTime<Utc>) -> Self {
        Self::Date(d)
    }
}

// ── Relations ─────────────────────────────────────────────────────

/// State of a relation field on an entity.
///
/// `NotLoaded` means the relation was not included in the query that produced
/// the entity. `Loaded(vec![])` means it was included and is empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", content = "ids", rename_all = "snake_case")]
pub enum Relation {
    #[default]
    NotLoaded,
    Loaded(Vec<EntityId>),
}

impl Relation {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    /// Related ids, or `None` when the relation was not loaded.
    pub fn ids(&self) -> Option<&[EntityId]> {
        match self {
            Self::Loaded(ids) => Some(ids),
            Self::NotLoaded => None,
        }
    }

    /// Rewrite every reference to `from` as `to`. Returns whether anything changed.
    pub fn replace_id(&mut self, from: &EntityId, to: &EntityId) -> bool {
        let Self::Loaded(ids) = self else {
            return false;
        };
        let mut changed = false;
        for id in ids.iter_mut().filter(|id| *id == from) {
            *id = to.clone();
            changed = true;
        }
        changed
    }

    /// Drop every reference to `id`. Returns whether anything changed.
    pub fn remove_id(&mut self, id: &EntityId) -> bool {
        let Self::Loaded(ids) = self else {
            return false;
        };
        let before = ids.len();
        ids.retain(|existing| existing != id);
        ids.len() != before
    }
}

// ── Entities ──────────────────────────────────────────────────────

/// An instance of an entity type in the knowledge graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub entity_type: String,
    pub space_id: SpaceId,
    #[serde(default)]
    pub scalars: BTreeMap<String, ScalarValue>,
    #[serde(default)]
    pub relations: BTreeMap<String, Relation>,
}

impl Entity {
    /// Build an entity from a creation payload.
    ///
    /// Relation values in the payload become loaded relations.
    pub fn from_payload(
        id: EntityId,
        entity_type: &str,
        space_id: SpaceId,
        payload: &Payload,
    ) -> Self {
        let mut scalars = BTreeMap::new();
        let mut relations = BTreeMap::new();
        for (name, value) in payload.iter() {
            match value {
                FieldValue::Scalar(v) => {
                    scalars.insert(name.clone(), v.clone());
                }
                FieldValue::Relation(ids) => {
                    relations.insert(name.clone(), Relation::Loaded(ids.clone()));
                }
            }
        }
        Self {
            id,
            entity_type: entity_type.to_string(),
            space_id,
            scalars,
            relations,
        }
    }

    pub fn scalar(&self, field: &str) -> Option<&ScalarValue> {
        self.scalars.get(field)
    }

    /// Relation state for a field. Absent relations read as not loaded.
    pub fn relation(&self, field: &str) -> &Relation {
        static NOT_LOADED: Relation = Relation::NotLoaded;
        self.relations.get(field).unwrap_or(&NOT_LOADED)
    }

    /// Current field values as a creation payload.
    ///
    /// Relations that were never loaded are left out: their value is unknown.
    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::new();
        for (name, value) in &self.scalars {
            payload.insert(name.clone(), FieldValue::Scalar(value.clone()));
        }
        for (name, relation) in &self.relations {
            if let Relation::Loaded(ids) = relation {
                payload.insert(name.clone(), FieldValue::Relation(ids.clone()));
            }
        }
        payload
    }
}

// ── Payloads ──────────────────────────────────────────────────────

/// A single field value in a creation payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Scalar(ScalarValue),
    Relation(Vec<EntityId>),
}

/// Field values for creating an entity, keyed by field name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, FieldValue>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style scalar insert.
    pub fn with(mut self, field: &str, value: impl Into<ScalarValue>) -> Self {
        self.0
            .insert(field.to_string(), FieldValue::Scalar(value.into()));
        self
    }

    /// Builder-style relation insert.
    pub fn with_relation(mut self, field: &str, ids: Vec<EntityId>) -> Self {
        self.0.insert(field.to_string(), FieldValue::Relation(ids));
        self
    }

    pub fn insert(&mut self, field: String, value: FieldValue) {
        self.0.insert(field, value);
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ── Query Descriptors ─────────────────────────────────────────────

/// A predicate on a single scalar field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Predicate {
    Equals(ScalarValue),
    /// Case-sensitive substring match on a string field.
    Contains(String),
}

impl Predicate {
    pub fn matches(&self, value: Option<&ScalarValue>) -> bool {
        match (self, value) {
            (Self::Equals(expected), Some(actual)) => expected == actual,
            (Self::Contains(needle), Some(ScalarValue::String(haystack))) => {
                haystack.contains(needle.as_str())
            }
            _ => false,
        }
    }
}

/// A conjunction of field predicates. The empty filter matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Filter(BTreeMap<String, Predicate>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, predicate: Predicate) -> Self {
        self.0.insert(field.to_string(), predicate);
        self
    }

    pub fn contains(self, field: &str, needle: &str) -> Self {
        self.with(field, Predicate::Contains(needle.to_string()))
    }

    pub fn equals(self, field: &str, value: impl Into<ScalarValue>) -> Self {
        self.with(field, Predicate::Equals(value.into()))
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        self.0
            .iter()
            .all(|(field, predicate)| predicate.matches(entity.scalar(field)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Predicate)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The shape of a query: what to fetch, from where, and how much.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryDescriptor {
    pub entity_type: String,
    pub mode: VisibilityMode,
    /// Required for public queries; private queries default to the session's space.
    pub space_id: Option<SpaceId>,
    #[serde(default)]
    pub filter: Filter,
    pub limit: u32,
    /// Relation fields to resolve eagerly.
    #[serde(default)]
    pub include: BTreeSet<String>,
}

impl QueryDescriptor {
    /// Query a public space.
    pub fn public(entity_type: &str, space_id: impl Into<SpaceId>) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            mode: VisibilityMode::Public,
            space_id: Some(space_id.into()),
            filter: Filter::default(),
            limit: DEFAULT_PAGE_SIZE,
            include: BTreeSet::new(),
        }
    }

    /// Query the session's private space.
    pub fn private(entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            mode: VisibilityMode::Private,
            space_id: None,
            filter: Filter::default(),
            limit: DEFAULT_PAGE_SIZE,
            include: BTreeSet::new(),
        }
    }

    pub fn in_space(mut self, space_id: impl Into<SpaceId>) -> Self {
        self.space_id = Some(space_id.into());
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn include(mut self, relation: &str) -> Self {
        self.include.insert(relation.to_string());
        self
    }
}

// ── Cache State ───────────────────────────────────────────────────

/// Deterministic cache key derived from a [`QueryDescriptor`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Pending,
    Success,
    Error,
}

/// Category of a failed fetch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Remote,
    InvalidResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// The observable state of one cached query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub entity_type: String,
    pub status: CacheStatus,
    /// Server response order, followed by optimistic entities awaiting confirmation.
    pub data: Vec<Entity>,
    /// Present iff `status` is `Error`.
    pub error: Option<CacheFailure>,
    pub last_updated_at: Option<DateTime<Utc>>,
    /// Sequence number of the request whose response is reflected here (0 = none yet).
    pub revision: u64,
}

impl CacheEntry {
    pub fn pending(fingerprint: Fingerprint, entity_type: &str) -> Self {
        Self {
            fingerprint,
            entity_type: entity_type.to_string(),
            status: CacheStatus::Pending,
            data: Vec::new(),
            error: None,
            last_updated_at: None,
            revision: 0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == CacheStatus::Pending
    }

    pub fn find(&self, id: &EntityId) -> Option<&Entity> {
        self.data.iter().find(|e| &e.id == id)
    }
}

// ── Pending Mutations ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    /// Copy of an existing entity into another space.
    Publish { source: EntityId },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Optimistic,
    Confirmed,
    Failed,
}

/// A mutation issued by the dispatcher and not yet settled (or failed).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingMutation {
    pub local_id: EntityId,
    pub kind: MutationKind,
    pub entity_type: String,
    pub target_space_id: SpaceId,
    pub payload: Payload,
    pub status: MutationStatus,
    /// Server-assigned id once confirmed.
    pub server_id: Option<EntityId>,
    /// Failure message once failed.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}
