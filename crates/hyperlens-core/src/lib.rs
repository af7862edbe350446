//! hyperlens-core: Entity model, schema registry, configuration, and error handling.
//!
//! This crate provides the foundational types used across all Hyperlens components:
//! - Entities, payloads, relations, and query descriptors for the knowledge graph
//! - The schema registry that validates payloads against declared entity types
//! - The built-in entity catalog (projects, dapps, investors, ...)
//! - Cache entry and pending mutation states observed by the UI layer
//! - Event types for cache and mutation notifications
//! - Configuration management
//! - Common error types

pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod schema;
pub mod types;

pub use error::{FieldProblem, HyperlensError, SchemaError};
pub use schema::{EntityType, FieldDef, FieldKind, SchemaRegistry};
pub use types::{
    CacheEntry, CacheFailure, CacheStatus, Entity, EntityId, FailureKind, FieldValue, Filter,
    Fingerprint, MutationKind, MutationStatus, Payload, PendingMutation, Predicate, PrimitiveKind,
    QueryDescriptor, Relation, ScalarValue, SpaceId, SpaceSummary, VisibilityMode,
};
