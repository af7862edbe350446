//! BLAKE3 fingerprints for query descriptors.
//!
//! Serializes a canonical view of the descriptor to JSON and hashes the
//! bytes. Filter keys and included relations are kept in ordered
//! collections, so descriptors that differ only in insertion order produce
//! the same fingerprint.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use hyperlens_core::{
    Filter, Fingerprint, Predicate, QueryDescriptor, ScalarValue, SpaceId, VisibilityMode,
};

/// Hashable representation of a descriptor. Every field takes part in the key.
#[derive(Serialize)]
struct CanonicalDescriptor<'a> {
    entity_type: &'a str,
    mode: VisibilityMode,
    space_id: Option<&'a SpaceId>,
    filter: BTreeMap<&'a str, CanonicalPredicate<'a>>,
    limit: u32,
    include: &'a BTreeSet<String>,
}

#[derive(Serialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
enum CanonicalPredicate<'a> {
    Equals(CanonicalScalar<'a>),
    Contains(&'a str),
}

/// Numbers are written as text: JSON has no spelling for NaN or infinity.
#[derive(Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
enum CanonicalScalar<'a> {
    String(&'a str),
    Number(String),
    Boolean(bool),
    Date(&'a DateTime<Utc>),
}

impl<'a> From<&'a ScalarValue> for CanonicalScalar<'a> {
    fn from(value: &'a ScalarValue) -> Self {
        match value {
            ScalarValue::String(s) => Self::String(s),
            // -0.0 == 0.0, so both must hash alike.
            ScalarValue::Number(n) if *n == 0.0 => Self::Number(format!("{:?}", 0.0_f64)),
            ScalarValue::Number(n) => Self::Number(format!("{n:?}")),
            ScalarValue::Boolean(b) => Self::Boolean(*b),
            ScalarValue::Date(at) => Self::Date(at),
        }
    }
}

fn canonical_filter(filter: &Filter) -> BTreeMap<&str, CanonicalPredicate<'_>> {
    filter
        .iter()
        .map(|(field, predicate)| {
            let predicate = match predicate {
                Predicate::Equals(value) => CanonicalPredicate::Equals(value.into()),
                Predicate::Contains(needle) => CanonicalPredicate::Contains(needle),
            };
            (field.as_str(), predicate)
        })
        .collect()
}

/// Compute the fingerprint of a query descriptor.
///
/// Pure and deterministic: the hex-encoded BLAKE3 hash of the canonical JSON.
pub fn build(descriptor: &QueryDescriptor) -> Fingerprint {
    hash(descriptor, descriptor.space_id.as_ref())
}

/// Fingerprint of a descriptor whose space was resolved to `resolved`.
///
/// A private query without an explicit space is keyed by the session space it
/// resolved to, so entries never carry over from one private space to another.
/// Descriptors with an explicit space hash exactly as in [`build`].
pub fn build_resolved(descriptor: &QueryDescriptor, resolved: &SpaceId) -> Fingerprint {
    hash(descriptor, Some(descriptor.space_id.as_ref().unwrap_or(resolved)))
}

fn hash(descriptor: &QueryDescriptor, space_id: Option<&SpaceId>) -> Fingerprint {
    let canonical = CanonicalDescriptor {
        entity_type: &descriptor.entity_type,
        mode: descriptor.mode,
        space_id,
        filter: canonical_filter(&descriptor.filter),
        limit: descriptor.limit,
        include: &descriptor.include,
    };

    let json = serde_json::to_vec(&canonical).expect("Descriptor serialization should not fail");
    Fingerprint(blake3::hash(&json).to_hex().to_string())
}
