//! Schema registry: declared entity types and payload validation.
//!
//! Fields are tagged variants (scalar or relation) rather than reflected
//! shapes, so every payload, filter, and include set can be checked against
//! the declared type before it reaches the cache or the network.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{FieldProblem, SchemaError};
use crate::types::{FieldValue, Filter, Payload, Predicate, PrimitiveKind, ScalarValue};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    Scalar {
        primitive: PrimitiveKind,
        optional: bool,
    },
    /// Cardinality is always many.
    Relation { target: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldDef {
    pub fn is_relation(&self) -> bool {
        matches!(self.kind, FieldKind::Relation { .. })
    }
}

/// A declared entity type. Fields keep their declaration order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityType {
    name: String,
    fields: Vec<FieldDef>,
}

impl EntityType {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
        }
    }

    /// Add a required scalar field.
    pub fn scalar(self, name: &str, primitive: PrimitiveKind) -> Self {
        self.field(name, FieldKind::Scalar {
            primitive,
            optional: false,
        })
    }

    /// Add an optional scalar field.
    pub fn optional(self, name: &str, primitive: PrimitiveKind) -> Self {
        self.field(name, FieldKind::Scalar {
            primitive,
            optional: true,
        })
    }

    /// Add a relation field pointing at `target`.
    pub fn relation(self, name: &str, target: &str) -> Self {
        self.field(name, FieldKind::Relation {
            target: target.to_string(),
        })
    }

    fn field(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(FieldDef {
            name: name.to_string(),
            kind,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relation_names(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.is_relation())
            .map(|f| f.name.as_str())
    }
}

/// Registry of entity types known to the application.
///
/// Built once at startup and then shared read-only.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    types: BTreeMap<String, EntityType>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity type. Names are unique, and so are field names within a type.
    pub fn register(&mut self, entity_type: EntityType) -> Result<(), SchemaError> {
        if self.types.contains_key(&entity_type.name) {
            return Err(SchemaError::DuplicateType(entity_type.name));
        }

        let duplicate_field = {
            let mut seen = BTreeSet::new();
            entity_type
                .fields
                .iter()
                .find(|f| !seen.insert(f.name.as_str()))
                .map(|f| f.name.clone())
        };
        if let Some(field) = duplicate_field {
            return Err(SchemaError::DuplicateField {
                entity_type: entity_type.name,
                field,
            });
        }

        tracing::debug!(
            entity_type = %entity_type.name,
            fields = entity_type.fields.len(),
            "Entity type registered"
        );
        self.types.insert(entity_type.name.clone(), entity_type);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<&EntityType, SchemaError> {
        self.types
            .get(name)
            .ok_or_else(|| SchemaError::UnknownType(name.to_string()))
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Check that every relation target names a registered type.
    pub fn verify_relations(&self) -> Result<(), SchemaError> {
        for entity_type in self.types.values() {
            for field in &entity_type.fields {
                if let FieldKind::Relation { target } = &field.kind {
                    self.resolve(target)?;
                }
            }
        }
        Ok(())
    }

    /// Validate a creation payload.
    ///
    /// Reports every problem at once: declared fields in declaration order,
    /// then unknown payload fields in name order.
    pub fn validate(&self, entity_type: &str, payload: &Payload) -> Result<(), SchemaError> {
        let declared = self.resolve(entity_type)?;
        let mut problems = Vec::new();

        for field in &declared.fields {
            let value = payload.get(&field.name);
            match (&field.kind, value) {
                (FieldKind::Scalar { optional, .. }, None) => {
                    if !optional {
                        problems.push(FieldProblem::Missing {
                            field: field.name.clone(),
                        });
                    }
                }
                (FieldKind::Scalar { primitive, .. }, Some(FieldValue::Scalar(v))) => {
                    if v.kind() != *primitive {
                        problems.push(FieldProblem::WrongKind {
                            field: field.name.clone(),
                            expected: *primitive,
                            found: v.kind(),
                        });
                    } else if !is_finite(v) {
                        problems.push(FieldProblem::NotFinite {
                            field: field.name.clone(),
                        });
                    }
                }
                (FieldKind::Scalar { .. }, Some(FieldValue::Relation(_))) => {
                    problems.push(FieldProblem::WrongShape {
                        field: field.name.clone(),
                        expected: "scalar",
                    });
                }
                (FieldKind::Relation { .. }, Some(FieldValue::Scalar(_))) => {
                    problems.push(FieldProblem::WrongShape {
                        field: field.name.clone(),
                        expected: "relation",
                    });
                }
                (FieldKind::Relation { .. }, _) => {}
            }
        }

        for (name, _) in payload.iter() {
            if declared.get(name).is_none() {
                problems.push(FieldProblem::Unknown {
                    field: name.clone(),
                });
            }
        }

        mismatch(declared, problems)
    }

    /// Validate a query filter: predicates apply to declared scalar fields,
    /// `Contains` only to string fields, and numbers compared for equality
    /// must be finite.
    pub fn validate_filter(&self, entity_type: &str, filter: &Filter) -> Result<(), SchemaError> {
        let declared = self.resolve(entity_type)?;
        let mut problems = Vec::new();

        for (name, predicate) in filter.iter() {
            match declared.get(name).map(|f| &f.kind) {
                None => problems.push(FieldProblem::Unknown {
                    field: name.clone(),
                }),
                Some(FieldKind::Relation { .. }) => problems.push(FieldProblem::WrongShape {
                    field: name.clone(),
                    expected: "scalar",
                }),
                Some(FieldKind::Scalar { primitive, .. }) => {
                    let found = match predicate {
                        Predicate::Equals(v) => v.kind(),
                        Predicate::Contains(_) => PrimitiveKind::String,
                    };
                    if found != *primitive {
                        problems.push(FieldProblem::WrongKind {
                            field: name.clone(),
                            expected: *primitive,
                            found,
                        });
                    } else if matches!(predicate, Predicate::Equals(v) if !is_finite(v)) {
                        problems.push(FieldProblem::NotFinite {
                            field: name.clone(),
                        });
                    }
                }
            }
        }

        mismatch(declared, problems)
    }

    /// Validate that every included name is a relation field of the type.
    pub fn validate_includes<'a>(
        &self,
        entity_type: &str,
        include: impl IntoIterator<Item = &'a String>,
    ) -> Result<(), SchemaError> {
        let declared = self.resolve(entity_type)?;
        let problems = include
            .into_iter()
            .filter_map(|name| match declared.get(name) {
                Some(f) if f.is_relation() => None,
                Some(_) => Some(FieldProblem::WrongShape {
                    field: name.clone(),
                    expected: "relation",
                }),
                None => Some(FieldProblem::Unknown {
                    field: name.clone(),
                }),
            })
            .collect();

        mismatch(declared, problems)
    }
}

fn is_finite(value: &ScalarValue) -> bool {
    match value {
        ScalarValue::Number(n) => n.is_finite(),
        _ => true,
    }
}

fn mismatch(declared: &EntityType, problems: Vec<FieldProblem>) -> Result<(), SchemaError> {
    if problems.is_empty() {
        Ok(())
    } else {
        Err(SchemaError::FieldMismatch {
            entity_type: declared.name.clone(),
            problems,
        })
    }
}
