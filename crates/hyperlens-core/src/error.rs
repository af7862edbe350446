use std::fmt;

use thiserror::Error;

use crate::types::PrimitiveKind;

/// Top-level error type for Hyperlens.
#[derive(Error, Debug)]
pub enum HyperlensError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),
}

/// Schema-level errors. These are programmer errors: a correctly wired
/// application never produces them at runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Entity type already registered: {0}")]
    DuplicateType(String),

    #[error("Field `{field}` declared twice on {entity_type}")]
    DuplicateField { entity_type: String, field: String },

    #[error("Unknown entity type: {0}")]
    UnknownType(String),

    #[error("Field mismatch for {entity_type}: {}", join_problems(.problems))]
    FieldMismatch {
        entity_type: String,
        problems: Vec<FieldProblem>,
    },
}

impl SchemaError {
    /// Field problems carried by a `FieldMismatch`, empty otherwise.
    pub fn problems(&self) -> &[FieldProblem] {
        match self {
            Self::FieldMismatch { problems, .. } => problems,
            _ => &[],
        }
    }
}

/// One reason a payload, filter, or include set does not fit its entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldProblem {
    /// A required scalar field is absent.
    Missing { field: String },
    /// A scalar field holds a value of another primitive kind.
    WrongKind {
        field: String,
        expected: PrimitiveKind,
        found: PrimitiveKind,
    },
    /// A relation field was given a scalar, or a scalar field a relation.
    WrongShape { field: String, expected: &'static str },
    /// The field is not declared by the entity type.
    Unknown { field: String },
    /// A number is NaN or infinite.
    NotFinite { field: String },
}

impl FieldProblem {
    pub fn field(&self) -> &str {
        match self {
            Self::Missing { field }
            | Self::WrongKind { field, .. }
            | Self::WrongShape { field, .. }
            | Self::Unknown { field }
            | Self::NotFinite { field } => field,
        }
    }
}

impl fmt::Display for FieldProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { field } => write!(f, "missing `{field}`"),
            Self::WrongKind {
                field,
                expected,
                found,
            } => write!(f, "`{field}` expected {expected}, found {found}"),
            Self::WrongShape { field, expected } => write!(f, "`{field}` expected {expected}"),
            Self::Unknown { field } => write!(f, "unknown `{field}`"),
            Self::NotFinite { field } => write!(f, "`{field}` must be finite"),
        }
    }
}

fn join_problems(problems: &[FieldProblem]) -> String {
    problems
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
