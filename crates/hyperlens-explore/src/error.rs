//! Error types for the hyperlens-explore crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExploreError {
    #[error("Config error: {0}")]
    Config(#[from] hyperlens_core::HyperlensError),

    #[error("Schema error: {0}")]
    Schema(#[from] hyperlens_core::SchemaError),

    #[error("Query error: {0}")]
    Cache(#[from] hyperlens_graph::CacheError),

    #[error("Mutation error: {0}")]
    Mutation(#[from] hyperlens_graph::MutationError),

    #[error("Space listing error: {0}")]
    Directory(#[from] hyperlens_graph::DirectoryError),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidAssignment { field: String, reason: String },

    #[error("No {entity_type} with id {id} in space {space_id}")]
    EntityNotFound {
        entity_type: String,
        id: String,
        space_id: String,
    },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ExploreError>;
