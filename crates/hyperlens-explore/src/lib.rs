//! hyperlens-explore: command-line explorer for Hyperlens.
//!
//! Drives the query cache and mutation dispatcher against a JSON snapshot of
//! a knowledge graph: list spaces and the entities they hold, create
//! entities in the private space, and publish them to a public one.

pub mod commands;
pub mod config;
pub mod error;
pub mod fields;
pub mod session;
pub mod snapshot;
