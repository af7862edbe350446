//! hyperlens-graph: client-side synchronization for the knowledge graph.
//!
//! This crate is the single mutation point for cached graph state. All
//! queries flow through the [`QueryCache`] and all writes through the
//! [`MutationDispatcher`], both owned by a [`SyncClient`], so that request
//! deduplication, response ordering, and optimistic reconciliation are
//! applied consistently. The network itself is reached only through the
//! transport traits in [`client`].

pub mod client;
pub mod fingerprint;
pub mod mutations;
pub mod queries;
pub mod space;

pub use client::{DirectoryError, MutationTransport, QueryTransport, SyncClient, TransportError};
pub use mutations::{MutationDispatcher, MutationError, MutationTicket};
pub use queries::{CacheError, QueryCache};
pub use space::{
    AnonymousSession, AuthToken, ConnectionContext, DirectoryContext, ResolveError,
    SessionProvider, SpaceResolver,
};
