//! Transport seams and the shared sync client.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use hyperlens_core::config::SyncConfig;
use hyperlens_core::events::SyncEvent;
use hyperlens_core::{
    Entity, FailureKind, Payload, QueryDescriptor, SchemaRegistry, SpaceId, SpaceSummary,
    VisibilityMode,
};

use crate::mutations::MutationDispatcher;
use crate::queries::QueryCache;
use crate::space::{
    ConnectionContext, DirectoryContext, ResolveError, SessionProvider, SpaceResolver,
};

/// Errors reported by a transport. Recoverable by retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote error ({code}): {message}")]
    Remote { code: u16, message: String },

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl TransportError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Network(_) => FailureKind::Network,
            Self::Remote { .. } => FailureKind::Remote,
            Self::Decode(_) => FailureKind::InvalidResponse,
        }
    }
}

/// Errors from listing spaces.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Remote query transport of the external knowledge-graph protocol.
#[async_trait]
pub trait QueryTransport: Send + Sync {
    async fn query(
        &self,
        descriptor: &QueryDescriptor,
        context: &ConnectionContext,
    ) -> Result<Vec<Entity>, TransportError>;

    /// Spaces of `context.mode` that the session can see.
    async fn spaces(
        &self,
        context: &DirectoryContext,
    ) -> Result<Vec<SpaceSummary>, TransportError>;
}

/// Remote mutation transport. Returns the entity with its server-assigned id.
#[async_trait]
pub trait MutationTransport: Send + Sync {
    async fn create(
        &self,
        entity_type: &str,
        payload: &Payload,
        context: &ConnectionContext,
    ) -> Result<Entity, TransportError>;
}

/// Process-wide client state: schema, resolver, query cache, and dispatcher.
///
/// Construct once at application start and pass by reference. Clones of the
/// cache and dispatcher handles are cheap (inner Arc). Call
/// [`shutdown`](Self::shutdown) to tear it down; responses arriving after
/// that are dropped.
pub struct SyncClient {
    registry: Arc<SchemaRegistry>,
    directory: Arc<dyn QueryTransport>,
    resolver: SpaceResolver,
    cache: QueryCache,
    mutations: MutationDispatcher,
    events: broadcast::Sender<SyncEvent>,
    default_page_size: u32,
}

impl SyncClient {
    pub fn new(
        config: &SyncConfig,
        registry: SchemaRegistry,
        query_transport: Arc<dyn QueryTransport>,
        mutation_transport: Arc<dyn MutationTransport>,
        session: Arc<dyn SessionProvider>,
    ) -> Self {
        let registry = Arc::new(registry);
        let resolver = SpaceResolver::new(config, session);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let cache = QueryCache::new(
            registry.clone(),
            resolver.clone(),
            query_transport.clone(),
            config.stale_after(),
            events.clone(),
        );
        let mutations = MutationDispatcher::new(
            registry.clone(),
            resolver.clone(),
            mutation_transport,
            cache.clone(),
            events.clone(),
        );

        tracing::info!(
            public_endpoint = %config.public_endpoint,
            private_endpoint = %config.private_endpoint,
            "Sync client started"
        );

        Self {
            registry,
            directory: query_transport,
            resolver,
            cache,
            mutations,
            events,
            default_page_size: config.default_page_size,
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &SpaceResolver {
        &self.resolver
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn mutations(&self) -> &MutationDispatcher {
        &self.mutations
    }

    /// Subscribe to every cache and mutation event from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Spaces of one visibility mode, as the remote lists them for this session.
    pub async fn spaces(
        &self,
        mode: VisibilityMode,
    ) -> Result<Vec<SpaceSummary>, DirectoryError> {
        let context = self.resolver.resolve_directory(mode)?;
        let spaces = self.directory.spaces(&context).await.map_err(|e| {
            tracing::warn!(%mode, error = %e, "Listing spaces failed");
            e
        })?;
        tracing::debug!(%mode, count = spaces.len(), "Spaces listed");
        Ok(spaces)
    }

    /// A public-space query using the configured page size.
    pub fn public_query(&self, entity_type: &str, space_id: impl Into<SpaceId>) -> QueryDescriptor {
        QueryDescriptor::public(entity_type, space_id).with_limit(self.default_page_size)
    }

    /// A private-space query using the configured page size.
    pub fn private_query(&self, entity_type: &str) -> QueryDescriptor {
        QueryDescriptor::private(entity_type).with_limit(self.default_page_size)
    }

    /// Tear down: drop every cache entry and pending mutation, and ignore
    /// responses still in flight.
    pub fn shutdown(self) {
        self.cache.close();
        self.mutations.close();
        tracing::info!("Sync client shut down");
    }
}
