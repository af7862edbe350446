//! Explorer operations on top of a [`SyncClient`].
//!
//! Each command returns data; printing is left to the binary.

use std::sync::Arc;

use hyperlens_core::catalog;
use hyperlens_core::config::SyncConfig;
use hyperlens_core::{
    CacheStatus, Entity, EntityId, EntityType, QueryDescriptor, SpaceId, SpaceSummary,
    VisibilityMode,
};
use hyperlens_graph::{SessionProvider, SyncClient};

use crate::config::ExploreConfig;
use crate::error::{ExploreError, Result};
use crate::fields;
use crate::session::StaticSession;
use crate::snapshot::SnapshotTransport;

/// Build a client over the configured snapshot and session.
pub fn open_client(sync: &SyncConfig, explore: &ExploreConfig) -> Result<SyncClient> {
    let transport = Arc::new(SnapshotTransport::open(&explore.snapshot_path)?);
    let session = StaticSession::from_config(explore);
    tracing::debug!(
        snapshot = %explore.snapshot_path,
        signed_in = session.is_authenticated(),
        "Opening explorer"
    );
    Ok(SyncClient::new(
        sync,
        catalog::registry()?,
        transport.clone(),
        transport,
        Arc::new(session),
    ))
}

/// Every registered entity type with its fields.
pub fn types(client: &SyncClient) -> Vec<EntityType> {
    let registry = client.registry();
    registry
        .type_names()
        .filter_map(|name| registry.resolve(name).ok())
        .cloned()
        .collect()
}

/// Spaces of one mode visible to the configured session.
pub async fn spaces(client: &SyncClient, mode: VisibilityMode) -> Result<Vec<SpaceSummary>> {
    Ok(client.spaces(mode).await?)
}

/// What to list.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub entity_type: String,
    /// Public space to read. Takes precedence over `private_space`.
    pub space: Option<String>,
    /// Private space to read. Unset: the session's own.
    pub private_space: Option<String>,
    /// Case-sensitive substring of `name`.
    pub search: Option<String>,
    /// `field=value` equality conditions.
    pub conditions: Vec<String>,
    pub limit: Option<u32>,
    pub include: Vec<String>,
}

/// Translate a list request into a query descriptor.
pub fn build_query(client: &SyncClient, request: &ListRequest) -> Result<QueryDescriptor> {
    let declared = client.registry().resolve(&request.entity_type)?;

    let mut filter = fields::parse_filter(declared, &request.conditions)?;
    if let Some(search) = request.search.as_deref().filter(|s| !s.is_empty()) {
        filter = filter.contains("name", search);
    }

    let mut descriptor = match (&request.space, &request.private_space) {
        (Some(space), _) => client.public_query(&request.entity_type, space.as_str()),
        (None, Some(space)) => client
            .private_query(&request.entity_type)
            .in_space(space.as_str()),
        (None, None) => client.private_query(&request.entity_type),
    }
    .with_filter(filter);
    if let Some(limit) = request.limit {
        descriptor = descriptor.with_limit(limit);
    }
    for relation in &request.include {
        descriptor = descriptor.include(relation);
    }
    Ok(descriptor)
}

/// Run a query to completion. A failed fetch is an error here.
pub async fn list(client: &SyncClient, descriptor: &QueryDescriptor) -> Result<Vec<Entity>> {
    let entry = client.cache().fetch(descriptor).await?;
    match (entry.status, entry.error) {
        (CacheStatus::Error, Some(failure)) => Err(ExploreError::QueryFailed(failure.message)),
        _ => Ok(entry.data),
    }
}

/// Create an entity in the private space and wait for confirmation.
pub async fn create(
    client: &SyncClient,
    entity_type: &str,
    assignments: &[String],
    space: Option<&str>,
) -> Result<Entity> {
    let declared = client.registry().resolve(entity_type)?;
    let payload = fields::parse_payload(declared, assignments)?;
    let ticket = client.mutations().create(
        entity_type,
        payload,
        &SpaceId::from(space.unwrap_or_default()),
    )?;
    tracing::info!(local_id = %ticket.local_id(), entity_type, "Create dispatched");
    Ok(ticket.outcome().await?)
}

/// Copy an entity into a public space.
///
/// The source is looked up with every relation loaded, so the copy carries
/// them too. `from` names a public source space; unset means private.
pub async fn publish(
    client: &SyncClient,
    entity_type: &str,
    id: &str,
    from: Option<&str>,
    to: &str,
) -> Result<Entity> {
    let declared = client.registry().resolve(entity_type)?;
    let mut lookup = match from {
        Some(space) => QueryDescriptor::public(entity_type, space),
        None => QueryDescriptor::private(entity_type),
    }
    .with_limit(u32::MAX);
    for relation in declared.relation_names() {
        lookup = lookup.include(relation);
    }

    let wanted = EntityId::new(id);
    let source = list(client, &lookup)
        .await?
        .into_iter()
        .find(|e| e.id == wanted)
        .ok_or_else(|| ExploreError::EntityNotFound {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
            space_id: from.unwrap_or("private").to_string(),
        })?;

    let ticket = client.mutations().publish(&source, &SpaceId::from(to))?;
    tracing::info!(source = %source.id, target = to, "Publish dispatched");
    Ok(ticket.outcome().await?)
}
