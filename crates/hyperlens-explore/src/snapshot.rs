//! File-backed knowledge graph.
//!
//! A snapshot is a JSON document mapping space ids to the entities they
//! hold, plus a directory naming each space and its visibility. Queries are
//! answered locally (type, filter, limit, includes) and creates are assigned
//! a fresh UUID and written back to the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hyperlens_core::{
    Entity, EntityId, Payload, QueryDescriptor, Relation, SpaceId, SpaceSummary, VisibilityMode,
};
use hyperlens_graph::{
    ConnectionContext, DirectoryContext, MutationTransport, QueryTransport, TransportError,
};

use crate::error::{ExploreError, Result};

/// On-disk snapshot format.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    #[serde(default)]
    pub spaces: BTreeMap<String, Vec<Entity>>,
    #[serde(default)]
    pub directory: BTreeMap<String, SpaceRecord>,
}

/// Directory entry of one space.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpaceRecord {
    pub name: String,
    pub mode: VisibilityMode,
}

impl Snapshot {
    /// Entities of one space, in stored order.
    pub fn space(&self, space_id: &str) -> &[Entity] {
        self.spaces.get(space_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Spaces of one mode, ordered by id. A space that holds entities but
    /// has no directory entry is public and named by its id.
    pub fn spaces_of(&self, mode: VisibilityMode) -> Vec<SpaceSummary> {
        let recorded = self
            .directory
            .iter()
            .map(|(id, record)| (id, record.name.as_str(), record.mode));
        let unrecorded = self
            .spaces
            .keys()
            .filter(|id| !self.directory.contains_key(*id))
            .map(|id| (id, id.as_str(), VisibilityMode::Public));

        let mut found: Vec<SpaceSummary> = recorded
            .chain(unrecorded)
            .filter(|(_, _, m)| *m == mode)
            .map(|(id, name, mode)| SpaceSummary {
                id: SpaceId::new(id.as_str()),
                name: name.to_string(),
                mode,
            })
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }
}

/// Query and mutation transport over a snapshot file.
pub struct SnapshotTransport {
    path: PathBuf,
    snapshot: Mutex<Snapshot>,
}

impl SnapshotTransport {
    /// Open a snapshot file. A missing file is an empty graph.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                ExploreError::Snapshot(format!("{}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Snapshot not found, starting empty");
                Snapshot::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            snapshot: Mutex::new(snapshot),
        })
    }

    /// Copy of the current graph.
    pub fn snapshot(&self) -> Snapshot {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Answer a query against the entities of one space.
fn answer(entities: &[Entity], descriptor: &QueryDescriptor) -> Vec<Entity> {
    entities
        .iter()
        .filter(|e| e.entity_type == descriptor.entity_type)
        .filter(|e| descriptor.filter.matches(e))
        .take(descriptor.limit as usize)
        .map(|e| {
            let mut e = e.clone();
            for (name, relation) in e.relations.iter_mut() {
                if !descriptor.include.contains(name) {
                    *relation = Relation::NotLoaded;
                }
            }
            e
        })
        .collect()
}

#[async_trait]
impl QueryTransport for SnapshotTransport {
    async fn query(
        &self,
        descriptor: &QueryDescriptor,
        context: &ConnectionContext,
    ) -> std::result::Result<Vec<Entity>, TransportError> {
        let snapshot = self.lock();
        let found = answer(snapshot.space(context.space_id.as_str()), descriptor);
        tracing::debug!(
            space_id = %context.space_id,
            entity_type = %descriptor.entity_type,
            count = found.len(),
            "Snapshot query"
        );
        Ok(found)
    }

    async fn spaces(
        &self,
        context: &DirectoryContext,
    ) -> std::result::Result<Vec<SpaceSummary>, TransportError> {
        Ok(self.lock().spaces_of(context.mode))
    }
}

#[async_trait]
impl MutationTransport for SnapshotTransport {
    async fn create(
        &self,
        entity_type: &str,
        payload: &Payload,
        context: &ConnectionContext,
    ) -> std::result::Result<Entity, TransportError> {
        let entity = Entity::from_payload(
            EntityId::new(Uuid::new_v4().to_string()),
            entity_type,
            context.space_id.clone(),
            payload,
        );

        let space_id = context.space_id.to_string();
        let mut snapshot = self.lock();
        let new_space = !snapshot.directory.contains_key(&space_id);
        if new_space {
            snapshot.directory.insert(
                space_id.clone(),
                SpaceRecord {
                    name: space_id.clone(),
                    mode: context.mode,
                },
            );
        }
        snapshot
            .spaces
            .entry(space_id.clone())
            .or_default()
            .push(entity.clone());
        if let Err(e) = self.persist(&snapshot) {
            // Keep memory and file in step.
            if let Some(space) = snapshot.spaces.get_mut(&space_id) {
                space.retain(|existing| existing.id != entity.id);
            }
            if new_space {
                snapshot.directory.remove(&space_id);
            }
            return Err(TransportError::Remote {
                code: 500,
                message: e.to_string(),
            });
        }

        tracing::info!(id = %entity.id, entity_type, space_id = %context.space_id, "Snapshot entity created");
        Ok(entity)
    }
}
