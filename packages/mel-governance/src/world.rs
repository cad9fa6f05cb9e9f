//! Worlds, deltas, and the lineage store.
//!
//! A world is an immutable point in the lineage DAG; a delta is the stored
//! patch-set bridging two worlds. The DAG has exactly one genesis per
//! schema, whose delta is a self-edge with empty patches. Stores must write
//! `(world, delta, snapshot)` atomically per transition; readers observe
//! committed worlds without locking writers on other keys.

use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mel_core::{ContentHash, Patch, Snapshot};

use crate::branch::PersistedBranchState;
use crate::error::GovernanceError;
use crate::proposal::ProposalId;

/// Identity of a world in the lineage DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorldId(Uuid);

impl WorldId {
    /// A fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The inner uuid.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How the world's producing execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorldStatus {
    /// Execution completed and passed scope validation.
    Completed,
    /// Execution failed or violated its approved scope. The snapshot is
    /// still recorded for inspection; branch heads never point here.
    Failed,
}

/// An immutable point in the lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct World {
    /// Unique identity.
    pub world_id: WorldId,
    /// Schema that produced the snapshot.
    pub schema_hash: ContentHash,
    /// Content hash of the snapshot's observable state.
    pub snapshot_hash: ContentHash,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Proposal that produced this world, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by_proposal: Option<ProposalId>,
    /// Terminal classification.
    pub status: WorldStatus,
}

/// The stored edit between two worlds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldDelta {
    /// Parent world (equal to `to_world_id` for genesis).
    pub from_world_id: WorldId,
    /// Child world.
    pub to_world_id: WorldId,
    /// Canonical patch list from parent data to child data.
    pub patches: Vec<Patch>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl WorldDelta {
    /// The genesis self-edge with empty patches.
    pub fn genesis(world_id: WorldId, created_at: DateTime<Utc>) -> Self {
        Self {
            from_world_id: world_id,
            to_world_id: world_id,
            patches: Vec::new(),
            created_at,
        }
    }

    /// True for a genesis self-edge.
    pub fn is_genesis(&self) -> bool {
        self.from_world_id == self.to_world_id
    }
}

/// Persistence seam for worlds and lineage.
#[async_trait]
pub trait WorldStore: Send + Sync {
    /// Atomically record a world, its parent delta, and its snapshot.
    async fn store(
        &self,
        world: World,
        delta: WorldDelta,
        snapshot: Snapshot,
    ) -> Result<(), GovernanceError>;

    /// Recover the exact snapshot recorded for a world.
    async fn restore(&self, world_id: &WorldId) -> Result<Snapshot, GovernanceError>;

    /// Fetch a world's metadata.
    async fn get_world(&self, world_id: &WorldId) -> Result<Option<World>, GovernanceError>;

    /// Whether the world exists.
    async fn has(&self, world_id: &WorldId) -> Result<bool, GovernanceError>;

    /// Direct children of a world in the DAG.
    async fn get_children(&self, world_id: &WorldId) -> Result<Vec<WorldId>, GovernanceError>;

    /// Ancestor chain from the world back to genesis (inclusive, oldest
    /// last).
    async fn get_lineage(&self, world_id: &WorldId) -> Result<Vec<WorldId>, GovernanceError>;

    /// Persist branch bookkeeping.
    async fn save_branch_state(&self, state: PersistedBranchState) -> Result<(), GovernanceError>;

    /// Recover branch bookkeeping, if any was saved.
    async fn load_branch_state(&self) -> Result<Option<PersistedBranchState>, GovernanceError>;

    /// Drop a world's snapshot payload while keeping its metadata and delta,
    /// so lineage stays intact. Returns whether anything was archived.
    ///
    /// Optional; the default implementation archives nothing.
    async fn archive(&self, _world_id: &WorldId) -> Result<bool, GovernanceError> {
        Ok(false)
    }

    /// Reclaim storage for archived worlds. Optional no-op by default.
    async fn compact(&self) -> Result<(), GovernanceError> {
        Ok(())
    }
}

/// The default in-memory store.
///
/// Two concurrent maps hold worlds and deltas; a third holds snapshots so
/// `restore` returns exactly what was recorded. Suitable for tests and
/// single-process embedding; durable engines implement [`WorldStore`]
/// elsewhere.
#[derive(Default)]
pub struct InMemoryWorldStore {
    worlds: DashMap<WorldId, World>,
    deltas: DashMap<WorldId, WorldDelta>,
    snapshots: DashMap<WorldId, Snapshot>,
    children: DashMap<WorldId, Vec<WorldId>>,
    branch_state: Mutex<Option<PersistedBranchState>>,
}

impl InMemoryWorldStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored worlds.
    pub fn world_count(&self) -> usize {
        self.worlds.len()
    }
}

#[async_trait]
impl WorldStore for InMemoryWorldStore {
    async fn store(
        &self,
        world: World,
        delta: WorldDelta,
        snapshot: Snapshot,
    ) -> Result<(), GovernanceError> {
        let world_id = world.world_id;
        if !delta.is_genesis() {
            self.children
                .entry(delta.from_world_id)
                .or_default()
                .push(world_id);
        }
        self.worlds.insert(world_id, world);
        self.deltas.insert(world_id, delta);
        self.snapshots.insert(world_id, snapshot);
        Ok(())
    }

    async fn restore(&self, world_id: &WorldId) -> Result<Snapshot, GovernanceError> {
        self.snapshots
            .get(world_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GovernanceError::WorldNotFound {
                world_id: world_id.to_string(),
            })
    }

    async fn get_world(&self, world_id: &WorldId) -> Result<Option<World>, GovernanceError> {
        Ok(self.worlds.get(world_id).map(|entry| entry.value().clone()))
    }

    async fn has(&self, world_id: &WorldId) -> Result<bool, GovernanceError> {
        Ok(self.worlds.contains_key(world_id))
    }

    async fn get_children(&self, world_id: &WorldId) -> Result<Vec<WorldId>, GovernanceError> {
        Ok(self
            .children
            .get(world_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn get_lineage(&self, world_id: &WorldId) -> Result<Vec<WorldId>, GovernanceError> {
        let mut lineage = Vec::new();
        let mut current = *world_id;
        loop {
            let Some(delta) = self.deltas.get(&current).map(|entry| entry.value().clone()) else {
                return Err(GovernanceError::WorldNotFound {
                    world_id: current.to_string(),
                });
            };
            lineage.push(current);
            if delta.is_genesis() {
                return Ok(lineage);
            }
            current = delta.from_world_id;
        }
    }

    async fn save_branch_state(&self, state: PersistedBranchState) -> Result<(), GovernanceError> {
        let mut slot = self
            .branch_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(state);
        Ok(())
    }

    async fn load_branch_state(&self) -> Result<Option<PersistedBranchState>, GovernanceError> {
        let slot = self
            .branch_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(slot.clone())
    }

    async fn archive(&self, world_id: &WorldId) -> Result<bool, GovernanceError> {
        Ok(self.snapshots.remove(world_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mel_core::{SnapshotMeta, SystemState};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;

    fn snapshot(data: Value) -> Snapshot {
        Snapshot {
            data,
            computed: BTreeMap::new(),
            system: SystemState::idle(),
            input: Value::Null,
            meta: SnapshotMeta {
                version: 1,
                timestamp: Utc::now(),
                random_seed: 0,
                schema_hash: ContentHash::from_hex("00".repeat(32)),
            },
        }
    }

    fn world(id: WorldId, snapshot: &Snapshot) -> World {
        World {
            world_id: id,
            schema_hash: snapshot.meta.schema_hash.clone(),
            snapshot_hash: snapshot.content_hash().unwrap(),
            created_at: Utc::now(),
            created_by_proposal: None,
            status: WorldStatus::Completed,
        }
    }

    #[tokio::test]
    async fn store_and_restore_round_trip() {
        let store = InMemoryWorldStore::new();
        let snap = snapshot(json!({"count": 1}));
        let id = WorldId::generate();
        store
            .store(world(id, &snap), WorldDelta::genesis(id, Utc::now()), snap.clone())
            .await
            .unwrap();

        assert!(store.has(&id).await.unwrap());
        assert_eq!(store.restore(&id).await.unwrap(), snap);
        assert_eq!(store.get_world(&id).await.unwrap().unwrap().world_id, id);
    }

    #[tokio::test]
    async fn missing_world_is_an_error() {
        let store = InMemoryWorldStore::new();
        let ghost = WorldId::generate();
        assert!(!store.has(&ghost).await.unwrap());
        assert!(matches!(
            store.restore(&ghost).await,
            Err(GovernanceError::WorldNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn lineage_walks_back_to_genesis() {
        let store = InMemoryWorldStore::new();
        let genesis_snap = snapshot(json!({"count": 0}));
        let genesis_id = WorldId::generate();
        store
            .store(
                world(genesis_id, &genesis_snap),
                WorldDelta::genesis(genesis_id, Utc::now()),
                genesis_snap,
            )
            .await
            .unwrap();

        let mut parent = genesis_id;
        let mut expected = vec![genesis_id];
        for i in 1..4 {
            let snap = snapshot(json!({"count": i}));
            let id = WorldId::generate();
            store
                .store(
                    world(id, &snap),
                    WorldDelta {
                        from_world_id: parent,
                        to_world_id: id,
                        patches: vec![Patch::set("count", json!(i))],
                        created_at: Utc::now(),
                    },
                    snap,
                )
                .await
                .unwrap();
            expected.push(id);
            parent = id;
        }

        let lineage = store.get_lineage(&parent).await.unwrap();
        let mut oldest_last = expected.clone();
        oldest_last.reverse();
        assert_eq!(lineage, oldest_last);

        let children = store.get_children(&genesis_id).await.unwrap();
        assert_eq!(children, vec![expected[1]]);
    }

    #[tokio::test]
    async fn archive_drops_the_snapshot_but_keeps_lineage() {
        let store = InMemoryWorldStore::new();
        let snap = snapshot(json!({"count": 1}));
        let id = WorldId::generate();
        store
            .store(world(id, &snap), WorldDelta::genesis(id, Utc::now()), snap)
            .await
            .unwrap();

        assert!(store.archive(&id).await.unwrap());
        assert!(!store.archive(&id).await.unwrap());
        // Metadata and lineage survive; only the payload is gone.
        assert!(store.has(&id).await.unwrap());
        assert_eq!(store.get_lineage(&id).await.unwrap(), vec![id]);
        assert!(matches!(
            store.restore(&id).await,
            Err(GovernanceError::WorldNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn children_track_forks() {
        let store = InMemoryWorldStore::new();
        let base_snap = snapshot(json!({}));
        let base = WorldId::generate();
        store
            .store(
                world(base, &base_snap),
                WorldDelta::genesis(base, Utc::now()),
                base_snap,
            )
            .await
            .unwrap();

        let mut fork_ids = Vec::new();
        for i in 0..2 {
            let snap = snapshot(json!({"fork": i}));
            let id = WorldId::generate();
            store
                .store(
                    world(id, &snap),
                    WorldDelta {
                        from_world_id: base,
                        to_world_id: id,
                        patches: vec![Patch::set("fork", json!(i))],
                        created_at: Utc::now(),
                    },
                    snap,
                )
                .await
                .unwrap();
            fork_ids.push(id);
        }
        assert_eq!(store.get_children(&base).await.unwrap(), fork_ids);
    }
}
