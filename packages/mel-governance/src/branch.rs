//! Branches: named heads into the lineage DAG, with epochs.
//!
//! Each branch carries a monotonic epoch. Switching *away* from a branch
//! increments that branch's epoch, which supersedes any in-flight proposal
//! that observed the older epoch. This is the single mechanism that keeps slow
//! approvals from committing onto a branch the user has left.

use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mel_core::ContentHash;

use crate::error::GovernanceError;
use crate::world::WorldId;

/// Identity of a branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchId(String);

impl BranchId {
    /// Wrap a branch identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BranchId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// A named pointer into the lineage DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    /// Unique identity.
    pub id: BranchId,
    /// Human-readable name.
    pub name: String,
    /// Current head world.
    pub head: WorldId,
    /// Monotonic epoch; bumped when the branch is switched away from.
    pub epoch: u64,
    /// Schema the branch's worlds belong to.
    pub schema_hash: ContentHash,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Branch this one forked from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_branch: Option<BranchId>,
    /// Ancestor world ids accumulated as the head advances (oldest first).
    pub lineage: Vec<WorldId>,
}

/// On-disk shape for branching engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedBranchState {
    /// All branches.
    pub branches: Vec<Branch>,
    /// The active branch.
    pub active_branch_id: BranchId,
}

/// In-process branch bookkeeping.
pub struct BranchManager {
    branches: DashMap<BranchId, Branch>,
    active: RwLock<Option<BranchId>>,
}

impl Default for BranchManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BranchManager {
    /// An empty manager; call [`BranchManager::initialize`] before use.
    pub fn new() -> Self {
        Self {
            branches: DashMap::new(),
            active: RwLock::new(None),
        }
    }

    /// Create the first branch pointing at the genesis world and make it
    /// active.
    pub fn initialize(
        &self,
        name: &str,
        genesis: WorldId,
        schema_hash: ContentHash,
        now: DateTime<Utc>,
    ) -> Branch {
        let branch = Branch {
            id: BranchId::new(name),
            name: name.to_string(),
            head: genesis,
            epoch: 1,
            schema_hash,
            created_at: now,
            parent_branch: None,
            lineage: vec![genesis],
        };
        self.branches.insert(branch.id.clone(), branch.clone());
        self.set_active(branch.id.clone());
        branch
    }

    /// The active branch.
    pub fn active(&self) -> Result<Branch, GovernanceError> {
        let active = self
            .active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let Some(id) = active else {
            return Err(GovernanceError::NotInitialized);
        };
        self.get(&id)
    }

    /// Look up a branch.
    pub fn get(&self, id: &BranchId) -> Result<Branch, GovernanceError> {
        self.branches
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GovernanceError::BranchNotFound {
                branch_id: id.to_string(),
            })
    }

    /// Fork a new branch at a world.
    pub fn fork(
        &self,
        name: &str,
        from_world: WorldId,
        parent: &BranchId,
        schema_hash: ContentHash,
        now: DateTime<Utc>,
    ) -> Result<Branch, GovernanceError> {
        let parent_branch = self.get(parent)?;
        let branch = Branch {
            id: BranchId::new(name),
            name: name.to_string(),
            head: from_world,
            epoch: 1,
            schema_hash,
            created_at: now,
            parent_branch: Some(parent_branch.id),
            lineage: vec![from_world],
        };
        self.branches.insert(branch.id.clone(), branch.clone());
        Ok(branch)
    }

    /// Switch the active branch. The branch being switched *away from* gets
    /// its epoch bumped, superseding its in-flight proposals.
    pub fn switch(&self, to: &BranchId) -> Result<Branch, GovernanceError> {
        let target = self.get(to)?;
        let previous = self
            .active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(previous) = previous {
            if previous != *to {
                if let Some(mut branch) = self.branches.get_mut(&previous) {
                    branch.epoch += 1;
                }
            }
        }
        self.set_active(to.clone());
        Ok(target)
    }

    /// Advance a branch's head after a committed world.
    pub fn advance_head(&self, id: &BranchId, world: WorldId) -> Result<(), GovernanceError> {
        let mut branch = self
            .branches
            .get_mut(id)
            .ok_or_else(|| GovernanceError::BranchNotFound {
                branch_id: id.to_string(),
            })?;
        branch.head = world;
        branch.lineage.push(world);
        Ok(())
    }

    /// The current epoch of a branch.
    pub fn epoch(&self, id: &BranchId) -> Result<u64, GovernanceError> {
        Ok(self.get(id)?.epoch)
    }

    /// Snapshot the full state for persistence.
    pub fn persisted(&self) -> Result<PersistedBranchState, GovernanceError> {
        let active = self
            .active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(GovernanceError::NotInitialized)?;
        let mut branches: Vec<Branch> =
            self.branches.iter().map(|entry| entry.value().clone()).collect();
        branches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(PersistedBranchState {
            branches,
            active_branch_id: active,
        })
    }

    /// Restore from persisted state, replacing everything in memory.
    pub fn restore(&self, state: PersistedBranchState) {
        self.branches.clear();
        for branch in state.branches {
            self.branches.insert(branch.id.clone(), branch);
        }
        self.set_active(state.active_branch_id);
    }

    fn set_active(&self, id: BranchId) {
        let mut active = self
            .active
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *active = Some(id);
    }
}
