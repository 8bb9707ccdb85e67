//! Bounded pool of isolated working copies.
//!
//! A semaphore with `capacity` permits bounds concurrent leases; every lease
//! owns one permit and one slot index until it is released or swept. Leases
//! are never handed out above capacity, and waiting is always time-bounded.

use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use crate::{
    git::Git,
    types::{LeaseState, PoolStats, WorktreeLease},
};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no worktree became available within {waited:?} (capacity {capacity})")]
    Exhausted { capacity: usize, waited: Duration },
    #[error("unknown or already released lease {0}")]
    UnknownLease(String),
    #[error("worktree pool is shut down")]
    Closed,
    #[error(transparent)]
    Workspace(#[from] anyhow::Error),
}

impl PoolError {
    /// Exhaustion is the only error a caller should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

// ── Working copies ────────────────────────────────────────────────────────

/// Provides the on-disk working copy behind a pool slot.
pub trait Workspace: Send + Sync {
    /// Make sure the slot's working copy exists and is clean; return its path.
    fn prepare(&self, slot: usize) -> Result<PathBuf>;
    /// Return a working copy to a clean state before the slot is reused.
    fn reset(&self, path: &Path) -> Result<()>;
}

/// Plain directories; used when no integration repository is configured.
pub struct ScratchWorkspace {
    root: PathBuf,
}

impl ScratchWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Workspace for ScratchWorkspace {
    fn prepare(&self, slot: usize) -> Result<PathBuf> {
        let path = self.root.join(format!("slot-{slot}"));
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    fn reset(&self, path: &Path) -> Result<()> {
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        std::fs::create_dir_all(path)?;
        Ok(())
    }
}

/// One detached `git worktree` per slot, parked at the integration branch.
pub struct GitWorkspace {
    git: Git,
    root: PathBuf,
    base: String,
}

impl GitWorkspace {
    pub fn new(git: Git, root: impl Into<PathBuf>, base: impl Into<String>) -> Self {
        Self {
            git,
            root: root.into(),
            base: base.into(),
        }
    }
}

impl Workspace for GitWorkspace {
    fn prepare(&self, slot: usize) -> Result<PathBuf> {
        let path = self.root.join(format!("slot-{slot}"));
        let path_str = path.to_string_lossy().into_owned();
        if !path.join(".git").exists() {
            if path.exists() {
                std::fs::remove_dir_all(&path)?;
            }
            std::fs::create_dir_all(&self.root)?;
            self.git.prune_worktrees()?;
            self.git.worktree_add_detached(&path_str, &self.base)?;
        } else if !self.git.status_clean(&path_str)? {
            self.git.reset_worktree(&path_str, &self.base)?;
        }
        Ok(path)
    }

    fn reset(&self, path: &Path) -> Result<()> {
        self.git
            .reset_worktree(&path.to_string_lossy(), &self.base)
    }
}

// ── Pool ──────────────────────────────────────────────────────────────────

struct LeaseEntry {
    lease: WorktreeLease,
    _permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct PoolState {
    free_slots: BTreeSet<usize>,
    leases: HashMap<String, LeaseEntry>,
    orphaned_total: u64,
}

pub struct WorktreePool {
    capacity: usize,
    stale_after: chrono::Duration,
    semaphore: Arc<Semaphore>,
    workspace: Arc<dyn Workspace>,
    state: Mutex<PoolState>,
}

impl WorktreePool {
    pub fn new(capacity: usize, stale_after_hours: i64, workspace: Arc<dyn Workspace>) -> Self {
        Self {
            capacity,
            stale_after: chrono::Duration::hours(stale_after_hours),
            semaphore: Arc::new(Semaphore::new(capacity)),
            workspace,
            state: Mutex::new(PoolState {
                free_slots: (0..capacity).collect(),
                ..Default::default()
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lease a working copy, waiting at most `timeout` for one to free up.
    pub async fn acquire(
        &self,
        tenant_id: &str,
        job_id: Option<&str>,
        timeout: Duration,
    ) -> Result<WorktreeLease, PoolError> {
        let permit = match tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned())
            .await
        {
            Ok(Ok(p)) => p,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                return Err(PoolError::Exhausted {
                    capacity: self.capacity,
                    waited: timeout,
                })
            }
        };

        let slot = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.free_slots.pop_first()
        };
        let Some(slot) = slot else {
            return Err(PoolError::Exhausted {
                capacity: self.capacity,
                waited: timeout,
            });
        };

        let path = match self.workspace.prepare(slot) {
            Ok(p) => p,
            Err(e) => {
                let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
                st.free_slots.insert(slot);
                return Err(PoolError::Workspace(e));
            }
        };

        let now = Utc::now();
        let lease = WorktreeLease {
            lease_id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            job_id: job_id.map(str::to_string),
            slot,
            path: path.to_string_lossy().into_owned(),
            created_at: now,
            last_used_at: now,
            state: LeaseState::Active,
        };
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.leases.insert(
            lease.lease_id.clone(),
            LeaseEntry {
                lease: lease.clone(),
                _permit: permit,
            },
        );
        Ok(lease)
    }

    /// Return the lease's slot to the pool after resetting its working copy.
    pub fn release(&self, lease_id: &str) -> Result<(), PoolError> {
        let entry = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.leases
                .remove(lease_id)
                .ok_or_else(|| PoolError::UnknownLease(lease_id.to_string()))?
        };
        self.reclaim(entry);
        Ok(())
    }

    fn reclaim(&self, entry: LeaseEntry) {
        let path = PathBuf::from(&entry.lease.path);
        if let Err(e) = self.workspace.reset(&path) {
            warn!(
                lease_id = %entry.lease.lease_id,
                path = %entry.lease.path,
                "worktree reset failed: {e:#}"
            );
        }
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.free_slots.insert(entry.lease.slot);
        drop(st);
        drop(entry);
    }

    /// Mark the lease as used now.
    pub fn touch(&self, lease_id: &str) -> Result<(), PoolError> {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = st
            .leases
            .get_mut(lease_id)
            .ok_or_else(|| PoolError::UnknownLease(lease_id.to_string()))?;
        entry.lease.last_used_at = Utc::now();
        Ok(())
    }

    /// Keep the working copy out of circulation for investigation.
    pub fn preserve(&self, lease_id: &str) -> Result<(), PoolError> {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = st
            .leases
            .get_mut(lease_id)
            .ok_or_else(|| PoolError::UnknownLease(lease_id.to_string()))?;
        entry.lease.state = LeaseState::Preserved;
        entry.lease.last_used_at = Utc::now();
        info!(lease_id, path = %entry.lease.path, "worktree preserved");
        Ok(())
    }

    pub fn get(&self, lease_id: &str) -> Option<WorktreeLease> {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.leases.get(lease_id).map(|e| e.lease.clone())
    }

    pub fn leases(&self) -> Vec<WorktreeLease> {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = st.leases.values().map(|e| e.lease.clone()).collect();
        out.sort_by_key(|l| l.slot);
        out
    }

    pub fn sweep(&self) -> Vec<WorktreeLease> {
        self.sweep_at(Utc::now())
    }

    /// Force-release every lease idle longer than the staleness threshold.
    /// Returns the orphaned leases so the caller can fail their jobs.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<WorktreeLease> {
        let cutoff = now - self.stale_after;
        let stale: Vec<LeaseEntry> = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<String> = st
                .leases
                .values()
                .filter(|e| e.lease.last_used_at < cutoff)
                .map(|e| e.lease.lease_id.clone())
                .collect();
            let removed: Vec<LeaseEntry> =
                ids.iter().filter_map(|id| st.leases.remove(id)).collect();
            st.orphaned_total += removed.len() as u64;
            removed
        };

        let mut orphaned = Vec::with_capacity(stale.len());
        for mut entry in stale {
            warn!(
                lease_id = %entry.lease.lease_id,
                tenant_id = %entry.lease.tenant_id,
                job_id = ?entry.lease.job_id,
                last_used_at = %entry.lease.last_used_at,
                "orphaned worktree lease reclaimed"
            );
            entry.lease.state = LeaseState::Orphaned;
            let view = entry.lease.clone();
            self.reclaim(entry);
            orphaned.push(view);
        }
        orphaned
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let preserved = st
            .leases
            .values()
            .filter(|e| e.lease.state == LeaseState::Preserved)
            .count();
        PoolStats {
            capacity: self.capacity,
            in_use: st.leases.len() - preserved,
            preserved,
            available: self.semaphore.available_permits(),
            orphaned_total: st.orphaned_total,
        }
    }
}
