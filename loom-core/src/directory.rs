//! In-memory registry of known peers.
//!
//! Concurrency model: one `DashMap` keyed by node id, consistent per key
//! but not globally atomic, plus a role index for stable role lookups.
//! Only the gossip receive path upserts peers; only the owning node
//! advances its own entry (`update_self`).

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::types::{NodeInfo, NodeStatus, Role};

/// Emitted on every accepted upsert and on every status transition.
#[derive(Debug, Clone)]
pub struct DirectoryEvent {
    pub node_id: String,
    pub status: NodeStatus,
    pub version: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct DirectoryTimeouts {
    pub suspect_ms: u64,
    pub dead_ms: u64,
    pub evict_ms: u64,
}

impl DirectoryTimeouts {
    pub fn from_secs(suspect: u64, dead: u64, evict: u64) -> Self {
        Self {
            suspect_ms: suspect * 1000,
            dead_ms: dead * 1000,
            evict_ms: evict * 1000,
        }
    }
}

/// Serialized directory state, minus transient fields (freeze marks).
#[derive(Debug, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub nodes: Vec<NodeInfo>,
}

pub struct NodeDirectory {
    self_id: String,
    nodes: DashMap<String, NodeInfo>,
    roles: DashMap<Role, BTreeSet<String>>,
    /// Peers whose last_seen is pinned after sustained send failures, so
    /// third-party gossip cannot keep them alive. Cleared by a frame
    /// received from the node itself.
    frozen: Mutex<HashSet<String>>,
    timeouts: DirectoryTimeouts,
    events: broadcast::Sender<DirectoryEvent>,
}

impl NodeDirectory {
    pub fn new(self_info: NodeInfo, timeouts: DirectoryTimeouts) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let dir = Self {
            self_id: self_info.node_id.clone(),
            nodes: DashMap::new(),
            roles: DashMap::new(),
            frozen: Mutex::new(HashSet::new()),
            timeouts,
            events,
        };
        dir.index_role(self_info.role, &self_info.node_id);
        dir.nodes.insert(self_info.node_id.clone(), self_info);
        Arc::new(dir)
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DirectoryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, node_id: &str, status: NodeStatus, version: u64) {
        // Nobody listening is fine.
        let _ = self.events.send(DirectoryEvent {
            node_id: node_id.to_string(),
            status,
            version,
        });
    }

    fn index_role(&self, role: Role, node_id: &str) {
        self.roles
            .entry(role)
            .or_default()
            .insert(node_id.to_string());
    }

    fn unindex(&self, role: Role, node_id: &str) {
        if let Some(mut set) = self.roles.get_mut(&role) {
            set.remove(node_id);
        }
    }

    /// Accept a peer entry iff it is newer than what we hold.
    ///
    /// Entries about self are ignored: the owning node is authoritative
    /// for its own record. Returns true when the entry was applied.
    pub fn upsert(&self, info: NodeInfo) -> bool {
        if info.node_id == self.self_id {
            return false;
        }

        let node_id = info.node_id.clone();
        let mut accepted = false;
        let mut newly_indexed = None;
        let mut status = info.status;
        let mut version = info.version;

        match self.nodes.entry(node_id.clone()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(
                    "Discovered node {} at {}:{} ({})",
                    info.node_id,
                    info.address,
                    info.port,
                    info.role.as_str()
                );
                newly_indexed = Some(info.role);
                slot.insert(info);
                accepted = true;
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let existing = slot.get();
                if existing.role != info.role {
                    // Role is immutable per node within a run.
                    warn!(
                        "Rejecting {}: role changed {} -> {}",
                        info.node_id,
                        existing.role.as_str(),
                        info.role.as_str()
                    );
                    return false;
                }
                let newer = info.version > existing.version
                    || (info.version == existing.version && info.last_seen > existing.last_seen);
                if newer {
                    let mut incoming = info;
                    if self.frozen.lock().contains(&node_id) {
                        // Frozen peers keep their pinned last_seen until
                        // the node speaks for itself again.
                        incoming.last_seen = existing.last_seen;
                        incoming.status = existing.status;
                        status = incoming.status;
                    }
                    version = incoming.version;
                    slot.insert(incoming);
                    accepted = true;
                } else {
                    debug!(
                        "Discarding stale entry for {} (v{} <= v{})",
                        node_id, info.version, existing.version
                    );
                }
            }
        }

        // The role index is touched only after the entry guard is gone.
        if let Some(role) = newly_indexed {
            self.index_role(role, &node_id);
        }
        if accepted {
            self.emit(&node_id, status, version);
        }
        accepted
    }

    /// Refresh the liveness clock of a node without touching its version.
    pub fn mark_seen(&self, node_id: &str, now_ms: u64) {
        if self.frozen.lock().contains(node_id) {
            return;
        }
        if let Some(mut entry) = self.nodes.get_mut(node_id) {
            if now_ms > entry.last_seen {
                entry.last_seen = now_ms;
            }
        }
    }

    /// Pin a peer's last_seen after sustained send failures so its decay
    /// is not masked by third-party reports.
    pub fn freeze(&self, node_id: &str) {
        if node_id == self.self_id {
            return;
        }
        if self.frozen.lock().insert(node_id.to_string()) {
            debug!("Froze liveness clock for {}", node_id);
        }
    }

    /// Called when a gossip frame arrives from the node itself.
    pub fn unfreeze(&self, node_id: &str) {
        if self.frozen.lock().remove(node_id) {
            debug!("Unfroze liveness clock for {}", node_id);
        }
    }

    /// Recompute statuses from `now` and evict long-dead entries.
    /// Safe to run concurrently with `upsert`.
    pub fn sweep(&self, now_ms: u64) {
        let mut evict: Vec<(String, Role)> = Vec::new();

        for mut entry in self.nodes.iter_mut() {
            if entry.node_id == self.self_id {
                continue;
            }
            let age = now_ms.saturating_sub(entry.last_seen);
            let next = if age < self.timeouts.suspect_ms {
                NodeStatus::Alive
            } else if age < self.timeouts.dead_ms {
                NodeStatus::Suspected
            } else {
                NodeStatus::Dead
            };

            if next != entry.status {
                // alive -> suspected -> dead, never skipping a stage.
                let stepped = match (entry.status, next) {
                    (NodeStatus::Alive, NodeStatus::Dead) => NodeStatus::Suspected,
                    _ => next,
                };
                info!(
                    "Node {} status: {:?} -> {:?} (age {}ms)",
                    entry.node_id, entry.status, stepped, age
                );
                entry.status = stepped;
                let (id, status, version) = (entry.node_id.clone(), entry.status, entry.version);
                drop(entry);
                self.emit(&id, status, version);
                continue;
            }

            if entry.status == NodeStatus::Dead && age >= self.timeouts.evict_ms {
                evict.push((entry.node_id.clone(), entry.role));
            }
        }

        for (node_id, role) in evict {
            self.nodes.remove(&node_id);
            self.unindex(role, &node_id);
            self.frozen.lock().remove(&node_id);
            info!("Evicted dead node {}", node_id);
        }
    }

    pub fn lookup(&self, node_id: &str) -> Option<NodeInfo> {
        self.nodes.get(node_id).map(|entry| entry.value().clone())
    }

    /// Alive node ids with the given role, lexicographically ordered so
    /// callers get stable tie-breaks.
    pub fn lookup_by_role(&self, role: Role) -> Vec<String> {
        let Some(ids) = self.roles.get(&role) else {
            return Vec::new();
        };
        ids.iter()
            .filter(|id| {
                self.nodes
                    .get(id.as_str())
                    .map(|entry| entry.status == NodeStatus::Alive)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// All known entries, self included.
    pub fn all(&self) -> Vec<NodeInfo> {
        self.nodes.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn alive_peers(&self) -> Vec<NodeInfo> {
        self.nodes
            .iter()
            .filter(|entry| {
                entry.node_id != self.self_id && entry.status == NodeStatus::Alive
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn self_info(&self) -> NodeInfo {
        self.nodes
            .get(&self.self_id)
            .map(|entry| entry.value().clone())
            .expect("self entry always present")
    }

    /// Mutate the self entry, bumping its version. The closure must not
    /// touch `version`; it is advanced here exactly once.
    pub fn update_self(&self, mutate: impl FnOnce(&mut NodeInfo)) -> u64 {
        let mut entry = self
            .nodes
            .get_mut(&self.self_id)
            .expect("self entry always present");
        mutate(&mut entry);
        entry.version += 1;
        entry.last_seen = crate::types::unix_ms();
        let version = entry.version;
        let status = entry.status;
        let id = entry.node_id.clone();
        drop(entry);
        self.emit(&id, status, version);
        version
    }

    /// Refresh self last_seen without a version bump (per-tick heartbeat).
    pub fn touch_self(&self, now_ms: u64) {
        if let Some(mut entry) = self.nodes.get_mut(&self.self_id) {
            entry.last_seen = now_ms;
        }
    }

    pub fn snapshot(&self) -> DirectorySnapshot {
        DirectorySnapshot { nodes: self.all() }
    }

    /// Reload peers from a persisted snapshot. Every restored peer starts
    /// out suspected so it must re-prove liveness through gossip.
    pub fn restore(&self, snapshot: DirectorySnapshot) {
        for mut info in snapshot.nodes {
            if info.node_id == self.self_id {
                continue;
            }
            info.status = NodeStatus::Suspected;
            self.upsert(info);
        }
    }
}
