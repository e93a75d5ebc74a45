//! Byte-budget residency cache for decoded node payloads
//!
//! Tracks each node's residency state and enforces the memory budget by
//! evicting the least useful resident nodes. The driver thread is the sole
//! writer; the decode pipeline only reports completions back to it.

use std::collections::HashMap;

use crate::stream::decode::NodeData;

/// Residency state of a node with an entry in the cache.
/// Absent from the map entirely means dropped: never requested, or evicted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeStatus {
    /// Requested, decode in flight
    Pending,
    /// Decoded payload resident and drawable
    Loaded,
    /// Decode failed; terminal until explicitly flushed
    Failed,
}

/// An unresident node worth loading, ranked by its computed error
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Candidate {
    pub id: u32,
    pub error: f32,
}

/// Eviction spares any node whose ratcheted error is at least this
/// fraction of the best unloaded candidate's error.
const EVICTION_GUARD: f32 = 0.9;

pub struct ResidencyCache {
    statuses: HashMap<u32, NodeStatus>,
    payloads: HashMap<u32, NodeData>,
    sizes: HashMap<u32, u64>,
    /// Highest error ever computed per node; ranks eviction victims and
    /// survives camera passes that no longer reach the node
    ratcheted: Vec<f32>,
    candidates: Vec<Candidate>,
    resident_bytes: u64,
    budget_bytes: u64,
    pending_count: usize,
    max_pending: usize,
}

impl ResidencyCache {
    pub fn new(node_count: usize, budget_bytes: u64, max_pending: usize) -> Self {
        Self {
            statuses: HashMap::new(),
            payloads: HashMap::new(),
            sizes: HashMap::new(),
            ratcheted: vec![0.0; node_count],
            candidates: Vec::new(),
            resident_bytes: 0,
            budget_bytes,
            pending_count: 0,
            max_pending,
        }
    }

    pub fn status(&self, id: u32) -> Option<NodeStatus> {
        self.statuses.get(&id).copied()
    }

    pub fn is_loaded(&self, id: u32) -> bool {
        self.status(id) == Some(NodeStatus::Loaded)
    }

    /// Ratcheted error for a node; 0.0 if never computed
    pub fn error(&self, id: u32) -> f32 {
        self.ratcheted[id as usize]
    }

    /// Ratchet the node's error: keep the maximum ever observed so a node
    /// the camera briefly looked away from does not become an instant
    /// eviction victim.
    pub fn record_error(&mut self, id: u32, error: f32) {
        let slot = &mut self.ratcheted[id as usize];
        if error > *slot {
            *slot = error;
        }
    }

    /// Drop the previous frame's candidates; ratcheted errors persist
    pub fn begin_frame(&mut self) {
        self.candidates.clear();
    }

    pub fn add_candidate(&mut self, candidate: Candidate) {
        self.candidates.push(candidate);
    }

    /// Error of the most urgent unloaded candidate, the reference point
    /// for the eviction guard
    pub fn best_candidate_error(&self) -> f32 {
        self.candidates
            .iter()
            .filter(|c| self.status(c.id).is_none())
            .map(|c| c.error)
            .fold(0.0, f32::max)
    }

    /// Pick the highest-error candidate with no residency entry, or None
    /// if nothing is requestable or the pending window is full.
    pub fn next_request(&mut self) -> Option<Candidate> {
        if self.pending_count >= self.max_pending {
            return None;
        }
        self.candidates
            .iter()
            .filter(|c| self.status(c.id).is_none())
            .max_by(|a, b| a.error.total_cmp(&b.error))
            .copied()
    }

    /// Evict lowest-error residents until the budget holds, sparing nodes
    /// still competitive with the best candidate. Returns the evicted ids.
    ///
    /// May leave the cache over budget when everything resident is still
    /// wanted; admission continues regardless so the scene can refine.
    pub fn evict_if_over_budget(&mut self, best_error: f32) -> Vec<u32> {
        let mut evicted = Vec::new();
        while self.resident_bytes > self.budget_bytes {
            let victim = self
                .statuses
                .iter()
                .filter(|&(_, &s)| s == NodeStatus::Loaded)
                .map(|(&id, _)| id)
                .min_by(|a, b| self.error(*a).total_cmp(&self.error(*b)));
            let Some(victim) = victim else { break };
            if self.error(victim) >= best_error * EVICTION_GUARD {
                // Everything left is as useful as what we would load
                break;
            }
            self.evict(victim);
            evicted.push(victim);
        }
        if !evicted.is_empty() {
            log::debug!(
                "evicted {} nodes, {} bytes resident",
                evicted.len(),
                self.resident_bytes
            );
        }
        evicted
    }

    pub fn mark_pending(&mut self, id: u32) {
        if self.statuses.insert(id, NodeStatus::Pending).is_none() {
            self.pending_count += 1;
        }
    }

    /// Install a decoded payload. A node evicted while its decode was in
    /// flight has no Pending entry anymore; the result is discarded.
    pub fn mark_loaded(&mut self, id: u32, data: NodeData, size: u64) {
        if self.status(id) != Some(NodeStatus::Pending) {
            log::debug!("discarding decode result for non-pending node {id}");
            return;
        }
        self.pending_count -= 1;
        self.statuses.insert(id, NodeStatus::Loaded);
        self.payloads.insert(id, data);
        self.sizes.insert(id, size);
        self.resident_bytes += size;
    }

    /// Record a terminal decode failure so the node is never re-requested
    pub fn mark_failed(&mut self, id: u32) {
        if self.status(id) == Some(NodeStatus::Pending) {
            self.pending_count -= 1;
        }
        self.statuses.insert(id, NodeStatus::Failed);
    }

    /// Drop a node back to absent, releasing its bytes if it was loaded
    pub fn evict(&mut self, id: u32) {
        match self.statuses.remove(&id) {
            Some(NodeStatus::Loaded) => {
                self.payloads.remove(&id);
                let size = self.sizes.remove(&id).unwrap_or(0);
                self.resident_bytes -= size;
            }
            Some(NodeStatus::Pending) => {
                // The in-flight decode will be discarded on arrival
                self.pending_count -= 1;
            }
            Some(NodeStatus::Failed) | None => {}
        }
    }

    /// Forget everything, failures included
    pub fn flush(&mut self) {
        self.statuses.clear();
        self.payloads.clear();
        self.sizes.clear();
        self.candidates.clear();
        self.ratcheted.fill(0.0);
        self.resident_bytes = 0;
        self.pending_count = 0;
    }

    pub fn payload(&self, id: u32) -> Option<&NodeData> {
        self.payloads.get(&id)
    }

    pub fn loaded_ids(&self) -> Vec<u32> {
        self.statuses
            .iter()
            .filter(|&(_, &s)| s == NodeStatus::Loaded)
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes
    }

    pub fn pending_count(&self) -> usize {
        self.pending_count
    }
}
