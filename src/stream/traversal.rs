//! Priority-driven selection of the DAG cut to display
//!
//! Best-first expansion over the node DAG: a max-heap ordered by computed
//! screen-space error pops the worst-offending node each step, decides
//! whether it can be refined, and pushes its children. The pass yields the
//! selected cut, the candidates worth loading, and the blocked frontier.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use crate::graph::NodeGraph;
use crate::stream::metric::CameraView;
use crate::stream::residency::{Candidate, ResidencyCache};

/// Transient heap entry for one traversal pass
#[derive(Clone, Copy, Debug)]
struct TraversalElement {
    id: u32,
    error: f32,
}

impl Eq for TraversalElement {}

impl PartialEq for TraversalElement {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Ord for TraversalElement {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher error pops first (max-heap); ties break arbitrarily.
        // total_cmp keeps NaN/infinity from poisoning the heap order.
        self.error.total_cmp(&other.error)
    }
}

impl PartialOrd for TraversalElement {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Result of one traversal pass
#[derive(Debug, Default)]
pub struct Traversal {
    /// The displayed cut: nodes whose refinement is actually applied
    pub selected: HashSet<u32>,
    /// Unresident nodes worth requesting, with their error as priority
    pub candidates: Vec<Candidate>,
    /// Nodes whose refinement was denied this pass; monotone within a pass
    pub blocked: HashSet<u32>,
    /// Every node reached by the pass (shared children deduplicated)
    pub visited: HashSet<u32>,
    /// Error computed for each node this pass; 0.0 = not computed
    pub errors: Vec<f32>,
    /// Number of blocked pops before the pass ended
    pub blocked_count: usize,
}

/// Priority-driven DAG cut selection
pub struct TraversalScheduler {
    /// Refinement stops once a node's error drops to this level
    pub target_error: f32,
    /// Faces the selected cut may accumulate before expansion is denied
    pub draw_budget: u64,
    /// Hard stop after this many blocked pops, a safety valve for
    /// pathological expansion on very deep or wide graphs
    pub max_blocked: usize,
}

impl TraversalScheduler {
    pub fn new(target_error: f32, draw_budget: u64, max_blocked: usize) -> Self {
        Self { target_error, draw_budget, max_blocked }
    }

    /// Run one selection pass for the given view.
    ///
    /// Residency is read to decide expandability and written with every
    /// computed error so eviction ranking stays current across frames.
    pub fn traverse(
        &self,
        graph: &NodeGraph,
        view: &CameraView,
        residency: &mut ResidencyCache,
        target_error: f32,
    ) -> Traversal {
        let mut traversal = Traversal {
            errors: vec![0.0; graph.node_count()],
            ..Default::default()
        };
        let mut heap = BinaryHeap::new();

        for &root in graph.roots() {
            visit(graph, view, residency, &mut traversal, &mut heap, root);
        }

        let mut drawn_faces: u64 = 0;
        while traversal.blocked_count < self.max_blocked {
            let Some(element) = heap.pop() else { break };
            let id = element.id;

            if !residency.is_loaded(id) {
                traversal.candidates.push(Candidate { id, error: element.error });
            }

            // Refinement needs data to refine past, headroom in the draw
            // budget and an error still above the target.
            let expandable = element.error > target_error.max(self.target_error)
                && drawn_faces <= self.draw_budget
                && residency.is_loaded(id);
            let is_blocked = traversal.blocked.contains(&id) || !expandable;

            if is_blocked {
                traversal.blocked_count += 1;
            } else {
                traversal.selected.insert(id);
                drawn_faces += graph.node(id).face_count as u64;
            }

            for patch in graph.patches(id) {
                if graph.is_sink(patch.node) {
                    // Sink ends this node's edge list
                    break;
                }
                if is_blocked {
                    // Blocking propagates to children and is never retracted
                    // within a pass, even if they are reached independently.
                    traversal.blocked.insert(patch.node);
                }
                if !traversal.visited.contains(&patch.node) {
                    visit(graph, view, residency, &mut traversal, &mut heap, patch.node);
                }
            }
        }

        // Stale residents the camera moved away from still need a fresh
        // error so eviction ranks them fairly.
        for id in residency.loaded_ids() {
            if traversal.errors[id as usize] == 0.0 {
                let error = view.compute_error(graph.node(id));
                traversal.errors[id as usize] = error;
                residency.record_error(id, error);
            }
        }

        log::trace!(
            "traversal: {} selected, {} candidates, {} blocked",
            traversal.selected.len(),
            traversal.candidates.len(),
            traversal.blocked_count
        );
        traversal
    }
}

fn visit(
    graph: &NodeGraph,
    view: &CameraView,
    residency: &mut ResidencyCache,
    traversal: &mut Traversal,
    heap: &mut BinaryHeap<TraversalElement>,
    id: u32,
) {
    traversal.visited.insert(id);
    let error = view.compute_error(graph.node(id));
    traversal.errors[id as usize] = error;
    residency.record_error(id, error);
    heap.push(TraversalElement { id, error });
}

/// A contiguous triangle span of one node to draw at its own resolution
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawRange {
    pub node: u32,
    pub first_triangle: u32,
    pub triangle_count: u32,
}

/// Slice the selected cut into triangle ranges.
///
/// For each selected node, spans covered by a patch whose child is itself
/// selected are skipped (the child renders them at finer resolution);
/// everything else, sink spans included, is emitted. Adjacent kept spans
/// are merged.
pub fn draw_ranges(graph: &NodeGraph, selected: &HashSet<u32>) -> Vec<DrawRange> {
    let mut ranges = Vec::new();
    let mut ids: Vec<u32> = selected.iter().copied().collect();
    ids.sort_unstable();

    for id in ids {
        let mut start = 0u32;
        let mut cursor = 0u32;
        for patch in graph.patches(id) {
            let refined = !graph.is_sink(patch.node) && selected.contains(&patch.node);
            if refined {
                if cursor > start {
                    ranges.push(DrawRange {
                        node: id,
                        first_triangle: start,
                        triangle_count: cursor - start,
                    });
                }
                start = patch.triangle_offset;
            }
            cursor = patch.triangle_offset;
        }
        if cursor > start {
            ranges.push(DrawRange {
                node: id,
                first_triangle: start,
                triangle_count: cursor - start,
            });
        }
    }
    ranges
}
