//! Frame-driven streaming orchestration
//!
//! `Streamer` owns the graph, the residency cache and the decode pipeline
//! and advances them once per frame: adapt the error target to frame time,
//! select the cut, request the most urgent missing nodes, absorb finished
//! decodes and evict what the budget no longer affords.

use std::path::Path;
use std::sync::Arc;

use crate::core::camera::Camera;
use crate::core::error::Error;
use crate::core::types::Result;
use crate::graph::NodeGraph;
use crate::stream::decode::{
    DecodeJob, DecodePipeline, DecodeResult, FilePayloadSource, NodeData, PayloadSource,
};
use crate::stream::metric::CameraView;
use crate::stream::residency::ResidencyCache;
use crate::stream::traversal::{draw_ranges, DrawRange, TraversalScheduler};

/// Streaming tuning knobs
#[derive(Clone, Copy, Debug)]
pub struct StreamConfig {
    /// Error target the adaptive controller relaxes toward under load
    pub target_error: f32,
    /// Ceiling for the adaptive error under sustained overload
    pub max_error: f32,
    /// Faces the selected cut may accumulate per frame
    pub draw_budget_faces: u64,
    /// Traversal stops after this many blocked pops
    pub max_blocked_nodes: usize,
    /// Resident payload byte budget
    pub cache_budget_bytes: u64,
    /// In-flight decode window
    pub max_pending: usize,
    /// Frame rate the adaptive controller defends
    pub target_fps: f32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            target_error: 2.0,
            max_error: 20.0,
            draw_budget_faces: 5_000_000,
            max_blocked_nodes: 30,
            cache_budget_bytes: 512 << 20,
            max_pending: 16,
            target_fps: 30.0,
        }
    }
}

/// Everything one `update` call changed, for the renderer to apply
#[derive(Debug, Default)]
pub struct FrameUpdate {
    /// The displayed cut, sorted by node id
    pub selected: Vec<u32>,
    /// Triangle ranges to draw for the cut
    pub draw_ranges: Vec<DrawRange>,
    /// Nodes that finished decoding this frame
    pub loaded: Vec<u32>,
    /// Nodes whose decode failed this frame
    pub failed: Vec<u32>,
    /// Nodes evicted to make room
    pub evicted: Vec<u32>,
    /// Nodes handed to the decode pipeline this frame
    pub requested: Vec<u32>,
    /// Blocked pops in this frame's traversal
    pub blocked_count: usize,
    /// Error target used for this frame's selection
    pub current_error: f32,
}

pub struct Streamer {
    graph: NodeGraph,
    config: StreamConfig,
    scheduler: TraversalScheduler,
    cache: ResidencyCache,
    pipeline: DecodePipeline,
    current_error: f32,
}

impl Streamer {
    pub fn new(
        graph: NodeGraph,
        source: Arc<dyn PayloadSource>,
        config: StreamConfig,
    ) -> Result<Self> {
        let scheduler = TraversalScheduler::new(
            config.target_error,
            config.draw_budget_faces,
            config.max_blocked_nodes,
        );
        let cache = ResidencyCache::new(
            graph.node_count(),
            config.cache_budget_bytes,
            config.max_pending,
        );
        let pipeline = DecodePipeline::new(source, *graph.signature())?;
        Ok(Self {
            graph,
            config,
            scheduler,
            cache,
            pipeline,
            current_error: config.target_error,
        })
    }

    /// Open an asset file: parse the header and record tables, keep the
    /// file as the payload source.
    pub fn open(path: &Path, config: StreamConfig) -> Result<Self> {
        use std::io::Read;

        let mut file = std::fs::File::open(path).map_err(Error::Io)?;
        let mut head = [0u8; crate::graph::HEADER_SIZE];
        file.read_exact(&mut head).map_err(Error::Io)?;
        let header = crate::graph::format::parse_header(&head)?;

        let tables = header.node_count as usize * crate::graph::NODE_RECORD_SIZE
            + header.patch_count as usize * crate::graph::PATCH_RECORD_SIZE
            + header.texture_count as usize * crate::graph::TEXTURE_RECORD_SIZE;
        let mut buf = vec![0u8; crate::graph::HEADER_SIZE + tables];
        buf[..crate::graph::HEADER_SIZE].copy_from_slice(&head);
        file.read_exact(&mut buf[crate::graph::HEADER_SIZE..])
            .map_err(Error::Io)?;
        drop(file);

        let graph = NodeGraph::from_bytes(&buf)?;
        let source = Arc::new(FilePayloadSource::open(path).map_err(Error::Io)?);
        Self::new(graph, source, config)
    }

    /// Advance streaming by one frame.
    ///
    /// `dt_seconds` is the previous frame's duration and drives the
    /// adaptive error controller.
    pub fn update(&mut self, camera: &Camera, viewport_width: u32, dt_seconds: f32) -> FrameUpdate {
        self.adapt_error(dt_seconds);

        let view = CameraView::new(camera, viewport_width);
        self.cache.begin_frame();
        let traversal =
            self.scheduler
                .traverse(&self.graph, &view, &mut self.cache, self.current_error);
        for candidate in &traversal.candidates {
            self.cache.add_candidate(*candidate);
        }

        let mut update = FrameUpdate {
            blocked_count: traversal.blocked_count,
            current_error: self.current_error,
            ..Default::default()
        };

        // Absorb finished decodes before admitting new work so freshly
        // loaded nodes count against the budget.
        for result in self.pipeline.poll_completed() {
            match result {
                DecodeResult::Decoded { node, data } => {
                    self.cache.mark_loaded(node, data, self.graph.node_size(node));
                    update.loaded.push(node);
                }
                DecodeResult::Failed { node, error } => {
                    log::warn!("node {node} failed to load: {error}");
                    self.cache.mark_failed(node);
                    update.failed.push(node);
                }
            }
        }

        // Admit the most urgent missing nodes, evicting colder residents
        // to stay near the budget.
        while let Some(request) = self.cache.next_request() {
            update
                .evicted
                .extend(self.cache.evict_if_over_budget(request.error));
            let node = self.graph.node(request.id);
            let (offset, len) = self.graph.payload_span(request.id);
            let job = DecodeJob {
                node: request.id,
                offset,
                len,
                vertex_count: node.vertex_count,
                face_count: node.face_count,
            };
            if !self.pipeline.submit(job) {
                // Queue full; the candidate stays urgent next frame
                break;
            }
            self.cache.mark_pending(request.id);
            update.requested.push(request.id);
        }
        update
            .evicted
            .extend(self.cache.evict_if_over_budget(self.cache.best_candidate_error()));

        // Eviction may have reclaimed nodes traversal already picked; the
        // cut handed to the host must reference resident payloads only.
        let mut selected = traversal.selected;
        for id in &update.evicted {
            selected.remove(id);
        }
        update.draw_ranges = draw_ranges(&self.graph, &selected);
        update.selected = selected.into_iter().collect();
        update.selected.sort_unstable();
        update
    }

    /// Trade detail for frame rate: relax the error target when frames run
    /// long, tighten it back toward the configured target when there is
    /// headroom.
    fn adapt_error(&mut self, dt_seconds: f32) {
        if dt_seconds <= 0.0 {
            return;
        }
        let ratio = dt_seconds * self.config.target_fps;
        if ratio > 1.1 {
            self.current_error *= 1.05;
        } else if ratio < 0.9 {
            self.current_error *= 0.95;
        }
        self.current_error = self
            .current_error
            .clamp(self.config.target_error, self.config.max_error);
    }

    /// Drop every resident and pending node. In-flight decodes finish in
    /// the background and are discarded on arrival.
    pub fn flush(&mut self) {
        self.cache.flush();
    }

    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    pub fn payload(&self, id: u32) -> Option<&NodeData> {
        self.cache.payload(id)
    }

    pub fn resident_bytes(&self) -> u64 {
        self.cache.resident_bytes()
    }

    pub fn current_error(&self) -> f32 {
        self.current_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Vec3;
    use crate::graph::{
        Header, NodeRecord, PatchRecord, Signature, HEADER_SIZE, MAGIC, NO_TEXTURE,
        PAYLOAD_PADDING,
    };
    use bytemuck::Zeroable;
    use std::io::Write;
    use std::time::Duration;

    /// Serialize a linear chain asset, one node per stored error ending in
    /// the sink, with payloads starting at the first padding boundary after
    /// the tables. Every node shares a unit sphere at the origin so
    /// computed errors order the same way as the stored ones.
    fn write_chain_asset(errors: &[f32]) -> tempfile::NamedTempFile {
        let signature = Signature::mesh(false, false, false, true, 0);
        let vertex_count = 4u16;
        let face_count = 2u16;
        let count = errors.len();

        let table_bytes = HEADER_SIZE + (count + 1) * 44 + count * 12;
        let first_unit = table_bytes.div_ceil(PAYLOAD_PADDING as usize) as u32;

        let mut nodes = Vec::new();
        let mut patches = Vec::new();
        for (i, &error) in errors.iter().enumerate() {
            let mut node = NodeRecord::zeroed();
            node.sphere = [0.0, 0.0, 0.0, 1.0];
            node.tight_radius = 1.0;
            node.error = error;
            node.vertex_count = vertex_count;
            node.face_count = face_count;
            node.offset = first_unit + i as u32;
            node.first_patch = i as u32;
            nodes.push(node);
            // The last node's patch targets the sink
            patches.push(PatchRecord {
                node: i as u32 + 1,
                triangle_offset: 2,
                texture: NO_TEXTURE,
            });
        }
        let mut sink = NodeRecord::zeroed();
        sink.offset = first_unit + count as u32;
        sink.first_patch = count as u32;
        nodes.push(sink);

        let mut header = Header::zeroed();
        header.magic = MAGIC;
        header.signature = signature;
        header.node_count = nodes.len() as u32;
        header.patch_count = patches.len() as u32;

        let mut buf = Vec::new();
        buf.extend_from_slice(bytemuck::bytes_of(&header));
        for node in &nodes {
            buf.extend_from_slice(bytemuck::bytes_of(node));
        }
        for patch in &patches {
            buf.extend_from_slice(bytemuck::bytes_of(patch));
        }
        assert_eq!(buf.len(), table_bytes);

        // One padding unit of geometry per node
        buf.resize(first_unit as usize * PAYLOAD_PADDING as usize, 0);
        for _ in 0..count {
            for i in 0..vertex_count as u32 {
                buf.extend_from_slice(bytemuck::bytes_of(&[i as f32, 0.0, 0.0]));
            }
            for i in 0..face_count {
                buf.extend_from_slice(bytemuck::bytes_of(&[i, i + 1, i + 2]));
            }
            buf.resize(buf.len().div_ceil(PAYLOAD_PADDING as usize) * PAYLOAD_PADDING as usize, 0);
        }

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&buf).unwrap();
        file.flush().unwrap();
        file
    }

    fn config() -> StreamConfig {
        StreamConfig {
            target_error: 0.001,
            max_error: 0.001,
            ..StreamConfig::default()
        }
    }

    fn camera() -> Camera {
        Camera::look_at(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y)
    }

    /// Run updates until `done` holds or the deadline passes
    fn settle(
        streamer: &mut Streamer,
        done: impl Fn(&Streamer) -> bool,
    ) -> FrameUpdate {
        let camera = camera();
        let mut last = FrameUpdate::default();
        for _ in 0..200 {
            last = streamer.update(&camera, 1920, 1.0 / 30.0);
            if done(streamer) {
                return last;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        last
    }

    #[test]
    fn test_streams_root_then_child_to_full_detail() {
        let file = write_chain_asset(&[5.0, 1.0]);
        let mut streamer = Streamer::open(file.path(), config()).unwrap();
        assert_eq!(streamer.graph().roots(), &[0]);

        // First frame: nothing resident; the root is requested first and
        // the blocked frontier prefetches the child behind it
        let first = streamer.update(&camera(), 1920, 1.0 / 30.0);
        assert_eq!(first.requested, vec![0, 1]);
        assert!(first.selected.is_empty());
        assert!(first.draw_ranges.is_empty());

        settle(&mut streamer, |s| {
            s.payload(0).is_some() && s.payload(1).is_some()
        });
        assert!(streamer.payload(0).is_some());
        assert!(streamer.payload(1).is_some());
        assert_eq!(streamer.payload(0).unwrap().positions.len(), 4);

        // Selection runs before completions are absorbed, so the refined
        // cut shows up on the following frame
        let last = streamer.update(&camera(), 1920, 1.0 / 30.0);
        assert_eq!(last.selected, vec![0, 1]);
        // The root's only span is refined away; the child draws its faces
        assert_eq!(last.draw_ranges.len(), 1);
        assert_eq!(last.draw_ranges[0].node, 1);
        assert_eq!(last.draw_ranges[0].triangle_count, 2);
    }

    #[test]
    fn test_flush_forgets_residents() {
        let file = write_chain_asset(&[5.0, 1.0]);
        let mut streamer = Streamer::open(file.path(), config()).unwrap();
        settle(&mut streamer, |s| s.payload(0).is_some());

        streamer.flush();
        assert!(streamer.payload(0).is_none());
        assert_eq!(streamer.resident_bytes(), 0);

        // Streaming restarts from the root
        let next = settle(&mut streamer, |s| s.payload(0).is_some());
        assert!(streamer.payload(0).is_some() || !next.requested.is_empty());
    }

    #[test]
    fn test_open_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a mesh file at all").unwrap();
        file.flush().unwrap();
        assert!(Streamer::open(file.path(), StreamConfig::default()).is_err());
    }

    #[test]
    fn test_adaptive_error_relaxes_and_recovers() {
        let file = write_chain_asset(&[5.0, 1.0]);
        let config = StreamConfig {
            target_error: 2.0,
            max_error: 4.0,
            ..StreamConfig::default()
        };
        let mut streamer = Streamer::open(file.path(), config).unwrap();
        assert_eq!(streamer.current_error(), 2.0);

        // Slow frames walk the target up to the ceiling
        for _ in 0..100 {
            streamer.update(&camera(), 1920, 0.1);
        }
        assert_eq!(streamer.current_error(), 4.0);

        // Fast frames bring it back down to the configured target
        for _ in 0..100 {
            streamer.update(&camera(), 1920, 0.001);
        }
        assert_eq!(streamer.current_error(), 2.0);
    }

    #[test]
    fn test_steady_frames_leave_error_untouched() {
        let file = write_chain_asset(&[5.0, 1.0]);
        let mut streamer = Streamer::open(file.path(), StreamConfig::default()).unwrap();
        let before = streamer.current_error();
        streamer.update(&camera(), 1920, 1.0 / 30.0);
        assert_eq!(streamer.current_error(), before);
    }

    #[test]
    fn test_evicted_nodes_leave_the_reported_cut() {
        // Chain with a hot grandchild: the traversal stop keeps node 2
        // unseen until node 1 is resident, so nodes 0 and 1 fill the
        // one-node budget first. The frame that discovers node 2 selects
        // node 1 and then evicts it to admit the far hotter node 2; the
        // reported cut must not reference the evicted payload.
        let file = write_chain_asset(&[100.0, 90.0, 200.0]);
        let config = StreamConfig {
            target_error: 0.001,
            max_error: 0.001,
            max_blocked_nodes: 1,
            cache_budget_bytes: 256,
            max_pending: 4,
            ..StreamConfig::default()
        };
        let mut streamer = Streamer::open(file.path(), config).unwrap();

        settle(&mut streamer, |s| s.payload(0).is_some());
        settle(&mut streamer, |s| s.payload(1).is_some());

        let frame = streamer.update(&camera(), 1920, 1.0 / 30.0);
        assert_eq!(frame.evicted, vec![1]);
        assert_eq!(frame.requested, vec![2]);
        assert!(streamer.payload(1).is_none());

        // Node 0 survives eviction and still draws; node 1 is gone from
        // both the selected set and the draw ranges
        assert!(frame.selected.contains(&0));
        assert!(!frame.selected.contains(&1));
        assert!(frame.draw_ranges.iter().all(|r| r.node != 1));
        assert!(frame.draw_ranges.iter().any(|r| r.node == 0));
    }
}
