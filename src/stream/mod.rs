//! View-dependent streaming: traversal, decode pipeline and residency cache

pub mod decode;
pub mod metric;
pub mod residency;
pub mod streamer;
pub mod traversal;

pub use decode::{DecodeJob, DecodePipeline, DecodeResult, FilePayloadSource, NodeData, PayloadSource};
pub use metric::{CameraView, DISTANCE_EPSILON, OUTER_NODE_FACTOR};
pub use residency::{Candidate, NodeStatus, ResidencyCache};
pub use streamer::{FrameUpdate, StreamConfig, Streamer};
pub use traversal::{draw_ranges, DrawRange, Traversal, TraversalScheduler};
