//! Background payload reading and decoding
//!
//! Payload I/O and decompression run on a dedicated runtime so the frame
//! driver never blocks. Jobs go in over a bounded channel, decoded nodes
//! come back out, and the driver drains completions once per frame.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

use crate::core::error::Error;
use crate::core::types::{Result, Vec3};
use crate::graph::{Codec, Signature};

/// Where node payload bytes come from.
///
/// Reads happen on the decode runtime; implementations must tolerate
/// concurrent calls.
pub trait PayloadSource: Send + Sync + 'static {
    fn read_span(&self, offset: u64, len: u64) -> std::io::Result<Vec<u8>>;
}

/// Payload source backed by a single asset file
pub struct FilePayloadSource {
    file: Mutex<File>,
}

impl FilePayloadSource {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        Ok(Self { file: Mutex::new(File::open(path)?) })
    }
}

impl PayloadSource for FilePayloadSource {
    fn read_span(&self, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
        let mut file = self.file.lock().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::Other, "payload file lock poisoned")
        })?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Decoded geometry of one node, ready for upload
#[derive(Clone, Debug, Default)]
pub struct NodeData {
    pub positions: Vec<Vec3>,
    pub normals: Option<Vec<[i16; 3]>>,
    pub colors: Option<Vec<[u8; 4]>>,
    pub uvs: Option<Vec<[f32; 2]>>,
    pub faces: Option<Vec<[u16; 3]>>,
}

/// One node's decode work order
#[derive(Clone, Copy, Debug)]
pub struct DecodeJob {
    pub node: u32,
    /// Byte offset of the payload in the source
    pub offset: u64,
    /// Padded byte length of the payload span
    pub len: u64,
    pub vertex_count: u16,
    pub face_count: u16,
}

/// Outcome of one decode job
#[derive(Debug)]
pub enum DecodeResult {
    Decoded { node: u32, data: NodeData },
    Failed { node: u32, error: Error },
}

/// Decode a raw payload span into geometry arrays.
///
/// The decoded layout is fixed: positions, then normals, colors, uvs and
/// face indices, each present only if the signature says so. LZ4 payloads
/// carry a little-endian u32 compressed length first, since the span is
/// padded and the block codec needs an exact input slice.
pub fn decode_payload(
    signature: &Signature,
    node: u32,
    vertex_count: u16,
    face_count: u16,
    bytes: &[u8],
) -> Result<NodeData> {
    let decoded_size = vertex_count as usize * signature.vertex_size()
        + face_count as usize * signature.face_size();

    let decoded: Vec<u8>;
    let payload = match signature.codec()? {
        Codec::None => {
            if bytes.len() < decoded_size {
                return Err(decode_error(node, format!(
                    "payload is {} bytes, layout needs {decoded_size}",
                    bytes.len()
                )));
            }
            &bytes[..decoded_size]
        }
        Codec::Lz4 => {
            if bytes.len() < 4 {
                return Err(decode_error(node, "payload too short for length prefix".into()));
            }
            let compressed_len =
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
            let end = 4 + compressed_len;
            if bytes.len() < end {
                return Err(decode_error(node, format!(
                    "compressed length {compressed_len} exceeds span of {} bytes",
                    bytes.len() - 4
                )));
            }
            decoded = lz4_flex::block::decompress(&bytes[4..end], decoded_size)
                .map_err(|e| decode_error(node, e.to_string()))?;
            if decoded.len() != decoded_size {
                return Err(decode_error(node, format!(
                    "decompressed to {} bytes, layout needs {decoded_size}",
                    decoded.len()
                )));
            }
            &decoded[..]
        }
    };

    // The decoded arrays assume the conventional attribute types; reject
    // exotic signatures instead of misreinterpreting their bytes.
    use crate::graph::format::{face_slot, vertex_slot};
    let sizes = [
        (signature.vertex[vertex_slot::POSITION].size(), 12),
        (signature.vertex[vertex_slot::NORMAL].size(), if signature.has_normals() { 6 } else { 0 }),
        (signature.vertex[vertex_slot::COLOR].size(), if signature.has_colors() { 4 } else { 0 }),
        (signature.vertex[vertex_slot::UV].size(), if signature.has_uvs() { 8 } else { 0 }),
        (signature.face[face_slot::INDEX].size(), if signature.has_indices() { 6 } else { 0 }),
    ];
    if sizes.iter().any(|(actual, expected)| actual != expected) {
        return Err(decode_error(node, "unsupported attribute layout".into()));
    }

    fn take<'a>(payload: &'a [u8], cursor: &mut usize, bytes: usize) -> &'a [u8] {
        let slice = &payload[*cursor..*cursor + bytes];
        *cursor += bytes;
        slice
    }

    let n = vertex_count as usize;
    let mut cursor = 0usize;
    let positions: Vec<Vec3> = bytemuck::pod_collect_to_vec(take(payload, &mut cursor, 12 * n));
    let normals = signature
        .has_normals()
        .then(|| bytemuck::pod_collect_to_vec(take(payload, &mut cursor, 6 * n)));
    let colors = signature
        .has_colors()
        .then(|| bytemuck::pod_collect_to_vec(take(payload, &mut cursor, 4 * n)));
    let uvs = signature
        .has_uvs()
        .then(|| bytemuck::pod_collect_to_vec(take(payload, &mut cursor, 8 * n)));
    let faces = signature
        .has_indices()
        .then(|| bytemuck::pod_collect_to_vec(take(payload, &mut cursor, 6 * face_count as usize)));

    let mut data = NodeData { positions, normals, colors, uvs, faces };
    if !signature.has_indices() {
        shuffle_vertices(&mut data, node);
    }
    Ok(data)
}

fn decode_error(node: u32, reason: String) -> Error {
    Error::Decode { node, reason }
}

/// Point-cloud payloads are stored in spatial order; drawing a vertex
/// prefix of that order would reveal one region at a time. A shuffle seeded
/// by the node id makes prefixes uniform and stays reproducible across
/// runs.
fn shuffle_vertices(data: &mut NodeData, node: u32) {
    let mut rng = SmallRng::seed_from_u64(node as u64);
    let mut order: Vec<usize> = (0..data.positions.len()).collect();
    order.shuffle(&mut rng);

    fn reorder<T: Copy>(values: &mut Vec<T>, order: &[usize]) {
        *values = order.iter().map(|&i| values[i]).collect();
    }
    reorder(&mut data.positions, &order);
    if let Some(normals) = &mut data.normals {
        reorder(normals, &order);
    }
    if let Some(colors) = &mut data.colors {
        reorder(colors, &order);
    }
    if let Some(uvs) = &mut data.uvs {
        reorder(uvs, &order);
    }
}

/// Queue depth for jobs and results. Deeper than the residency pending
/// window so submission never stalls on a full channel.
const CHANNEL_DEPTH: usize = 64;

/// How long the worker sleeps on an empty queue before rechecking stop
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Background decode worker on its own runtime
pub struct DecodePipeline {
    job_tx: mpsc::Sender<DecodeJob>,
    result_rx: mpsc::Receiver<DecodeResult>,
    stop: Arc<AtomicBool>,
    runtime: Option<Runtime>,
}

impl DecodePipeline {
    pub fn new(source: Arc<dyn PayloadSource>, signature: Signature) -> Result<Self> {
        let (job_tx, job_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (result_tx, result_rx) = mpsc::channel(CHANNEL_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(Error::Io)?;

        let worker_stop = Arc::clone(&stop);
        runtime.spawn(async move {
            worker_loop(source, signature, job_rx, result_tx, worker_stop).await;
        });

        Ok(Self { job_tx, result_rx, stop, runtime: Some(runtime) })
    }

    /// Hand a job to the worker. Returns false when the queue is full;
    /// the caller retries on a later frame.
    pub fn submit(&self, job: DecodeJob) -> bool {
        self.job_tx.try_send(job).is_ok()
    }

    /// Drain every completed decode without blocking
    pub fn poll_completed(&mut self) -> Vec<DecodeResult> {
        let mut results = Vec::new();
        while let Ok(result) = self.result_rx.try_recv() {
            results.push(result);
        }
        results
    }
}

impl Drop for DecodePipeline {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }
}

async fn worker_loop(
    source: Arc<dyn PayloadSource>,
    signature: Signature,
    mut job_rx: mpsc::Receiver<DecodeJob>,
    result_tx: mpsc::Sender<DecodeResult>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        let job = match tokio::time::timeout(IDLE_WAIT, job_rx.recv()).await {
            Ok(Some(job)) => job,
            // Channel closed: the pipeline was dropped
            Ok(None) => break,
            // Periodic wake to observe the stop flag
            Err(_) => continue,
        };

        // Drain the whole backlog before sleeping again
        let mut batch = vec![job];
        while let Ok(job) = job_rx.try_recv() {
            batch.push(job);
        }
        for job in batch {
            let result = run_job(&*source, &signature, job);
            if result_tx.send(result).await.is_err() {
                return;
            }
        }
    }
}

fn run_job(source: &dyn PayloadSource, signature: &Signature, job: DecodeJob) -> DecodeResult {
    let bytes = match source.read_span(job.offset, job.len) {
        Ok(bytes) => bytes,
        Err(e) => {
            return DecodeResult::Failed { node: job.node, error: Error::Io(e) };
        }
    };
    match decode_payload(signature, job.node, job.vertex_count, job.face_count, &bytes) {
        Ok(data) => {
            log::trace!("decoded node {}: {} vertices", job.node, data.positions.len());
            DecodeResult::Decoded { node: job.node, data }
        }
        Err(error) => {
            log::warn!("decode failed for node {}: {error}", job.node);
            DecodeResult::Failed { node: job.node, error }
        }
    }
}
