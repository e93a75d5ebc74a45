//! Immutable multiresolution DAG description
//!
//! A `NodeGraph` is loaded once from the header and record tables of an
//! asset file and never mutated afterwards; all streaming state lives in
//! `stream`. Nodes form a DAG, not a tree: several parents may share a
//! child, and the last node index is the reserved sink marking "no further
//! refinement".

pub mod format;

pub use format::{
    Attribute, Codec, Header, NodeRecord, PatchRecord, Signature, TextureRecord,
    HEADER_SIZE, MAGIC, NO_TEXTURE, NODE_RECORD_SIZE, PATCH_RECORD_SIZE, PAYLOAD_PADDING,
    TEXTURE_RECORD_SIZE,
};

use crate::core::error::Error;
use crate::core::types::Result;

/// Immutable DAG of precomputed detail levels
pub struct NodeGraph {
    header: Header,
    nodes: Vec<NodeRecord>,
    patches: Vec<PatchRecord>,
    textures: Vec<TextureRecord>,
    roots: Vec<u32>,
}

impl NodeGraph {
    /// Parse the header and record tables from the start of an asset file.
    ///
    /// `buf` must cover at least the header and the three record tables;
    /// node payloads beyond them are read lazily by the decode pipeline.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let header = format::parse_header(buf)?;

        let mut cursor = HEADER_SIZE;
        let nodes: Vec<NodeRecord> = format::parse_records(
            &buf[cursor..],
            header.node_count as usize,
            NODE_RECORD_SIZE,
        )?;
        cursor += header.node_count as usize * NODE_RECORD_SIZE;

        let patches: Vec<PatchRecord> = format::parse_records(
            &buf[cursor..],
            header.patch_count as usize,
            PATCH_RECORD_SIZE,
        )?;
        cursor += header.patch_count as usize * PATCH_RECORD_SIZE;

        let textures: Vec<TextureRecord> = format::parse_records(
            &buf[cursor..],
            header.texture_count as usize,
            TEXTURE_RECORD_SIZE,
        )?;

        Self::new(header, nodes, patches, textures)
    }

    /// Build a graph from already-parsed tables, validating DAG structure
    pub fn new(
        header: Header,
        nodes: Vec<NodeRecord>,
        patches: Vec<PatchRecord>,
        textures: Vec<TextureRecord>,
    ) -> Result<Self> {
        if nodes.len() != header.node_count as usize {
            return Err(Error::Parse(format!(
                "node table length {} does not match header count {}",
                nodes.len(),
                header.node_count
            )));
        }
        if nodes.is_empty() {
            return Err(Error::Parse("node table is empty".into()));
        }
        let sink = nodes.len() as u32 - 1;

        // Patch ranges must be monotone and stay inside the patch table
        for id in 0..nodes.len() - 1 {
            let begin = nodes[id].first_patch;
            let end = nodes[id + 1].first_patch;
            if begin > end || end as usize > patches.len() {
                return Err(Error::Parse(format!(
                    "node {id} has invalid patch range [{begin}, {end})"
                )));
            }
        }
        for (i, patch) in patches.iter().enumerate() {
            if patch.node > sink {
                return Err(Error::Parse(format!(
                    "patch {i} targets node {} beyond the sink {sink}",
                    patch.node
                )));
            }
        }

        let roots = compute_roots(&nodes, &patches);
        log::info!(
            "loaded graph: {} nodes, {} patches, {} textures, {} roots",
            nodes.len(),
            patches.len(),
            textures.len(),
            roots.len()
        );

        Ok(Self { header, nodes, patches, textures, roots })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn signature(&self) -> &Signature {
        &self.header.signature
    }

    /// Number of node records, sink included
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Reserved terminal node index
    pub fn sink(&self) -> u32 {
        self.nodes.len() as u32 - 1
    }

    pub fn is_sink(&self, id: u32) -> bool {
        id == self.sink()
    }

    pub fn node(&self, id: u32) -> &NodeRecord {
        &self.nodes[id as usize]
    }

    /// Out-edges of a node: the record slice [first_patch, next.first_patch)
    pub fn patches(&self, id: u32) -> &[PatchRecord] {
        let begin = self.nodes[id as usize].first_patch as usize;
        let end = self.nodes[id as usize + 1].first_patch as usize;
        &self.patches[begin..end]
    }

    /// Texture table lookup for a patch's texture id; `None` for
    /// `NO_TEXTURE` and out-of-range ids
    pub fn texture(&self, id: u32) -> Option<&TextureRecord> {
        self.textures.get(id as usize)
    }

    /// Nodes never referenced as a patch child
    pub fn roots(&self) -> &[u32] {
        &self.roots
    }

    /// Byte span of a node's compressed payload in the file
    pub fn payload_span(&self, id: u32) -> (u64, u64) {
        let begin = self.nodes[id as usize].begin_offset();
        let end = self.nodes[id as usize + 1].begin_offset();
        (begin, end - begin)
    }

    /// Size a node's payload occupies once resident, in bytes
    pub fn node_size(&self, id: u32) -> u64 {
        let (_, len) = self.payload_span(id);
        len
    }
}

/// Scan every patch and drop any targeted id from the root candidates.
/// The sink is never a root: it is a terminal marker, not a detail level.
fn compute_roots(nodes: &[NodeRecord], patches: &[PatchRecord]) -> Vec<u32> {
    let sink = nodes.len() as u32 - 1;
    let mut is_root = vec![true; sink as usize];
    for patch in patches {
        if patch.node < sink {
            is_root[patch.node as usize] = false;
        }
    }
    is_root
        .iter()
        .enumerate()
        .filter_map(|(id, &root)| root.then_some(id as u32))
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;

    #[test]
    fn test_shared_child_has_two_roots() {
        // Nodes 0 and 1 each point at shared child 2; node 2 refines to the
        // sink (index 3).
        let graph = test_graph::build(&[
            ([0.0, 0.0, 0.0, 1.0], 5.0, &[2]),
            ([2.0, 0.0, 0.0, 1.0], 5.0, &[2]),
            ([1.0, 0.0, 0.0, 2.0], 1.0, &[]),
        ]);

        assert_eq!(graph.node_count(), 4);
        assert_eq!(graph.sink(), 3);
        assert_eq!(graph.roots(), &[0, 1]);
    }

    #[test]
    fn test_patch_ranges() {
        let graph = test_graph::build(&[
            ([0.0, 0.0, 0.0, 1.0], 5.0, &[1, 2]),
            ([0.0, 0.0, 0.0, 1.0], 2.0, &[]),
            ([0.0, 0.0, 0.0, 1.0], 2.0, &[]),
        ]);

        assert_eq!(graph.patches(0).len(), 2);
        assert_eq!(graph.patches(0)[0].node, 1);
        assert_eq!(graph.patches(0)[1].node, 2);
        assert_eq!(graph.patches(1).len(), 1);
        assert_eq!(graph.patches(1)[0].node, graph.sink());
    }

    #[test]
    fn test_from_bytes_roundtrip() {
        let source = test_graph::build(&[
            ([0.0, 0.0, 0.0, 1.0], 5.0, &[1]),
            ([0.0, 0.0, 0.0, 1.0], 2.0, &[]),
        ]);

        let mut buf = Vec::new();
        buf.extend_from_slice(bytemuck::bytes_of(source.header()));
        for id in 0..source.node_count() as u32 {
            buf.extend_from_slice(bytemuck::bytes_of(source.node(id)));
        }
        for id in 0..source.node_count() as u32 - 1 {
            for patch in source.patches(id) {
                buf.extend_from_slice(bytemuck::bytes_of(patch));
            }
        }

        let parsed = NodeGraph::from_bytes(&buf).unwrap();
        assert_eq!(parsed.node_count(), source.node_count());
        assert_eq!(parsed.roots(), source.roots());
        assert_eq!(parsed.patches(0)[0].node, 1);
    }

    #[test]
    fn test_from_bytes_truncated_tables() {
        let source = test_graph::build(&[([0.0, 0.0, 0.0, 1.0], 5.0, &[])]);
        let mut buf = Vec::new();
        buf.extend_from_slice(bytemuck::bytes_of(source.header()));
        // Only half a node record follows the header
        buf.extend_from_slice(&[0u8; NODE_RECORD_SIZE / 2]);
        assert!(NodeGraph::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_invalid_patch_target_rejected() {
        let mut header = Header::zeroed();
        header.magic = MAGIC;
        header.node_count = 2;
        header.patch_count = 1;
        let mut node = NodeRecord::zeroed();
        node.first_patch = 0;
        let mut sink = NodeRecord::zeroed();
        sink.first_patch = 1;
        let patches = vec![PatchRecord { node: 9, triangle_offset: 0, texture: NO_TEXTURE }];
        assert!(NodeGraph::new(header, vec![node, sink], patches, Vec::new()).is_err());
    }

    #[test]
    fn test_texture_lookup_is_checked() {
        let mut header = Header::zeroed();
        header.magic = MAGIC;
        header.node_count = 2;
        header.patch_count = 1;
        header.texture_count = 1;
        let mut node = NodeRecord::zeroed();
        node.first_patch = 0;
        let mut sink = NodeRecord::zeroed();
        sink.first_patch = 1;
        let patches = vec![PatchRecord { node: 1, triangle_offset: 10, texture: 0 }];
        let mut texture = TextureRecord::zeroed();
        texture.offset = 7;
        let graph =
            NodeGraph::new(header, vec![node, sink], patches, vec![texture]).unwrap();

        // A patch's texture id resolves through the table
        let id = graph.patches(0)[0].texture;
        assert_eq!(graph.texture(id).unwrap().offset, 7);
        assert!(graph.texture(NO_TEXTURE).is_none());
        assert!(graph.texture(1).is_none());
    }

    #[test]
    fn test_payload_spans_are_contiguous() {
        let graph = test_graph::build(&[
            ([0.0, 0.0, 0.0, 1.0], 5.0, &[1]),
            ([0.0, 0.0, 0.0, 1.0], 2.0, &[]),
        ]);
        let (begin0, len0) = graph.payload_span(0);
        let (begin1, _) = graph.payload_span(1);
        assert_eq!(begin0 + len0, begin1);
        assert_eq!(graph.node_size(0), PAYLOAD_PADDING);
    }
}
