//! Binary layout of multiresolution mesh files
//!
//! The on-disk format is a fixed 88-byte little-endian header followed by
//! flat node, patch and texture record tables, then the compressed per-node
//! payloads. Record layouts are byte-exact: existing asset files must parse
//! unchanged.

use bytemuck::{Pod, Zeroable};

use crate::core::error::Error;
use crate::core::types::Result;

/// File magic, "Nxs " read as a little-endian u32
pub const MAGIC: u32 = 0x4E78_7320;

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 88;

/// Node record size in bytes
pub const NODE_RECORD_SIZE: usize = 44;

/// Patch record size in bytes
pub const PATCH_RECORD_SIZE: usize = 12;

/// Texture record size in bytes
pub const TEXTURE_RECORD_SIZE: usize = 68;

/// Node payload offsets are stored in units of this padding
pub const PAYLOAD_PADDING: u64 = 256;

/// Patch texture id meaning "no texture"
pub const NO_TEXTURE: u32 = 0xFFFF_FFFF;

/// One vertex or face attribute: scalar type code plus component count.
/// A zero count means the attribute is absent.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Attribute {
    pub kind: u8,
    pub count: u8,
}

impl Attribute {
    pub const NONE: u8 = 0;
    pub const BYTE: u8 = 1;
    pub const UNSIGNED_BYTE: u8 = 2;
    pub const SHORT: u8 = 3;
    pub const UNSIGNED_SHORT: u8 = 4;
    pub const INT: u8 = 5;
    pub const UNSIGNED_INT: u8 = 6;
    pub const FLOAT: u8 = 7;
    pub const DOUBLE: u8 = 8;

    pub fn is_present(&self) -> bool {
        self.count > 0
    }

    /// Byte size of one element of this attribute
    pub fn size(&self) -> usize {
        let scalar = match self.kind {
            Self::BYTE | Self::UNSIGNED_BYTE => 1,
            Self::SHORT | Self::UNSIGNED_SHORT => 2,
            Self::INT | Self::UNSIGNED_INT | Self::FLOAT => 4,
            Self::DOUBLE => 8,
            _ => 0,
        };
        scalar * self.count as usize
    }
}

/// Well-known vertex attribute slots
pub mod vertex_slot {
    pub const POSITION: usize = 0;
    pub const NORMAL: usize = 1;
    pub const COLOR: usize = 2;
    pub const UV: usize = 3;
}

/// Well-known face attribute slots
pub mod face_slot {
    pub const INDEX: usize = 0;
}

/// Per-file attribute signature: which arrays each node payload carries
/// and how the payloads are compressed.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Signature {
    pub vertex: [Attribute; 8],
    pub face: [Attribute; 8],
    pub flags: u32,
}

/// Payload compression codec selected by the signature flags
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    None,
    Lz4,
}

impl Signature {
    /// Low flag bits select the payload codec
    pub const COMPRESSION_MASK: u32 = 0x3;
    /// LZ4 block compression
    pub const FLAG_LZ4: u32 = 0x2;

    /// Resolve the codec, rejecting any unknown compression flag value
    pub fn codec(&self) -> Result<Codec> {
        match self.flags & Self::COMPRESSION_MASK {
            0 => Ok(Codec::None),
            Self::FLAG_LZ4 => Ok(Codec::Lz4),
            other => Err(Error::Parse(format!(
                "unsupported compression flags {other:#x}"
            ))),
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & Self::COMPRESSION_MASK != 0
    }

    pub fn has_normals(&self) -> bool {
        self.vertex[vertex_slot::NORMAL].is_present()
    }

    pub fn has_colors(&self) -> bool {
        self.vertex[vertex_slot::COLOR].is_present()
    }

    pub fn has_uvs(&self) -> bool {
        self.vertex[vertex_slot::UV].is_present()
    }

    pub fn has_indices(&self) -> bool {
        self.face[face_slot::INDEX].is_present()
    }

    /// Bytes per vertex across all present vertex attributes
    pub fn vertex_size(&self) -> usize {
        self.vertex.iter().map(Attribute::size).sum()
    }

    /// Bytes per face across all present face attributes
    pub fn face_size(&self) -> usize {
        self.face.iter().map(Attribute::size).sum()
    }

    /// Conventional triangle-mesh signature used by encoders: float3
    /// positions, optional short3 normals, byte4 colors, float2 uvs and
    /// ushort3 face indices.
    pub fn mesh(normals: bool, colors: bool, uvs: bool, indices: bool, flags: u32) -> Self {
        let mut vertex = [Attribute::default(); 8];
        vertex[vertex_slot::POSITION] = Attribute { kind: Attribute::FLOAT, count: 3 };
        if normals {
            vertex[vertex_slot::NORMAL] = Attribute { kind: Attribute::SHORT, count: 3 };
        }
        if colors {
            vertex[vertex_slot::COLOR] = Attribute { kind: Attribute::UNSIGNED_BYTE, count: 4 };
        }
        if uvs {
            vertex[vertex_slot::UV] = Attribute { kind: Attribute::FLOAT, count: 2 };
        }
        let mut face = [Attribute::default(); 8];
        if indices {
            face[face_slot::INDEX] = Attribute { kind: Attribute::UNSIGNED_SHORT, count: 3 };
        }
        Self { vertex, face, flags }
    }
}

/// Fixed 88-byte file header
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Header {
    pub magic: u32,
    pub version: u32,
    pub vertex_total: u64,
    pub face_total: u64,
    pub signature: Signature,
    pub node_count: u32,
    pub patch_count: u32,
    pub texture_count: u32,
    /// Bounding sphere of the whole asset: center xyz + radius
    pub sphere: [f32; 4],
}

/// One node of the multiresolution DAG as stored on disk.
///
/// `first_patch` together with the next record's `first_patch` delimits this
/// node's out-edges; the last record is the reserved sink and carries no
/// geometry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct NodeRecord {
    /// Payload offset in `PAYLOAD_PADDING` units
    pub offset: u32,
    pub vertex_count: u16,
    pub face_count: u16,
    /// Object-space geometric error of this level of detail
    pub error: f32,
    /// Normal cone, packed as four normalized i16s
    pub cone: [i16; 4],
    /// Bounding sphere: center xyz + radius
    pub sphere: [f32; 4],
    /// Sphere radius ignoring normal-cone slack
    pub tight_radius: f32,
    pub first_patch: u32,
}

impl NodeRecord {
    /// Byte offset of this node's payload in the file
    pub fn begin_offset(&self) -> u64 {
        self.offset as u64 * PAYLOAD_PADDING
    }

    pub fn center(&self) -> glam::Vec3 {
        glam::Vec3::new(self.sphere[0], self.sphere[1], self.sphere[2])
    }

    pub fn radius(&self) -> f32 {
        self.sphere[3]
    }
}

/// DAG edge plus rendering metadata
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct PatchRecord {
    /// Child node index; the sink index means "no further refinement"
    pub node: u32,
    /// Prefix index into the owning node's triangle range
    pub triangle_offset: u32,
    /// Texture table index, `NO_TEXTURE` if untextured
    pub texture: u32,
}

/// Texture table entry: payload offset plus a uv transform
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TextureRecord {
    pub offset: u32,
    pub matrix: [f32; 16],
}

/// Parse and validate the fixed header at the start of `buf`.
///
/// Fails fast on short buffers, magic mismatch and unknown compression
/// flags; no partial state is constructed.
pub fn parse_header(buf: &[u8]) -> Result<Header> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::Parse(format!(
            "truncated header: {} bytes, need {HEADER_SIZE}",
            buf.len()
        )));
    }
    let header: Header = bytemuck::pod_read_unaligned(&buf[..HEADER_SIZE]);
    if header.magic != MAGIC {
        return Err(Error::Parse(format!(
            "magic mismatch: read {:#x}, expected {MAGIC:#x}",
            header.magic
        )));
    }
    header.signature.codec()?;
    Ok(header)
}

/// Read `count` fixed-size records following the header tables
pub fn parse_records<T: Pod>(buf: &[u8], count: usize, record_size: usize) -> Result<Vec<T>> {
    let needed = count * record_size;
    if buf.len() < needed {
        return Err(Error::Parse(format!(
            "truncated record table: {} bytes, need {needed}",
            buf.len()
        )));
    }
    Ok(buf[..needed]
        .chunks_exact(record_size)
        .map(bytemuck::pod_read_unaligned)
        .collect())
}
