//! Meta-tiles: compact hierarchical metadata driving traversal.
//!
//! A meta-tile is a square block of meta-nodes of side
//! `2^meta_binary_order`, covering a sub-range of one lod of the tile
//! tree. Each node records whether the tile has geometry, which children
//! exist, the tile's bounding extents and the texel scale used by the
//! coarseness test. Traversal never descends past a node whose child
//! flags are clear, so meta-tiles gate all other fetching.
//!
//! The wire format is a little-endian binary grid, magic `MT01`; see
//! [`MetaTile::decode`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::tile::TileId;

/// Errors from decoding or indexing meta-tiles.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetaError {
    #[error("bad meta-tile magic")]
    BadMagic,

    #[error("meta-tile truncated at byte {0}")]
    Truncated(usize),

    #[error("meta-tile binary order {got} does not match reference frame order {want}")]
    OrderMismatch { got: u8, want: u8 },

    #[error("tile {tile} outside meta-tile block at {origin}")]
    OutsideBlock { tile: TileId, origin: TileId },
}

const MAGIC: &[u8; 4] = b"MT01";

/// Flag bits of a meta-node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetaFlags(pub u16);

impl MetaFlags {
    pub const GEOMETRY: u16 = 1 << 0;
    pub const NAVTILE: u16 = 1 << 1;
    pub const APPLY_TEXEL_SIZE: u16 = 1 << 2;
    pub const APPLY_DISPLAY_SIZE: u16 = 1 << 3;
    pub const ALIEN: u16 = 1 << 4;
    /// Upper-left child; the other quadrants follow in UL, UR, LL, LR
    /// order at successive bits.
    pub const UL_CHILD: u16 = 1 << 5;

    pub fn geometry(self) -> bool {
        self.0 & Self::GEOMETRY != 0
    }

    pub fn alien(self) -> bool {
        self.0 & Self::ALIEN != 0
    }

    pub fn apply_texel_size(self) -> bool {
        self.0 & Self::APPLY_TEXEL_SIZE != 0
    }

    pub fn apply_display_size(self) -> bool {
        self.0 & Self::APPLY_DISPLAY_SIZE != 0
    }

    /// True when the child at quadrant `q` (0..4, UL,UR,LL,LR) exists.
    pub fn child(self, q: u8) -> bool {
        debug_assert!(q < 4);
        self.0 & (Self::UL_CHILD << q) != 0
    }

    /// True when any child exists.
    pub fn any_child(self) -> bool {
        self.0 & (0b1111 << 5) != 0
    }
}

/// Vertical range of a node's geometry with a representative altitude.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeomExtents {
    pub z_min: f64,
    pub z_max: f64,
    /// Altitude of a representative point, NaN when absent.
    pub surrogate: f64,
}

impl GeomExtents {
    pub fn has_surrogate(&self) -> bool {
        self.surrogate.is_finite()
    }
}

/// Metadata of a single tile.
#[derive(Clone, Debug, PartialEq)]
pub struct MetaNode {
    pub flags: MetaFlags,
    /// Bounding box in the node's local srs, lower and upper corner.
    pub extents_ll: [f64; 3],
    pub extents_ur: [f64; 3],
    pub geom_extents: Option<GeomExtents>,
    pub texel_size: f32,
    pub display_size: u16,
    /// 1-based index into the tileset-mapping surface list; 0 when unused.
    pub source_reference: u16,
    pub credits: Vec<u16>,
    pub internal_texture_count: u8,
}

impl Default for MetaNode {
    fn default() -> Self {
        Self {
            flags: MetaFlags(0),
            extents_ll: [0.0; 3],
            extents_ur: [0.0; 3],
            geom_extents: None,
            texel_size: 0.0,
            display_size: 0,
            source_reference: 0,
            credits: Vec::new(),
            internal_texture_count: 0,
        }
    }
}

impl MetaNode {
    pub fn geometry(&self) -> bool {
        self.flags.geometry()
    }

    pub fn alien(&self) -> bool {
        self.flags.alien()
    }

    /// True when the extents box is degenerate (no usable bounds).
    pub fn extents_empty(&self) -> bool {
        self.extents_ll == self.extents_ur
    }
}

/// Display size every decoded node is clamped to.
///
/// The upstream tiling pipelines emit unreliable display sizes; the
/// runtime overrides them on load and the coarseness test treats the
/// display-size criterion as reserved.
pub const DISPLAY_SIZE_OVERRIDE: u16 = 1024;

/// A decoded square block of meta-nodes.
///
/// Immutable once decoded; shared behind the resource store's handles.
#[derive(Clone, Debug)]
pub struct MetaTile {
    origin: TileId,
    binary_order: u8,
    nodes: Vec<MetaNode>,
}

impl MetaTile {
    /// Side of the block in tiles.
    pub fn side(&self) -> u32 {
        1u32 << self.binary_order
    }

    /// Rounded id of the block origin.
    pub fn origin(&self) -> TileId {
        self.origin
    }

    /// The node covering `tile`, which must lie within the block.
    pub fn get(&self, tile: TileId) -> Result<&MetaNode, MetaError> {
        let outside = tile.lod != self.origin.lod
            || tile.round(self.binary_order) != self.origin;
        if outside {
            return Err(MetaError::OutsideBlock {
                tile,
                origin: self.origin,
            });
        }
        let (ox, oy) = tile.offset_in_block(self.binary_order);
        Ok(&self.nodes[(oy * self.side() + ox) as usize])
    }

    /// Approximate resident size for the memory budget.
    pub fn ram_bytes(&self) -> u64 {
        (std::mem::size_of::<Self>()
            + self.nodes.len() * std::mem::size_of::<MetaNode>()) as u64
    }

    /// Decodes the binary wire format.
    ///
    /// Verifies the magic, that the embedded order matches the reference
    /// frame's `meta_binary_order` and that every node record is intact.
    /// Display sizes are overridden to [`DISPLAY_SIZE_OVERRIDE`].
    pub fn decode(data: &Bytes, meta_binary_order: u8) -> Result<Self, MetaError> {
        if data.len() < 4 || data[..4] != MAGIC[..] {
            return Err(MetaError::BadMagic);
        }
        let mut buf = data.slice(4..);
        let total = data.len();
        let truncated = |buf: &Bytes| MetaError::Truncated(total - buf.remaining());
        if buf.remaining() < 10 {
            return Err(truncated(&buf));
        }
        let lod = buf.get_u8();
        let x = buf.get_u32_le();
        let y = buf.get_u32_le();
        let order = buf.get_u8();
        if order != meta_binary_order {
            return Err(MetaError::OrderMismatch {
                got: order,
                want: meta_binary_order,
            });
        }
        let origin = TileId { lod, x, y }.round(order);

        let side = 1usize << order;
        let mut nodes = Vec::with_capacity(side * side);
        for _ in 0..side * side {
            nodes.push(Self::decode_node(&mut buf, &truncated)?);
        }
        Ok(Self {
            origin,
            binary_order: order,
            nodes,
        })
    }

    fn decode_node(
        buf: &mut Bytes,
        truncated: &dyn Fn(&Bytes) -> MetaError,
    ) -> Result<MetaNode, MetaError> {
        if buf.remaining() < 2 + 48 + 1 {
            return Err(truncated(buf));
        }
        let flags = MetaFlags(buf.get_u16_le());
        let mut extents_ll = [0.0; 3];
        let mut extents_ur = [0.0; 3];
        for v in &mut extents_ll {
            *v = buf.get_f64_le();
        }
        for v in &mut extents_ur {
            *v = buf.get_f64_le();
        }
        let presence = buf.get_u8();
        let geom_extents = if presence & 1 != 0 {
            if buf.remaining() < 16 {
                return Err(truncated(buf));
            }
            let z_min = buf.get_f64_le();
            let z_max = buf.get_f64_le();
            let surrogate = if presence & 2 != 0 {
                if buf.remaining() < 8 {
                    return Err(truncated(buf));
                }
                buf.get_f64_le()
            } else {
                f64::NAN
            };
            Some(GeomExtents {
                z_min,
                z_max,
                surrogate,
            })
        } else {
            None
        };
        if buf.remaining() < 4 + 2 + 2 + 1 {
            return Err(truncated(buf));
        }
        let texel_size = buf.get_f32_le();
        let _display_size = buf.get_u16_le();
        let source_reference = buf.get_u16_le();
        let credit_count = buf.get_u8() as usize;
        if buf.remaining() < credit_count * 2 + 1 {
            return Err(truncated(buf));
        }
        let mut credits = Vec::with_capacity(credit_count);
        for _ in 0..credit_count {
            credits.push(buf.get_u16_le());
        }
        let internal_texture_count = buf.get_u8();
        Ok(MetaNode {
            flags,
            extents_ll,
            extents_ur,
            geom_extents,
            texel_size,
            display_size: DISPLAY_SIZE_OVERRIDE,
            source_reference,
            credits,
            internal_texture_count,
        })
    }

    /// Encodes a block into the wire format.
    ///
    /// The authoring half of the codec; the runtime only decodes, test
    /// harnesses and tooling encode.
    pub fn encode(origin: TileId, binary_order: u8, nodes: &[MetaNode]) -> Bytes {
        let side = 1usize << binary_order;
        assert_eq!(nodes.len(), side * side, "node grid must fill the block");
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_u8(origin.lod);
        buf.put_u32_le(origin.x);
        buf.put_u32_le(origin.y);
        buf.put_u8(binary_order);
        for node in nodes {
            buf.put_u16_le(node.flags.0);
            for v in node.extents_ll.iter().chain(node.extents_ur.iter()) {
                buf.put_f64_le(*v);
            }
            match &node.geom_extents {
                Some(g) => {
                    let presence = 1 | if g.has_surrogate() { 2 } else { 0 };
                    buf.put_u8(presence);
                    buf.put_f64_le(g.z_min);
                    buf.put_f64_le(g.z_max);
                    if g.has_surrogate() {
                        buf.put_f64_le(g.surrogate);
                    }
                }
                None => buf.put_u8(0),
            }
            buf.put_f32_le(node.texel_size);
            buf.put_u16_le(node.display_size);
            buf.put_u16_le(node.source_reference);
            buf.put_u8(node.credits.len() as u8);
            for c in &node.credits {
                buf.put_u16_le(*c);
            }
            buf.put_u8(node.internal_texture_count);
        }
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_node() -> MetaNode {
        MetaNode {
            flags: MetaFlags(MetaFlags::GEOMETRY | MetaFlags::APPLY_TEXEL_SIZE),
            extents_ll: [0.0, 0.0, -10.0],
            extents_ur: [1.0, 1.0, 250.0],
            geom_extents: Some(GeomExtents {
                z_min: -10.0,
                z_max: 250.0,
                surrogate: 40.0,
            }),
            texel_size: 2.5,
            display_size: 256,
            source_reference: 0,
            credits: vec![1, 7],
            internal_texture_count: 1,
        }
    }

    fn block(order: u8) -> Vec<MetaNode> {
        let side = 1usize << order;
        vec![leaf_node(); side * side]
    }

    #[test]
    fn test_decode_roundtrip() {
        let origin = TileId { lod: 8, x: 32, y: 64 };
        let data = MetaTile::encode(origin, 5, &block(5));
        let tile = MetaTile::decode(&data, 5).unwrap();
        assert_eq!(tile.origin(), origin);
        assert_eq!(tile.side(), 32);

        let node = tile.get(TileId { lod: 8, x: 35, y: 70 }).unwrap();
        assert!(node.geometry());
        assert_eq!(node.credits, vec![1, 7]);
        // display size is always overridden on load
        assert_eq!(node.display_size, DISPLAY_SIZE_OVERRIDE);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let data = Bytes::from_static(b"XXXXrest");
        assert!(matches!(
            MetaTile::decode(&data, 5),
            Err(MetaError::BadMagic)
        ));
    }

    #[test]
    fn test_decode_rejects_order_mismatch() {
        let data = MetaTile::encode(TileId::ROOT, 3, &block(3));
        assert!(matches!(
            MetaTile::decode(&data, 5),
            Err(MetaError::OrderMismatch { got: 3, want: 5 })
        ));
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let data = MetaTile::encode(TileId::ROOT, 2, &block(2));
        let cut = data.slice(..data.len() - 3);
        assert!(matches!(
            MetaTile::decode(&cut, 2),
            Err(MetaError::Truncated(_))
        ));
    }

    #[test]
    fn test_get_outside_block() {
        let data = MetaTile::encode(TileId { lod: 8, x: 32, y: 64 }, 5, &block(5));
        let tile = MetaTile::decode(&data, 5).unwrap();
        // different lod
        assert!(tile.get(TileId { lod: 7, x: 32, y: 64 }).is_err());
        // different block at the same lod
        assert!(tile.get(TileId { lod: 8, x: 0, y: 0 }).is_err());
    }

    #[test]
    fn test_child_flags() {
        let f = MetaFlags(MetaFlags::UL_CHILD | (MetaFlags::UL_CHILD << 3));
        assert!(f.child(0));
        assert!(!f.child(1));
        assert!(!f.child(2));
        assert!(f.child(3));
        assert!(f.any_child());
        assert!(!MetaFlags(MetaFlags::GEOMETRY).any_child());
    }

    #[test]
    fn test_node_without_geom_extents() {
        let mut nodes = block(1);
        for n in &mut nodes {
            n.geom_extents = None;
        }
        let data = MetaTile::encode(TileId::ROOT, 1, &nodes);
        let tile = MetaTile::decode(&data, 1).unwrap();
        assert_eq!(tile.get(TileId::ROOT).unwrap().geom_extents, None);
    }
}
