//! Tile identifiers and quad-tree arithmetic.
//!
//! The tile hierarchy is a quad-tree rooted at `lod 0`. A tile at
//! `(lod, x, y)` has up to four children at `(lod+1, 2x+dx, 2y+dy)` with
//! `dx, dy` in `{0, 1}`. Meta-tiles cover square blocks of the tree, so
//! tile ids are rounded down to the block origin by masking off the low
//! `meta_binary_order` bits of `x` and `y`.

use std::fmt;

use thiserror::Error;

/// Errors for tile arithmetic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TileError {
    /// Coordinates exceed the range valid at the given lod.
    #[error("tile ({x}, {y}) out of range at lod {lod}")]
    OutOfRange { lod: u8, x: u32, y: u32 },
}

/// Identifier of one tile in the quad-tree.
///
/// Ordering is lexicographic `(lod, y, x)` so tiles of one level sort
/// together row by row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileId {
    /// Level of detail; 0 is the root.
    pub lod: u8,
    /// Column within the lod.
    pub x: u32,
    /// Row within the lod.
    pub y: u32,
}

impl TileId {
    /// The root tile `(0, 0, 0)`.
    pub const ROOT: TileId = TileId { lod: 0, x: 0, y: 0 };

    /// Creates a tile id, validating the coordinate range for the lod.
    pub fn new(lod: u8, x: u32, y: u32) -> Result<Self, TileError> {
        let max = 1u64 << lod;
        if (x as u64) >= max || (y as u64) >= max {
            return Err(TileError::OutOfRange { lod, x, y });
        }
        Ok(Self { lod, x, y })
    }

    /// Returns true for the root tile.
    pub fn is_root(&self) -> bool {
        self.lod == 0
    }

    /// The parent tile, or `None` for the root.
    pub fn parent(&self) -> Option<TileId> {
        if self.lod == 0 {
            return None;
        }
        Some(TileId {
            lod: self.lod - 1,
            x: self.x / 2,
            y: self.y / 2,
        })
    }

    /// The four children in quadrant order: UL, UR, LL, LR.
    ///
    /// The upper-left child shares the doubled coordinates; `x` grows to
    /// the right, `y` grows downward.
    pub fn children(&self) -> [TileId; 4] {
        let lod = self.lod + 1;
        let x = self.x * 2;
        let y = self.y * 2;
        [
            TileId { lod, x, y },
            TileId { lod, x: x + 1, y },
            TileId { lod, x, y: y + 1 },
            TileId { lod, x: x + 1, y: y + 1 },
        ]
    }

    /// Index of this tile within its parent: `(x % 2) + (y % 2) * 2`.
    ///
    /// Matches the bit position of the per-quadrant child flags in a
    /// meta-node (UL = 0, UR = 1, LL = 2, LR = 3).
    pub fn quadrant_in_parent(&self) -> u8 {
        ((self.x % 2) + (self.y % 2) * 2) as u8
    }

    /// Rounds the id down to the origin of its covering meta-tile block.
    ///
    /// Masks off the low `meta_binary_order` bits of `x` and `y`; the lod
    /// is unchanged. Rounding is idempotent.
    pub fn round(&self, meta_binary_order: u8) -> TileId {
        TileId {
            lod: self.lod,
            x: (self.x >> meta_binary_order) << meta_binary_order,
            y: (self.y >> meta_binary_order) << meta_binary_order,
        }
    }

    /// Offset of this tile within its meta-tile block.
    pub fn offset_in_block(&self, meta_binary_order: u8) -> (u32, u32) {
        let mask = (1u32 << meta_binary_order) - 1;
        (self.x & mask, self.y & mask)
    }

    /// Number of lod steps below the root.
    pub fn distance_from_root(&self) -> u32 {
        self.lod as u32
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.lod, self.x, self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_has_no_parent() {
        assert_eq!(TileId::ROOT.parent(), None);
        assert!(TileId::ROOT.is_root());
    }

    #[test]
    fn test_children_quadrant_order() {
        let t = TileId { lod: 3, x: 5, y: 2 };
        let c = t.children();
        assert_eq!(c[0], TileId { lod: 4, x: 10, y: 4 }); // UL
        assert_eq!(c[1], TileId { lod: 4, x: 11, y: 4 }); // UR
        assert_eq!(c[2], TileId { lod: 4, x: 10, y: 5 }); // LL
        assert_eq!(c[3], TileId { lod: 4, x: 11, y: 5 }); // LR
    }

    #[test]
    fn test_children_roundtrip_through_parent() {
        let t = TileId { lod: 7, x: 91, y: 40 };
        for (i, c) in t.children().iter().enumerate() {
            assert_eq!(c.parent(), Some(t));
            assert_eq!(c.quadrant_in_parent() as usize, i);
        }
    }

    #[test]
    fn test_new_rejects_out_of_range() {
        assert!(TileId::new(0, 0, 0).is_ok());
        assert_eq!(
            TileId::new(0, 1, 0),
            Err(TileError::OutOfRange { lod: 0, x: 1, y: 0 })
        );
        assert!(TileId::new(3, 7, 7).is_ok());
        assert!(TileId::new(3, 8, 0).is_err());
    }

    #[test]
    fn test_round_masks_low_bits() {
        let t = TileId { lod: 10, x: 37, y: 230 };
        let r = t.round(5);
        assert_eq!(r, TileId { lod: 10, x: 32, y: 224 });
    }

    #[test]
    fn test_round_is_idempotent() {
        let t = TileId { lod: 12, x: 1234, y: 987 };
        let once = t.round(5);
        assert_eq!(once.round(5), once);
    }

    #[test]
    fn test_offset_in_block() {
        let t = TileId { lod: 10, x: 37, y: 230 };
        assert_eq!(t.offset_in_block(5), (5, 6));
        let origin = t.round(5);
        assert_eq!(origin.offset_in_block(5), (0, 0));
    }

    #[test]
    fn test_display() {
        let t = TileId { lod: 4, x: 3, y: 9 };
        assert_eq!(t.to_string(), "4-3-9");
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_round_idempotent_property(
                lod in 0u8..=20,
                x_raw in 0u32..1_000_000,
                y_raw in 0u32..1_000_000,
                order in 0u8..=8
            ) {
                let max = 1u64 << lod;
                let t = TileId {
                    lod,
                    x: (x_raw as u64 % max) as u32,
                    y: (y_raw as u64 % max) as u32,
                };
                let once = t.round(order);
                prop_assert_eq!(once.round(order), once);
            }

            #[test]
            fn test_parent_of_child_property(
                lod in 0u8..=19,
                x_raw in 0u32..1_000_000,
                y_raw in 0u32..1_000_000
            ) {
                let max = 1u64 << lod;
                let t = TileId {
                    lod,
                    x: (x_raw as u64 % max) as u32,
                    y: (y_raw as u64 % max) as u32,
                };
                for c in t.children() {
                    prop_assert_eq!(c.parent(), Some(t));
                }
            }
        }
    }
}
