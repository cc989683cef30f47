//! Traversal tree vertices.

use glam::{DMat4, DVec3};

use crate::draws::RenderTask;
use crate::gpu::MeshAggregate;
use crate::mapconfig::SurfaceStackEntry;
use crate::meta::{MetaNode, MetaTile};
use crate::resource::Handle;
use crate::tile::TileId;

/// Sentinel half-extent of an undetermined bounding box.
///
/// Shallow nodes keep this unbounded box so the visibility test always
/// passes for them; a finite sentinel avoids NaN from `0 * inf` in the
/// plane dot products.
pub const UNBOUNDED: f64 = 1e30;

/// Oriented bounding box refinement for deep nodes.
#[derive(Clone, Debug)]
pub struct Obb {
    /// World-to-box rotation (the box frame's inverse).
    pub rot_inv: DMat4,
    /// Box extents in box-local coordinates.
    pub points: [DVec3; 2],
}

/// Per-class pending draws of one node.
#[derive(Debug, Default)]
pub struct NodeDraws {
    pub opaque: Vec<RenderTask>,
    pub transparent: Vec<RenderTask>,
    pub infographic: Vec<RenderTask>,
}

impl NodeDraws {
    pub fn is_empty(&self) -> bool {
        self.opaque.is_empty() && self.transparent.is_empty() && self.infographic.is_empty()
    }

    pub fn clear(&mut self) {
        self.opaque.clear();
        self.transparent.clear();
        self.infographic.clear();
    }

    /// Touches every resource the draws reference.
    pub fn touch(&self, tick: u64) {
        for task in self.iter() {
            task.touch(tick);
        }
    }

    /// True when every task's resources are `Ready`.
    pub fn ready(&self) -> bool {
        self.iter().all(|t| t.ready())
    }

    pub fn iter(&self) -> impl Iterator<Item = &RenderTask> {
        self.opaque
            .iter()
            .chain(self.transparent.iter())
            .chain(self.infographic.iter())
    }
}

/// One vertex of the traversal tree, owned by its parent.
#[derive(Debug)]
pub struct TraverseNode {
    pub id: TileId,
    /// Resolved meta-node; set once per lifetime of the vertex.
    pub meta: Option<MetaNode>,
    /// Meta-tile handles aligned with the surface stack, kept for
    /// touching; filled together with `meta`.
    pub meta_tiles: Vec<Option<Handle<MetaTile>>>,
    /// The chosen surface-stack entry, when some surface has geometry.
    pub surface: Option<SurfaceStackEntry>,
    pub corners_phys: [DVec3; 8],
    /// Lower and upper corner; unbounded until the meta is resolved deep
    /// enough to matter.
    pub aabb_phys: [DVec3; 2],
    pub obb: Option<Obb>,
    pub surrogate_phys: Option<DVec3>,
    pub draws: NodeDraws,
    pub children: Vec<TraverseNode>,
    pub priority: f64,
    pub last_access_tick: u64,
    /// Frame the node last emitted draws; dedups coarser fallbacks.
    pub rendered_tick: u64,
    /// Random per-node salt scattering the priority-refresh cost.
    pub hash: u32,
    pub credits: Vec<u16>,
    /// Keeps the mesh aggregate alive while the node has draws.
    pub touch_handle: Option<Handle<MeshAggregate>>,
}

impl TraverseNode {
    pub fn new(id: TileId) -> Self {
        Self {
            id,
            meta: None,
            meta_tiles: Vec::new(),
            surface: None,
            corners_phys: [DVec3::ZERO; 8],
            aabb_phys: [DVec3::splat(-UNBOUNDED), DVec3::splat(UNBOUNDED)],
            obb: None,
            surrogate_phys: None,
            draws: NodeDraws::default(),
            children: Vec::new(),
            priority: 0.0,
            last_access_tick: 0,
            rendered_tick: 0,
            hash: rand::random(),
            credits: Vec::new(),
            touch_handle: None,
        }
    }

    /// The tree root; always in budget, never evicted by priority.
    pub fn root() -> Self {
        let mut node = Self::new(TileId::ROOT);
        node.priority = f64::INFINITY;
        node
    }

    /// Drops everything derived from the meta, children included.
    pub fn clear(&mut self) {
        self.meta = None;
        self.meta_tiles.clear();
        self.surface = None;
        self.corners_phys = [DVec3::ZERO; 8];
        self.aabb_phys = [DVec3::splat(-UNBOUNDED), DVec3::splat(UNBOUNDED)];
        self.obb = None;
        self.surrogate_phys = None;
        self.draws.clear();
        self.children.clear();
        self.credits.clear();
        self.touch_handle = None;
    }

    /// Touches every resource the node holds.
    pub fn touch_resources(&self, tick: u64) {
        for handle in self.meta_tiles.iter().flatten() {
            handle.touch(tick);
        }
        if let Some(mesh) = &self.touch_handle {
            mesh.touch(tick);
        }
        self.draws.touch(tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_priority_infinite() {
        let root = TraverseNode::root();
        assert_eq!(root.priority, f64::INFINITY);
        assert!(root.id.is_root());
    }

    #[test]
    fn test_new_node_is_unbounded() {
        let node = TraverseNode::new(TileId { lod: 2, x: 1, y: 1 });
        assert!(node.aabb_phys[0].x < -1e29);
        assert!(node.aabb_phys[1].x > 1e29);
        assert!(node.meta.is_none());
        assert!(node.draws.is_empty());
    }

    #[test]
    fn test_clear_resets_derived_state() {
        let mut node = TraverseNode::new(TileId { lod: 2, x: 1, y: 1 });
        node.children.push(TraverseNode::new(TileId { lod: 3, x: 2, y: 2 }));
        node.credits.push(4);
        node.aabb_phys = [DVec3::ZERO, DVec3::ONE];
        node.clear();
        assert!(node.children.is_empty());
        assert!(node.credits.is_empty());
        assert!(node.aabb_phys[1].x > 1e29);
    }

    #[test]
    fn test_hashes_differ_between_nodes() {
        // random salt; 32 collisions in a row would mean a broken rng
        let nodes: Vec<TraverseNode> = (0..32)
            .map(|i| TraverseNode::new(TileId { lod: 5, x: i, y: 0 }))
            .collect();
        let first = nodes[0].hash;
        assert!(nodes.iter().any(|n| n.hash != first));
    }
}
