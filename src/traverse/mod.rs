//! Tile-tree traversal.
//!
//! Each frame the engine walks the quad-tree from the root, resolving
//! meta-nodes through the surface stack, culling against the camera
//! frustum, measuring screen-space coarseness and assembling draws for
//! the tiles it settles on. Four policies decide how loading gaps are
//! covered:
//!
//! * **Hierarchical** - render the coarsest complete ancestor while
//!   children load; no holes, extra overdraw.
//! * **Flat** - render only tiles that pass the coarseness test; holes
//!   while loading, bounded draw cost.
//! * **Balanced** (default) - descend while ready, cover not-yet-ready
//!   subtrees with the nearest ancestor that has draws.
//! * **Fixed** - render one fixed lod within a distance of the focus.
//!
//! The engine only reads resource validity - it never waits. A tile
//! whose resources are `Indeterminate` simply stays undrawn this frame
//! and is revisited the next.

mod node;
mod visibility;

pub use node::{NodeDraws, Obb, TraverseNode, UNBOUNDED};
pub use visibility::{aabb_point_distance, coarseness_test, visibility_test, OBB_MIN_DEPTH};

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use glam::{DMat4, DVec3, Mat3, Vec4};
use tracing::trace;

use crate::camera::Camera;
use crate::coord::{CoordConvertor, Frame};
use crate::draws::{hit_credit, DrawClass, DrawTask, FrameHandles, MapDraws, RenderTask};
use crate::gpu::{GpuTexture, MeshAggregate};
use crate::mapconfig::{MapConfig, SurfaceStackEntry, UrlVars};
use crate::meta::{MetaNode, MetaTile};
use crate::resource::{Handle, ResourceStore, Validity};
use crate::surface::{reorder_bound_layers, BoundLayerInfo, BoundParamInfo};
use crate::telemetry::MapStatistics;
use crate::tile::TileId;

/// Traversal policy; see the module docs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TraverseMode {
    Hierarchical,
    Flat,
    #[default]
    Balanced,
    Fixed,
}

/// Knobs of one traversal run.
#[derive(Clone, Debug)]
pub struct TraversalParams {
    pub mode: TraverseMode,
    /// Coarseness threshold in pixels per texel.
    pub max_texel_to_pixel_scale: f64,
    /// Cap on meta/draw determinations per tick.
    pub max_node_updates: u32,
    pub fixed_mode_lod: u8,
    pub fixed_mode_distance: f64,
}

impl Default for TraversalParams {
    fn default() -> Self {
        Self {
            mode: TraverseMode::Balanced,
            max_texel_to_pixel_scale: 1.2,
            max_node_updates: 16,
            fixed_mode_lod: 10,
            fixed_mode_distance: 100_000.0,
        }
    }
}

/// Everything one traversal run needs, borrowed from the facade.
pub struct Traversal<'a> {
    pub store: &'a ResourceStore,
    pub config: &'a MapConfig,
    /// The active surface stack, topmost first.
    pub stack: &'a [SurfaceStackEntry],
    /// Redirect targets when a tileset mapping is active; meta-node
    /// `source_reference` values index into it 1-based.
    pub tileset_stack: Option<&'a [SurfaceStackEntry]>,
    pub bound_layers: &'a HashMap<String, Arc<BoundLayerInfo>>,
    pub convertor: &'a CoordConvertor,
    pub camera: &'a Camera,
    pub params: &'a TraversalParams,
    pub statistics: &'a MapStatistics,
    pub tick: u64,
    pub draws: &'a mut MapDraws,
    pub frame_handles: &'a mut FrameHandles,
}

impl<'a> Traversal<'a> {
    /// Runs the configured mode from the root.
    pub fn run(&mut self, root: &mut TraverseNode) {
        match self.params.mode {
            TraverseMode::Hierarchical => self.traverse_hierarchical(root, false),
            TraverseMode::Flat => self.traverse_flat(root),
            TraverseMode::Balanced => {
                self.traverse_balanced(root, false);
            }
            TraverseMode::Fixed => self.traverse_fixed(root),
        }
    }

    // ------------------------------------------------------------------
    // modes
    // ------------------------------------------------------------------

    fn traverse_hierarchical(&mut self, node: &mut TraverseNode, load_only: bool) {
        if !self.init_node(node) {
            return;
        }
        if node.surface.is_some() && node.draws.is_empty() {
            self.determine_draws(node);
        }
        if load_only {
            return;
        }
        if !visibility_test(node, self.camera) {
            return;
        }
        if self.is_coarse_enough(node) || node.children.is_empty() {
            if !node.draws.is_empty() {
                self.render_node(node);
            }
            return;
        }

        // children render instead of this node only once all of them are
        // ready; until then they only load
        let ok = node.children.iter().all(|t| {
            t.meta.is_some() && !(t.surface.is_some() && t.draws.is_empty())
        });
        for i in self.children_order(node) {
            self.traverse_hierarchical(&mut node.children[i], !ok);
        }
        if !ok && !node.draws.is_empty() {
            self.render_node(node);
        }
    }

    fn traverse_flat(&mut self, node: &mut TraverseNode) {
        if !self.init_node(node) {
            return;
        }
        if !visibility_test(node, self.camera) {
            node.draws.clear();
            return;
        }
        if self.is_coarse_enough(node) || node.children.is_empty() {
            if node.surface.is_some() && node.draws.is_empty() {
                self.determine_draws(node);
            }
            if !node.draws.is_empty() {
                self.render_node(node);
            }
            return;
        }
        for i in self.children_order(node) {
            self.traverse_flat(&mut node.children[i]);
        }
        node.draws.clear();
    }

    /// Returns true when the subtree is covered (rendered, or nothing to
    /// render there); false asks the nearest ancestor with draws to
    /// cover the gap.
    fn traverse_balanced(&mut self, node: &mut TraverseNode, render_only: bool) -> bool {
        if render_only {
            node.last_access_tick = self.tick;
            node.touch_resources(self.tick);
            if node.meta.is_none() {
                return false;
            }
        } else if !self.init_node(node) {
            return false;
        }
        if !visibility_test(node, self.camera) {
            node.draws.clear();
            return true;
        }

        let mut render_only = render_only;
        if !render_only && (self.is_coarse_enough(node) || node.children.is_empty()) {
            if node.surface.is_some() && node.draws.is_empty() {
                self.determine_draws(node);
            }
            render_only = true;
        }
        if render_only && !node.draws.is_empty() {
            self.render_node(node);
            return true;
        }
        if node.children.is_empty() {
            // nothing to draw and nowhere to descend; covered only when
            // no surface claims geometry here
            return node.surface.is_none();
        }

        let mut covered = true;
        for i in self.children_order(node) {
            covered &= self.traverse_balanced(&mut node.children[i], render_only);
        }
        if covered {
            if !render_only {
                node.draws.clear();
            }
            return true;
        }

        // a descendant is still loading; cover it with this node
        if node.surface.is_some() && node.draws.is_empty() {
            self.determine_draws(node);
        }
        if !node.draws.is_empty() {
            if node.rendered_tick != self.tick {
                self.render_node(node);
            }
            true
        } else {
            false
        }
    }

    fn traverse_fixed(&mut self, node: &mut TraverseNode) {
        if !self.init_node(node) {
            return;
        }
        let focus = self.camera.target;
        if aabb_point_distance(focus, node.aabb_phys[0], node.aabb_phys[1])
            > self.params.fixed_mode_distance
        {
            node.draws.clear();
            return;
        }
        if node.id.lod >= self.params.fixed_mode_lod || node.children.is_empty() {
            if node.surface.is_some() && node.draws.is_empty() {
                self.determine_draws(node);
            }
            if !node.draws.is_empty() {
                self.render_node(node);
            }
            return;
        }
        for i in self.children_order(node) {
            self.traverse_fixed(&mut node.children[i]);
        }
        node.draws.clear();
    }

    // ------------------------------------------------------------------
    // shared steps
    // ------------------------------------------------------------------

    /// Touch, refresh priority and make sure the meta is resolved.
    fn init_node(&mut self, node: &mut TraverseNode) -> bool {
        self.statistics.nodes_traversed.fetch_add(1, Ordering::Relaxed);
        node.last_access_tick = self.tick;
        node.touch_resources(self.tick);
        self.update_node_priority(node);
        if node.meta.is_none() {
            return self.determine_meta(node);
        }
        true
    }

    fn is_coarse_enough(&self, node: &TraverseNode) -> bool {
        coarseness_test(node, self.camera, self.params.max_texel_to_pixel_scale)
    }

    /// Refreshes the node's priority every fourth tick, scattered by the
    /// node's hash so the cost spreads across frames.
    fn update_node_priority(&self, node: &mut TraverseNode) {
        if node.id.is_root() {
            node.priority = f64::INFINITY;
            return;
        }
        if node.meta.is_some() && (node.hash as u64 + self.tick) % 4 == 0 {
            let dist = aabb_point_distance(
                self.camera.target,
                node.aabb_phys[0],
                node.aabb_phys[1],
            );
            node.priority = 1e6 / (dist + 1.0);
        }
    }

    /// Children in descending priority order; meta-less children inherit
    /// the parent's priority first.
    fn children_order(&self, node: &mut TraverseNode) -> Vec<usize> {
        let parent_priority = node.priority;
        for child in &mut node.children {
            if child.meta.is_none() {
                child.priority = parent_priority;
            }
        }
        let mut order: Vec<usize> = (0..node.children.len()).collect();
        order.sort_by(|&a, &b| {
            node.children[b]
                .priority
                .total_cmp(&node.children[a].priority)
        });
        order
    }

    // ------------------------------------------------------------------
    // meta resolution
    // ------------------------------------------------------------------

    /// Resolves the meta-node of `surface` for `id`.
    ///
    /// Parent before child: the parent's meta-node must be valid and its
    /// child-availability flag set before this tile's meta-tile is even
    /// requested, so meta-tiles are fetched only along reachable
    /// branches.
    fn check_meta_node(
        &self,
        surface: &crate::mapconfig::SurfaceInfo,
        id: TileId,
        priority: f64,
    ) -> (Validity, Option<MetaNode>, Option<Handle<MetaTile>>) {
        if let Some(parent) = id.parent() {
            let (validity, parent_node, _) = self.check_meta_node(surface, parent, priority);
            match validity {
                Validity::Invalid => return (Validity::Invalid, None, None),
                Validity::Indeterminate => return (Validity::Indeterminate, None, None),
                Validity::Valid => {}
            }
            let parent_node = parent_node.expect("valid resolution carries a node");
            if !parent_node.flags.child(id.quadrant_in_parent()) {
                return (Validity::Invalid, None, None);
            }
        }
        self.fetch_meta_node(surface, id, priority)
    }

    fn fetch_meta_node(
        &self,
        surface: &crate::mapconfig::SurfaceInfo,
        id: TileId,
        priority: f64,
    ) -> (Validity, Option<MetaNode>, Option<Handle<MetaTile>>) {
        let order = self.config.reference_frame.meta_binary_order;
        let url = surface.url_meta.expand(&UrlVars::tile(id.round(order)));
        let handle = match self.store.get::<MetaTile>(&url) {
            Ok(handle) => handle,
            Err(_) => return (Validity::Invalid, None, None),
        };
        handle.touch(self.tick);
        // meta-tiles gate everything else, fetch them more urgently
        handle.update_priority(priority * 2.0);
        match handle.validity() {
            Validity::Valid => {
                let tile = handle.value().expect("valid meta-tile has a payload");
                match tile.get(id) {
                    Ok(node) => (Validity::Valid, Some(node.clone()), Some(handle)),
                    Err(_) => (Validity::Invalid, None, None),
                }
            }
            validity => (validity, None, Some(handle)),
        }
    }

    /// Resolves the node's meta across the surface stack, picks the
    /// effective surface and allocates children.
    fn determine_meta(&mut self, node: &mut TraverseNode) -> bool {
        debug_assert!(node.meta.is_none());
        debug_assert!(node.children.is_empty());

        if self.statistics.node_meta_updates.load(Ordering::Relaxed)
            >= self.params.max_node_updates
        {
            return false;
        }
        self.statistics
            .node_meta_updates
            .fetch_add(1, Ordering::Relaxed);

        let id = node.id;
        let mut determined = true;
        let mut meta_tiles: Vec<Option<Handle<MetaTile>>> = vec![None; self.stack.len()];
        let mut children_available = [false; 4];
        let mut chosen: Option<MetaNode> = None;
        let mut topmost: Option<SurfaceStackEntry> = None;

        for (i, entry) in self.stack.iter().enumerate() {
            let (validity, meta, handle) =
                self.check_meta_node(&entry.surface, id, node.priority);
            match validity {
                Validity::Indeterminate => {
                    determined = false;
                    continue;
                }
                Validity::Invalid => continue,
                Validity::Valid => {}
            }
            let meta = meta.expect("valid resolution carries a node");
            meta_tiles[i] = handle;
            for (q, slot) in children_available.iter_mut().enumerate() {
                *slot = *slot || meta.flags.child(q as u8);
            }
            if topmost.is_some() || meta.alien() != entry.alien {
                continue;
            }
            if meta.geometry() {
                // geometry found; the tileset mapping may redirect the
                // serving surface
                let serving = match (self.tileset_stack, meta.source_reference) {
                    (Some(mapped), reference) if reference > 0 => {
                        mapped.get(reference as usize - 1).cloned()
                    }
                    _ => Some(entry.clone()),
                };
                chosen = Some(meta);
                topmost = serving;
            } else if chosen.is_none() {
                chosen = Some(meta);
            }
        }
        if !determined {
            return false;
        }
        let Some(meta) = chosen else {
            // every surface failed; prune the branch
            return false;
        };

        self.fill_geometry(node, &meta);
        if let Some(serving) = topmost {
            node.credits.extend(meta.credits.iter().copied());
            node.surface = Some(serving);
        }
        node.meta = Some(meta);
        node.meta_tiles = meta_tiles;

        for (q, available) in children_available.iter().enumerate() {
            if *available {
                node.children
                    .push(TraverseNode::new(id.children()[q]));
            }
        }
        self.update_node_priority(node);
        trace!(tile = %id, children = node.children.len(), "meta resolved");
        true
    }

    /// Computes physical corners, AABB, oriented box and surrogate.
    fn fill_geometry(&self, node: &mut TraverseNode, meta: &MetaNode) {
        let id = node.id;
        let (tile_ll, tile_ur) = self.config.reference_frame.tile_extents(id);

        if let Some(geom) = &meta.geom_extents {
            let el = DVec3::new(tile_ll.x, tile_ll.y, geom.z_min);
            let eu = DVec3::new(tile_ur.x, tile_ur.y, geom.z_max);
            for (i, corner) in node.corners_phys.iter_mut().enumerate() {
                let f = lower_upper_combine(i) * (eu - el) + el;
                *corner = self.convertor.convert(f, Frame::Node, Frame::Physical);
            }

            if id.distance_from_root() > OBB_MIN_DEPTH {
                node.obb = Some(build_obb(&node.corners_phys));
            }
        } else if !meta.extents_empty() {
            // degenerate fallback: meta extents are normalized within the
            // division extents
            let fl = DVec3::from_array(meta.extents_ll);
            let fu = DVec3::from_array(meta.extents_ur);
            let el = self.config.reference_frame.division.extents.ll();
            let eu = self.config.reference_frame.division.extents.ur();
            for (i, corner) in node.corners_phys.iter_mut().enumerate() {
                let f = lower_upper_combine(i) * (fu - fl) + fl;
                *corner = f * (eu - el) + el;
            }
        } else {
            return;
        }

        // shallow nodes keep the unbounded box; the planet's curvature
        // makes their corner hull unreliable
        if id.distance_from_root() > 2 {
            let mut lo = node.corners_phys[0];
            let mut hi = node.corners_phys[0];
            for corner in &node.corners_phys {
                lo = lo.min(*corner);
                hi = hi.max(*corner);
            }
            node.aabb_phys = [lo, hi];
        }

        if let Some(geom) = &meta.geom_extents {
            if geom.has_surrogate() {
                let centre = (tile_ll + tile_ur) * 0.5;
                let sds = DVec3::new(centre.x, centre.y, geom.surrogate);
                node.surrogate_phys =
                    Some(self.convertor.convert(sds, Frame::Node, Frame::Physical));
            }
        }
    }

    // ------------------------------------------------------------------
    // draw determination
    // ------------------------------------------------------------------

    /// Builds the node's render tasks from its surface's mesh aggregate.
    ///
    /// Commits all draws or none: any submesh with `Indeterminate`
    /// dependencies leaves the node draws-incomplete for this tick.
    fn determine_draws(&mut self, node: &mut TraverseNode) -> bool {
        let Some(surface_entry) = node.surface.clone() else {
            return false;
        };
        let Some(meta) = node.meta.clone() else {
            return false;
        };
        if self.statistics.node_draw_updates.load(Ordering::Relaxed)
            >= self.params.max_node_updates
        {
            return false;
        }
        self.statistics
            .node_draw_updates
            .fetch_add(1, Ordering::Relaxed);

        let id = node.id;
        let surface = &surface_entry.surface;

        // prefetch internal textures alongside the mesh
        for sub in 0..meta.internal_texture_count as u32 {
            let url = surface.url_int_tex.expand(&UrlVars::with_sub(id, sub));
            if let Ok(tex) = self.store.get::<GpuTexture>(&url) {
                tex.touch(self.tick);
                tex.update_priority(node.priority);
            }
        }

        let mesh_url = surface.url_mesh.expand(&UrlVars::tile(id));
        let mesh = match self.store.get::<MeshAggregate>(&mesh_url) {
            Ok(handle) => handle,
            Err(_) => {
                node.surface = None;
                return false;
            }
        };
        mesh.touch(self.tick);
        mesh.update_priority(node.priority);
        match mesh.validity() {
            Validity::Invalid => {
                // malformed mesh prunes the surface on this node
                node.surface = None;
                return false;
            }
            Validity::Indeterminate => return false,
            Validity::Valid => {}
        }
        let aggregate = mesh.value().expect("valid mesh has a payload");

        let mut determined = true;
        let mut new_opaque: Vec<RenderTask> = Vec::new();
        let mut new_transparent: Vec<RenderTask> = Vec::new();
        let mut new_credits: Vec<u16> = Vec::new();

        for (sub_index, part) in aggregate.submeshes.iter().enumerate() {
            if part.external_uv {
                let mut bls: Vec<BoundParamInfo> = self
                    .config
                    .view_bound_list(&surface.id)
                    .iter()
                    .filter_map(|p| {
                        self.bound_layers
                            .get(&p.id)
                            .map(|info| BoundParamInfo::new(info.clone(), p.alpha))
                    })
                    .collect();
                if part.texture_layer != 0 {
                    if let Some(extra) = self
                        .config
                        .bound_layer_by_numeric(part.texture_layer)
                        .and_then(|b| self.bound_layers.get(&b.id))
                    {
                        bls.push(BoundParamInfo::new(extra.clone(), None));
                    }
                }
                match reorder_bound_layers(&mut bls, self.store, id, node.priority, self.tick) {
                    Validity::Indeterminate => {
                        determined = false;
                        continue;
                    }
                    Validity::Invalid => continue,
                    Validity::Valid => {}
                }
                let mut all_transparent = true;
                for b in &bls {
                    for credit_name in &b.info.credits {
                        if let Some(credit) = self.config.credits.get(credit_name) {
                            new_credits.push(credit.id);
                        }
                    }
                    let transparent = b.info.transparent || b.texture_mask.is_some();
                    let task = RenderTask {
                        mesh: mesh.clone(),
                        submesh_index: sub_index,
                        texture_color: b.texture_color.clone(),
                        texture_mask: b.texture_mask.clone(),
                        model: part.norm_to_phys,
                        uvm: Mat3::IDENTITY,
                        color: Vec4::new(1.0, 1.0, 1.0, b.alpha.unwrap_or(1.0) as f32),
                        external_uv: true,
                    };
                    if transparent {
                        new_transparent.push(task);
                    } else {
                        new_opaque.push(task);
                    }
                    all_transparent = all_transparent && b.info.transparent;
                }
                if !all_transparent {
                    continue;
                }
            }

            if part.internal_uv {
                let url = surface
                    .url_int_tex
                    .expand(&UrlVars::with_sub(id, sub_index as u32));
                let texture = match self.store.get::<GpuTexture>(&url) {
                    Ok(handle) => handle,
                    Err(_) => continue,
                };
                texture.touch(self.tick);
                texture.update_priority(node.priority);
                match texture.validity() {
                    Validity::Indeterminate => {
                        determined = false;
                        continue;
                    }
                    Validity::Invalid => continue,
                    Validity::Valid => {}
                }
                let task = RenderTask {
                    mesh: mesh.clone(),
                    submesh_index: sub_index,
                    texture_color: Some(texture),
                    texture_mask: None,
                    model: part.norm_to_phys,
                    uvm: Mat3::IDENTITY,
                    color: Vec4::ONE,
                    external_uv: false,
                };
                // internal texture draws before bound layers of the same
                // node; identical depth would z-fight otherwise
                new_opaque.insert(0, task);
            }
        }

        if determined {
            node.draws.opaque = new_opaque;
            node.draws.transparent = new_transparent;
            node.credits.extend(new_credits);
            if node.draws.is_empty() {
                node.surface = None;
                node.touch_handle = None;
            } else {
                node.touch_handle = Some(mesh);
            }
            trace!(tile = %id, opaque = node.draws.opaque.len(), "draws determined");
        }
        determined
    }

    // ------------------------------------------------------------------
    // emission
    // ------------------------------------------------------------------

    /// Emits the node's ready draws into the frame.
    fn render_node(&mut self, node: &mut TraverseNode) {
        debug_assert!(node.meta.is_some());
        node.rendered_tick = self.tick;

        let view = self.camera.view;
        let lists = [
            (DrawClass::Opaque, &node.draws.opaque),
            (DrawClass::Transparent, &node.draws.transparent),
            (DrawClass::Infographic, &node.draws.infographic),
        ];
        for (class, tasks) in lists {
            for task in tasks {
                if let Some(draw) = DrawTask::from_render_task(task, &view) {
                    self.frame_handles.keep_task(task);
                    self.draws.push(class, draw);
                }
            }
        }

        for credit in &node.credits {
            hit_credit(&mut self.draws.credits, *credit);
        }
        if let Some(meta) = &node.meta {
            for credit in &meta.credits {
                hit_credit(&mut self.draws.credits, *credit);
            }
        }
        self.statistics.node_rendered(node.id.lod);
    }
}

/// Clearing pass: drops subtrees that went untouched for a few frames.
///
/// At lod 3 the walk is sampled so only one sixty-fourth of the grid is
/// visited per tick, amortising the cost over a second of frames.
pub fn traverse_clearing(node: &mut TraverseNode, tick: u64) {
    if node.id.lod == 3 {
        let slot = (node.id.y * 8 + node.id.x) % 64;
        if slot as u64 != tick % 64 {
            return;
        }
    }
    if node.last_access_tick + 5 < tick {
        node.clear();
        return;
    }
    for child in &mut node.children {
        traverse_clearing(child, tick);
    }
}

/// Binary corner combination: bit i of `index` selects the upper bound
/// on axis i.
fn lower_upper_combine(index: usize) -> DVec3 {
    DVec3::new(
        (index & 1) as f64,
        ((index >> 1) & 1) as f64,
        ((index >> 2) & 1) as f64,
    )
}

/// Oriented box from the eight physical corners of a tile.
fn build_obb(corners: &[DVec3; 8]) -> Obb {
    let centre = corners.iter().sum::<DVec3>() / 8.0;
    let forward = corners[4] - corners[0];
    let up = corners[2] - corners[0];
    let t = DMat4::look_at_rh(centre, centre + forward, up);
    let mut lo = DVec3::splat(f64::INFINITY);
    let mut hi = DVec3::splat(f64::NEG_INFINITY);
    for corner in corners {
        let p = t.transform_point3(*corner);
        lo = lo.min(p);
        hi = hi.max(p);
    }
    Obb {
        rot_inv: t.inverse(),
        points: [lo, hi],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lower_upper_combine_covers_all_corners() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..8 {
            let c = lower_upper_combine(i);
            assert!(c.x == 0.0 || c.x == 1.0);
            assert!(c.y == 0.0 || c.y == 1.0);
            assert!(c.z == 0.0 || c.z == 1.0);
            seen.insert((c.x as u8, c.y as u8, c.z as u8));
        }
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn test_obb_contains_all_corners() {
        let corners = [
            DVec3::new(0.0, 0.0, 0.0),
            DVec3::new(1.0, 0.0, 0.1),
            DVec3::new(0.0, 1.0, 0.0),
            DVec3::new(1.0, 1.0, 0.1),
            DVec3::new(0.0, 0.0, 2.0),
            DVec3::new(1.0, 0.0, 2.1),
            DVec3::new(0.0, 1.0, 2.0),
            DVec3::new(1.0, 1.0, 2.1),
        ];
        let obb = build_obb(&corners);
        let t = obb.rot_inv.inverse();
        for corner in &corners {
            let p = t.transform_point3(*corner);
            for axis in 0..3 {
                assert!(p[axis] >= obb.points[0][axis] - 1e-9);
                assert!(p[axis] <= obb.points[1][axis] + 1e-9);
            }
        }
    }

    #[test]
    fn test_clearing_drops_stale_subtree() {
        let mut root = TraverseNode::root();
        root.meta = Some(MetaNode::default());
        root.last_access_tick = 0;
        let mut child = TraverseNode::new(TileId { lod: 1, x: 0, y: 0 });
        child.last_access_tick = 0;
        root.children.push(child);

        // tick 5: still within the grace window
        traverse_clearing(&mut root, 5);
        assert!(root.meta.is_some());

        // tick 6: root is stale, whole subtree dropped
        traverse_clearing(&mut root, 6);
        assert!(root.meta.is_none());
        assert!(root.children.is_empty());
    }

    #[test]
    fn test_clearing_lod3_sampled() {
        let mut node = TraverseNode::new(TileId { lod: 3, x: 2, y: 1 });
        node.last_access_tick = 0;
        node.meta = Some(MetaNode::default());
        // slot = (1*8 + 2) % 64 = 10; tick 9 skips the node entirely
        traverse_clearing(&mut node, 9);
        assert!(node.meta.is_some());
        // tick 74 maps to slot 10 and clears it
        traverse_clearing(&mut node, 74);
        assert!(node.meta.is_none());
    }
}
