//! Frustum and screen-space tests over traversal nodes.

use glam::{DVec3, DVec4};

use crate::camera::Camera;

use super::node::TraverseNode;

/// Depth below which nodes carry an oriented-box refinement.
pub const OBB_MIN_DEPTH: u32 = 4;

/// Classifies the node's bounds against the six frustum planes.
///
/// Uses the p-vertex optimisation: per plane, only the box corner that
/// maximises the signed distance is tested; if even that corner is
/// outside, the whole box is. Deep nodes additionally refine with their
/// oriented box, which hugs curved terrain much tighter than the AABB.
pub fn visibility_test(node: &TraverseNode, camera: &Camera) -> bool {
    if !aabb_in_frustum(&node.aabb_phys, &camera.frustum_planes) {
        return false;
    }
    if node.id.distance_from_root() > OBB_MIN_DEPTH {
        if let Some(obb) = &node.obb {
            // move each plane into box space; points stay axis-aligned
            let rot_inv_t = obb.rot_inv.transpose();
            for plane in &camera.frustum_planes {
                let local = rot_inv_t * *plane;
                if !corner_inside(&obb.points, &local) {
                    return false;
                }
            }
        }
    }
    true
}

fn aabb_in_frustum(aabb: &[DVec3; 2], planes: &[DVec4; 6]) -> bool {
    planes.iter().all(|p| corner_inside(aabb, p))
}

/// P-vertex test of one plane against a lower/upper box.
fn corner_inside(aabb: &[DVec3; 2], plane: &DVec4) -> bool {
    let pv = DVec3::new(
        aabb[usize::from(plane.x > 0.0)].x,
        aabb[usize::from(plane.y > 0.0)].y,
        aabb[usize::from(plane.z > 0.0)].z,
    );
    let d = plane.truncate().dot(pv);
    // NaN (undetermined bounds) must pass, so reject only on a definite
    // negative
    !(d < -plane.w)
}

/// Screen-space coarseness decision: true when the tile is fine enough
/// to render without descending.
///
/// For each of the eight corners a world-space segment of the node's
/// texel size is projected; the tile is accepted only when every
/// projected length stays under `max_texel_to_pixel_scale` pixels. The
/// display-size criterion is reserved and accepts unconditionally.
pub fn coarseness_test(
    node: &TraverseNode,
    camera: &Camera,
    max_texel_to_pixel_scale: f64,
) -> bool {
    let Some(meta) = &node.meta else {
        return false;
    };
    let apply_texel = meta.flags.apply_texel_size();
    let apply_display = meta.flags.apply_display_size();
    if !apply_texel && !apply_display {
        return false;
    }

    let mut result = true;
    if apply_texel {
        let up = camera.perpendicular * meta.texel_size as f64;
        for corner in &node.corners_phys {
            let c1 = *corner - up * 0.5;
            let c2 = c1 + up;
            let p1 = project(camera, c1);
            let p2 = project(camera, c2);
            let len = (p2 - p1).length() * camera.window_height as f64;
            result = result && len < max_texel_to_pixel_scale;
        }
    }
    result
}

fn project(camera: &Camera, p: DVec3) -> DVec3 {
    let clip = camera.view_proj * p.extend(1.0);
    clip.truncate() / clip.w
}

/// Distance from a point to an axis-aligned box; zero inside.
pub fn aabb_point_distance(p: DVec3, ll: DVec3, ur: DVec3) -> f64 {
    let clamped = p.clamp(ll, ur);
    (p - clamped).length()
}
