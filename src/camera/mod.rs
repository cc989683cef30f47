//! Navigation state and per-frame camera composition.
//!
//! Navigation lives in the reference frame's navigation srs: a focus
//! position, yaw/pitch/roll orientation, a vertical extent (how much of
//! the world the view spans at the focus) and a vertical field of view.
//! Each frame the facade composes the physical-frame camera from it:
//! eye and view matrix, a projection whose far plane reaches past the
//! horizon, and the six frustum planes the traversal culls against.
//! Hosts may override any stage through [`CameraOverrides`].

use glam::{DMat4, DQuat, DVec2, DVec3, DVec4};

use crate::coord::{CoordConvertor, Frame};
use crate::mapconfig::{Position, PositionType};

/// Scale applied to pan deltas, navigation units per vertical extent.
const PAN_SPEED: f64 = 1.0 / 800.0;

/// Mutable viewer state in the navigation frame.
#[derive(Clone, Debug)]
pub struct NavigationState {
    pub kind: PositionType,
    /// Focus point, navigation srs.
    pub position: DVec3,
    /// Yaw, pitch, roll in degrees.
    pub orientation: DVec3,
    pub vertical_extent: f64,
    pub vertical_fov: f64,
}

impl NavigationState {
    pub fn from_position(p: &Position) -> Self {
        Self {
            kind: p.kind,
            position: DVec3::from_array(p.position),
            orientation: DVec3::from_array(p.orientation),
            vertical_extent: p.vertical_extent,
            vertical_fov: p.vertical_fov,
        }
    }

    /// Moves the focus in view-aligned surface directions.
    ///
    /// `value` is (right, forward, zoom-notch); the move scales with the
    /// vertical extent so panning feels constant at every altitude. On a
    /// geographic frame the longitudinal step shrinks with latitude.
    pub fn pan(&mut self, convertor: &CoordConvertor, value: [f64; 3]) {
        let yaw = self.orientation.x.to_radians();
        let move_xy = DVec2::from_angle(-yaw).rotate(DVec2::new(-value[0], value[1]))
            * (self.vertical_extent * PAN_SPEED);
        if convertor.is_geographic() {
            let lat_rad = self.position.y.to_radians();
            let metres_per_deg = convertor.body_major_radius().to_radians(); // per degree of arc
            self.position.x += move_xy.x / (metres_per_deg * lat_rad.cos().max(1e-6));
            self.position.y = (self.position.y + move_xy.y / metres_per_deg).clamp(-89.9, 89.9);
            if self.position.x > 180.0 {
                self.position.x -= 360.0;
            } else if self.position.x < -180.0 {
                self.position.x += 360.0;
            }
        } else {
            self.position.x += move_xy.x;
            self.position.y += move_xy.y;
        }
        self.zoom(value[2]);
    }

    /// Rotates the view; `value` is (yaw delta, pitch delta, unused).
    pub fn rotate(&mut self, value: [f64; 3]) {
        self.orientation.x = (self.orientation.x - value[0] * 0.2).rem_euclid(360.0);
        self.orientation.y = (self.orientation.y - value[1] * 0.1).clamp(-90.0, 90.0);
    }

    /// Zooms by shrinking or growing the vertical extent.
    pub fn zoom(&mut self, notches: f64) {
        self.vertical_extent *= 1.001f64.powf(-notches);
    }

    /// Distance of an objective camera from the focus point.
    pub fn objective_distance(&self) -> f64 {
        self.vertical_extent * 0.5 / (self.vertical_fov.to_radians() * 0.5).tan()
    }

    /// Serialises the state into a position fragment:
    /// `kind,lon,lat,alt,yaw,pitch,roll,extent,fov`.
    pub fn to_url(&self) -> String {
        let kind = match self.kind {
            PositionType::Objective => "obj",
            PositionType::Subjective => "subj",
        };
        format!(
            "{},{:.6},{:.6},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2}",
            kind,
            self.position.x,
            self.position.y,
            self.position.z,
            self.orientation.x,
            self.orientation.y,
            self.orientation.z,
            self.vertical_extent,
            self.vertical_fov
        )
    }

    /// Parses a fragment produced by [`Self::to_url`].
    pub fn from_url(url: &str) -> Option<Self> {
        let mut parts = url.split(',');
        let kind = match parts.next()? {
            "obj" => PositionType::Objective,
            "subj" => PositionType::Subjective,
            _ => return None,
        };
        let mut values = [0f64; 8];
        for v in values.iter_mut() {
            *v = parts.next()?.trim().parse().ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            kind,
            position: DVec3::new(values[0], values[1], values[2]),
            orientation: DVec3::new(values[3], values[4], values[5]),
            vertical_extent: values[6],
            vertical_fov: values[7],
        })
    }
}

/// Per-frame camera override callbacks.
///
/// Applied in a fixed order: eye, target and up before the view matrix
/// is built, then the view matrix itself, then fov/aspect/near/far
/// before the projection, then the projection.
#[derive(Default)]
pub struct CameraOverrides {
    pub eye: Option<Box<dyn FnMut(&mut DVec3) + Send>>,
    pub target: Option<Box<dyn FnMut(&mut DVec3) + Send>>,
    pub up: Option<Box<dyn FnMut(&mut DVec3) + Send>>,
    pub view: Option<Box<dyn FnMut(&mut DMat4) + Send>>,
    pub fov_aspect_near_far: Option<Box<dyn FnMut(&mut f64, &mut f64, &mut f64, &mut f64) + Send>>,
    pub proj: Option<Box<dyn FnMut(&mut DMat4) + Send>>,
}

impl std::fmt::Debug for CameraOverrides {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraOverrides")
            .field("eye", &self.eye.is_some())
            .field("view", &self.view.is_some())
            .field("proj", &self.proj.is_some())
            .finish()
    }
}

/// The composed per-frame camera.
#[derive(Clone, Debug)]
pub struct Camera {
    pub eye: DVec3,
    pub target: DVec3,
    pub up: DVec3,
    pub forward: DVec3,
    /// Unit vector perpendicular to forward and up; the texel-size
    /// coarseness test displaces corners along it.
    pub perpendicular: DVec3,
    pub view: DMat4,
    pub proj: DMat4,
    pub view_proj: DMat4,
    /// Plane equations (nx, ny, nz, d); inside when `dot(n, p) >= -d`.
    pub frustum_planes: [DVec4; 6],
    pub window_width: u32,
    pub window_height: u32,
    /// Distance at which fog fully obscures terrain, physical units.
    pub fog_distance: f64,
}

impl Camera {
    /// Composes the camera for one frame.
    pub fn compose(
        nav: &NavigationState,
        convertor: &CoordConvertor,
        window_width: u32,
        window_height: u32,
        fog_radius_fraction: f64,
        overrides: &mut CameraOverrides,
    ) -> Camera {
        let mut target = convertor.nav_to_phys(nav.position);
        let (dir, mut up) = orientation_vectors(nav, convertor);

        let dist = match nav.kind {
            PositionType::Objective => nav.objective_distance(),
            PositionType::Subjective => 1e-5,
        };
        let mut eye = target - dir * dist;
        if let Some(cb) = &mut overrides.eye {
            cb(&mut eye);
        }
        if let Some(cb) = &mut overrides.target {
            cb(&mut target);
        }
        if let Some(cb) = &mut overrides.up {
            cb(&mut up);
        }
        let mut view = DMat4::look_at_rh(eye, target, up);
        if let Some(cb) = &mut overrides.view {
            cb(&mut view);
            // keep the derived vectors in sync with the override
            let inv = view.inverse();
            eye = inv.transform_point3(DVec3::ZERO);
            let forward = -DVec3::new(inv.z_axis.x, inv.z_axis.y, inv.z_axis.z);
            target = eye + forward * dist;
            up = DVec3::new(inv.y_axis.x, inv.y_axis.y, inv.y_axis.z);
        }
        let forward = (target - eye).normalize_or_zero();

        // far plane past the horizon plus mountains hiding behind it
        let mut near = (dist * 0.1).max(2.0);
        let body_radius = convertor.body_major_radius();
        let (terrain_above_origin, camera_above_origin) = if convertor.is_geographic() {
            let surface = convertor.nav_to_phys(DVec3::new(
                nav.position.x,
                nav.position.y,
                0.0,
            ));
            (surface.length(), eye.length())
        } else {
            (body_radius, body_radius + dist * 2.0)
        };
        let camera_to_horizon = if camera_above_origin > terrain_above_origin {
            (camera_above_origin * camera_above_origin
                - terrain_above_origin * terrain_above_origin)
                .sqrt()
        } else {
            0.0
        };
        let mountains = 5000.0 + terrain_above_origin;
        let mountains_behind_horizon = (mountains * mountains
            - terrain_above_origin * terrain_above_origin)
            .sqrt();
        let mut far = camera_to_horizon + mountains_behind_horizon;

        let mut fov = nav.vertical_fov;
        let mut aspect = window_width.max(1) as f64 / window_height.max(1) as f64;
        if let Some(cb) = &mut overrides.fov_aspect_near_far {
            cb(&mut fov, &mut aspect, &mut near, &mut far);
        }
        debug_assert!(fov > 1e-3 && fov < 180.0 - 1e-3);
        debug_assert!(near > 0.0 && far > near);
        let mut proj = DMat4::perspective_rh(fov.to_radians(), aspect, near, far);
        if let Some(cb) = &mut overrides.proj {
            cb(&mut proj);
        }

        let view_proj = proj * view;
        Camera {
            eye,
            target,
            up,
            forward,
            perpendicular: up.cross(forward).normalize_or_zero(),
            view,
            proj,
            view_proj,
            frustum_planes: frustum_planes(&view_proj),
            window_width,
            window_height,
            fog_distance: body_radius * fog_radius_fraction,
        }
    }
}

/// Forward and up vectors from the yaw/pitch orientation, physical frame.
fn orientation_vectors(nav: &NavigationState, convertor: &CoordConvertor) -> (DVec3, DVec3) {
    // local frame at the focus from finite differences in nav space
    let origin = convertor.nav_to_phys(nav.position);
    let local_up =
        (convertor.nav_to_phys(nav.position + DVec3::new(0.0, 0.0, 1.0)) - origin).normalize();
    let east_step = if convertor.is_geographic() { 1e-6 } else { 1.0 };
    let east = (convertor.nav_to_phys(nav.position + DVec3::new(east_step, 0.0, 0.0)) - origin)
        .normalize_or_zero();
    let north = local_up.cross(east).normalize_or_zero();

    let yaw = DQuat::from_axis_angle(local_up, -nav.orientation.x.to_radians());
    let east_rot = yaw * east;
    let pitch = DQuat::from_axis_angle(east_rot, nav.orientation.y.to_radians());
    let dir = (pitch * (yaw * north)).normalize();
    let up = (pitch * local_up).normalize();
    (dir, up)
}

/// Extracts the six planes from a view-projection matrix.
///
/// Row combinations per Gribb-Hartmann: left, right, bottom, top, near,
/// far. Planes are not normalised; the p-vertex test only needs signs
/// and relative distances against the same plane.
pub fn frustum_planes(view_proj: &DMat4) -> [DVec4; 6] {
    let r0 = view_proj.row(0);
    let r1 = view_proj.row(1);
    let r2 = view_proj.row(2);
    let r3 = view_proj.row(3);
    [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r3 + r2, r3 - r2]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{WGS84_FLATTENING, WGS84_MAJOR_RADIUS};
    use crate::mapconfig::SrsDefinition;

    fn convertor() -> CoordConvertor {
        CoordConvertor::new(SrsDefinition::Geographic {
            major_radius: WGS84_MAJOR_RADIUS,
            flattening: WGS84_FLATTENING,
        })
    }

    fn nav() -> NavigationState {
        NavigationState {
            kind: PositionType::Objective,
            position: DVec3::new(14.42, 50.08, 0.0),
            orientation: DVec3::new(0.0, -90.0, 0.0),
            vertical_extent: 20000.0,
            vertical_fov: 45.0,
        }
    }

    #[test]
    fn test_compose_looks_down_at_focus() {
        let nav = nav();
        let conv = convertor();
        let camera = Camera::compose(&nav, &conv, 1280, 720, 0.01, &mut Default::default());
        let focus = conv.nav_to_phys(nav.position);
        // the eye sits above the focus, outside the ellipsoid
        assert!(camera.eye.length() > focus.length());
        // forward points from eye to focus
        let to_focus = (focus - camera.eye).normalize();
        assert!(camera.forward.dot(to_focus) > 0.999);
    }

    #[test]
    fn test_focus_point_inside_frustum() {
        let nav = nav();
        let conv = convertor();
        let camera = Camera::compose(&nav, &conv, 1280, 720, 0.01, &mut Default::default());
        let focus = conv.nav_to_phys(nav.position);
        for plane in &camera.frustum_planes {
            let d = plane.truncate().dot(focus);
            assert!(d >= -plane.w, "focus behind plane {plane:?}");
        }
    }

    #[test]
    fn test_point_behind_camera_outside_frustum() {
        let nav = nav();
        let conv = convertor();
        let camera = Camera::compose(&nav, &conv, 1280, 720, 0.01, &mut Default::default());
        let behind = camera.eye - camera.forward * 1000.0;
        let inside = camera.frustum_planes.iter().all(|p| {
            p.truncate().dot(behind) >= -p.w
        });
        assert!(!inside);
    }

    #[test]
    fn test_eye_override_applies() {
        let nav = nav();
        let conv = convertor();
        let forced = DVec3::new(7e6, 0.0, 0.0);
        let mut overrides = CameraOverrides {
            eye: Some(Box::new(move |eye| *eye = forced)),
            ..Default::default()
        };
        let camera = Camera::compose(&nav, &conv, 1280, 720, 0.01, &mut overrides);
        assert!((camera.eye - forced).length() < 1e-9);
    }

    #[test]
    fn test_zoom_scales_extent() {
        let mut nav = nav();
        let before = nav.vertical_extent;
        nav.zoom(100.0);
        assert!(nav.vertical_extent < before);
        nav.zoom(-100.0);
        assert!((nav.vertical_extent - before).abs() / before < 1e-9);
    }

    #[test]
    fn test_pan_moves_north_at_zero_yaw() {
        let mut nav = nav();
        let lat_before = nav.position.y;
        nav.pan(&convertor(), [0.0, 100.0, 0.0]);
        assert!(nav.position.y > lat_before);
    }

    #[test]
    fn test_rotate_clamps_pitch() {
        let mut nav = nav();
        nav.rotate([0.0, 2000.0, 0.0]);
        assert_eq!(nav.orientation.y, -90.0);
    }

    #[test]
    fn test_position_url_roundtrip() {
        let nav = nav();
        let url = nav.to_url();
        let parsed = NavigationState::from_url(&url).unwrap();
        assert_eq!(parsed.kind, nav.kind);
        assert!((parsed.position - nav.position).length() < 1e-5);
        assert!((parsed.vertical_extent - nav.vertical_extent).abs() < 0.01);
    }

    #[test]
    fn test_position_url_rejects_garbage() {
        assert!(NavigationState::from_url("").is_none());
        assert!(NavigationState::from_url("obj,1,2").is_none());
        assert!(NavigationState::from_url("orbit,1,2,3,4,5,6,7,8").is_none());
    }

    #[test]
    fn test_objective_distance() {
        let nav = nav();
        // extent 20000 at 45 degrees: distance = 10000 / tan(22.5)
        let expected = 10000.0 / (22.5f64.to_radians()).tan();
        assert!((nav.objective_distance() - expected).abs() < 1e-6);
    }
}
