//! Coordinate conversion between the spatial reference systems of a map.
//!
//! Three frames matter to the runtime: the *navigation* srs the camera
//! position lives in (geographic lon/lat/alt or planar projected), the
//! *physical* srs everything is rendered in (earth-centred cartesian for
//! geographic frames, metric planar for projected ones) and the per-node
//! srs of individual tiles, which shares the navigation frame's units.
//!
//! Conversions are pure functions. A conversion that cannot be inverted
//! yields NaN components, which propagate; callers check the result with
//! `is_finite()` rather than unwrapping a `Result` on the hot path.

use glam::DVec3;
use thiserror::Error;

use crate::mapconfig::SrsDefinition;

/// Errors raised while assembling a convertor from configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordError {
    /// The map configuration references an srs id it never defines.
    #[error("unknown srs id '{0}' in reference frame")]
    UnknownSrs(String),
}

/// The frames a point can be expressed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Camera/navigation coordinates (lon/lat/alt or planar x/y/alt).
    Navigation,
    /// Render coordinates (earth-centred cartesian or metric planar).
    Physical,
    /// Local coordinates of a tile; numerically the navigation frame
    /// restricted to the tile's extents.
    Node,
}

/// Converts points between the frames of one reference frame.
///
/// Built once per map configuration; cheap to clone.
#[derive(Clone, Debug)]
pub struct CoordConvertor {
    navigation: SrsDefinition,
}

impl CoordConvertor {
    /// Builds a convertor for the given navigation srs definition.
    pub fn new(navigation: SrsDefinition) -> Self {
        Self { navigation }
    }

    /// Converts `p` from frame `from` to frame `to`.
    ///
    /// Routes through the physical frame; unrepresentable inputs come out
    /// as NaN.
    pub fn convert(&self, p: DVec3, from: Frame, to: Frame) -> DVec3 {
        if from == to {
            return p;
        }
        let phys = match from {
            Frame::Navigation | Frame::Node => self.nav_to_phys(p),
            Frame::Physical => p,
        };
        match to {
            Frame::Navigation | Frame::Node => self.phys_to_nav(phys),
            Frame::Physical => phys,
        }
    }

    /// Navigation to physical.
    pub fn nav_to_phys(&self, p: DVec3) -> DVec3 {
        match self.navigation {
            SrsDefinition::Geographic {
                major_radius,
                flattening,
            } => geodetic_to_cartesian(p, major_radius, flattening),
            SrsDefinition::Projected { .. } | SrsDefinition::Cartesian => p,
        }
    }

    /// Physical to navigation.
    pub fn phys_to_nav(&self, p: DVec3) -> DVec3 {
        match self.navigation {
            SrsDefinition::Geographic {
                major_radius,
                flattening,
            } => cartesian_to_geodetic(p, major_radius, flattening),
            SrsDefinition::Projected { .. } | SrsDefinition::Cartesian => p,
        }
    }

    /// Major radius of the reference body, in physical units.
    ///
    /// For projected frames this falls back to the WGS84 value so that
    /// quantities derived from it (far plane, fog) stay sane.
    pub fn body_major_radius(&self) -> f64 {
        match self.navigation {
            SrsDefinition::Geographic { major_radius, .. } => major_radius,
            SrsDefinition::Projected { .. } | SrsDefinition::Cartesian => WGS84_MAJOR_RADIUS,
        }
    }

    /// True when the navigation frame is geographic.
    pub fn is_geographic(&self) -> bool {
        matches!(self.navigation, SrsDefinition::Geographic { .. })
    }
}

/// WGS84 semi-major axis in metres.
pub const WGS84_MAJOR_RADIUS: f64 = 6_378_137.0;

/// WGS84 flattening.
pub const WGS84_FLATTENING: f64 = 1.0 / 298.257_223_563;

/// Geodetic (lon deg, lat deg, alt m) to earth-centred cartesian.
fn geodetic_to_cartesian(p: DVec3, major_radius: f64, flattening: f64) -> DVec3 {
    let lon = p.x.to_radians();
    let lat = p.y.to_radians();
    let alt = p.z;
    let e2 = flattening * (2.0 - flattening);
    let sin_lat = lat.sin();
    let cos_lat = lat.cos();
    let n = major_radius / (1.0 - e2 * sin_lat * sin_lat).sqrt();
    DVec3::new(
        (n + alt) * cos_lat * lon.cos(),
        (n + alt) * cos_lat * lon.sin(),
        (n * (1.0 - e2) + alt) * sin_lat,
    )
}

/// Earth-centred cartesian to geodetic (lon deg, lat deg, alt m).
///
/// Bowring's closed-form approximation; sub-millimetre for near-surface
/// points. Degenerates to NaN at the body centre, by construction.
fn cartesian_to_geodetic(p: DVec3, major_radius: f64, flattening: f64) -> DVec3 {
    let e2 = flattening * (2.0 - flattening);
    let b = major_radius * (1.0 - flattening);
    let ep2 = (major_radius * major_radius - b * b) / (b * b);
    let r = (p.x * p.x + p.y * p.y).sqrt();
    if r == 0.0 && p.z == 0.0 {
        return DVec3::splat(f64::NAN);
    }
    let theta = (p.z * major_radius).atan2(r * b);
    let lat = (p.z + ep2 * b * theta.sin().powi(3))
        .atan2(r - e2 * major_radius * theta.cos().powi(3));
    let lon = p.y.atan2(p.x);
    let sin_lat = lat.sin();
    let n = major_radius / (1.0 - e2 * sin_lat * sin_lat).sqrt();
    let alt = if lat.cos().abs() > 1e-12 {
        r / lat.cos() - n
    } else {
        p.z.abs() - b
    };
    DVec3::new(lon.to_degrees(), lat.to_degrees(), alt)
}
