//! Map-configuration wire model.
//!
//! A map configuration is a JSON manifest describing the reference frame
//! (subdivision and coordinate plumbing), the spatial reference systems,
//! the stacked surfaces providing geometry, the bound layers draped over
//! them, the active view and the initial position. The runtime fetches it
//! through the resource store like any other resource and derives the
//! surface stack from it.

mod url;

pub use url::{UrlTemplate, UrlVars};

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use glam::{DVec2, DVec3};

use crate::tile::TileId;

/// Errors raised while parsing or validating a map configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The manifest is not valid JSON.
    #[error("malformed map configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// A view or surface references an id that is never defined.
    #[error("dangling reference to '{0}' in map configuration")]
    DanglingReference(String),

    /// The reference frame is unusable.
    #[error("invalid reference frame: {0}")]
    InvalidReferenceFrame(String),
}

/// Spatial reference system definition.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SrsDefinition {
    /// Geodetic lon/lat/alt on an ellipsoid.
    #[serde(rename_all = "camelCase")]
    Geographic {
        major_radius: f64,
        flattening: f64,
    },
    /// Planar metric coordinates, optionally periodic in x.
    #[serde(rename_all = "camelCase")]
    Projected {
        #[serde(default)]
        period: Option<f64>,
    },
    /// The physical frame itself.
    Cartesian,
}

/// Axis-aligned extents of the root subdivision.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
pub struct DivisionExtents {
    pub ll: [f64; 3],
    pub ur: [f64; 3],
}

impl DivisionExtents {
    pub fn ll(&self) -> DVec3 {
        DVec3::from_array(self.ll)
    }

    pub fn ur(&self) -> DVec3 {
        DVec3::from_array(self.ur)
    }
}

/// The tree's spatial subdivision and coordinate plumbing.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceFrame {
    pub id: String,
    /// Side of a meta-tile block is `2^meta_binary_order` tiles.
    pub meta_binary_order: u8,
    pub navigation_srs: String,
    pub physical_srs: String,
    pub division: Division,
}

/// Root division of the reference frame.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Division {
    pub extents: DivisionExtents,
}

impl ReferenceFrame {
    /// 2D extents of a tile in the navigation frame.
    ///
    /// Row 0 borders the upper edge of the division; `x` grows rightward,
    /// `y` downward, halving per lod step.
    pub fn tile_extents(&self, id: TileId) -> (DVec2, DVec2) {
        let ll = self.division.extents.ll();
        let ur = self.division.extents.ur();
        let n = (1u64 << id.lod) as f64;
        let sx = (ur.x - ll.x) / n;
        let sy = (ur.y - ll.y) / n;
        let tile_ll = DVec2::new(ll.x + sx * id.x as f64, ur.y - sy * (id.y + 1) as f64);
        let tile_ur = DVec2::new(ll.x + sx * (id.x + 1) as f64, ur.y - sy * id.y as f64);
        (tile_ll, tile_ur)
    }
}

/// Availability constraint of a bound layer.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    /// Inclusive lod range the layer has content for.
    pub lod_range: [u8; 2],
    /// Inclusive tile range `[[x0, y0], [x1, y1]]` at the lower lod.
    pub tile_range: [[u32; 2]; 2],
}

impl Availability {
    /// True when the layer may have content for the tile.
    pub fn covers(&self, id: TileId) -> bool {
        if id.lod < self.lod_range[0] || id.lod > self.lod_range[1] {
            return false;
        }
        // project the tile up to the range's base lod
        let shift = id.lod - self.lod_range[0];
        let x = id.x >> shift;
        let y = id.y >> shift;
        x >= self.tile_range[0][0]
            && x <= self.tile_range[1][0]
            && y >= self.tile_range[0][1]
            && y <= self.tile_range[1][1]
    }
}

/// A raster overlay applied onto surface geometry via UV remapping.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundLayer {
    pub id: String,
    /// Numeric id used by mesh submeshes to reference a texture layer.
    #[serde(default)]
    pub numeric_id: Option<u16>,
    /// Colour tile URL template; absent for external layers until
    /// their definition resource is merged in.
    #[serde(default)]
    pub url: Option<String>,
    /// Mask tile URL template for non-watertight layers.
    #[serde(default)]
    pub mask_url: Option<String>,
    #[serde(default)]
    pub availability: Option<Availability>,
    #[serde(default)]
    pub credits: Vec<String>,
    #[serde(default)]
    pub watertight: bool,
    #[serde(default, rename = "isTransparent")]
    pub transparent: bool,
    #[serde(default)]
    pub alpha: Option<f64>,
    /// URL of a standalone definition to fetch and merge before use.
    #[serde(default)]
    pub external_url: Option<String>,
}

impl BoundLayer {
    /// True when the full definition lives in a separate resource.
    pub fn is_external(&self) -> bool {
        self.external_url.is_some()
    }
}

/// A named, URL-templated source of meta-tiles, meshes and textures.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Surface {
    pub id: String,
    pub meta_url: String,
    pub mesh_url: String,
    /// Internal texture URL template (per tile and submesh).
    pub texture_url: String,
    #[serde(default)]
    pub geodata_url: Option<String>,
    #[serde(default)]
    pub alien: bool,
    #[serde(default)]
    pub credits: Vec<String>,
}

/// Several stacked surfaces served as a single virtual one.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualSurface {
    /// Ids of the component surfaces.
    pub id: Vec<String>,
    /// URL of the tileset-mapping resource.
    pub mapping_url: String,
}

/// Reference to a bound layer within a view, with optional alpha.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BoundLayerParams {
    pub id: String,
    #[serde(default)]
    pub alpha: Option<f64>,
}

/// The active view: per-surface ordered bound-layer lists.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct View {
    #[serde(default)]
    pub surfaces: HashMap<String, Vec<BoundLayerParams>>,
}

/// Kind of the viewer position.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PositionType {
    /// Camera orbits the focus point at a distance derived from the
    /// vertical extent.
    #[default]
    Objective,
    /// Camera sits at the position itself.
    Subjective,
}

/// Viewer position in the navigation frame.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    #[serde(default, rename = "type")]
    pub kind: PositionType,
    /// Navigation-frame coordinates of the focus point.
    pub position: [f64; 3],
    /// Yaw, pitch, roll in degrees.
    pub orientation: [f64; 3],
    /// Height of the viewed area at the focus, navigation units.
    pub vertical_extent: f64,
    /// Vertical field of view in degrees.
    pub vertical_fov: f64,
}

/// Attribution notice definition.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Credit {
    pub id: u16,
    pub notice: String,
}

/// The parsed map-configuration manifest.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapConfig {
    pub reference_frame: ReferenceFrame,
    pub srses: HashMap<String, SrsDefinition>,
    #[serde(default)]
    pub bound_layers: Vec<BoundLayer>,
    pub surfaces: Vec<Surface>,
    #[serde(default)]
    pub virtual_surfaces: Vec<VirtualSurface>,
    #[serde(default)]
    pub view: View,
    pub position: Position,
    #[serde(default)]
    pub credits: HashMap<String, Credit>,
}

impl MapConfig {
    /// Parses and validates a manifest.
    pub fn from_json(data: &[u8]) -> Result<Self, ConfigError> {
        let config: MapConfig = serde_json::from_slice(data)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reference_frame.meta_binary_order == 0
            || self.reference_frame.meta_binary_order > 8
        {
            return Err(ConfigError::InvalidReferenceFrame(format!(
                "metaBinaryOrder {} out of range 1..=8",
                self.reference_frame.meta_binary_order
            )));
        }
        if !self.srses.contains_key(&self.reference_frame.navigation_srs) {
            return Err(ConfigError::DanglingReference(
                self.reference_frame.navigation_srs.clone(),
            ));
        }
        for (surface_id, layers) in &self.view.surfaces {
            if !self.surfaces.iter().any(|s| &s.id == surface_id) {
                return Err(ConfigError::DanglingReference(surface_id.clone()));
            }
            for l in layers {
                if !self.bound_layers.iter().any(|b| b.id == l.id) {
                    return Err(ConfigError::DanglingReference(l.id.clone()));
                }
            }
        }
        Ok(())
    }

    /// The navigation srs definition.
    pub fn navigation_srs(&self) -> &SrsDefinition {
        // validated at parse
        &self.srses[&self.reference_frame.navigation_srs]
    }

    /// Looks up a bound layer by id.
    pub fn bound_layer(&self, id: &str) -> Option<&BoundLayer> {
        self.bound_layers.iter().find(|b| b.id == id)
    }

    /// Looks up a bound layer by its numeric id.
    pub fn bound_layer_by_numeric(&self, numeric: u16) -> Option<&BoundLayer> {
        self.bound_layers
            .iter()
            .find(|b| b.numeric_id == Some(numeric))
    }

    /// Bound-layer params of the view for the given surface.
    pub fn view_bound_list(&self, surface_id: &str) -> &[BoundLayerParams] {
        self.view
            .surfaces
            .get(surface_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Generates the surface stack for the active view.
    ///
    /// Surfaces appear in manifest order, restricted to those the view
    /// names (all of them when the view is empty); topmost is front.
    pub fn surface_stack(&self) -> Vec<SurfaceStackEntry> {
        self.surfaces
            .iter()
            .filter(|s| self.view.surfaces.is_empty() || self.view.surfaces.contains_key(&s.id))
            .map(|s| SurfaceStackEntry {
                surface: Arc::new(SurfaceInfo::new(s)),
                alien: s.alien,
            })
            .collect()
    }

    /// Finds the virtual surface whose component set matches the view.
    pub fn matching_virtual_surface(&self) -> Option<&VirtualSurface> {
        let mut view_ids: Vec<&str> = self.view.surfaces.keys().map(|s| s.as_str()).collect();
        view_ids.sort_unstable();
        self.virtual_surfaces.iter().find(|vs| {
            let mut ids: Vec<&str> = vs.id.iter().map(|s| s.as_str()).collect();
            ids.sort_unstable();
            ids == view_ids
        })
    }

    /// Resolves a possibly relative URL against the manifest's own URL.
    pub fn resolve_url(base: &str, url: &str) -> String {
        if url.contains("://") {
            return url.to_string();
        }
        match base.rfind('/') {
            Some(pos) => format!("{}/{}", &base[..pos], url),
            None => url.to_string(),
        }
    }
}

/// Prepared per-surface URL templates.
#[derive(Debug)]
pub struct SurfaceInfo {
    pub id: String,
    pub url_meta: UrlTemplate,
    pub url_mesh: UrlTemplate,
    pub url_int_tex: UrlTemplate,
    pub url_geodata: Option<UrlTemplate>,
    pub credits: Vec<String>,
}

impl SurfaceInfo {
    pub fn new(s: &Surface) -> Self {
        Self {
            id: s.id.clone(),
            url_meta: UrlTemplate::new(&s.meta_url),
            url_mesh: UrlTemplate::new(&s.mesh_url),
            url_int_tex: UrlTemplate::new(&s.texture_url),
            url_geodata: s.geodata_url.as_deref().map(UrlTemplate::new),
            credits: s.credits.clone(),
        }
    }
}

/// One entry of the surface stack; topmost entry is first.
#[derive(Clone, Debug)]
pub struct SurfaceStackEntry {
    pub surface: Arc<SurfaceInfo>,
    /// Entry serves alien meta-nodes when set.
    pub alien: bool,
}

/// Tileset-mapping resource: redirection table for virtual surfaces.
///
/// `source_reference` values in meta-nodes are 1-based indices into this
/// list.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TilesetMappingConfig {
    pub surfaces: Vec<String>,
}

impl TilesetMappingConfig {
    pub fn from_json(data: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Authentication configuration resource.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// Extra request headers, typically an Authorization token.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl AuthConfig {
    pub fn from_json(data: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(data)?)
    }
}
