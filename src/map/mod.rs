//! The map facade.
//!
//! [`Map`] owns everything: the resource store, the fetch pipeline and
//! its data runtime, the traversal tree, the navigation state and the
//! per-frame draw lists. A host drives it with two calls per frame -
//! [`Map::render_tick_prepare`] (prerequisite loading, resource state
//! machine, tree clearing) and [`Map::render_tick_render`] (camera
//! composition and traversal) - and reads [`Map::draws`] afterwards.
//!
//! The facade is the sole owner of the active map configuration; changing
//! the config path purges the store, the tree and the frame state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::BlobCache;
use crate::camera::{Camera, CameraOverrides, NavigationState};
use crate::coord::CoordConvertor;
use crate::draws::{credit_notices, FrameHandles, MapDraws};
use crate::fetch::{AuthSlot, FetchPipeline, FetchPipelineConfig, Fetcher};
use crate::gpu::GpuCallbacks;
use crate::mapconfig::{
    AuthConfig, BoundLayer, MapConfig, SurfaceInfo, SurfaceStackEntry, TilesetMappingConfig,
};
use crate::resource::{
    DecodeContext, Handle, ResourceError, ResourceStore, StoreBudget, Validity,
};
use crate::surface::BoundLayerInfo;
use crate::telemetry::{MapStatistics, StatisticsSnapshot};
use crate::traverse::{traverse_clearing, Traversal, TraversalParams, TraverseNode};

pub use crate::traverse::TraverseMode;

/// Facade-level failures surfaced to the host.
#[derive(Debug, Error)]
pub enum MapError {
    /// The map configuration failed on every configured path.
    #[error("map configuration failed to load: {0}")]
    ConfigFailed(String),

    /// The authentication configuration failed fatally.
    #[error("authentication failure")]
    AuthFailed,

    /// The data runtime could not be created.
    #[error("failed to create data runtime: {0}")]
    RuntimeCreation(String),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Tunables of the runtime; defaults mirror a desktop browser profile.
#[derive(Clone, Debug)]
pub struct MapOptions {
    /// Coarseness threshold in pixels per texel.
    pub max_texel_to_pixel_scale: f64,
    pub max_resources_memory_ram: u64,
    pub max_resources_memory_gpu: u64,
    pub max_concurrent_downloads: usize,
    /// Cap on meta/draw determinations per tick.
    pub max_node_updates_per_tick: u32,
    /// Cap on decode transitions per tick; `-1` means unbounded.
    pub max_resource_processes_per_tick: i32,
    pub fetch_timeout: Duration,
    pub traverse_mode: TraverseMode,
    pub fixed_mode_lod: u8,
    pub fixed_mode_distance: f64,
    /// Fog reach as a fraction of the body's major radius.
    pub fog_radius_fraction: f64,
    /// Fallback configuration URLs tried in order after a fatal failure.
    pub alternate_config_paths: Vec<String>,
    pub blob_cache_bytes: u64,
    pub data_threads: usize,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            max_texel_to_pixel_scale: 1.2,
            max_resources_memory_ram: 1024 * 1024 * 1024,
            max_resources_memory_gpu: 512 * 1024 * 1024,
            max_concurrent_downloads: 10,
            max_node_updates_per_tick: 16,
            max_resource_processes_per_tick: 10,
            fetch_timeout: Duration::from_secs(30),
            traverse_mode: TraverseMode::Balanced,
            fixed_mode_lod: 10,
            fixed_mode_distance: 100_000.0,
            // an Earth-sized body gets the classic 50 km fog reach
            fog_radius_fraction: 50_000.0 / 6_378_137.0,
            alternate_config_paths: Vec::new(),
            blob_cache_bytes: 256 * 1024 * 1024,
            data_threads: 2,
        }
    }
}

/// State derived from a ready map configuration.
struct ActiveConfig {
    config: Arc<MapConfig>,
    convertor: CoordConvertor,
    stack: Vec<SurfaceStackEntry>,
    tileset_stack: Option<Vec<SurfaceStackEntry>>,
    bound_layers: HashMap<String, Arc<BoundLayerInfo>>,
    root: TraverseNode,
}

/// The per-frame entry point of the runtime.
pub struct Map {
    options: MapOptions,
    statistics: Arc<MapStatistics>,
    store: Arc<ResourceStore>,
    _runtime: tokio::runtime::Runtime,
    pipeline: FetchPipeline,
    auth_slot: AuthSlot,
    gpu: GpuCallbacks,

    map_config_path: Option<String>,
    auth_path: Option<String>,
    alternates_tried: usize,
    map_config: Option<Handle<MapConfig>>,
    auth: Option<Handle<AuthConfig>>,
    tileset_mapping: Option<Handle<TilesetMappingConfig>>,
    active: Option<ActiveConfig>,
    initialized: bool,

    navigation: Option<NavigationState>,
    overrides: CameraOverrides,
    camera: Option<Camera>,
    draws: MapDraws,
    frame_handles: FrameHandles,
}

impl Map {
    /// Creates the runtime with its own data threads.
    pub fn new(
        options: MapOptions,
        fetcher: Arc<dyn Fetcher>,
        gpu: GpuCallbacks,
    ) -> Result<Self, MapError> {
        let statistics = Arc::new(MapStatistics::default());
        let (store, fetch_rx) = ResourceStore::new(
            StoreBudget {
                max_ram_bytes: options.max_resources_memory_ram,
                max_gpu_bytes: options.max_resources_memory_gpu,
            },
            statistics.clone(),
        );
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(options.data_threads.max(1))
            .thread_name("terrastream-data")
            .enable_all()
            .build()
            .map_err(|e| MapError::RuntimeCreation(e.to_string()))?;
        let auth_slot = AuthSlot::default();
        let pipeline = FetchPipeline::start(
            runtime.handle(),
            FetchPipelineConfig {
                max_concurrent_downloads: options.max_concurrent_downloads,
                fetch_timeout: options.fetch_timeout,
            },
            fetcher,
            Arc::new(BlobCache::new(options.blob_cache_bytes)),
            auth_slot.clone(),
            fetch_rx,
            statistics.clone(),
        );
        Ok(Self {
            options,
            statistics,
            store,
            _runtime: runtime,
            pipeline,
            auth_slot,
            gpu,
            map_config_path: None,
            auth_path: None,
            alternates_tried: 0,
            map_config: None,
            auth: None,
            tileset_mapping: None,
            active: None,
            initialized: false,
            navigation: None,
            overrides: CameraOverrides::default(),
            camera: None,
            draws: MapDraws::default(),
            frame_handles: FrameHandles::default(),
        })
    }

    /// Points the map at a configuration manifest; purges current state.
    pub fn set_map_config_path(&mut self, path: &str, auth_path: Option<&str>) {
        info!(path, auth = auth_path.is_some(), "changing map config path");
        self.map_config_path = Some(path.to_string());
        self.auth_path = auth_path.map(str::to_string);
        self.alternates_tried = 0;
        self.purge_map_config();
    }

    /// Drops the tree, the draws and every cached resource.
    pub fn purge_map_config(&mut self) {
        debug!("purging map config");
        self.store.purge();
        self.auth_slot.set(None);
        self.map_config = None;
        self.auth = None;
        self.tileset_mapping = None;
        self.active = None;
        self.initialized = false;
        self.navigation = None;
        self.camera = None;
        self.draws = MapDraws::default();
        self.frame_handles.clear();
        self.statistics.reset();
    }

    pub fn render_initialize(&mut self) {
        info!("render initialize");
    }

    /// Shuts the pipeline down; in-flight fetches are abandoned.
    pub fn render_finalize(&mut self) {
        info!("render finalize");
        self.pipeline.shutdown();
    }

    /// True once the configuration chain is loaded and the tree exists.
    pub fn is_map_config_ready(&self) -> bool {
        self.initialized
    }

    /// Prerequisite loading, resource state machine and tree clearing.
    pub fn render_tick_prepare(&mut self) -> Result<(), MapError> {
        let tick = self.statistics.begin_frame();
        let ctx = DecodeContext {
            meta_binary_order: self
                .active
                .as_ref()
                .map(|a| a.config.reference_frame.meta_binary_order),
        };
        self.store.tick(
            tick,
            self.options.max_resource_processes_per_tick,
            &ctx,
            &self.gpu,
        );

        if !self.prerequisites_check()? {
            return Ok(());
        }
        if let Some(active) = &mut self.active {
            traverse_clearing(&mut active.root, tick);
        }
        Ok(())
    }

    /// Composes the camera and traverses the tree into draw lists.
    pub fn render_tick_render(&mut self, window_width: u32, window_height: u32) {
        if !self.initialized {
            return;
        }
        let Some(active) = &mut self.active else {
            return;
        };
        let Some(navigation) = &self.navigation else {
            return;
        };

        let camera = Camera::compose(
            navigation,
            &active.convertor,
            window_width,
            window_height,
            self.options.fog_radius_fraction,
            &mut self.overrides,
        );

        self.draws.clear();
        self.frame_handles.clear();
        self.draws.camera.eye = camera.eye.to_array();
        self.draws.camera.view = camera.view.to_cols_array();
        self.draws.camera.proj = camera.proj.to_cols_array();

        let params = TraversalParams {
            mode: self.options.traverse_mode,
            max_texel_to_pixel_scale: self.options.max_texel_to_pixel_scale,
            max_node_updates: self.options.max_node_updates_per_tick,
            fixed_mode_lod: self.options.fixed_mode_lod,
            fixed_mode_distance: self.options.fixed_mode_distance,
        };
        let tick = self.statistics.frame();
        let mut traversal = Traversal {
            store: self.store.as_ref(),
            config: active.config.as_ref(),
            stack: &active.stack,
            tileset_stack: active.tileset_stack.as_deref(),
            bound_layers: &active.bound_layers,
            convertor: &active.convertor,
            camera: &camera,
            params: &params,
            statistics: self.statistics.as_ref(),
            tick,
            draws: &mut self.draws,
            frame_handles: &mut self.frame_handles,
        };
        traversal.run(&mut active.root);

        self.draws.sort_opaque_front_to_back();
        self.camera = Some(camera);
    }

    /// The draw bundle of the last rendered frame.
    pub fn draws(&self) -> &MapDraws {
        &self.draws
    }

    /// Attribution notices of everything drawn last frame.
    pub fn credits(&self) -> Vec<String> {
        match &self.active {
            Some(active) => credit_notices(&self.draws.credits, active.config.as_ref()),
            None => Vec::new(),
        }
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.statistics.snapshot()
    }

    /// The camera composed by the last render tick.
    pub fn camera(&self) -> Option<&Camera> {
        self.camera.as_ref()
    }

    pub fn camera_overrides(&mut self) -> &mut CameraOverrides {
        &mut self.overrides
    }

    // ------------------------------------------------------------------
    // navigation affordances
    // ------------------------------------------------------------------

    pub fn pan(&mut self, value: [f64; 3]) {
        if let (Some(nav), Some(active)) = (&mut self.navigation, &self.active) {
            nav.pan(&active.convertor, value);
        }
    }

    pub fn rotate(&mut self, value: [f64; 3]) {
        if let Some(nav) = &mut self.navigation {
            nav.rotate(value);
        }
    }

    pub fn zoom(&mut self, notches: f64) {
        if let Some(nav) = &mut self.navigation {
            nav.zoom(notches);
        }
    }

    /// Serialises the viewer position, shareable as a URL fragment.
    pub fn position_url(&self) -> Option<String> {
        self.navigation.as_ref().map(|n| n.to_url())
    }

    /// Restores a position produced by [`Self::position_url`].
    pub fn set_position_url(&mut self, url: &str) -> bool {
        match NavigationState::from_url(url) {
            Some(nav) => {
                self.navigation = Some(nav);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // prerequisites
    // ------------------------------------------------------------------

    /// Loads the configuration chain step by step, one validity check per
    /// tick: auth, manifest, external bound layers, tileset mapping.
    fn prerequisites_check(&mut self) -> Result<bool, MapError> {
        let tick = self.statistics.frame();
        if let Some(h) = &self.map_config {
            h.touch(tick);
        }
        if let Some(h) = &self.auth {
            h.touch(tick);
        }
        if let Some(h) = &self.tileset_mapping {
            h.touch(tick);
        }
        if self.initialized {
            return Ok(true);
        }
        let Some(config_path) = self.map_config_path.clone() else {
            return Ok(false);
        };

        // authentication first; everything else fetches with its headers
        if let Some(auth_path) = self.auth_path.clone() {
            let auth = match &self.auth {
                Some(handle) => handle.clone(),
                None => {
                    let handle = self.store.get::<AuthConfig>(&auth_path)?;
                    handle.update_priority(f64::INFINITY);
                    self.auth_slot.set(Some(handle.clone()));
                    self.auth = Some(handle.clone());
                    handle
                }
            };
            match auth.validity() {
                Validity::Valid => {}
                Validity::Indeterminate => return Ok(false),
                Validity::Invalid => return Err(MapError::AuthFailed),
            }
        }

        let config_handle = match &self.map_config {
            Some(handle) => handle.clone(),
            None => {
                let handle = self.store.get::<MapConfig>(&config_path)?;
                handle.update_priority(f64::INFINITY);
                self.map_config = Some(handle.clone());
                handle
            }
        };
        match config_handle.validity() {
            Validity::Valid => {}
            Validity::Indeterminate => return Ok(false),
            Validity::Invalid => return self.try_alternate_config(&config_path),
        }
        let config = config_handle.value().expect("valid config has a payload");

        // external bound layers merge their standalone definitions
        let mut merged_layers: Vec<BoundLayer> = Vec::with_capacity(config.bound_layers.len());
        for layer in &config.bound_layers {
            if let Some(external_url) = &layer.external_url {
                let url = MapConfig::resolve_url(&config_path, external_url);
                let handle = self.store.get::<BoundLayer>(&url)?;
                handle.touch(tick);
                handle.update_priority(f64::INFINITY);
                match handle.validity() {
                    Validity::Valid => {
                        let fetched = handle.value().expect("valid layer has a payload");
                        let mut merged = (*fetched).clone();
                        merged.id = layer.id.clone();
                        merged.numeric_id = layer.numeric_id.or(merged.numeric_id);
                        merged_layers.push(merged);
                    }
                    Validity::Indeterminate => return Ok(false),
                    Validity::Invalid => {
                        warn!(layer = %layer.id, "external bound layer failed, skipping");
                    }
                }
            } else {
                merged_layers.push(layer.clone());
            }
        }
        let mut config = (*config).clone();
        config.bound_layers = merged_layers;

        // virtual surface: serve the whole view through one mapping
        let mut tileset_stack = None;
        if let Some(virtual_surface) = config.matching_virtual_surface().cloned() {
            let url = MapConfig::resolve_url(&config_path, &virtual_surface.mapping_url);
            let handle = match &self.tileset_mapping {
                Some(handle) => handle.clone(),
                None => {
                    let handle = self.store.get::<TilesetMappingConfig>(&url)?;
                    handle.update_priority(f64::INFINITY);
                    self.tileset_mapping = Some(handle.clone());
                    handle
                }
            };
            match handle.validity() {
                Validity::Valid => {
                    let mapping = handle.value().expect("valid mapping has a payload");
                    tileset_stack = Some(build_tileset_stack(&config, mapping.as_ref()));
                }
                Validity::Indeterminate => return Ok(false),
                Validity::Invalid => {
                    return Err(MapError::ConfigFailed("tileset mapping failed".into()))
                }
            }
        }

        let stack = config.surface_stack();
        if stack.is_empty() {
            return Err(MapError::ConfigFailed(
                "map configuration has no usable surfaces".into(),
            ));
        }
        let bound_layers = BoundLayerInfo::build_registry(&config);
        let convertor = CoordConvertor::new(config.navigation_srs().clone());
        if self.navigation.is_none() {
            self.navigation = Some(NavigationState::from_position(&config.position));
        }
        self.active = Some(ActiveConfig {
            config: Arc::new(config),
            convertor,
            stack,
            tileset_stack,
            bound_layers,
            root: TraverseNode::root(),
        });
        self.initialized = true;
        info!("map config ready");
        Ok(true)
    }

    /// Switches to the next alternate configuration path, if any remain.
    fn try_alternate_config(&mut self, failed: &str) -> Result<bool, MapError> {
        let alternates = self.options.alternate_config_paths.clone();
        if self.alternates_tried < alternates.len() {
            let next = alternates[self.alternates_tried].clone();
            let tried = self.alternates_tried + 1;
            warn!(failed, next = %next, "map config failed, trying alternate");
            let auth = self.auth_path.clone();
            self.set_map_config_path(&next, auth.as_deref());
            self.alternates_tried = tried;
            Ok(false)
        } else {
            Err(MapError::ConfigFailed(failed.to_string()))
        }
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        self.pipeline.shutdown();
    }
}

/// Resolves the mapping's surface ids against the manifest.
fn build_tileset_stack(
    config: &MapConfig,
    mapping: &TilesetMappingConfig,
) -> Vec<SurfaceStackEntry> {
    mapping
        .surfaces
        .iter()
        .filter_map(|id| {
            config.surfaces.iter().find(|s| &s.id == id).map(|s| {
                SurfaceStackEntry {
                    surface: Arc::new(SurfaceInfo::new(s)),
                    alien: s.alien,
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let options = MapOptions::default();
        assert_eq!(options.max_concurrent_downloads, 10);
        assert_eq!(options.traverse_mode, TraverseMode::Balanced);
        // Earth-sized body gets ~50 km of fog
        let fog = options.fog_radius_fraction * 6_378_137.0;
        assert!((fog - 50_000.0).abs() < 1.0);
    }

    #[test]
    fn test_map_without_config_is_not_ready() {
        let fetcher = Arc::new(crate::fetch::MemoryFetcher::new());
        let mut map = Map::new(MapOptions::default(), fetcher, GpuCallbacks::default()).unwrap();
        assert!(!map.is_map_config_ready());
        map.render_tick_prepare().unwrap();
        assert!(!map.is_map_config_ready());
        map.render_tick_render(800, 600);
        assert!(map.draws().is_empty());
    }

    #[test]
    fn test_set_position_url_roundtrip() {
        let fetcher = Arc::new(crate::fetch::MemoryFetcher::new());
        let mut map = Map::new(MapOptions::default(), fetcher, GpuCallbacks::default()).unwrap();
        assert!(map.set_position_url("obj,14.42,50.08,0,0,-90,0,25000,45"));
        let url = map.position_url().unwrap();
        assert!(url.starts_with("obj,14.42"));
        assert!(!map.set_position_url("garbage"));
    }
}
