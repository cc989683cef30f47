//! Terrastream - streaming runtime core for 3D geospatial tile browsers
//!
//! Given a map configuration (a manifest of tiled surface layers on a
//! reference frame) and a moving camera, this library decides each frame
//! which tiles of a hierarchical quad-tree should be visible, fetches the
//! metadata and payloads those tiles need in the background, and assembles
//! ordered draw lists for an external GPU renderer, all under a bounded
//! memory budget.
//!
//! # Architecture
//!
//! ```text
//! Map facade ──► Traversal engine ──► Resource store ──► Fetch pipeline
//!     │               │                    │                  │
//!     │               ▼                    ▼                  ▼
//!     │          Meta resolver        Blob cache          Fetcher (HTTP)
//!     ▼
//! MapDraws (opaque / transparent / infographic)
//! ```
//!
//! The render thread owns the traversal tree and the draw lists; it never
//! blocks on I/O. Readiness is polled as a tri-valued [`Validity`] each
//! frame - a tile that is not ready is simply not drawn until it is.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use terrastream::{Map, MapOptions, HttpFetcher};
//!
//! let fetcher = Arc::new(HttpFetcher::new(Default::default())?);
//! let mut map = Map::new(MapOptions::default(), fetcher, Default::default());
//! map.set_map_config_path("https://example.com/mapconfig.json", None);
//! map.render_initialize();
//! loop {
//!     map.render_tick_prepare();
//!     map.render_tick_render(1920, 1080);
//!     let draws = map.draws();
//!     // hand draws to the GPU backend
//! }
//! ```

pub mod cache;
pub mod camera;
pub mod coord;
pub mod draws;
pub mod fetch;
pub mod gpu;
pub mod map;
pub mod mapconfig;
pub mod meta;
pub mod resource;
pub mod surface;
pub mod telemetry;
pub mod tile;
pub mod traverse;

pub use draws::{DrawTask, MapDraws};
pub use fetch::{
    FetchError, FetchReply, Fetcher, HttpFetcher, HttpFetcherConfig, MemoryFetcher,
};
pub use map::{Map, MapError, MapOptions, TraverseMode};
pub use resource::{ResourceStore, Validity};
pub use tile::TileId;
