//! End-to-end tests of the map facade.
//!
//! A complete synthetic world - manifest, meta-tiles, meshes, textures -
//! is served from the in-memory fetcher and the facade is driven frame by
//! frame exactly as a host would:
//! - cold start until draws and credits appear
//! - descent into ready children
//! - branch pruning where no surface has geometry
//! - frame-to-frame determinism with a static camera
//!
//! Run with: `cargo test --test map_traversal_integration`

use std::sync::Arc;
use std::time::Duration;

use terrastream::fetch::MemoryFetcher;
use terrastream::gpu::GpuCallbacks;
use terrastream::meta::{GeomExtents, MetaFlags, MetaNode, MetaTile};
use terrastream::{FetchReply, Map, MapOptions, TileId};

// ============================================================================
// Helper Functions
// ============================================================================

const CONFIG_URL: &str = "https://m.example.com/mapconfig.json";

/// Smallest valid transparent PNG (1x1 RGBA).
const PNG_1X1: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

/// The manifest served at `CONFIG_URL`; meta binary order 1 keeps the
/// meta-tile grids at 2x2.
const MANIFEST: &str = r#"{
    "referenceFrame": {
        "id": "earth",
        "metaBinaryOrder": 1,
        "navigationSrs": "geo",
        "physicalSrs": "ecef",
        "division": { "extents": { "ll": [-180, -90, -12000], "ur": [180, 90, 9000] } }
    },
    "srses": {
        "geo": { "type": "geographic", "majorRadius": 6378137.0, "flattening": 0.0033528106647474805 },
        "ecef": { "type": "cartesian" }
    },
    "boundLayers": [],
    "surfaces": [
        { "id": "terrain",
          "metaUrl": "https://m.example.com/meta/{lod}-{x}-{y}.meta",
          "meshUrl": "https://m.example.com/mesh/{lod}-{x}-{y}.mesh",
          "textureUrl": "https://m.example.com/tex/{lod}-{x}-{y}-{sub}.jpg",
          "credits": ["cr1"] }
    ],
    "view": { "surfaces": { "terrain": [] } },
    "position": {
        "type": "objective",
        "position": [14.42, 50.08, 0],
        "orientation": [0, -90, 0],
        "verticalExtent": 25000,
        "verticalFov": 45
    },
    "credits": { "cr1": { "id": 1, "notice": "(c) synthetic imagery" } }
}"#;

/// Encodes a one-submesh aggregate with internal UVs.
fn encode_mesh() -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(b"MA01");
    data.extend_from_slice(&1u16.to_le_bytes()); // submesh count
    data.push(1); // internal uv
    data.extend_from_slice(&0u16.to_le_bytes()); // texture layer
    data.push(1); // surface reference
    for col in 0..4 {
        for row in 0..4 {
            let v: f64 = if row == col { 1.0 } else { 0.0 };
            data.extend_from_slice(&v.to_le_bytes());
        }
    }
    // 3 vertices, 36 bytes position data
    data.extend_from_slice(&3u32.to_le_bytes());
    data.extend_from_slice(&36u32.to_le_bytes());
    data.extend_from_slice(&[0u8; 36]);
    // 3 indices, 6 bytes
    data.extend_from_slice(&3u32.to_le_bytes());
    data.extend_from_slice(&6u32.to_le_bytes());
    data.extend_from_slice(&[0u8; 6]);
    data
}

fn geometry_node(child_flags: u16) -> MetaNode {
    MetaNode {
        flags: MetaFlags(MetaFlags::GEOMETRY | child_flags),
        extents_ll: [0.0, 0.0, 0.0],
        extents_ur: [1.0, 1.0, 1.0],
        geom_extents: Some(GeomExtents {
            z_min: -100.0,
            z_max: 100.0,
            surrogate: 0.0,
        }),
        texel_size: 1.0,
        display_size: 256,
        source_reference: 0,
        credits: vec![1],
        internal_texture_count: 1,
    }
}

/// 2x2 grid with the given node at offset (0, 0).
fn meta_block(origin: TileId, node: MetaNode) -> Vec<u8> {
    let mut nodes = vec![MetaNode::default(); 4];
    nodes[0] = node;
    MetaTile::encode(origin, 1, &nodes).to_vec()
}

/// Serves a single-tile world: the root has geometry and no children.
fn serve_leaf_root_world(fetcher: &MemoryFetcher) {
    fetcher.insert(CONFIG_URL, FetchReply::ok(MANIFEST));
    fetcher.insert(
        "https://m.example.com/meta/0-0-0.meta",
        FetchReply::ok(meta_block(TileId::ROOT, geometry_node(0))),
    );
    fetcher.insert(
        "https://m.example.com/mesh/0-0-0.mesh",
        FetchReply::ok(encode_mesh()),
    );
    fetcher.insert(
        "https://m.example.com/tex/0-0-0-0.jpg",
        FetchReply::ok(PNG_1X1),
    );
}

fn new_map(fetcher: Arc<MemoryFetcher>) -> Map {
    let mut map = Map::new(MapOptions::default(), fetcher, GpuCallbacks::default()).unwrap();
    map.set_map_config_path(CONFIG_URL, None);
    map.render_initialize();
    map
}

/// Drives frames until the predicate holds or panics after the limit.
fn drive_until(map: &mut Map, frames: usize, mut done: impl FnMut(&Map) -> bool) {
    for _ in 0..frames {
        map.render_tick_prepare().unwrap();
        map.render_tick_render(1280, 720);
        if done(map) {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("world did not converge within {frames} frames");
}

// ============================================================================
// Integration Tests
// ============================================================================

/// Cold start: configure, tick until the manifest chain and the root
/// tile are streamed in, then draws and credits are non-empty.
#[test]
fn test_cold_start_produces_draws_and_credits() {
    let fetcher = Arc::new(MemoryFetcher::new());
    serve_leaf_root_world(&fetcher);
    let mut map = new_map(fetcher);

    assert!(!map.is_map_config_ready());
    drive_until(&mut map, 400, |m| !m.draws().is_empty());

    assert!(map.is_map_config_ready());
    assert_eq!(map.draws().opaque.len(), 1);
    let credits = map.credits();
    assert_eq!(credits, vec!["(c) synthetic imagery".to_string()]);

    let stats = map.statistics();
    assert!(stats.nodes_rendered >= 1);
    assert!(stats.resources_decoded >= 4);
}

/// With a ready child the traversal descends past the root.
#[test]
fn test_descends_into_ready_children() {
    let fetcher = Arc::new(MemoryFetcher::new());
    fetcher.insert(CONFIG_URL, FetchReply::ok(MANIFEST));
    // root advertises its upper-left child
    fetcher.insert(
        "https://m.example.com/meta/0-0-0.meta",
        FetchReply::ok(meta_block(TileId::ROOT, geometry_node(MetaFlags::UL_CHILD))),
    );
    fetcher.insert(
        "https://m.example.com/meta/1-0-0.meta",
        FetchReply::ok(meta_block(
            TileId { lod: 1, x: 0, y: 0 },
            geometry_node(0),
        )),
    );
    for id in ["0-0-0", "1-0-0"] {
        fetcher.insert(
            &format!("https://m.example.com/mesh/{id}.mesh"),
            FetchReply::ok(encode_mesh()),
        );
        fetcher.insert(
            &format!("https://m.example.com/tex/{id}-0.jpg"),
            FetchReply::ok(PNG_1X1),
        );
    }
    let mut map = new_map(fetcher.clone());

    drive_until(&mut map, 400, |m| !m.draws().is_empty());
    // keep driving until the child tile streams in
    let log_fetcher = fetcher.clone();
    drive_until(&mut map, 400, move |_| {
        log_fetcher
            .request_log()
            .iter()
            .any(|u| u.contains("mesh/1-0-0.mesh"))
    });
    assert!(!map.draws().is_empty());
}

/// A meta-node without geometry on any surface produces no draws and no
/// descendant fetches.
#[test]
fn test_geometryless_branch_is_pruned() {
    let fetcher = Arc::new(MemoryFetcher::new());
    fetcher.insert(CONFIG_URL, FetchReply::ok(MANIFEST));
    let barren = MetaNode {
        flags: MetaFlags(0),
        ..geometry_node(0)
    };
    fetcher.insert(
        "https://m.example.com/meta/0-0-0.meta",
        FetchReply::ok(meta_block(TileId::ROOT, barren)),
    );
    let mut map = new_map(fetcher.clone());

    // wait until the meta tile has definitely been consumed
    drive_until(&mut map, 400, |m| m.statistics().resources_decoded >= 2);
    for _ in 0..20 {
        map.render_tick_prepare().unwrap();
        map.render_tick_render(1280, 720);
    }

    assert!(map.draws().is_empty());
    let log = fetcher.request_log();
    assert!(
        log.iter().all(|u| !u.contains("/mesh/")),
        "no mesh may be fetched for a geometryless branch"
    );
    assert!(
        log.iter().all(|u| !u.contains("meta/1-")),
        "descendant meta-tiles must never be requested"
    );
}

/// Two consecutive frames with a static camera and everything resident
/// produce identical draw lists.
#[test]
fn test_static_camera_is_deterministic() {
    let fetcher = Arc::new(MemoryFetcher::new());
    serve_leaf_root_world(&fetcher);
    let mut map = new_map(fetcher);

    drive_until(&mut map, 400, |m| !m.draws().is_empty());

    map.render_tick_prepare().unwrap();
    map.render_tick_render(1280, 720);
    let first: Vec<([f32; 16], [f64; 3])> = map
        .draws()
        .opaque
        .iter()
        .map(|d| (d.mv, d.center))
        .collect();

    map.render_tick_prepare().unwrap();
    map.render_tick_render(1280, 720);
    let second: Vec<([f32; 16], [f64; 3])> = map
        .draws()
        .opaque
        .iter()
        .map(|d| (d.mv, d.center))
        .collect();

    assert!(!first.is_empty());
    assert_eq!(first, second);
}

/// Navigation affordances reach the composed camera.
#[test]
fn test_navigation_moves_camera() {
    let fetcher = Arc::new(MemoryFetcher::new());
    serve_leaf_root_world(&fetcher);
    let mut map = new_map(fetcher);

    drive_until(&mut map, 400, |m| !m.draws().is_empty());
    let eye_before = map.camera().unwrap().eye;

    map.pan([500.0, 0.0, 0.0]);
    map.render_tick_prepare().unwrap();
    map.render_tick_render(1280, 720);
    let eye_after = map.camera().unwrap().eye;

    assert!((eye_before - eye_after).length() > 1.0);
}

/// An unreachable manifest falls back to a configured alternate path.
#[test]
fn test_alternate_config_path() {
    let fetcher = Arc::new(MemoryFetcher::new());
    serve_leaf_root_world(&fetcher);
    // primary URL serves a permanent 404; the alternate works
    fetcher.insert("https://m.example.com/broken.json", FetchReply::status(404));

    let options = MapOptions {
        alternate_config_paths: vec![CONFIG_URL.to_string()],
        ..Default::default()
    };
    let mut map = Map::new(options, fetcher, GpuCallbacks::default()).unwrap();
    map.set_map_config_path("https://m.example.com/broken.json", None);
    map.render_initialize();

    drive_until(&mut map, 400, |m| !m.draws().is_empty());
    assert!(map.is_map_config_ready());
}
