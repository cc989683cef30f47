//! Runtime statistics.
//!
//! Lock-light instrumentation: every counter is an atomic bumped with
//! relaxed ordering from whichever thread observes the event, and reads
//! take a point-in-time [`StatisticsSnapshot`]. Frame-scoped counters are
//! reset by the facade at the start of each prepare tick.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Per-lod counters stop distinguishing above this depth.
pub const MAX_LODS: usize = 22;

/// Process-wide counters of the map runtime.
#[derive(Debug, Default)]
pub struct MapStatistics {
    // lifetime
    pub resources_created: AtomicU64,
    pub resources_downloaded: AtomicU64,
    pub resources_decoded: AtomicU64,
    pub resources_failed: AtomicU64,
    pub resources_evicted: AtomicU64,
    pub bytes_downloaded: AtomicU64,

    // frame
    pub frame_index: AtomicU64,
    pub node_meta_updates: AtomicU32,
    pub node_draw_updates: AtomicU32,
    pub nodes_traversed: AtomicU32,
    pub nodes_rendered: AtomicU32,
    nodes_rendered_per_lod: [AtomicU32; MAX_LODS],
}

impl MapStatistics {
    /// Advances the frame index and clears frame-scoped counters.
    pub fn begin_frame(&self) -> u64 {
        let frame = self.frame_index.fetch_add(1, Ordering::Relaxed) + 1;
        self.node_meta_updates.store(0, Ordering::Relaxed);
        self.node_draw_updates.store(0, Ordering::Relaxed);
        self.nodes_traversed.store(0, Ordering::Relaxed);
        self.nodes_rendered.store(0, Ordering::Relaxed);
        for counter in &self.nodes_rendered_per_lod {
            counter.store(0, Ordering::Relaxed);
        }
        frame
    }

    /// Current frame index.
    pub fn frame(&self) -> u64 {
        self.frame_index.load(Ordering::Relaxed)
    }

    /// Records a node rendered at `lod`.
    pub fn node_rendered(&self, lod: u8) {
        self.nodes_rendered.fetch_add(1, Ordering::Relaxed);
        let slot = (lod as usize).min(MAX_LODS - 1);
        self.nodes_rendered_per_lod[slot].fetch_add(1, Ordering::Relaxed);
    }

    /// Resets everything, frame index included (map purge).
    pub fn reset(&self) {
        self.frame_index.store(0, Ordering::Relaxed);
        self.begin_frame();
        self.frame_index.store(0, Ordering::Relaxed);
    }

    /// Point-in-time copy for display.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            resources_created: self.resources_created.load(Ordering::Relaxed),
            resources_downloaded: self.resources_downloaded.load(Ordering::Relaxed),
            resources_decoded: self.resources_decoded.load(Ordering::Relaxed),
            resources_failed: self.resources_failed.load(Ordering::Relaxed),
            resources_evicted: self.resources_evicted.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            frame_index: self.frame(),
            node_meta_updates: self.node_meta_updates.load(Ordering::Relaxed),
            node_draw_updates: self.node_draw_updates.load(Ordering::Relaxed),
            nodes_traversed: self.nodes_traversed.load(Ordering::Relaxed),
            nodes_rendered: self.nodes_rendered.load(Ordering::Relaxed),
            nodes_rendered_per_lod: std::array::from_fn(|i| {
                self.nodes_rendered_per_lod[i].load(Ordering::Relaxed)
            }),
        }
    }
}

/// Copy of the counters at one instant.
#[derive(Clone, Debug)]
pub struct StatisticsSnapshot {
    pub resources_created: u64,
    pub resources_downloaded: u64,
    pub resources_decoded: u64,
    pub resources_failed: u64,
    pub resources_evicted: u64,
    pub bytes_downloaded: u64,
    pub frame_index: u64,
    pub node_meta_updates: u32,
    pub node_draw_updates: u32,
    pub nodes_traversed: u32,
    pub nodes_rendered: u32,
    pub nodes_rendered_per_lod: [u32; MAX_LODS],
}
