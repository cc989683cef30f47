//! Surface-stack composition and bound-layer parameter resolution.
//!
//! A tile's geometry comes from the topmost surface-stack entry whose
//! meta-node has geometry and whose alien flag matches the entry; the
//! textures draped over it come from the view's ordered bound-layer list.
//! Candidate layers are prepared (availability checked, colour and mask
//! tiles requested) and then trimmed from the top down to the first
//! opaque watertight layer - everything beneath it would be invisible.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::gpu::GpuTexture;
use crate::mapconfig::{Availability, BoundLayer, MapConfig, UrlTemplate, UrlVars};
use crate::resource::{Handle, ResourceStore, Validity};
use crate::tile::TileId;

/// A bound layer with its URL templates pre-split.
#[derive(Debug)]
pub struct BoundLayerInfo {
    pub id: String,
    pub numeric_id: Option<u16>,
    pub url_tex: UrlTemplate,
    pub url_mask: Option<UrlTemplate>,
    pub availability: Option<Availability>,
    pub credits: Vec<String>,
    pub watertight: bool,
    pub transparent: bool,
    pub alpha: Option<f64>,
}

impl BoundLayerInfo {
    /// Prepares a fully defined layer. Returns `None` while the layer is
    /// external and its definition has not been merged yet.
    pub fn new(layer: &BoundLayer) -> Option<Self> {
        let url = layer.url.as_deref()?;
        Some(Self {
            id: layer.id.clone(),
            numeric_id: layer.numeric_id,
            url_tex: UrlTemplate::new(url),
            url_mask: layer.mask_url.as_deref().map(UrlTemplate::new),
            availability: layer.availability.clone(),
            credits: layer.credits.clone(),
            watertight: layer.watertight,
            transparent: layer.transparent,
            alpha: layer.alpha,
        })
    }

    /// Builds the lookup map for every defined layer of a config.
    pub fn build_registry(config: &MapConfig) -> HashMap<String, Arc<BoundLayerInfo>> {
        config
            .bound_layers
            .iter()
            .filter_map(|b| BoundLayerInfo::new(b).map(|info| (b.id.clone(), Arc::new(info))))
            .collect()
    }
}

/// One candidate bound layer of a submesh, with its resolved textures.
#[derive(Debug)]
pub struct BoundParamInfo {
    pub info: Arc<BoundLayerInfo>,
    pub alpha: Option<f64>,
    pub texture_color: Option<Handle<GpuTexture>>,
    pub texture_mask: Option<Handle<GpuTexture>>,
}

impl BoundParamInfo {
    pub fn new(info: Arc<BoundLayerInfo>, alpha: Option<f64>) -> Self {
        Self {
            info,
            alpha,
            texture_color: None,
            texture_mask: None,
        }
    }

    /// Requests the layer's tiles and reports their combined validity.
    ///
    /// `Invalid` means the layer has nothing for this tile and should be
    /// dropped from the candidate list; `Indeterminate` defers the whole
    /// submesh to a later tick.
    pub fn prepare(
        &mut self,
        store: &ResourceStore,
        tile: TileId,
        priority: f64,
        tick: u64,
    ) -> Validity {
        if let Some(avail) = &self.info.availability {
            if !avail.covers(tile) {
                return Validity::Invalid;
            }
        }
        let vars = UrlVars::tile(tile);

        let color = match store.get::<GpuTexture>(&self.info.url_tex.expand(&vars)) {
            Ok(handle) => handle,
            Err(_) => return Validity::Invalid,
        };
        color.touch(tick);
        color.update_priority(priority);
        let mut validity = color.validity();
        self.texture_color = Some(color);

        if !self.info.watertight {
            if let Some(mask_template) = &self.info.url_mask {
                let mask = match store.get::<GpuTexture>(&mask_template.expand(&vars)) {
                    Ok(handle) => handle,
                    Err(_) => return Validity::Invalid,
                };
                mask.touch(tick);
                mask.update_priority(priority);
                validity = combine(validity, mask.validity());
                self.texture_mask = Some(mask);
            }
        }
        validity
    }
}

fn combine(a: Validity, b: Validity) -> Validity {
    match (a, b) {
        (Validity::Invalid, _) | (_, Validity::Invalid) => Validity::Invalid,
        (Validity::Indeterminate, _) | (_, Validity::Indeterminate) => Validity::Indeterminate,
        _ => Validity::Valid,
    }
}

/// Prepares every candidate and trims occluded layers.
///
/// Candidates are ordered top to bottom. Layers with nothing for this
/// tile are dropped; if any remaining layer is still loading the whole
/// list is `Indeterminate`. Once all are `Valid`, everything below the
/// first opaque watertight layer is removed.
pub fn reorder_bound_layers(
    list: &mut Vec<BoundParamInfo>,
    store: &ResourceStore,
    tile: TileId,
    priority: f64,
    tick: u64,
) -> Validity {
    let mut determined = true;
    list.retain_mut(|b| match b.prepare(store, tile, priority, tick) {
        Validity::Invalid => false,
        Validity::Indeterminate => {
            determined = false;
            true
        }
        Validity::Valid => true,
    });
    if !determined {
        return Validity::Indeterminate;
    }

    if let Some(cut) = list
        .iter()
        .position(|b| b.info.watertight && !b.info.transparent && b.texture_mask.is_none())
    {
        if cut + 1 < list.len() {
            trace!(
                tile = %tile,
                dropped = list.len() - cut - 1,
                "trimming bound layers under opaque watertight layer"
            );
            list.truncate(cut + 1);
        }
    }
    Validity::Valid
}
