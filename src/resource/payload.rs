//! Typed resource payloads.
//!
//! Resources are a tagged variant over the concrete payload types rather
//! than trait objects: the store holds them uniformly, callers match on
//! the tag, and decode is dispatched by the variant.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::gpu::{
    GpuCallbacks, GpuDecodeError, GpuFont, GpuGeodata, GpuTexture, MeshAggregate, ResourceInfo,
};
use crate::mapconfig::{AuthConfig, BoundLayer, ConfigError, MapConfig, TilesetMappingConfig};
use crate::meta::{MetaError, MetaTile};

/// Kind tag of a resource; fixed per URL at first request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    MetaTile,
    MeshAggregate,
    Texture,
    BoundLayerConfig,
    AuthConfig,
    MapConfig,
    TilesetMapping,
    Font,
    Geodata,
}

/// Decode failures; all are fatal for the resource.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("meta-tile decode failed: {0}")]
    Meta(#[from] MetaError),

    #[error("{0}")]
    Gpu(#[from] GpuDecodeError),

    #[error("configuration decode failed: {0}")]
    Config(#[from] ConfigError),

    #[error("meta-tile decoded before the reference frame was known")]
    MissingReferenceFrame,
}

/// Context a decode needs beyond the raw bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct DecodeContext {
    /// Meta binary order of the active reference frame.
    pub meta_binary_order: Option<u8>,
}

/// The decoded value of a resource.
#[derive(Debug)]
pub enum ResourcePayload {
    MetaTile(Arc<MetaTile>),
    MeshAggregate(Arc<MeshAggregate>),
    Texture(Arc<GpuTexture>),
    BoundLayerConfig(Arc<BoundLayer>),
    AuthConfig(Arc<AuthConfig>),
    MapConfig(Arc<MapConfig>),
    TilesetMapping(Arc<TilesetMappingConfig>),
    Font(Arc<GpuFont>),
    Geodata(Arc<GpuGeodata>),
}

impl ResourcePayload {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::MetaTile(_) => ResourceKind::MetaTile,
            Self::MeshAggregate(_) => ResourceKind::MeshAggregate,
            Self::Texture(_) => ResourceKind::Texture,
            Self::BoundLayerConfig(_) => ResourceKind::BoundLayerConfig,
            Self::AuthConfig(_) => ResourceKind::AuthConfig,
            Self::MapConfig(_) => ResourceKind::MapConfig,
            Self::TilesetMapping(_) => ResourceKind::TilesetMapping,
            Self::Font(_) => ResourceKind::Font,
            Self::Geodata(_) => ResourceKind::Geodata,
        }
    }

    /// Decodes raw bytes into the payload for `kind`.
    ///
    /// Returns the payload with its ram and gpu byte costs. GPU upload
    /// callbacks run here, on the thread driving the decode.
    pub fn decode(
        kind: ResourceKind,
        url: &str,
        content: &Bytes,
        ctx: &DecodeContext,
        callbacks: &GpuCallbacks,
    ) -> Result<(Self, u64, u64), DecodeError> {
        match kind {
            ResourceKind::MetaTile => {
                let order = ctx
                    .meta_binary_order
                    .ok_or(DecodeError::MissingReferenceFrame)?;
                let tile = MetaTile::decode(content, order)?;
                let ram = tile.ram_bytes();
                Ok((Self::MetaTile(Arc::new(tile)), ram, 0))
            }
            ResourceKind::MeshAggregate => {
                let (mesh, ram) = MeshAggregate::decode(content, callbacks)?;
                let gpu = mesh.gpu_bytes();
                Ok((Self::MeshAggregate(Arc::new(mesh)), ram, gpu))
            }
            ResourceKind::Texture => {
                let (tex, ram) = GpuTexture::decode(content, callbacks)?;
                let gpu = tex.info.gpu_bytes;
                Ok((Self::Texture(Arc::new(tex)), ram, gpu))
            }
            ResourceKind::BoundLayerConfig => {
                let layer: BoundLayer = serde_json::from_slice(content)
                    .map_err(ConfigError::Json)?;
                Ok((Self::BoundLayerConfig(Arc::new(layer)), content.len() as u64, 0))
            }
            ResourceKind::AuthConfig => {
                let auth = AuthConfig::from_json(content)?;
                Ok((Self::AuthConfig(Arc::new(auth)), content.len() as u64, 0))
            }
            ResourceKind::MapConfig => {
                let config = MapConfig::from_json(content)?;
                Ok((Self::MapConfig(Arc::new(config)), content.len() as u64, 0))
            }
            ResourceKind::TilesetMapping => {
                let mapping = TilesetMappingConfig::from_json(content)?;
                Ok((Self::TilesetMapping(Arc::new(mapping)), content.len() as u64, 0))
            }
            ResourceKind::Font => {
                let name = url.rsplit('/').next().unwrap_or(url).to_string();
                let mut info = ResourceInfo::default();
                if let Some(cb) = &callbacks.load_font {
                    cb(&mut info, content, &name);
                }
                let gpu = info.gpu_bytes;
                Ok((
                    Self::Font(Arc::new(GpuFont { name, info })),
                    content.len() as u64,
                    gpu,
                ))
            }
            ResourceKind::Geodata => {
                let mut info = ResourceInfo::default();
                if let Some(cb) = &callbacks.load_geodata {
                    cb(&mut info, content);
                }
                let gpu = info.gpu_bytes;
                Ok((
                    Self::Geodata(Arc::new(GpuGeodata { info })),
                    content.len() as u64,
                    gpu,
                ))
            }
        }
    }
}

/// Payload types addressable through a typed [`super::Handle`].
pub trait PayloadKind: Send + Sync + 'static {
    const KIND: ResourceKind;

    /// Extracts the typed value when the variant matches.
    fn from_payload(payload: &ResourcePayload) -> Option<Arc<Self>>;
}

macro_rules! impl_payload_kind {
    ($ty:ty, $variant:ident) => {
        impl PayloadKind for $ty {
            const KIND: ResourceKind = ResourceKind::$variant;

            fn from_payload(payload: &ResourcePayload) -> Option<Arc<Self>> {
                match payload {
                    ResourcePayload::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

impl_payload_kind!(MetaTile, MetaTile);
impl_payload_kind!(MeshAggregate, MeshAggregate);
impl_payload_kind!(GpuTexture, Texture);
impl_payload_kind!(BoundLayer, BoundLayerConfig);
impl_payload_kind!(AuthConfig, AuthConfig);
impl_payload_kind!(MapConfig, MapConfig);
impl_payload_kind!(TilesetMappingConfig, TilesetMapping);
impl_payload_kind!(GpuFont, Font);
impl_payload_kind!(GpuGeodata, Geodata);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{MetaNode, MetaTile};
    use crate::tile::TileId;

    #[test]
    fn test_decode_meta_tile_needs_context() {
        let nodes = vec![MetaNode::default(); 4];
        let data = MetaTile::encode(TileId::ROOT, 1, &nodes);
        let err = ResourcePayload::decode(
            ResourceKind::MetaTile,
            "https://e.com/0-0-0.meta",
            &data,
            &DecodeContext::default(),
            &GpuCallbacks::default(),
        );
        assert!(matches!(err, Err(DecodeError::MissingReferenceFrame)));

        let ctx = DecodeContext {
            meta_binary_order: Some(1),
        };
        let (payload, ram, gpu) = ResourcePayload::decode(
            ResourceKind::MetaTile,
            "https://e.com/0-0-0.meta",
            &data,
            &ctx,
            &GpuCallbacks::default(),
        )
        .unwrap();
        assert_eq!(payload.kind(), ResourceKind::MetaTile);
        assert!(ram > 0);
        assert_eq!(gpu, 0);
    }

    #[test]
    fn test_typed_extraction() {
        let mapping = TilesetMappingConfig {
            surfaces: vec!["a".into()],
        };
        let payload = ResourcePayload::TilesetMapping(Arc::new(mapping));
        assert!(TilesetMappingConfig::from_payload(&payload).is_some());
        assert!(MetaTile::from_payload(&payload).is_none());
    }

    #[test]
    fn test_decode_auth_config() {
        let data = Bytes::from_static(br#"{ "headers": { "Authorization": "Bearer t" } }"#);
        let (payload, _, _) = ResourcePayload::decode(
            ResourceKind::AuthConfig,
            "https://e.com/auth.json",
            &data,
            &DecodeContext::default(),
            &GpuCallbacks::default(),
        )
        .unwrap();
        match payload {
            ResourcePayload::AuthConfig(auth) => {
                assert_eq!(auth.headers.get("Authorization").unwrap(), "Bearer t");
            }
            other => panic!("wrong payload kind: {:?}", other.kind()),
        }
    }
}
