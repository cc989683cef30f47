//! Host-side GPU integration.
//!
//! The core never talks to a graphics API. Decoded payloads are handed to
//! host-provided upload callbacks together with a per-resource
//! [`ResourceInfo`] slot; the host stores whatever it needs (a texture id,
//! a buffer handle) as opaque `user_data`, and draw tasks expose the same
//! pointers back when the frame is rendered. All callbacks are optional -
//! without them resources still reach `Ready`, which is how headless
//! tests run.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use glam::DMat4;
use thiserror::Error;

/// Errors from decoding geometry or texture payloads.
#[derive(Debug, Error)]
pub enum GpuDecodeError {
    #[error("bad mesh magic")]
    BadMeshMagic,

    #[error("mesh aggregate truncated")]
    MeshTruncated,

    #[error("texture decode failed: {0}")]
    Texture(#[from] image::ImageError),
}

/// Opaque host data attached to an uploaded resource.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Per-resource slot the host fills during upload.
#[derive(Clone, Default)]
pub struct ResourceInfo {
    /// Whatever the host wants draw tasks to carry for this resource.
    pub user_data: Option<UserData>,
    /// GPU memory the host reports for the budget, in bytes.
    pub gpu_bytes: u64,
}

impl fmt::Debug for ResourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceInfo")
            .field("has_user_data", &self.user_data.is_some())
            .field("gpu_bytes", &self.gpu_bytes)
            .finish()
    }
}

/// Decoded texture handed to `load_texture`.
#[derive(Clone, Debug)]
pub struct GpuTextureSpec {
    pub width: u32,
    pub height: u32,
    /// Always 4 (RGBA8) after decoding.
    pub components: u32,
    pub data: Bytes,
}

/// Decoded mesh aggregate handed to `load_mesh`, one call per submesh.
#[derive(Clone, Debug)]
pub struct GpuMeshSpec {
    pub vertex_data: Bytes,
    pub index_data: Bytes,
    pub vertex_count: u32,
    pub index_count: u32,
}

/// Host upload callbacks.
///
/// Fields default to `None`; the core invokes whichever are present when
/// a resource finishes decoding.
#[derive(Default)]
pub struct GpuCallbacks {
    pub load_texture: Option<Box<dyn Fn(&mut ResourceInfo, &GpuTextureSpec) + Send>>,
    pub load_mesh: Option<Box<dyn Fn(&mut ResourceInfo, &GpuMeshSpec) + Send>>,
    pub load_font: Option<Box<dyn Fn(&mut ResourceInfo, &Bytes, &str) + Send>>,
    pub load_geodata: Option<Box<dyn Fn(&mut ResourceInfo, &Bytes) + Send>>,
}

impl fmt::Debug for GpuCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuCallbacks")
            .field("load_texture", &self.load_texture.is_some())
            .field("load_mesh", &self.load_mesh.is_some())
            .field("load_font", &self.load_font.is_some())
            .field("load_geodata", &self.load_geodata.is_some())
            .finish()
    }
}

/// A decoded, uploaded texture.
#[derive(Debug)]
pub struct GpuTexture {
    pub width: u32,
    pub height: u32,
    pub info: ResourceInfo,
}

impl GpuTexture {
    /// Decodes an encoded image (PNG/JPEG) and runs the upload callback.
    pub fn decode(
        data: &Bytes,
        callbacks: &GpuCallbacks,
    ) -> Result<(Self, u64), GpuDecodeError> {
        let img = image::load_from_memory(data)?.to_rgba8();
        let (width, height) = img.dimensions();
        let spec = GpuTextureSpec {
            width,
            height,
            components: 4,
            data: Bytes::from(img.into_raw()),
        };
        let mut info = ResourceInfo::default();
        if let Some(cb) = &callbacks.load_texture {
            cb(&mut info, &spec);
        }
        let ram = spec.data.len() as u64;
        Ok((
            Self {
                width,
                height,
                info,
            },
            ram,
        ))
    }
}

/// One renderable part of a mesh aggregate.
#[derive(Debug)]
pub struct SubMesh {
    /// Transform from normalized mesh coordinates to the physical frame.
    pub norm_to_phys: DMat4,
    /// Mesh uses its surface's internal texture for this submesh.
    pub internal_uv: bool,
    /// Mesh carries external UVs for bound-layer draping.
    pub external_uv: bool,
    /// Numeric id of a bound layer baked into the mesh, 0 when none.
    pub texture_layer: u16,
    /// 1-based index into a multi-surface name list; 1 for plain meshes.
    pub surface_reference: u8,
    pub info: ResourceInfo,
}

/// A tile's decoded mesh: one or more submeshes.
///
/// Wire format: magic `MA01`, submesh count u16, then per submesh a
/// flags byte (bit0 internal uv, bit1 external uv), texture layer u16,
/// surface reference u8, a 16x f64 normalized-to-physical column-major
/// transform, and length-prefixed vertex and index blobs.
#[derive(Debug, Default)]
pub struct MeshAggregate {
    pub submeshes: Vec<SubMesh>,
}

const MESH_MAGIC: &[u8; 4] = b"MA01";

impl MeshAggregate {
    /// Decodes the aggregate and uploads each submesh.
    ///
    /// Returns the aggregate and its resident byte size.
    pub fn decode(
        data: &Bytes,
        callbacks: &GpuCallbacks,
    ) -> Result<(Self, u64), GpuDecodeError> {
        if data.len() < 4 || data[..4] != MESH_MAGIC[..] {
            return Err(GpuDecodeError::BadMeshMagic);
        }
        let mut buf = data.slice(4..);
        if buf.remaining() < 2 {
            return Err(GpuDecodeError::MeshTruncated);
        }
        let count = buf.get_u16_le() as usize;
        let mut submeshes = Vec::with_capacity(count);
        let mut ram = 0u64;
        for _ in 0..count {
            if buf.remaining() < 1 + 2 + 1 + 16 * 8 {
                return Err(GpuDecodeError::MeshTruncated);
            }
            let flags = buf.get_u8();
            let texture_layer = buf.get_u16_le();
            let surface_reference = buf.get_u8();
            let mut m = [0.0f64; 16];
            for v in &mut m {
                *v = buf.get_f64_le();
            }
            let norm_to_phys = DMat4::from_cols_array(&m);

            let (vertex_count, vertex_data) = Self::read_blob(&mut buf)?;
            let (index_count, index_data) = Self::read_blob(&mut buf)?;
            ram += (vertex_data.len() + index_data.len()) as u64;

            let spec = GpuMeshSpec {
                vertex_data,
                index_data,
                vertex_count,
                index_count,
            };
            let mut info = ResourceInfo::default();
            if let Some(cb) = &callbacks.load_mesh {
                cb(&mut info, &spec);
            }
            submeshes.push(SubMesh {
                norm_to_phys,
                internal_uv: flags & 1 != 0,
                external_uv: flags & 2 != 0,
                texture_layer,
                surface_reference,
                info,
            });
        }
        Ok((Self { submeshes }, ram))
    }

    fn read_blob(buf: &mut Bytes) -> Result<(u32, Bytes), GpuDecodeError> {
        if buf.remaining() < 8 {
            return Err(GpuDecodeError::MeshTruncated);
        }
        let count = buf.get_u32_le();
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(GpuDecodeError::MeshTruncated);
        }
        Ok((count, buf.copy_to_bytes(len)))
    }

    /// Sum of the host-reported GPU bytes across submeshes.
    pub fn gpu_bytes(&self) -> u64 {
        self.submeshes.iter().map(|s| s.info.gpu_bytes).sum()
    }
}

/// A loaded font; the core only ferries the blob to the host.
#[derive(Debug)]
pub struct GpuFont {
    pub name: String,
    pub info: ResourceInfo,
}

/// Loaded free-form geodata; the blob is host-interpreted.
#[derive(Debug)]
pub struct GpuGeodata {
    pub info: ResourceInfo,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    /// Encodes a one-submesh aggregate for tests.
    pub(crate) fn encode_test_mesh(internal_uv: bool, external_uv: bool, texture_layer: u16) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(MESH_MAGIC);
        buf.put_u16_le(1);
        let flags = (internal_uv as u8) | ((external_uv as u8) << 1);
        buf.put_u8(flags);
        buf.put_u16_le(texture_layer);
        buf.put_u8(1);
        for v in DMat4::IDENTITY.to_cols_array() {
            buf.put_f64_le(v);
        }
        // 3 vertices, 12 bytes; 3 indices, 6 bytes
        buf.put_u32_le(3);
        buf.put_u32_le(12);
        buf.put_slice(&[0u8; 12]);
        buf.put_u32_le(3);
        buf.put_u32_le(6);
        buf.put_slice(&[0u8; 6]);
        buf.freeze()
    }

    #[test]
    fn test_mesh_decode() {
        let data = encode_test_mesh(true, false, 0);
        let (mesh, ram) = MeshAggregate::decode(&data, &GpuCallbacks::default()).unwrap();
        assert_eq!(mesh.submeshes.len(), 1);
        assert!(mesh.submeshes[0].internal_uv);
        assert!(!mesh.submeshes[0].external_uv);
        assert_eq!(ram, 18);
    }

    #[test]
    fn test_mesh_decode_bad_magic() {
        let data = Bytes::from_static(b"NOPE");
        assert!(matches!(
            MeshAggregate::decode(&data, &GpuCallbacks::default()),
            Err(GpuDecodeError::BadMeshMagic)
        ));
    }

    #[test]
    fn test_mesh_decode_truncated() {
        let data = encode_test_mesh(false, true, 2);
        let cut = data.slice(..data.len() - 2);
        assert!(matches!(
            MeshAggregate::decode(&cut, &GpuCallbacks::default()),
            Err(GpuDecodeError::MeshTruncated)
        ));
    }

    #[test]
    fn test_mesh_upload_callback_runs() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let callbacks = GpuCallbacks {
            load_mesh: Some(Box::new(move |info, spec| {
                calls2.fetch_add(1, Ordering::Relaxed);
                info.gpu_bytes = (spec.vertex_data.len() + spec.index_data.len()) as u64;
            })),
            ..Default::default()
        };
        let data = encode_test_mesh(false, true, 0);
        let (mesh, _) = MeshAggregate::decode(&data, &callbacks).unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(mesh.gpu_bytes(), 18);
    }
}
