//! Draw-list assembly.
//!
//! Traversal produces [`RenderTask`]s that hold typed resource handles;
//! when a node is actually rendered they are flattened into host-facing
//! [`DrawTask`]s carrying opaque GPU user data and f32 matrices. Opaque
//! draws are globally sorted front to back before the frame is handed
//! over, which minimises overdraw; transparent and infographic draws keep
//! traversal order.

use glam::{DMat4, DVec3, Mat3, Vec4};

use crate::gpu::{GpuTexture, MeshAggregate, UserData};
use crate::resource::Handle;

/// Draw class of a render task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawClass {
    Opaque,
    Transparent,
    Infographic,
}

/// A pending draw of one submesh, still holding resource handles.
#[derive(Clone, Debug)]
pub struct RenderTask {
    /// Keeps the whole aggregate alive while the task exists.
    pub mesh: Handle<MeshAggregate>,
    pub submesh_index: usize,
    pub texture_color: Option<Handle<GpuTexture>>,
    pub texture_mask: Option<Handle<GpuTexture>>,
    /// Normalized-mesh to physical transform of the submesh.
    pub model: DMat4,
    /// UV remapping into the bound layer's tile.
    pub uvm: Mat3,
    pub color: Vec4,
    pub external_uv: bool,
}

impl RenderTask {
    /// True when every referenced resource is `Ready`.
    pub fn ready(&self) -> bool {
        use crate::resource::Validity;
        if self.mesh.validity() != Validity::Valid {
            return false;
        }
        if let Some(t) = &self.texture_color {
            if t.validity() != Validity::Valid {
                return false;
            }
        }
        if let Some(t) = &self.texture_mask {
            if t.validity() != Validity::Valid {
                return false;
            }
        }
        true
    }

    /// Touches every referenced resource against eviction.
    pub fn touch(&self, tick: u64) {
        self.mesh.touch(tick);
        if let Some(t) = &self.texture_color {
            t.touch(tick);
        }
        if let Some(t) = &self.texture_mask {
            t.touch(tick);
        }
    }
}

/// One flattened draw command for the host renderer.
#[derive(Clone)]
pub struct DrawTask {
    /// Host user data of the submesh, as stored by `load_mesh`.
    pub mesh: Option<UserData>,
    pub texture_color: Option<UserData>,
    pub texture_mask: Option<UserData>,
    /// Model-view matrix, column major.
    pub mv: [f32; 16],
    /// UV matrix, column major.
    pub uvm: [f32; 9],
    pub color: [f32; 4],
    /// Physical-frame centre of the submesh, for depth sorting.
    pub center: [f64; 3],
    pub external_uv: bool,
}

impl DrawTask {
    /// Flattens a ready render task against the frame's view matrix.
    ///
    /// Returns `None` when the task's resources are not all `Ready`; a
    /// committed node never hits that path, the check is the last line of
    /// the every-draw-references-ready-resources invariant.
    pub fn from_render_task(task: &RenderTask, view: &DMat4) -> Option<Self> {
        if !task.ready() {
            return None;
        }
        let aggregate = task.mesh.value()?;
        let submesh = aggregate.submeshes.get(task.submesh_index)?;
        let mesh_data = submesh.info.user_data.clone();
        let texture_color = task
            .texture_color
            .as_ref()
            .and_then(|t| t.value())
            .and_then(|t| t.info.user_data.clone());
        let texture_mask = task
            .texture_mask
            .as_ref()
            .and_then(|t| t.value())
            .and_then(|t| t.info.user_data.clone());

        let mv = (*view * task.model).as_mat4().to_cols_array();
        let center = task.model.transform_point3(DVec3::ZERO);
        Some(Self {
            mesh: mesh_data,
            texture_color,
            texture_mask,
            mv,
            uvm: task.uvm.to_cols_array(),
            color: task.color.to_array(),
            center: center.to_array(),
            external_uv: task.external_uv,
        })
    }
}

impl std::fmt::Debug for DrawTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrawTask")
            .field("has_mesh", &self.mesh.is_some())
            .field("has_texture", &self.texture_color.is_some())
            .field("center", &self.center)
            .field("external_uv", &self.external_uv)
            .finish()
    }
}

/// Camera block handed to the host with the draws.
#[derive(Clone, Debug, Default)]
pub struct DrawCamera {
    pub eye: [f64; 3],
    pub view: [f64; 16],
    pub proj: [f64; 16],
}

/// All draws of one frame, ordered for submission.
#[derive(Clone, Debug, Default)]
pub struct MapDraws {
    pub opaque: Vec<DrawTask>,
    pub transparent: Vec<DrawTask>,
    pub infographic: Vec<DrawTask>,
    pub camera: DrawCamera,
    /// Credit ids of everything that produced draws this frame.
    pub credits: Vec<u16>,
}

impl MapDraws {
    pub fn clear(&mut self) {
        self.opaque.clear();
        self.transparent.clear();
        self.infographic.clear();
        self.credits.clear();
    }

    pub fn push(&mut self, class: DrawClass, task: DrawTask) {
        match class {
            DrawClass::Opaque => self.opaque.push(task),
            DrawClass::Transparent => self.transparent.push(task),
            DrawClass::Infographic => self.infographic.push(task),
        }
    }

    /// Sorts opaque draws by squared distance to the camera eye.
    pub fn sort_opaque_front_to_back(&mut self) {
        let eye = DVec3::from_array(self.camera.eye);
        self.opaque.sort_by(|a, b| {
            let da = (DVec3::from_array(a.center) - eye).length_squared();
            let db = (DVec3::from_array(b.center) - eye).length_squared();
            da.total_cmp(&db)
        });
    }

    pub fn is_empty(&self) -> bool {
        self.opaque.is_empty() && self.transparent.is_empty() && self.infographic.is_empty()
    }
}

/// Dedups and records a credit hit.
pub(crate) fn hit_credit(credits: &mut Vec<u16>, id: u16) {
    if !credits.contains(&id) {
        credits.push(id);
    }
}

/// Resolves credit ids into their notices for display.
pub fn credit_notices(credits: &[u16], config: &crate::mapconfig::MapConfig) -> Vec<String> {
    let mut notices: Vec<String> = credits
        .iter()
        .filter_map(|id| {
            config
                .credits
                .values()
                .find(|c| c.id == *id)
                .map(|c| c.notice.clone())
        })
        .collect();
    notices.sort();
    notices.dedup();
    notices
}

/// Keeps draw-referenced handles alive for the duration of the frame.
///
/// The render thread parks a clone of every handle referenced by emitted
/// draws here; eviction can then never free a resource an in-flight GPU
/// draw still needs.
#[derive(Default)]
pub struct FrameHandles {
    meshes: Vec<Handle<MeshAggregate>>,
    textures: Vec<Handle<GpuTexture>>,
}

impl FrameHandles {
    pub fn clear(&mut self) {
        self.meshes.clear();
        self.textures.clear();
    }

    pub fn keep_task(&mut self, task: &RenderTask) {
        self.meshes.push(task.mesh.clone());
        if let Some(t) = &task.texture_color {
            self.textures.push(t.clone());
        }
        if let Some(t) = &task.texture_mask {
            self.textures.push(t.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.meshes.len() + self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty() && self.textures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draw_task_at(center: DVec3) -> DrawTask {
        DrawTask {
            mesh: None,
            texture_color: None,
            texture_mask: None,
            mv: glam::Mat4::IDENTITY.to_cols_array(),
            uvm: Mat3::IDENTITY.to_cols_array(),
            color: [1.0; 4],
            center: center.to_array(),
            external_uv: false,
        }
    }

    #[test]
    fn test_opaque_sort_front_to_back() {
        let mut draws = MapDraws::default();
        draws.camera.eye = [0.0, 0.0, 0.0];
        for d in [100.0, 10.0, 1000.0] {
            draws.push(DrawClass::Opaque, draw_task_at(DVec3::new(d, 0.0, 0.0)));
        }
        draws.sort_opaque_front_to_back();
        let order: Vec<f64> = draws.opaque.iter().map(|t| t.center[0]).collect();
        assert_eq!(order, vec![10.0, 100.0, 1000.0]);
    }

    #[test]
    fn test_transparent_keeps_traversal_order() {
        let mut draws = MapDraws::default();
        draws.camera.eye = [0.0, 0.0, 0.0];
        for d in [100.0, 10.0, 1000.0] {
            draws.push(
                DrawClass::Transparent,
                draw_task_at(DVec3::new(d, 0.0, 0.0)),
            );
        }
        draws.sort_opaque_front_to_back();
        let order: Vec<f64> = draws.transparent.iter().map(|t| t.center[0]).collect();
        assert_eq!(order, vec![100.0, 10.0, 1000.0]);
    }

    #[test]
    fn test_credit_hit_dedups() {
        let mut credits = Vec::new();
        hit_credit(&mut credits, 3);
        hit_credit(&mut credits, 3);
        hit_credit(&mut credits, 5);
        assert_eq!(credits, vec![3, 5]);
    }
}
