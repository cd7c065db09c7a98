// SPDX-License-Identifier: CEPL-1.0
//! A spinning triangle so there is something in the scene.

use anyhow::Result;
use ember_render::{BufferVertexConsumer, RenderSize, VertexConsumer};
use ember_render_vk::{
    BasicPipelines, InstanceInfo, UploadedGeometry, VkRenderer, BASIC_MATERIAL, CAMERA_UNIFORMS,
};
use glam::{Mat4, Vec3};

pub struct Demo {
    triangle: UploadedGeometry,
}

impl Demo {
    pub fn spawn(renderer: &mut VkRenderer) -> Result<Self> {
        let mut verts = BufferVertexConsumer::new(BasicPipelines::VERTEX_FORMAT);
        verts.pos(0.0, -0.6, 0.0)?.color(235, 80, 60)?.next_vertex()?;
        verts.pos(0.6, 0.5, 0.0)?.color(60, 200, 90)?.next_vertex()?;
        verts.pos(-0.6, 0.5, 0.0)?.color(70, 110, 240)?.next_vertex()?;

        let triangle = renderer.upload_geometry(&verts, &[0, 1, 2])?;
        renderer.add_instance(
            triangle.info,
            InstanceInfo {
                material: BASIC_MATERIAL,
                uniforms: CAMERA_UNIFORMS,
            },
        );
        Ok(Self { triangle })
    }

    pub fn despawn(self, renderer: &mut VkRenderer) {
        renderer.release_geometry(self.triangle);
    }
}

/// Rotation about the view axis, corrected for the window's aspect ratio.
pub fn camera(seconds: f32, size: RenderSize) -> Mat4 {
    let aspect = if size.is_zero() {
        1.0
    } else {
        size.width as f32 / size.height as f32
    };
    Mat4::from_scale(Vec3::new(1.0 / aspect.max(f32::EPSILON), 1.0, 1.0))
        * Mat4::from_rotation_z(seconds * 0.8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_squashes_x_on_wide_windows() {
        let m = camera(
            0.0,
            RenderSize {
                width: 200,
                height: 100,
            },
        );
        let p = m.transform_point3(Vec3::new(1.0, 1.0, 0.0));
        assert!((p.x - 0.5).abs() < 1e-6);
        assert!((p.y - 1.0).abs() < 1e-6);
    }

    #[test]
    fn camera_tolerates_a_minimized_window() {
        let m = camera(1.0, RenderSize { width: 0, height: 0 });
        assert!(m.is_finite());
    }
}
