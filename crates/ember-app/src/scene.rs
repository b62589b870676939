// SPDX-License-Identifier: CEPL-1.0
//! The demo scene: a spinning triangle drawn into an offscreen texture, then
//! sampled onto the window through a full-screen quad.

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use ember_render::{
    AddressMode, AttachmentDesc, ClearValues, CullMode, DrawTarget, Filter, FramebufferFormatId,
    FramebufferId, GraphicsPipelineId, IndexBufferId, IndexType, LoadOp, PipelineDesc,
    PipelineTarget, RenderDevice, SamplerDesc, SamplerId, ShaderId, ShaderModuleDesc,
    ShaderStage, ShaderStages, SurfaceId, TextureDesc, TextureFormat, TextureId, TextureUsage,
    Topology, UniformBinding, UniformBufferId, UniformKind, UniformLayoutDesc,
    UniformLayoutEntry, UniformLayoutId, UniformResource, UniformSetId, VertexAttribute,
    VertexBufferId, VertexBufferLayout, VertexFormat,
};
use glam::Mat4;

const SCENE_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/scene.vert.spv"));
const SCENE_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/scene.frag.spv"));
const BLIT_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/blit.vert.spv"));
const BLIT_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/blit.frag.spv"));

pub const OFFSCREEN_SIZE: u32 = 512;
const OFFSCREEN_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct SceneVertex {
    pos: [f32; 3],
    color: [f32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct BlitVertex {
    pos: [f32; 2],
    uv: [f32; 2],
}

const TRIANGLE: [SceneVertex; 3] = [
    SceneVertex {
        pos: [0.0, -0.6, 0.0],
        color: [1.0, 0.3, 0.1],
    },
    SceneVertex {
        pos: [0.6, 0.45, 0.0],
        color: [0.1, 0.9, 0.3],
    },
    SceneVertex {
        pos: [-0.6, 0.45, 0.0],
        color: [0.2, 0.4, 1.0],
    },
];

const QUAD: [BlitVertex; 4] = [
    BlitVertex {
        pos: [-1.0, -1.0],
        uv: [0.0, 0.0],
    },
    BlitVertex {
        pos: [1.0, -1.0],
        uv: [1.0, 0.0],
    },
    BlitVertex {
        pos: [1.0, 1.0],
        uv: [1.0, 1.0],
    },
    BlitVertex {
        pos: [-1.0, 1.0],
        uv: [0.0, 1.0],
    },
];

const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

fn scene_vertex_input() -> (Vec<VertexBufferLayout>, Vec<VertexAttribute>) {
    (
        vec![VertexBufferLayout {
            binding: 0,
            stride: std::mem::size_of::<SceneVertex>() as u32,
            per_instance: false,
        }],
        vec![
            VertexAttribute {
                location: 0,
                binding: 0,
                format: VertexFormat::Float32x3,
                offset: 0,
            },
            VertexAttribute {
                location: 1,
                binding: 0,
                format: VertexFormat::Float32x3,
                offset: 12,
            },
        ],
    )
}

fn blit_vertex_input() -> (Vec<VertexBufferLayout>, Vec<VertexAttribute>) {
    (
        vec![VertexBufferLayout {
            binding: 0,
            stride: std::mem::size_of::<BlitVertex>() as u32,
            per_instance: false,
        }],
        vec![
            VertexAttribute {
                location: 0,
                binding: 0,
                format: VertexFormat::Float32x2,
                offset: 0,
            },
            VertexAttribute {
                location: 1,
                binding: 0,
                format: VertexFormat::Float32x2,
                offset: 8,
            },
        ],
    )
}

/// Rotation about Z, `seconds` after start, at a quarter turn per second.
pub fn camera_matrix(seconds: f32) -> Mat4 {
    Mat4::from_rotation_z(seconds * std::f32::consts::FRAC_PI_2)
}

fn shader_stages<'a>(vert: &'a [u8], frag: &'a [u8]) -> [ShaderModuleDesc<'a>; 2] {
    [
        ShaderModuleDesc {
            stage: ShaderStage::Vertex,
            spirv: vert,
            entry_point: "main",
        },
        ShaderModuleDesc {
            stage: ShaderStage::Fragment,
            spirv: frag,
            entry_point: "main",
        },
    ]
}

/// Every id the scene owns. Torn down with [`Scene::destroy`].
pub struct Scene {
    target: TextureId,
    format: FramebufferFormatId,
    framebuffer: FramebufferId,
    camera: UniformBufferId,
    camera_layout: UniformLayoutId,
    camera_set: UniformSetId,
    scene_shader: ShaderId,
    scene_pipeline: GraphicsPipelineId,
    triangle: VertexBufferId,

    sampler: SamplerId,
    blit_layout: UniformLayoutId,
    blit_set: UniformSetId,
    blit_shader: ShaderId,
    blit_pipeline: GraphicsPipelineId,
    quad: VertexBufferId,
    quad_indices: IndexBufferId,

    surface: SurfaceId,
    clear: ClearValues,
}

impl Scene {
    pub fn new<D: RenderDevice>(dev: &mut D, surface: SurfaceId, clear: [f32; 4]) -> Result<Self> {
        // Offscreen pass.
        let target = dev
            .create_texture(
                &TextureDesc {
                    width: OFFSCREEN_SIZE,
                    height: OFFSCREEN_SIZE,
                    format: OFFSCREEN_FORMAT,
                    usage: TextureUsage::COLOR_ATTACHMENT | TextureUsage::SAMPLED,
                    mipmaps: false,
                },
                None,
            )
            .context("offscreen target")?;
        let format = dev.create_framebuffer_format(&[AttachmentDesc {
            format: OFFSCREEN_FORMAT,
            load: LoadOp::Clear,
            sampled_after: true,
        }])?;
        let framebuffer = dev.create_framebuffer(format, &[target])?;

        let camera = dev.create_uniform_buffer(
            std::mem::size_of::<[f32; 16]>(),
            Some(bytemuck::bytes_of(&camera_matrix(0.0).to_cols_array())),
        )?;
        let camera_layout = dev.create_uniform_layout(&UniformLayoutDesc {
            entries: vec![UniformLayoutEntry {
                binding: 0,
                kind: UniformKind::UniformBuffer,
                stages: ShaderStages::VERTEX,
            }],
        })?;
        let camera_set = dev.create_uniform_set(
            camera_layout,
            &[UniformBinding {
                binding: 0,
                resource: UniformResource::Buffer(camera),
            }],
        )?;

        let scene_shader = dev
            .create_shader(&shader_stages(SCENE_VERT, SCENE_FRAG))
            .context("scene shader")?;
        let (vertex_buffers, vertex_attributes) = scene_vertex_input();
        let scene_pipeline = dev
            .create_graphics_pipeline(&PipelineDesc {
                shader: scene_shader,
                target: PipelineTarget::Framebuffer(format),
                uniform_layouts: vec![camera_layout],
                vertex_buffers,
                vertex_attributes,
                topology: Topology::TriangleList,
                cull: CullMode::None,
                depth_test: false,
                depth_write: false,
                alpha_blend: false,
            })
            .context("scene pipeline")?;
        let triangle = dev.create_vertex_buffer(bytemuck::cast_slice(&TRIANGLE))?;

        // Present pass.
        let sampler = dev.create_sampler(&SamplerDesc {
            address_mode: AddressMode::ClampToEdge,
            mip_filter: Filter::Nearest,
            ..SamplerDesc::default()
        })?;
        let blit_layout = dev.create_uniform_layout(&UniformLayoutDesc {
            entries: vec![UniformLayoutEntry {
                binding: 0,
                kind: UniformKind::CombinedImageSampler,
                stages: ShaderStages::FRAGMENT,
            }],
        })?;
        let blit_set = dev.create_uniform_set(
            blit_layout,
            &[UniformBinding {
                binding: 0,
                resource: UniformResource::Texture {
                    texture: target,
                    sampler,
                },
            }],
        )?;
        let blit_shader = dev
            .create_shader(&shader_stages(BLIT_VERT, BLIT_FRAG))
            .context("blit shader")?;
        let (vertex_buffers, vertex_attributes) = blit_vertex_input();
        let blit_pipeline = dev
            .create_graphics_pipeline(&PipelineDesc {
                shader: blit_shader,
                target: PipelineTarget::Surface(surface),
                uniform_layouts: vec![blit_layout],
                vertex_buffers,
                vertex_attributes,
                topology: Topology::TriangleList,
                cull: CullMode::None,
                depth_test: false,
                depth_write: false,
                alpha_blend: false,
            })
            .context("blit pipeline")?;
        let quad = dev.create_vertex_buffer(bytemuck::cast_slice(&QUAD))?;
        let quad_indices =
            dev.create_index_buffer(bytemuck::cast_slice(&QUAD_INDICES), IndexType::U16)?;

        Ok(Self {
            target,
            format,
            framebuffer,
            camera,
            camera_layout,
            camera_set,
            scene_shader,
            scene_pipeline,
            triangle,
            sampler,
            blit_layout,
            blit_set,
            blit_shader,
            blit_pipeline,
            quad,
            quad_indices,
            surface,
            clear: ClearValues {
                color: clear,
                ..ClearValues::default()
            },
        })
    }

    /// Records and submits both passes. `SwapchainOutOfDate` is passed through
    /// untouched so the caller can resize and retry.
    pub fn render<D: RenderDevice>(&self, dev: &mut D, seconds: f32) -> ember_render::Result<()> {
        let mvp = camera_matrix(seconds).to_cols_array();
        dev.update_uniform_buffer(self.camera, 0, bytemuck::bytes_of(&mvp))?;

        dev.begin_draw_list(
            DrawTarget::Framebuffer(self.framebuffer),
            &ClearValues {
                color: [0.05, 0.05, 0.08, 1.0],
                ..ClearValues::default()
            },
        )?;
        dev.bind_pipeline(self.scene_pipeline)?;
        dev.bind_uniform_set(self.camera_set, 0)?;
        dev.bind_vertex_buffer(self.triangle, 0)?;
        dev.draw(TRIANGLE.len() as u32, 1)?;
        dev.end_draw_list()?;

        dev.begin_draw_list(DrawTarget::Surface(self.surface), &self.clear)?;
        dev.bind_pipeline(self.blit_pipeline)?;
        dev.bind_uniform_set(self.blit_set, 0)?;
        dev.bind_vertex_buffer(self.quad, 0)?;
        dev.bind_index_buffer(self.quad_indices)?;
        dev.draw_indexed(QUAD_INDICES.len() as u32, 1)?;
        dev.end_draw_list()
    }

    /// Dependents go first: pipelines and sets before their layouts, the
    /// framebuffer before its format and texture.
    pub fn destroy<D: RenderDevice>(self, dev: &mut D) -> ember_render::Result<()> {
        dev.destroy_graphics_pipeline(self.blit_pipeline)?;
        dev.destroy_graphics_pipeline(self.scene_pipeline)?;
        dev.destroy_uniform_set(self.blit_set)?;
        dev.destroy_uniform_set(self.camera_set)?;
        dev.destroy_uniform_layout(self.blit_layout)?;
        dev.destroy_uniform_layout(self.camera_layout)?;
        dev.destroy_shader(self.blit_shader)?;
        dev.destroy_shader(self.scene_shader)?;
        dev.destroy_framebuffer(self.framebuffer)?;
        dev.destroy_framebuffer_format(self.format)?;
        dev.destroy_sampler(self.sampler)?;
        dev.destroy_texture(self.target)?;
        dev.destroy_uniform_buffer(self.camera)?;
        dev.destroy_index_buffer(self.quad_indices)?;
        dev.destroy_vertex_buffer(self.quad)?;
        dev.destroy_vertex_buffer(self.triangle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layouts_match_structs() {
        for (buffers, attrs) in [scene_vertex_input(), blit_vertex_input()] {
            let stride = buffers[0].stride;
            let end = attrs
                .iter()
                .map(|a| a.offset + a.format.size())
                .max()
                .unwrap();
            assert_eq!(end, stride);
        }
    }

    #[test]
    fn camera_turns_a_quarter_per_second() {
        let m = camera_matrix(1.0);
        let x = m.transform_point3(glam::Vec3::X);
        assert!((x - glam::Vec3::Y).length() < 1e-5);
        assert_eq!(camera_matrix(0.0), Mat4::IDENTITY);
    }

    #[test]
    fn quad_indices_stay_in_range() {
        assert!(QUAD_INDICES.iter().all(|&i| (i as usize) < QUAD.len()));
        assert_eq!(bytemuck::cast_slice::<u16, u8>(&QUAD_INDICES).len() % IndexType::U16.size(), 0);
    }
}
