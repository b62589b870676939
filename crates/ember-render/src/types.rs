// SPDX-License-Identifier: CEPL-1.0
use bitflags::bitflags;

use crate::ids::{
    FramebufferFormatId, FramebufferId, SamplerId, ShaderId, SurfaceId, TextureId,
    UniformBufferId, UniformLayoutId,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    Rgba16Float,
    Rgba32Float,
    R8Unorm,
    R32Float,
    Depth32Float,
    Depth24Stencil8,
}

impl TextureFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::Depth32Float | TextureFormat::Depth24Stencil8)
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::R8Unorm => 1,
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8Srgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8Srgb
            | TextureFormat::R32Float
            | TextureFormat::Depth32Float
            | TextureFormat::Depth24Stencil8 => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 1 << 0;
        const COLOR_ATTACHMENT = 1 << 1;
        const DEPTH_ATTACHMENT = 1 << 2;
        const TRANSFER_SRC = 1 << 3;
        const TRANSFER_DST = 1 << 4;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
    /// Build the full mip chain from level 0 after upload.
    pub mipmaps: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerDesc {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub mip_filter: Filter,
    pub address_mode: AddressMode,
    pub max_anisotropy: Option<f32>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: Filter::Linear,
            min_filter: Filter::Linear,
            mip_filter: Filter::Linear,
            address_mode: AddressMode::Repeat,
            max_anisotropy: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

/// Pre-compiled SPIR-V for one stage.
#[derive(Clone, Debug)]
pub struct ShaderModuleDesc<'a> {
    pub stage: ShaderStage,
    pub spirv: &'a [u8],
    pub entry_point: &'a str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    pub fn size(self) -> usize {
        match self {
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOp {
    Clear,
    Load,
    DontCare,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachmentDesc {
    pub format: TextureFormat,
    pub load: LoadOp,
    /// Leave the attachment readable by shaders after the pass.
    pub sampled_after: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UniformKind {
    UniformBuffer,
    CombinedImageSampler,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UniformLayoutEntry {
    pub binding: u32,
    pub kind: UniformKind,
    pub stages: ShaderStages,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct UniformLayoutDesc {
    pub entries: Vec<UniformLayoutEntry>,
}

impl UniformLayoutDesc {
    pub fn count(&self, kind: UniformKind) -> u32 {
        self.entries.iter().filter(|e| e.kind == kind).count() as u32
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UniformResource {
    Buffer(UniformBufferId),
    Texture {
        texture: TextureId,
        sampler: SamplerId,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UniformBinding {
    pub binding: u32,
    pub resource: UniformResource,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Unorm8x4,
}

impl VertexFormat {
    pub fn size(self) -> u32 {
        match self {
            VertexFormat::Float32 | VertexFormat::Unorm8x4 => 4,
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexBufferLayout {
    pub binding: u32,
    pub stride: u32,
    pub per_instance: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topology {
    TriangleList,
    TriangleStrip,
    LineList,
    PointList,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineTarget {
    Framebuffer(FramebufferFormatId),
    Surface(SurfaceId),
}

#[derive(Clone, Debug)]
pub struct PipelineDesc {
    pub shader: ShaderId,
    pub target: PipelineTarget,
    pub uniform_layouts: Vec<UniformLayoutId>,
    pub vertex_buffers: Vec<VertexBufferLayout>,
    pub vertex_attributes: Vec<VertexAttribute>,
    pub topology: Topology,
    pub cull: CullMode,
    pub depth_test: bool,
    pub depth_write: bool,
    pub alpha_blend: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawTarget {
    Surface(SurfaceId),
    Framebuffer(FramebufferId),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClearValues {
    pub color: [f32; 4],
    pub depth: f32,
    pub stencil: u32,
}

impl Default for ClearValues {
    fn default() -> Self {
        Self {
            color: [0.0, 0.0, 0.0, 1.0],
            depth: 1.0,
            stencil: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentMode {
    Fifo,
    Mailbox,
    Immediate,
}

/// What a caller would like from a window surface, in order of preference.
#[derive(Clone, Debug, PartialEq)]
pub struct SurfacePreferences {
    pub formats: Vec<TextureFormat>,
    pub present_mode: PresentMode,
    pub depth: bool,
}

impl Default for SurfacePreferences {
    fn default() -> Self {
        Self {
            formats: vec![TextureFormat::Bgra8Srgb, TextureFormat::Rgba8Srgb],
            present_mode: PresentMode::Mailbox,
            depth: true,
        }
    }
}
