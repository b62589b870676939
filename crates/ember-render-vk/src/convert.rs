//! Mappings between the backend-neutral types and their Vulkan counterparts.

use ash::vk;
use ember_render::{
    AddressMode, CullMode, Filter, IndexType, PresentMode, RenderError, Result, ShaderStage,
    ShaderStages, TextureFormat, TextureUsage, Topology, UniformKind, VertexFormat,
};

pub(crate) fn texture_format(f: TextureFormat) -> vk::Format {
    match f {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::R8Unorm => vk::Format::R8_UNORM,
        TextureFormat::R32Float => vk::Format::R32_SFLOAT,
        TextureFormat::Depth32Float => vk::Format::D32_SFLOAT,
        TextureFormat::Depth24Stencil8 => vk::Format::D24_UNORM_S8_UINT,
    }
}

/// Only formats a caller could have asked for map back.
pub(crate) fn texture_format_from_vk(f: vk::Format) -> Result<TextureFormat> {
    Ok(match f {
        vk::Format::R8G8B8A8_UNORM => TextureFormat::Rgba8Unorm,
        vk::Format::R8G8B8A8_SRGB => TextureFormat::Rgba8Srgb,
        vk::Format::B8G8R8A8_UNORM => TextureFormat::Bgra8Unorm,
        vk::Format::B8G8R8A8_SRGB => TextureFormat::Bgra8Srgb,
        vk::Format::R16G16B16A16_SFLOAT => TextureFormat::Rgba16Float,
        vk::Format::R32G32B32A32_SFLOAT => TextureFormat::Rgba32Float,
        vk::Format::R8_UNORM => TextureFormat::R8Unorm,
        vk::Format::R32_SFLOAT => TextureFormat::R32Float,
        vk::Format::D32_SFLOAT => TextureFormat::Depth32Float,
        vk::Format::D24_UNORM_S8_UINT => TextureFormat::Depth24Stencil8,
        _ => return Err(RenderError::InvalidEnum("vk::Format")),
    })
}

pub(crate) fn texture_usage(usage: TextureUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(TextureUsage::SAMPLED) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::COLOR_ATTACHMENT) {
        flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(TextureUsage::DEPTH_ATTACHMENT) {
        flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if usage.contains(TextureUsage::TRANSFER_SRC) {
        flags |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(TextureUsage::TRANSFER_DST) {
        flags |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    flags
}

pub(crate) fn filter(f: Filter) -> vk::Filter {
    match f {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
    }
}

pub(crate) fn mipmap_mode(f: Filter) -> vk::SamplerMipmapMode {
    match f {
        Filter::Nearest => vk::SamplerMipmapMode::NEAREST,
        Filter::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

pub(crate) fn address_mode(m: AddressMode) -> vk::SamplerAddressMode {
    match m {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
    }
}

pub(crate) fn shader_stage(s: ShaderStage) -> vk::ShaderStageFlags {
    match s {
        ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
    }
}

pub(crate) fn shader_stages(s: ShaderStages) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if s.contains(ShaderStages::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if s.contains(ShaderStages::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    flags
}

pub(crate) fn index_type(t: IndexType) -> vk::IndexType {
    match t {
        IndexType::U16 => vk::IndexType::UINT16,
        IndexType::U32 => vk::IndexType::UINT32,
    }
}

pub(crate) fn vertex_format(f: VertexFormat) -> vk::Format {
    match f {
        VertexFormat::Float32 => vk::Format::R32_SFLOAT,
        VertexFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float32x4 => vk::Format::R32G32B32A32_SFLOAT,
        VertexFormat::Unorm8x4 => vk::Format::R8G8B8A8_UNORM,
    }
}

pub(crate) fn topology(t: Topology) -> vk::PrimitiveTopology {
    match t {
        Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        Topology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        Topology::LineList => vk::PrimitiveTopology::LINE_LIST,
        Topology::PointList => vk::PrimitiveTopology::POINT_LIST,
    }
}

pub(crate) fn cull_mode(c: CullMode) -> vk::CullModeFlags {
    match c {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

pub(crate) fn descriptor_type(k: UniformKind) -> vk::DescriptorType {
    match k {
        UniformKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        UniformKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    }
}

/// `(vsync, prefer_mailbox)` for a requested mode. A config with vsync on
/// overrides a request for tearing.
pub(crate) fn present_flags(mode: PresentMode, vsync: bool, prefer_mailbox: bool) -> (bool, bool) {
    match mode {
        PresentMode::Immediate => (vsync, prefer_mailbox),
        PresentMode::Fifo => (true, false),
        PresentMode::Mailbox => (true, prefer_mailbox),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_map_both_ways() {
        for f in [
            TextureFormat::Rgba8Unorm,
            TextureFormat::Bgra8Srgb,
            TextureFormat::Rgba32Float,
            TextureFormat::Depth24Stencil8,
        ] {
            assert_eq!(texture_format_from_vk(texture_format(f)).unwrap(), f);
        }
    }

    #[test]
    fn unmapped_vk_format_is_an_invalid_enum() {
        assert_eq!(
            texture_format_from_vk(vk::Format::BC7_SRGB_BLOCK),
            Err(RenderError::InvalidEnum("vk::Format"))
        );
    }

    #[test]
    fn usage_bits_translate() {
        let flags = texture_usage(TextureUsage::SAMPLED | TextureUsage::COLOR_ATTACHMENT);
        assert_eq!(
            flags,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::COLOR_ATTACHMENT
        );
        assert_eq!(
            shader_stages(ShaderStages::VERTEX | ShaderStages::FRAGMENT),
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn vsync_config_wins_over_immediate() {
        assert_eq!(present_flags(PresentMode::Immediate, true, true), (true, true));
        assert_eq!(present_flags(PresentMode::Immediate, false, true), (false, true));
        assert_eq!(present_flags(PresentMode::Fifo, false, true), (true, false));
        assert_eq!(present_flags(PresentMode::Mailbox, true, false), (true, false));
    }
}
