use std::ffi::CString;
use std::io::Cursor;

use ash::util::read_spv;
use ash::vk;
use ember_render::{PipelineDesc, RenderError, Result, ShaderModuleDesc};

use crate::convert;
use crate::error::VkResultExt;

pub(crate) struct ShaderStageModule {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub entry: CString,
}

/// One module per stage; only needed until pipelines using it are built.
pub(crate) struct Shader {
    pub stages: Vec<ShaderStageModule>,
}

impl Shader {
    pub unsafe fn new(device: &ash::Device, descs: &[ShaderModuleDesc<'_>]) -> Result<Self> {
        if descs.is_empty() {
            return Err(RenderError::contract("shader with no stages"));
        }
        let mut shader = Shader { stages: Vec::new() };
        for desc in descs {
            match shader.add_stage(device, desc) {
                Ok(()) => {}
                Err(e) => {
                    shader.destroy(device);
                    return Err(e);
                }
            }
        }
        if !shader
            .stages
            .iter()
            .any(|s| s.stage == vk::ShaderStageFlags::VERTEX)
        {
            shader.destroy(device);
            return Err(RenderError::contract("shader has no vertex stage"));
        }
        Ok(shader)
    }

    unsafe fn add_stage(&mut self, device: &ash::Device, desc: &ShaderModuleDesc<'_>) -> Result<()> {
        let stage = convert::shader_stage(desc.stage);
        if self.stages.iter().any(|s| s.stage == stage) {
            return Err(RenderError::contract(format!("duplicate {stage:?} stage")));
        }
        let entry = CString::new(desc.entry_point)
            .map_err(|_| RenderError::contract("entry point contains a NUL byte"))?;
        let code = read_spv(&mut Cursor::new(desc.spirv))
            .map_err(|e| RenderError::contract(format!("invalid SPIR-V for {stage:?}: {e}")))?;
        let ci = vk::ShaderModuleCreateInfo {
            s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
            p_code: code.as_ptr(),
            code_size: code.len() * 4,
            ..Default::default()
        };
        let module = device
            .create_shader_module(&ci, None)
            .op("vkCreateShaderModule")?;
        self.stages.push(ShaderStageModule {
            stage,
            module,
            entry,
        });
        Ok(())
    }

    pub unsafe fn destroy(self, device: &ash::Device) {
        for s in self.stages {
            device.destroy_shader_module(s.module, None);
        }
    }
}

/// The render pass a pipeline will be used with and what it writes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PipelineTargetInfo {
    pub render_pass: vk::RenderPass,
    pub color_count: u32,
    pub has_depth: bool,
}

pub(crate) struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    pub unsafe fn destroy(self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

/// Every attribute must read from a declared buffer binding, and bindings
/// must be unique.
pub(crate) fn validate_vertex_input(desc: &PipelineDesc) -> Result<()> {
    for (i, b) in desc.vertex_buffers.iter().enumerate() {
        if desc.vertex_buffers[..i].iter().any(|o| o.binding == b.binding) {
            return Err(RenderError::contract(format!(
                "vertex binding {} declared twice",
                b.binding
            )));
        }
    }
    for a in &desc.vertex_attributes {
        if !desc.vertex_buffers.iter().any(|b| b.binding == a.binding) {
            return Err(RenderError::contract(format!(
                "attribute at location {} reads undeclared binding {}",
                a.location, a.binding
            )));
        }
    }
    Ok(())
}

pub(crate) unsafe fn create_graphics_pipeline(
    device: &ash::Device,
    shader: &Shader,
    set_layouts: &[vk::DescriptorSetLayout],
    target: PipelineTargetInfo,
    desc: &PipelineDesc,
) -> Result<GraphicsPipeline> {
    validate_vertex_input(desc)?;

    let stages: Vec<vk::PipelineShaderStageCreateInfo> = shader
        .stages
        .iter()
        .map(|s| vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: s.stage,
            module: s.module,
            p_name: s.entry.as_ptr(),
            ..Default::default()
        })
        .collect();

    let bindings: Vec<vk::VertexInputBindingDescription> = desc
        .vertex_buffers
        .iter()
        .map(|b| vk::VertexInputBindingDescription {
            binding: b.binding,
            stride: b.stride,
            input_rate: if b.per_instance {
                vk::VertexInputRate::INSTANCE
            } else {
                vk::VertexInputRate::VERTEX
            },
        })
        .collect();
    let attributes: Vec<vk::VertexInputAttributeDescription> = desc
        .vertex_attributes
        .iter()
        .map(|a| vk::VertexInputAttributeDescription {
            location: a.location,
            binding: a.binding,
            format: convert::vertex_format(a.format),
            offset: a.offset,
        })
        .collect();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        vertex_binding_description_count: bindings.len() as u32,
        p_vertex_binding_descriptions: bindings.as_ptr(),
        vertex_attribute_description_count: attributes.len() as u32,
        p_vertex_attribute_descriptions: attributes.as_ptr(),
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: convert::topology(desc.topology),
        ..Default::default()
    };

    // Viewport and scissor are set per draw list.
    let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
        dynamic_state_count: dyn_states.len() as u32,
        p_dynamic_states: dyn_states.as_ptr(),
        ..Default::default()
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        scissor_count: 1,
        ..Default::default()
    };
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: convert::cull_mode(desc.cull),
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DEPTH_STENCIL_STATE_CREATE_INFO,
        depth_test_enable: (target.has_depth && desc.depth_test).into(),
        depth_write_enable: (target.has_depth && desc.depth_write).into(),
        depth_compare_op: vk::CompareOp::LESS_OR_EQUAL,
        ..Default::default()
    };

    let blend = if desc.alpha_blend {
        vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::TRUE,
            src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        }
    } else {
        vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::FALSE,
            color_write_mask: vk::ColorComponentFlags::RGBA,
            ..Default::default()
        }
    };
    let blend_attachments = vec![blend; target.color_count as usize];
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        attachment_count: blend_attachments.len() as u32,
        p_attachments: blend_attachments.as_ptr(),
        ..Default::default()
    };

    let layout_info = vk::PipelineLayoutCreateInfo {
        s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
        set_layout_count: set_layouts.len() as u32,
        p_set_layouts: set_layouts.as_ptr(),
        ..Default::default()
    };
    let layout = device
        .create_pipeline_layout(&layout_info, None)
        .op("vkCreatePipelineLayout")?;

    let pipeline_info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_depth_stencil_state: &depth_stencil,
        p_color_blend_state: &color_blend,
        p_dynamic_state: &dynamic_state,
        layout,
        render_pass: target.render_pass,
        subpass: 0,
        ..Default::default()
    };

    match device.create_graphics_pipelines(
        vk::PipelineCache::null(),
        std::slice::from_ref(&pipeline_info),
        None,
    ) {
        Ok(pipelines) => Ok(GraphicsPipeline {
            pipeline: pipelines[0],
            layout,
        }),
        Err((_, err)) => {
            device.destroy_pipeline_layout(layout, None);
            Err(RenderError::failed("vkCreateGraphicsPipelines", err))
        }
    }
}
