// SPDX-License-Identifier: CEPL-1.0
use crate::id_type;

id_type!(VertexBufferId);
id_type!(IndexBufferId);
id_type!(UniformBufferId);
id_type!(TextureId);
id_type!(SamplerId);
id_type!(ShaderId);
id_type!(FramebufferFormatId);
id_type!(FramebufferId);
id_type!(UniformLayoutId);
id_type!(UniformSetId);
id_type!(GraphicsPipelineId);
id_type!(
    /// A presentable window surface and its swapchain.
    SurfaceId
);
