// Display pipeline construction
//
// Everything that has to exist before the render loop can turn: the
// swapchain, the render pass, the graphics pipeline, and the per-image
// resources. create_swapchain and create_framebuffers run again on
// swapchain invalidation; the rest is built once.

use ash::vk;

use super::{DisplayCore, ImageRes};
use crate::{MlandError, RenderingMode, Result};
use utils::log;

/// How many swapchain images we ask for before clamping to the
/// surface's reported bounds
const DESIRED_BUFFER_COUNT: u32 = 3;

impl DisplayCore {
    pub(super) fn create_everything(&mut self) -> Result<()> {
        self.create_command_pools()?;
        self.c_surface = self.c_provider.create_surface(&self.c_dev)?;
        self.check_surface_support()?;
        if !self.create_swapchain()? {
            // a surface with no extent cannot be rendered to yet
            return Err(MlandError::COULD_NOT_CREATE_SWAPCHAIN);
        }
        self.create_pipeline_layout()?;
        self.create_render_pass()?;
        self.create_render_pipeline()?;
        self.create_framebuffers()?;

        // Signaled so the first iteration's wait-and-reset passes
        // without a prior submit
        let fence_info =
            vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        self.c_render_finished_fence = unsafe {
            self.c_dev
                .d_dev
                .create_fence(&fence_info, None)
                .or(Err(MlandError::COULD_NOT_CREATE_SYNC_OBJS))?
        };

        Ok(())
    }

    fn check_surface_support(&self) -> Result<()> {
        let supported = unsafe {
            self.c_dev
                .d_inst
                .i_surface_loader
                .get_physical_device_surface_support(
                    self.c_dev.d_pdev,
                    self.c_dev.d_graphics_index,
                    self.c_surface,
                )
                .or(Err(MlandError::VK_SURF_NOT_SUPPORTED))?
        };
        match supported {
            true => Ok(()),
            false => Err(MlandError::VK_SURF_NOT_SUPPORTED),
        }
    }

    /// choose a vkSurfaceFormatKHR for the surface
    ///
    /// HDR format selection is a future extension, for now the first
    /// reported format wins.
    fn best_format(
        formats: &[vk::SurfaceFormatKHR],
        _hdr: bool,
    ) -> Result<vk::SurfaceFormatKHR> {
        formats.first().cloned().ok_or(MlandError::INVALID)
    }

    /// Populate this display with a new vkSwapchain
    ///
    /// The previous swapchain, if any, is handed to the driver as
    /// old_swapchain and destroyed as soon as the new one exists.
    /// Returns Ok(false) when the surface currently has a zero extent
    /// and no swapchain can be built for it.
    pub(super) fn create_swapchain(&mut self) -> Result<bool> {
        log::debug!("{} Creating swapchain", self.c_shared.ds_name);
        let pdev = self.c_dev.d_pdev;
        let surface_loader = &self.c_dev.d_inst.i_surface_loader;

        let formats = unsafe {
            surface_loader
                .get_physical_device_surface_formats(pdev, self.c_surface)
                .or(Err(MlandError::COULD_NOT_CREATE_SWAPCHAIN))?
        };
        let present_modes = unsafe {
            surface_loader
                .get_physical_device_surface_present_modes(pdev, self.c_surface)
                .or(Err(MlandError::COULD_NOT_CREATE_SWAPCHAIN))?
        };
        if present_modes.is_empty() {
            return Err(MlandError::COULD_NOT_CREATE_SWAPCHAIN);
        }

        // mailbox keeps latency down on the outputs that offer it
        let present_mode = present_modes
            .iter()
            .cloned()
            .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
            .unwrap_or(present_modes[0]);
        if present_mode == vk::PresentModeKHR::MAILBOX {
            log::debug!("{} Using mailbox present mode", self.c_shared.ds_name);
        }

        let format = Self::best_format(
            &formats,
            self.c_shared.ds_mode.contains(RenderingMode::HDR),
        )?;

        let caps = unsafe {
            surface_loader
                .get_physical_device_surface_capabilities(pdev, self.c_surface)
                .or(Err(MlandError::COULD_NOT_CREATE_SWAPCHAIN))?
        };
        if caps.current_extent.width == 0 || caps.current_extent.height == 0 {
            return Ok(false);
        }

        let mut image_count = DESIRED_BUFFER_COUNT.max(caps.min_image_count + 1);
        if caps.max_image_count > 0 && image_count > caps.max_image_count {
            image_count = caps.max_image_count;
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.c_surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(caps.current_extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(self.c_swapchain);

        let new_swapchain = unsafe {
            self.c_dev
                .d_swapchain_loader
                .create_swapchain(&create_info, None)
                .or(Err(MlandError::COULD_NOT_CREATE_SWAPCHAIN))?
        };

        // the retired swapchain dies the moment its successor exists
        if self.c_swapchain != vk::SwapchainKHR::null() {
            unsafe {
                self.c_dev
                    .d_swapchain_loader
                    .destroy_swapchain(self.c_swapchain, None);
            }
        }
        self.c_swapchain = new_swapchain;
        self.c_extent = caps.current_extent;
        self.c_format = format.format;

        *self.c_shared.ds_extent.lock().unwrap() =
            (caps.current_extent.width, caps.current_extent.height);

        Ok(true)
    }

    pub(super) fn create_pipeline_layout(&mut self) -> Result<()> {
        log::debug!("{} Creating pipeline layout", self.c_shared.ds_name);
        // No descriptors and no push constants yet
        let layout_info = vk::PipelineLayoutCreateInfo::default();
        self.c_pipeline_layout = unsafe {
            self.c_dev
                .d_dev
                .create_pipeline_layout(&layout_info, None)
                .or(Err(MlandError::COULD_NOT_CREATE_PIPELINE))?
        };
        Ok(())
    }

    pub(super) fn create_render_pass(&mut self) -> Result<()> {
        log::debug!("{} Creating render pass", self.c_shared.ds_name);
        let attachments = [vk::AttachmentDescription::default()
            .format(self.c_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)];

        let attachment_refs = [vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];

        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&attachment_refs)];

        let dependencies = [vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)];

        let render_pass_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        self.c_render_pass = unsafe {
            self.c_dev
                .d_dev
                .create_render_pass(&render_pass_info, None)
                .or(Err(MlandError::COULD_NOT_CREATE_PIPELINE))?
        };
        Ok(())
    }

    pub(super) fn create_render_pipeline(&mut self) -> Result<()> {
        log::debug!("{} Creating render pipeline", self.c_shared.ds_name);
        let entrypoint = std::ffi::CString::new("main").unwrap();
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(self.c_dev.get_vert())
                .name(&entrypoint),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(self.c_dev.get_frag())
                .name(&entrypoint),
        ];

        // the fullscreen pass generates its own vertices
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // viewport and scissor are dynamic, only the counts matter here
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(false)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false);

        let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)];

        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .flags(vk::PipelineCreateFlags::ALLOW_DERIVATIVES)
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(self.c_pipeline_layout)
            .render_pass(self.c_render_pass)
            .subpass(0)
            .base_pipeline_index(-1);

        let pipelines = unsafe {
            self.c_dev
                .d_dev
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|_| MlandError::COULD_NOT_CREATE_PIPELINE)?
        };
        self.c_pipeline = pipelines[0];
        Ok(())
    }

    /// Tear down the per-image resources
    pub(super) fn destroy_images(&mut self) {
        unsafe {
            for img in self.c_images.drain(..) {
                self.c_dev.d_dev.destroy_framebuffer(img.ir_framebuffer, None);
                self.c_dev.d_dev.destroy_image_view(img.ir_view, None);
                self.c_dev
                    .d_dev
                    .free_command_buffers(self.c_graphics_pool, &[img.ir_graphics_cmd]);
            }
        }
    }

    /// Build one view + framebuffer + command buffer per swapchain image
    ///
    /// The images themselves belong to the swapchain; we never destroy
    /// them, only the views onto them.
    pub(super) fn create_framebuffers(&mut self) -> Result<()> {
        log::debug!("{} Creating framebuffers", self.c_shared.ds_name);
        self.destroy_images();

        let images = unsafe {
            self.c_dev
                .d_swapchain_loader
                .get_swapchain_images(self.c_swapchain)
                .or(Err(MlandError::COULD_NOT_CREATE_IMAGE))?
        };

        for image in images.iter() {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(*image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.c_format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = unsafe {
                self.c_dev
                    .d_dev
                    .create_image_view(&view_info, None)
                    .or(Err(MlandError::COULD_NOT_CREATE_IMAGE))?
            };

            let fb_attachments = [view];
            let fb_info = vk::FramebufferCreateInfo::default()
                .render_pass(self.c_render_pass)
                .attachments(&fb_attachments)
                .width(self.c_extent.width)
                .height(self.c_extent.height)
                .layers(1);

            let framebuffer = unsafe {
                match self.c_dev.d_dev.create_framebuffer(&fb_info, None) {
                    Ok(fb) => fb,
                    Err(_) => {
                        self.c_dev.d_dev.destroy_image_view(view, None);
                        return Err(MlandError::COULD_NOT_CREATE_IMAGE);
                    }
                }
            };

            let graphics_cmd = match self.c_dev.create_command_buffer(self.c_graphics_pool) {
                Ok(cmd) => cmd,
                Err(e) => {
                    unsafe {
                        self.c_dev.d_dev.destroy_framebuffer(framebuffer, None);
                        self.c_dev.d_dev.destroy_image_view(view, None);
                    }
                    return Err(e);
                }
            };

            self.c_images.push(ImageRes {
                ir_view: view,
                ir_framebuffer: framebuffer,
                ir_graphics_cmd: graphics_cmd,
            });
        }

        Ok(())
    }

    /// One pool per queue family in use
    pub(super) fn create_command_pools(&mut self) -> Result<()> {
        log::debug!("{} Creating command pools", self.c_shared.ds_name);
        self.c_graphics_pool = self
            .c_dev
            .create_command_pool(self.c_dev.d_graphics_index)?;
        self.c_transfer_pool = self
            .c_dev
            .create_command_pool(self.c_dev.d_transfer_index)?;
        Ok(())
    }
}
