// The render loop body
//
// One call to render_once is one attempt at a frame: take a sync slot,
// acquire an image, drain whatever still guards it, serialize against
// our previous submit, wait for demand or the deadline, draw, present,
// and record the slot in the busy map. The swapchain-rebuild and
// teardown drains live here too since they walk the same slots.

use ash::vk;

use super::state::DisplayState;
use super::{DisplayCore, SyncObjs, SHORT_WAIT_NS, STOP_WAIT_ATTEMPTS};
use crate::{MlandError, Result};
use utils::log;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

impl DisplayCore {
    /// Take a free sync slot, growing the pool if none are available
    fn get_sync_slot(&mut self) -> Result<u32> {
        if let Some(slot) = self.c_slots.pop_free() {
            return Ok(slot);
        }
        let sync = SyncObjs::new(&self.c_dev)?;
        Ok(self.c_slots.push(sync))
    }

    /// Wait for `fence`, optionally putting it back to unsignaled
    ///
    /// The reset variant is the per-frame submit serialization; the
    /// non-reset variant is used to drain before handing an image back
    /// to the driver.
    fn wait_fence(&self, fence: vk::Fence, reset: bool) -> bool {
        unsafe {
            if let Err(e) = self.c_dev.d_dev.wait_for_fences(&[fence], true, u64::MAX) {
                log::error!(
                    "{} Failed to wait for fence: {:?}",
                    self.c_shared.ds_name,
                    e
                );
                return false;
            }
            if reset {
                if let Err(e) = self.c_dev.d_dev.reset_fences(&[fence]) {
                    log::error!(
                        "{} Failed to reset fence: {:?}",
                        self.c_shared.ds_name,
                        e
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Drain the slot guarding `image_index`, if any
    ///
    /// Waits on its presented fence in short slices, pulsing the render
    /// trigger on every timeout so a peer display parked on the
    /// semaphore cannot deadlock against us. On success the slot goes
    /// back on the free list.
    fn wait_image(&mut self, image_index: u32) -> bool {
        let slot = match self.c_slots.take_busy(image_index) {
            Some(slot) => slot,
            None => return true,
        };
        let presented = self.c_slots.get(slot).so_presented;

        loop {
            match unsafe {
                self.c_dev
                    .d_dev
                    .wait_for_fences(&[presented], true, SHORT_WAIT_NS)
            } {
                Ok(()) => break,
                Err(vk::Result::TIMEOUT) => self.c_shared.ds_trigger.pulse(),
                Err(e) => {
                    log::error!(
                        "{} Failed to wait for presented fence: {:?}",
                        self.c_shared.ds_name,
                        e
                    );
                    self.c_shared.ds_state.advance(DisplayState::Error);
                    return false;
                }
            }
        }

        unsafe { self.c_dev.d_dev.reset_fences(&[presented]).ok() };
        self.c_slots.recycle(slot);
        true
    }

    /// Hand an acquired image back to the swapchain without presenting
    fn release_image(&self, image_index: u32) {
        let indices = [image_index];
        let release_info = vk::ReleaseSwapchainImagesInfoEXT::default()
            .swapchain(self.c_swapchain)
            .image_indices(&indices);
        if let Err(e) = unsafe {
            self.c_dev
                .d_swap_maint_loader
                .release_swapchain_images(&release_info)
        } {
            log::error!(
                "{} Failed to release swapchain image: {:?}",
                self.c_shared.ds_name,
                e
            );
        }
    }

    /// Record and submit the graphics work for one frame
    fn draw_frame(&mut self, sync: &SyncObjs, image_index: u32) -> Result<()> {
        let img = &self.c_images[image_index as usize];
        let cbuf = img.ir_graphics_cmd;
        let raw = &self.c_dev.d_dev;

        unsafe {
            raw.reset_command_buffer(cbuf, vk::CommandBufferResetFlags::empty())
                .or(Err(MlandError::SUBMIT_FAILED))?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            raw.begin_command_buffer(cbuf, &begin_info)
                .or(Err(MlandError::SUBMIT_FAILED))?;

            let clear_values = [vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 0.0],
                },
            }];
            let pass_info = vk::RenderPassBeginInfo::default()
                .render_pass(self.c_render_pass)
                .framebuffer(img.ir_framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent: self.c_extent,
                })
                .clear_values(&clear_values);

            raw.cmd_begin_render_pass(cbuf, &pass_info, vk::SubpassContents::INLINE);
            raw.cmd_bind_pipeline(cbuf, vk::PipelineBindPoint::GRAPHICS, self.c_pipeline);

            let viewports = [vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: self.c_extent.width as f32,
                height: self.c_extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            }];
            raw.cmd_set_viewport(cbuf, 0, &viewports);
            let scissors = [vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: self.c_extent,
            }];
            raw.cmd_set_scissor(cbuf, 0, &scissors);

            // the fullscreen triangle; client surface composition will
            // replace this draw
            raw.cmd_draw(cbuf, 3, 1, 0, 0);

            raw.cmd_end_render_pass(cbuf);
            raw.end_command_buffer(cbuf)
                .or(Err(MlandError::SUBMIT_FAILED))?;
        }

        let wait_semas = [sync.so_image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let cbufs = [cbuf];
        let signal_semas = [sync.so_render_finished];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semas)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&cbufs)
            .signal_semaphores(&signal_semas);

        self.c_dev.submit(
            self.c_dev.d_graphics_index,
            submit_info,
            self.c_render_finished_fence,
        )
    }

    /// Present the frame, returning true iff it counts as rendered
    ///
    /// The present fence targets the slot's presented fence, which is
    /// what later gates reuse of the image.
    fn present_frame(&mut self, sync: &SyncObjs, image_index: u32) -> bool {
        let fences = [sync.so_presented];
        let mut present_fence_info =
            vk::SwapchainPresentFenceInfoEXT::default().fences(&fences);

        let wait_semas = [sync.so_render_finished];
        let swapchains = [self.c_swapchain];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semas)
            .swapchains(&swapchains)
            .image_indices(&indices)
            .push_next(&mut present_fence_info);

        match self
            .c_dev
            .present(self.c_dev.d_graphics_index, &present_info)
        {
            Ok(false) => true,
            Ok(true) => {
                // suboptimal still hit the screen, count it and rebuild
                log::debug!("{} {}", self.c_shared.ds_name, MlandError::SUBOPTIMAL);
                self.c_shared.ds_state.advance(DisplayState::SwapOutOfDate);
                true
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("{} {}", self.c_shared.ds_name, MlandError::OUT_OF_DATE);
                self.c_shared.ds_state.advance(DisplayState::SwapOutOfDate);
                // drain our submit, then the driver gets the image back
                self.wait_fence(self.c_render_finished_fence, false);
                self.release_image(image_index);
                false
            }
            Err(e) => {
                log::error!(
                    "{} {}: {:?}",
                    self.c_shared.ds_name,
                    MlandError::PRESENT_FAILED,
                    e
                );
                self.c_shared.ds_state.advance(DisplayState::Error);
                false
            }
        }
    }

    /// One attempt at a frame
    pub(super) fn render_once(&mut self) {
        if self.c_extent.width == 0 || self.c_extent.height == 0 {
            self.c_shared.ds_state.advance(DisplayState::SwapOutOfDate);
            return;
        }

        let slot_idx = match self.get_sync_slot() {
            Ok(slot) => slot,
            Err(e) => {
                log::error!(
                    "{} Failed to grow the sync pool: {}",
                    self.c_shared.ds_name,
                    e
                );
                self.c_shared.ds_state.advance(DisplayState::Error);
                return;
            }
        };
        let sync = *self.c_slots.get(slot_idx);

        let acquire = unsafe {
            self.c_dev.d_swapchain_loader.acquire_next_image(
                self.c_swapchain,
                u64::MAX,
                sync.so_image_available,
                vk::Fence::null(),
            )
        };

        let image_index = match acquire {
            Ok((index, false)) => index,
            Ok((index, true)) => {
                // Suboptimal delivered an image and signaled the
                // semaphore; the slot is abandoned to the pool and the
                // image goes back to the driver once its prior user
                // drains
                log::info!("{} {}", self.c_shared.ds_name, MlandError::SUBOPTIMAL);
                self.c_shared.ds_state.advance(DisplayState::SwapOutOfDate);
                if self.wait_image(index) {
                    self.release_image(index);
                }
                return;
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::info!("{} {}", self.c_shared.ds_name, MlandError::OUT_OF_DATE);
                self.c_shared.ds_state.advance(DisplayState::SwapOutOfDate);
                // nothing was signaled, the slot can be reused as-is
                self.c_slots.recycle(slot_idx);
                return;
            }
            Err(e) => {
                log::error!(
                    "{} {}: {:?}",
                    self.c_shared.ds_name,
                    MlandError::COULD_NOT_ACQUIRE_NEXT_IMAGE,
                    e
                );
                self.c_shared.ds_state.advance(DisplayState::Error);
                return;
            }
        };

        // a prior present may still own this image
        if !self.wait_image(image_index) {
            return;
        }

        // at most one graphics submit outstanding per display
        if !self.wait_fence(self.c_render_finished_fence, true) {
            self.c_shared.ds_state.advance(DisplayState::Error);
            return;
        }

        // register for the next demand fan-out, then sleep until
        // someone asks for a frame or the deadline passes
        if self.c_rendered_normally {
            self.c_shared.ds_trigger.register_ready();
        }
        self.c_rendered_normally = self
            .c_shared
            .ds_trigger
            .acquire_until(self.c_next_frame_time);
        self.c_next_frame_time =
            Instant::now() + self.c_shared.ds_trigger.max_time_between_frames();

        if let Err(e) = self.draw_frame(&sync, image_index) {
            log::error!("{} Failed to draw frame: {}", self.c_shared.ds_name, e);
            self.c_shared.ds_state.advance(DisplayState::Error);
            return;
        }

        if self.present_frame(&sync, image_index) {
            self.c_slots.mark_busy(image_index, slot_idx);
            self.c_shared.ds_frames.fetch_add(1, Ordering::Relaxed);
        } else {
            // the wake-up did not become a frame; hand the permit back
            self.c_rendered_normally = false;
            self.c_shared.ds_trigger.pulse();
        }
    }

    /// Recover from SwapOutOfDate
    ///
    /// Every in-flight present must retire before its image dies with
    /// the old swapchain; then the swapchain and framebuffers are
    /// rebuilt and the new extent goes out to the protocol binding.
    pub(super) fn rebuild(&mut self) {
        log::debug!("{} Rebuilding swapchain", self.c_shared.ds_name);

        for (_image, slot) in self.c_slots.drain_busy() {
            let presented = self.c_slots.get(slot).so_presented;
            if !self.wait_fence(presented, true) {
                self.c_shared.ds_state.advance(DisplayState::Error);
                return;
            }
            self.c_slots.recycle(slot);
        }

        match self.create_swapchain() {
            Ok(true) => {}
            Ok(false) => {
                // zero-extent surface; stay in SwapOutOfDate until it
                // becomes usable again
                std::thread::sleep(Duration::from_millis(50));
                return;
            }
            Err(e) => {
                log::error!(
                    "{} Failed to recreate swapchain: {}",
                    self.c_shared.ds_name,
                    e
                );
                self.c_shared.ds_state.advance(DisplayState::Error);
                return;
            }
        }

        if let Err(e) = self.create_framebuffers() {
            log::error!(
                "{} Failed to recreate framebuffers: {}",
                self.c_shared.ds_name,
                e
            );
            self.c_shared.ds_state.advance(DisplayState::Error);
            return;
        }

        self.notify_output();
        self.c_shared.ds_state.recovered();
    }

    /// Push the current extent to the wl_output binding, if bound
    fn notify_output(&self) {
        let (width, height) = *self.c_shared.ds_extent.lock().unwrap();
        if let Some(sink) = self.c_shared.ds_output.lock().unwrap().as_ref() {
            log::debug!("{} Updating output", self.c_shared.ds_name);
            sink.update_extent(width, height);
        }
    }

    /// Tear down everything the worker built, in dependency order
    ///
    /// The presented-fence drain is bounded: a fence that has not
    /// signaled after ten short waits marks the display Error and is
    /// abandoned, so a wedged driver cannot hang the stop path.
    pub(super) fn cleanup(&mut self) {
        log::debug!("{} Cleaning up display", self.c_shared.ds_name);

        // the protocol binding goes away first
        self.c_shared.ds_output.lock().unwrap().take();

        for (_image, slot) in self.c_slots.drain_busy() {
            let presented = self.c_slots.get(slot).so_presented;
            let mut drained = false;
            for _ in 0..STOP_WAIT_ATTEMPTS {
                match unsafe {
                    self.c_dev
                        .d_dev
                        .wait_for_fences(&[presented], true, SHORT_WAIT_NS)
                } {
                    Ok(()) => {
                        drained = true;
                        break;
                    }
                    Err(vk::Result::TIMEOUT) => self.c_shared.ds_trigger.pulse(),
                    Err(_) => break,
                }
            }
            if !drained {
                log::error!(
                    "{} {} draining a presented fence, abandoning it",
                    self.c_shared.ds_name,
                    MlandError::TIMEOUT
                );
                self.c_shared.ds_state.advance(DisplayState::Error);
            }
        }

        // the graphics queue may still chew on our last submit
        if self.c_render_finished_fence != vk::Fence::null() {
            self.wait_fence(self.c_render_finished_fence, false);
        }
        self.c_dev.wait_idle(self.c_dev.d_graphics_index);

        unsafe {
            for sync in self.c_slots.drain_all() {
                self.c_dev
                    .d_dev
                    .destroy_semaphore(sync.so_image_available, None);
                self.c_dev
                    .d_dev
                    .destroy_semaphore(sync.so_render_finished, None);
                self.c_dev.d_dev.destroy_fence(sync.so_presented, None);
            }
            if self.c_render_finished_fence != vk::Fence::null() {
                self.c_dev
                    .d_dev
                    .destroy_fence(self.c_render_finished_fence, None);
                self.c_render_finished_fence = vk::Fence::null();
            }
        }

        self.destroy_images();

        unsafe {
            if self.c_pipeline != vk::Pipeline::null() {
                self.c_dev.d_dev.destroy_pipeline(self.c_pipeline, None);
                self.c_pipeline = vk::Pipeline::null();
            }
            if self.c_render_pass != vk::RenderPass::null() {
                self.c_dev.d_dev.destroy_render_pass(self.c_render_pass, None);
                self.c_render_pass = vk::RenderPass::null();
            }
            if self.c_pipeline_layout != vk::PipelineLayout::null() {
                self.c_dev
                    .d_dev
                    .destroy_pipeline_layout(self.c_pipeline_layout, None);
                self.c_pipeline_layout = vk::PipelineLayout::null();
            }
            if self.c_swapchain != vk::SwapchainKHR::null() {
                self.c_dev
                    .d_swapchain_loader
                    .destroy_swapchain(self.c_swapchain, None);
                self.c_swapchain = vk::SwapchainKHR::null();
            }
            if self.c_graphics_pool != vk::CommandPool::null() {
                self.c_dev
                    .d_dev
                    .destroy_command_pool(self.c_graphics_pool, None);
                self.c_graphics_pool = vk::CommandPool::null();
            }
            if self.c_transfer_pool != vk::CommandPool::null() {
                self.c_dev
                    .d_dev
                    .destroy_command_pool(self.c_transfer_pool, None);
                self.c_transfer_pool = vk::CommandPool::null();
            }
        }

        self.c_provider.delete_surface(&self.c_dev);
        self.c_surface = vk::SurfaceKHR::null();
    }
}
