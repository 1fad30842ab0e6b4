// The Display object
//
// A Display represents one physical output: a monitor acquired from
// DRM, or a window when running nested. Each display owns a worker
// thread that drives the acquire/draw/present/reclaim cycle; everything
// Vulkan lives on that thread and dies there. External callers interact
// only through the state machine.

extern crate ash;

mod create;
pub mod drm;
mod frame;
pub mod sdl;
mod slots;
pub mod state;

use ash::vk;

use crate::device::Device;
use crate::trigger::RenderTrigger;
use crate::{MlandError, OutputParams, OutputSink, RenderingMode, Result, SurfaceProvider};
use utils::log;
use self::slots::SlotPool;
use self::state::{DisplayState, StateCell};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// How long one slice of a bounded fence wait is
const SHORT_WAIT_NS: u64 = 200_000_000;
/// How many slices cleanup spends on a fence before declaring Error
const STOP_WAIT_ATTEMPTS: u32 = 10;

/// A display represents a physical screen
///
/// The handle held by the controller. All the rendering state lives in
/// the worker thread; this side carries the state machine, the shared
/// extent, and the join handle.
pub struct Display {
    d_shared: Arc<DisplayShared>,
    /// Taken by exactly one joiner during stop
    d_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

/// State shared between the worker thread and external callers
pub(crate) struct DisplayShared {
    pub(crate) ds_name: String,
    pub(crate) ds_dev: Arc<Device>,
    pub(crate) ds_trigger: Arc<RenderTrigger>,
    pub(crate) ds_state: StateCell,
    /// Current swapchain extent, readable from wl_output callbacks
    pub(crate) ds_extent: Mutex<(u32, u32)>,
    /// The protocol binding, present only between Idle and Stop
    pub(crate) ds_output: Mutex<Option<Arc<dyn OutputSink>>>,
    pub(crate) ds_frames: AtomicU64,
    pub(crate) ds_params: OutputParams,
    pub(crate) ds_mode: RenderingMode,
}

/// One record per swapchain image
pub(crate) struct ImageRes {
    pub(crate) ir_view: vk::ImageView,
    pub(crate) ir_framebuffer: vk::Framebuffer,
    pub(crate) ir_graphics_cmd: vk::CommandBuffer,
}

/// The per-frame synchronization slot
#[derive(Clone, Copy)]
pub(crate) struct SyncObjs {
    /// signaled by acquire, consumed by the graphics submit
    pub(crate) so_image_available: vk::Semaphore,
    /// signaled by the submit, consumed by present
    pub(crate) so_render_finished: vk::Semaphore,
    /// signaled when the driver is done consuming the presented image
    pub(crate) so_presented: vk::Fence,
}

impl SyncObjs {
    fn new(dev: &Device) -> Result<Self> {
        let sem_info = vk::SemaphoreCreateInfo::default();
        let fence_info = vk::FenceCreateInfo::default();
        unsafe {
            let image_available = dev
                .d_dev
                .create_semaphore(&sem_info, None)
                .or(Err(MlandError::COULD_NOT_CREATE_SYNC_OBJS))?;
            let render_finished = match dev.d_dev.create_semaphore(&sem_info, None) {
                Ok(sem) => sem,
                Err(_) => {
                    dev.d_dev.destroy_semaphore(image_available, None);
                    return Err(MlandError::COULD_NOT_CREATE_SYNC_OBJS);
                }
            };
            let presented = match dev.d_dev.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(_) => {
                    dev.d_dev.destroy_semaphore(image_available, None);
                    dev.d_dev.destroy_semaphore(render_finished, None);
                    return Err(MlandError::COULD_NOT_CREATE_SYNC_OBJS);
                }
            };
            Ok(Self {
                so_image_available: image_available,
                so_render_finished: render_finished,
                so_presented: presented,
            })
        }
    }
}

/// Everything the worker thread owns
///
/// Built inside the worker, torn down by cleanup() on the same thread.
/// Handles start as null so a half-finished build can run the same
/// teardown path as a full one.
pub(crate) struct DisplayCore {
    pub(crate) c_shared: Arc<DisplayShared>,
    pub(crate) c_dev: Arc<Device>,
    pub(crate) c_provider: Box<dyn SurfaceProvider>,
    pub(crate) c_surface: vk::SurfaceKHR,
    pub(crate) c_swapchain: vk::SwapchainKHR,
    pub(crate) c_format: vk::Format,
    pub(crate) c_extent: vk::Extent2D,
    pub(crate) c_render_pass: vk::RenderPass,
    pub(crate) c_pipeline_layout: vk::PipelineLayout,
    pub(crate) c_pipeline: vk::Pipeline,
    pub(crate) c_images: Vec<ImageRes>,
    pub(crate) c_graphics_pool: vk::CommandPool,
    pub(crate) c_transfer_pool: vk::CommandPool,
    pub(crate) c_slots: SlotPool<SyncObjs>,
    /// Serializes graphics submits: at most one outstanding per display
    pub(crate) c_render_finished_fence: vk::Fence,
    /// Whether the previous wake-up was demand-driven
    pub(crate) c_rendered_normally: bool,
    pub(crate) c_next_frame_time: Instant,
}

impl Display {
    /// Create a display and start its render worker
    pub fn new(
        name: String,
        dev: Arc<Device>,
        trigger: Arc<RenderTrigger>,
        provider: Box<dyn SurfaceProvider>,
        mode: RenderingMode,
    ) -> Result<Arc<Self>> {
        let params = provider.output_params();
        let shared = Arc::new(DisplayShared {
            ds_name: name.clone(),
            ds_dev: dev,
            ds_trigger: trigger,
            ds_state: StateCell::new(),
            ds_extent: Mutex::new((0, 0)),
            ds_output: Mutex::new(None),
            ds_frames: AtomicU64::new(0),
            ds_params: params,
            ds_mode: mode,
        });

        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("display {}", name))
            .spawn(move || worker_main(worker_shared, provider))
            .or(Err(MlandError::INVALID))?;

        Ok(Arc::new(Self {
            d_shared: shared,
            d_thread: Mutex::new(Some(handle)),
        }))
    }

    pub fn name(&self) -> &str {
        &self.d_shared.ds_name
    }

    pub fn output_params(&self) -> &OutputParams {
        &self.d_shared.ds_params
    }

    /// Current swapchain extent as (width, height)
    pub fn current_extent(&self) -> (u32, u32) {
        *self.d_shared.ds_extent.lock().unwrap()
    }

    pub fn frames_rendered(&self) -> u64 {
        self.d_shared.ds_frames.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> DisplayState {
        self.d_shared.ds_state.get()
    }

    /// Whether this display is still worth keeping around
    ///
    /// Blocks until the worker has published a state past PreInit.
    pub fn is_good(&self) -> bool {
        self.d_shared.ds_state.wait_past_preinit().is_healthy()
    }

    /// Attach the protocol binding for this output
    pub fn bind_output(&self, sink: Arc<dyn OutputSink>) {
        log::info!("{} Binding to wayland", self.d_shared.ds_name);
        *self.d_shared.ds_output.lock().unwrap() = Some(sink);
    }

    /// Stop the display
    ///
    /// Idempotent, and safe to call from any number of threads. The
    /// first caller drives the worker to Stopped (pumping the render
    /// trigger so a parked worker wakes up), joins the thread, and
    /// publishes Joined. Every later caller just waits for Joined, so
    /// the thread is joined exactly once.
    pub fn stop(&self) {
        let shared = &self.d_shared;
        if !shared.ds_state.try_begin_stop() {
            shared.ds_state.wait_for(DisplayState::Joined);
            return;
        }

        log::debug!("{} Stopping display", shared.ds_name);
        let trigger = shared.ds_trigger.clone();
        shared
            .ds_state
            .wait_for_pulsed(DisplayState::Stopped, Duration::from_millis(200), || {
                trigger.pulse()
            });

        if let Some(handle) = self.d_thread.lock().unwrap().take() {
            handle.join().ok();
        }
        shared.ds_state.advance(DisplayState::Joined);
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        log::debug!("{} Destroying display", self.d_shared.ds_name);
        self.stop();
    }
}

/// The render worker entry point
///
/// Builds the swapchain world, loops until a terminal state, reports
/// throughput, tears everything down, and parks until the stopper has
/// observed it.
fn worker_main(shared: Arc<DisplayShared>, provider: Box<dyn SurfaceProvider>) {
    let mut core = DisplayCore::new(shared.clone(), provider);

    match core.create_everything() {
        Ok(()) => shared.ds_state.advance(DisplayState::Idle),
        Err(e) => {
            log::error!("{} Failed to initialize display: {}", shared.ds_name, e);
            core.cleanup();
            shared.ds_state.advance(DisplayState::Error);
            shared.ds_state.wait_for(DisplayState::Stop);
            shared.ds_state.advance(DisplayState::Stopped);
            return;
        }
    }

    let start = Instant::now();
    while core.step() {}

    let frames = shared.ds_frames.load(Ordering::Relaxed);
    let elapsed = start.elapsed().as_millis().max(1) as u64;
    log::info!(
        "{} Rendered {} frames in {}ms ({:.2} fps)",
        shared.ds_name,
        frames,
        elapsed,
        frames as f64 / (elapsed as f64 / 1000.0)
    );

    core.cleanup();
    shared.ds_state.wait_for(DisplayState::Stop);
    shared.ds_state.advance(DisplayState::Stopped);
}

impl DisplayCore {
    fn new(shared: Arc<DisplayShared>, provider: Box<dyn SurfaceProvider>) -> Self {
        let dev = shared.ds_dev.clone();
        let deadline = Instant::now() + shared.ds_trigger.max_time_between_frames();
        Self {
            c_shared: shared,
            c_dev: dev,
            c_provider: provider,
            c_surface: vk::SurfaceKHR::null(),
            c_swapchain: vk::SwapchainKHR::null(),
            c_format: vk::Format::UNDEFINED,
            c_extent: vk::Extent2D::default(),
            c_render_pass: vk::RenderPass::null(),
            c_pipeline_layout: vk::PipelineLayout::null(),
            c_pipeline: vk::Pipeline::null(),
            c_images: Vec::new(),
            c_graphics_pool: vk::CommandPool::null(),
            c_transfer_pool: vk::CommandPool::null(),
            c_slots: SlotPool::new(),
            c_render_finished_fence: vk::Fence::null(),
            c_rendered_normally: true,
            c_next_frame_time: deadline,
        }
    }

    /// One iteration of the worker loop. Returns false to leave it.
    fn step(&mut self) -> bool {
        match self.c_shared.ds_state.get() {
            DisplayState::Idle => {
                self.render_once();
                true
            }
            DisplayState::SwapOutOfDate => {
                self.rebuild();
                true
            }
            DisplayState::Error | DisplayState::Stop => false,
            state => {
                log::error!(
                    "{} Worker observed unexpected state {:?}",
                    self.c_shared.ds_name,
                    state
                );
                self.c_shared.ds_state.advance(DisplayState::Error);
                false
            }
        }
    }
}
