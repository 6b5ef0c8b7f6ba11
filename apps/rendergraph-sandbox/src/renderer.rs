//! Per-frame recording and presentation.

use std::path::PathBuf;
use std::sync::Arc;

use rendergraph_gpu::upload::upload_image_rgba8;
use rendergraph_gpu::{
    vk, CommandBuffer, CommandPool, DescriptorPool, DescriptorPoolConfig, DescriptorSet, Device,
    FrameSyncRing, GpuContext, GpuError, GraphicsPipelineConfig, ImageView, ImageViewDesc,
    Pipeline, PresentOutcome, QueueType, Sampler, SamplerDesc, Shader, ShaderStage, Surface,
    Swapchain, SwapchainConfig,
};
use rendergraph_shaders::{ShaderCompiler, ShaderCompilerConfig};

const FRAMES_IN_FLIGHT: usize = 2;
const TEXTURE_SIZE: u32 = 64;

/// 8x8-cell checkerboard in RGBA8.
fn checkerboard(size: u32) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let light = ((x / 8) + (y / 8)) % 2 == 0;
            pixels.extend_from_slice(if light {
                &[230, 230, 230, 255]
            } else {
                &[40, 90, 160, 255]
            });
        }
    }
    pixels
}

pub struct Renderer {
    commands: Vec<CommandBuffer>,
    frames: FrameSyncRing,
    swapchain: Swapchain,
    pipeline: Arc<Pipeline>,
    texture_set: Arc<DescriptorSet>,
    // Keep the pool and texture objects alive for the descriptor set.
    _descriptors: DescriptorPool,
    _texture: (Arc<ImageView>, Arc<Sampler>),
    _pool: CommandPool,
    device: Arc<Device>,
}

impl Renderer {
    pub fn new(
        ctx: &GpuContext,
        surface: Arc<Surface>,
        framebuffer_size: (u32, u32),
    ) -> anyhow::Result<Self> {
        let device = Arc::clone(ctx.device());
        let swapchain = Swapchain::new(
            Arc::clone(&device),
            surface,
            SwapchainConfig::default(),
            framebuffer_size,
            ctx.logger().child("swapchain"),
        )?;

        let pool = ctx.command_pool(QueueType::Graphics)?;
        let commands = (0..FRAMES_IN_FLIGHT)
            .map(|_| pool.allocate_primary())
            .collect::<rendergraph_gpu::Result<Vec<_>>>()?;
        let frames = FrameSyncRing::new(&device, FRAMES_IN_FLIGHT)?;

        let compiler = ShaderCompiler::new(ShaderCompilerConfig {
            search_paths: vec![PathBuf::from(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../../crates/rendergraph-shaders/shaders"
            ))],
            ..Default::default()
        })?
        .with_logger(ctx.logger().child("shaders"));
        let vertex =
            Shader::load(Arc::clone(&device), &compiler, "fullscreen", "main", ShaderStage::Vertex)?;
        let fragment =
            Shader::load(Arc::clone(&device), &compiler, "textured", "main", ShaderStage::Fragment)?;
        let pipeline = Pipeline::graphics(
            Arc::clone(&device),
            vertex,
            fragment,
            GraphicsPipelineConfig {
                color_formats: vec![swapchain.format()],
                ..Default::default()
            },
            ctx.logger().child("pipeline"),
        )?;

        let image = upload_image_rgba8(
            ctx,
            &pool,
            TEXTURE_SIZE,
            TEXTURE_SIZE,
            &checkerboard(TEXTURE_SIZE),
        )?;
        let view = ImageView::new(&image, &ImageViewDesc::default())?;
        let sampler = Sampler::new(
            Arc::clone(&device),
            SamplerDesc {
                mag_filter: vk::Filter::NEAREST,
                ..Default::default()
            },
        )?;

        let descriptors = DescriptorPool::new(
            Arc::clone(&device),
            DescriptorPoolConfig::default(),
            ctx.logger().child("descriptors"),
        )?;
        let texture_set = descriptors.allocate_descriptor_set(&pipeline.set_layouts()[0])?;
        texture_set.write_image(
            0,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            &view,
            Some(&sampler),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;
        texture_set.update()?;

        Ok(Self {
            commands,
            frames,
            swapchain,
            pipeline,
            texture_set,
            _descriptors: descriptors,
            _texture: (view, sampler),
            _pool: pool,
            device,
        })
    }

    pub fn resize(&mut self, framebuffer_size: (u32, u32)) -> rendergraph_gpu::Result<()> {
        self.recreate_swapchain(framebuffer_size)
    }

    /// Rebuild the swapchain once no frame still references its images.
    fn recreate_swapchain(&mut self, framebuffer_size: (u32, u32)) -> rendergraph_gpu::Result<()> {
        self.device.wait_idle()?;
        for cmd in &mut self.commands {
            cmd.reset()?;
        }
        self.swapchain.recreate(framebuffer_size)
    }

    /// Record, submit and present one frame.
    ///
    /// An out-of-date swapchain is rebuilt and the frame skipped.
    pub fn draw_frame(&mut self, time: f32, framebuffer_size: (u32, u32)) -> rendergraph_gpu::Result<()> {
        let slot = self.frames.current_index();
        let frame = self.frames.current();
        frame.wait()?;
        let cmd = &mut self.commands[slot];
        cmd.reset()?;

        let acquired = match self
            .swapchain
            .acquire_next_image(&frame.image_available, u64::MAX)
        {
            Ok(acquired) => acquired,
            Err(GpuError::SwapchainOutOfDate) => return self.recreate_swapchain(framebuffer_size),
            Err(e) => return Err(e),
        };
        frame.in_flight.reset()?;

        let (Some(image), Some(view)) = (
            self.swapchain.image(acquired.index),
            self.swapchain.image_view(acquired.index),
        ) else {
            return Err(GpuError::InvalidState(format!(
                "swapchain returned unknown image {}",
                acquired.index
            )));
        };
        let extent = self.swapchain.extent();
        let pulse = 0.5 + 0.5 * time.sin();

        cmd.begin(true)?;
        image.transition(cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
        cmd.clear_color_image(
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            [0.1 * pulse, 0.1, 0.2 + 0.2 * pulse, 1.0],
        )?;
        image.transition(cmd, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)?;

        let attachments = [vk::RenderingAttachmentInfo::default()
            .image_view(view.raw())
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE)];
        let full = vk::Rect2D::default().extent(extent);
        cmd.record(|device, cb| unsafe {
            device.cmd_begin_rendering(
                cb,
                &vk::RenderingInfo::default()
                    .render_area(full)
                    .layer_count(1)
                    .color_attachments(&attachments),
            );
        })?;
        cmd.retain(view.clone())?;

        self.pipeline.bind(cmd)?;
        self.pipeline.bind_descriptor_set(cmd, 0, &self.texture_set)?;
        let (width, height) = (extent.width as f32, extent.height as f32);
        let viewport = vk::Viewport::default()
            .x(width * 0.25)
            .y(height * 0.25)
            .width(width * 0.5)
            .height(height * 0.5)
            .max_depth(1.0);
        cmd.record(|device, cb| unsafe {
            device.cmd_set_viewport(cb, 0, &[viewport]);
            device.cmd_set_scissor(cb, 0, &[full]);
            device.cmd_draw(cb, 3, 1, 0, 0);
            device.cmd_end_rendering(cb);
        })?;

        image.transition(cmd, vk::ImageLayout::PRESENT_SRC_KHR)?;
        cmd.end()?;

        cmd.insert_wait_semaphore(&frame.image_available, vk::PipelineStageFlags2::ALL_COMMANDS)?;
        cmd.insert_signal_semaphore(&frame.render_finished, vk::PipelineStageFlags2::ALL_COMMANDS)?;
        cmd.submit(Some(&frame.in_flight))?;

        let outcome = self
            .swapchain
            .present(acquired.index, &frame.render_finished);
        self.frames.advance();
        match outcome {
            Ok(PresentOutcome::Optimal) if !acquired.suboptimal => Ok(()),
            Ok(_) | Err(GpuError::SwapchainOutOfDate) => self.recreate_swapchain(framebuffer_size),
            Err(e) => Err(e),
        }
    }
}
