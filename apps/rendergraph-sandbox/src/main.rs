//! Opens a window and presents a cleared frame with a textured quad, handling
//! resizes and out-of-date swapchains.

mod renderer;

use std::time::Instant;

use anyhow::Context;
use rendergraph_gpu::{GpuContextBuilder, SurfaceProvider};
use rendergraph_platform::{PlatformConfig, PlatformWindow};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::renderer::Renderer;

fn validation_enabled() -> bool {
    match std::env::var("RENDERGRAPH_VALIDATION").as_deref() {
        Ok("1") => true,
        Ok("0") => false,
        _ => cfg!(debug_assertions),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut window = PlatformWindow::new(PlatformConfig::new("rendergraph sandbox"))
        .context("failed to open window")?;
    let (ctx, surface) = GpuContextBuilder::new()
        .app_name("rendergraph-sandbox")
        .validation(validation_enabled())
        .build_with_surface(&window)
        .context("failed to create GPU context")?;

    let mut renderer = Renderer::new(&ctx, surface, window.framebuffer_size())?;
    let start = Instant::now();
    let mut frames = 0u64;

    while !window.should_close() {
        window.poll_events();
        let size = window.framebuffer_size();
        if size.0 == 0 || size.1 == 0 {
            continue;
        }
        if window.take_resized() {
            renderer.resize(size)?;
        }
        renderer.draw_frame(start.elapsed().as_secs_f32(), size)?;
        frames += 1;
    }

    ctx.wait_idle()?;
    info!(frames, seconds = start.elapsed().as_secs_f32(), "Sandbox closed");
    Ok(())
}
