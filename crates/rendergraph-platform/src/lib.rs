//! Platform window for rendergraph.
//!
//! [`PlatformWindow`] owns a winit event loop and a single window, and
//! implements [`SurfaceProvider`] so a GPU context can present to it. Events
//! are pumped by the caller each frame instead of handing control to winit.

use std::ffi::CStr;
use std::time::Duration;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use rendergraph_gpu::{GpuError, SurfaceProvider};
use thiserror::Error;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Window, WindowId};

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Window creation failed: {0}")]
    WindowCreation(String),
    #[error("Event loop error: {0}")]
    EventLoop(String),
}

pub type Result<T> = std::result::Result<T, PlatformError>;

/// Platform configuration.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            title: "rendergraph".to_string(),
            width: 1280,
            height: 720,
            resizable: true,
        }
    }
}

impl PlatformConfig {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

#[derive(Default)]
struct WindowState {
    config: PlatformConfig,
    window: Option<Window>,
    should_close: bool,
    resized: bool,
    error: Option<String>,
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height))
            .with_resizable(self.config.resizable);
        match event_loop.create_window(attrs) {
            Ok(window) => self.window = Some(window),
            Err(e) => self.error = Some(e.to_string()),
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => self.should_close = true,
            WindowEvent::Resized(size) => {
                tracing::debug!(width = size.width, height = size.height, "Window resized");
                self.resized = true;
            }
            _ => {}
        }
    }
}

/// A winit window driven by [`SurfaceProvider::poll_events`].
pub struct PlatformWindow {
    event_loop: EventLoop<()>,
    state: WindowState,
}

impl PlatformWindow {
    /// Create the event loop and open the window.
    ///
    /// Pumps events until winit delivers the first `resumed`, which is when
    /// windows may be created.
    pub fn new(config: PlatformConfig) -> Result<Self> {
        let mut event_loop =
            EventLoop::new().map_err(|e| PlatformError::EventLoop(e.to_string()))?;
        let mut state = WindowState {
            config,
            ..Default::default()
        };

        while state.window.is_none() {
            if let PumpStatus::Exit(code) =
                event_loop.pump_app_events(Some(Duration::from_millis(10)), &mut state)
            {
                return Err(PlatformError::EventLoop(format!(
                    "event loop exited with code {code} before the window opened"
                )));
            }
            if let Some(error) = state.error.take() {
                return Err(PlatformError::WindowCreation(error));
            }
        }

        tracing::info!(title = %state.config.title, "Window created");
        Ok(Self { event_loop, state })
    }

    pub fn window(&self) -> Option<&Window> {
        self.state.window.as_ref()
    }

    /// Whether the window was resized since the last call.
    pub fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.state.resized)
    }

    fn handles(
        &self,
    ) -> rendergraph_gpu::Result<(
        raw_window_handle::RawDisplayHandle,
        raw_window_handle::RawWindowHandle,
    )> {
        let window = self
            .window()
            .ok_or_else(|| GpuError::SurfaceCreation("window is closed".to_string()))?;
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;
        Ok((display.as_raw(), handle.as_raw()))
    }
}

impl SurfaceProvider for PlatformWindow {
    fn required_instance_extensions(&self) -> rendergraph_gpu::Result<Vec<&'static CStr>> {
        let (display, _) = self.handles()?;
        let names = ash_window::enumerate_required_extensions(display)
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
        // ash-window hands out pointers into static extension-name constants.
        Ok(names
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) })
            .collect())
    }

    fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> rendergraph_gpu::Result<vk::SurfaceKHR> {
        let (display, window) = self.handles()?;
        unsafe { ash_window::create_surface(entry, instance, display, window, None) }
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))
    }

    fn framebuffer_size(&self) -> (u32, u32) {
        self.window().map_or((0, 0), |window| {
            let size = window.inner_size();
            (size.width, size.height)
        })
    }

    fn poll_events(&mut self) {
        let status = self
            .event_loop
            .pump_app_events(Some(Duration::ZERO), &mut self.state);
        if let PumpStatus::Exit(_) = status {
            self.state.should_close = true;
        }
    }

    fn should_close(&self) -> bool {
        self.state.should_close
    }
}
