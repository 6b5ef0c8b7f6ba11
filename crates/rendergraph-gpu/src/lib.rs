//! Explicit-lifetime Vulkan abstraction layer.
//!
//! This crate provides:
//! - Vulkan instance and device management
//! - Memory allocation via gpu-allocator, with reference-counted resources
//! - Command recording with a checked state machine
//! - Fences, semaphores and batched pipeline barriers
//! - Descriptor binding and pipeline objects built from reflected shaders
//! - Swapchain handling
//!
//! Windows and shader compilers plug in through [`SurfaceProvider`] and
//! [`ShaderProvider`].

pub mod allocator;
pub mod barrier;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod instance;
pub mod logging;
pub mod pipeline;
pub mod resources;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod upload;

pub use ash::vk;

pub use allocator::{Allocator, BufferDesc, ImageDesc, MemoryLocation, MemoryPolicy, Sharing};
pub use barrier::{AccessInfo, ResourceBarrier};
pub use command::{execute_one_time, CommandBuffer, CommandBufferState, CommandPool};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{
    BindingInfo, DescriptorPool, DescriptorPoolConfig, DescriptorSet, DescriptorSetLayout,
};
pub use device::{Device, Queue, QueueType};
pub use error::{AllocationError, ErrorCategory, GpuError, Result};
pub use instance::Instance;
pub use logging::Logger;
pub use pipeline::{GraphicsPipelineConfig, Pipeline, PipelineKind};
pub use resources::{
    Buffer, BufferMapping, GpuResource, Image, ImageOwnership, ImageView, ImageViewDesc, Sampler,
    SamplerDesc,
};
pub use shader::{CompiledShader, ParameterBinding, Shader, ShaderProvider, ShaderStage};
pub use surface::{Surface, SurfaceProvider};
pub use swapchain::{AcquiredImage, PresentOutcome, Swapchain, SwapchainConfig};
pub use sync::{Fence, FrameSync, FrameSyncRing, Semaphore};
