//! Headless GPU test harness for rendergraph.
//!
//! GPU-backed tests call [`try_headless`] and return early when the machine
//! has no Vulkan loader or device, so the suite stays green on CI runners
//! without a GPU.

pub mod harness;

pub use harness::{copy_round_trip, merge_round_trip, shader_compiler, try_headless, HeadlessHarness};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] rendergraph_gpu::GpuError),
    #[error("Shader error: {0}")]
    Shader(#[from] rendergraph_shaders::ShaderError),
    #[error("Readback mismatch at {index}: expected {expected}, got {actual}")]
    Mismatch {
        index: usize,
        expected: f32,
        actual: f32,
    },
}

pub type Result<T> = std::result::Result<T, TestError>;
