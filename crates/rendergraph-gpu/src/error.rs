//! GPU error types.
//!
//! Errors fall into five categories (see [`ErrorCategory`]). Setup and contract
//! errors are fatal to the caller; allocation and transient errors are meant to
//! be branched on.

use crate::device::QueueType;
use crate::command::CommandBufferState;
use ash::vk;
use thiserror::Error;

/// Broad classification of a [`GpuError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Missing loader, extension, layer, device or queue family.
    Setup,
    /// Device memory exhausted or an unsupported usage/memory combination.
    Allocation,
    /// The API was used in a way that would corrupt GPU state.
    Contract,
    /// Recoverable presentation errors, e.g. an out-of-date swapchain.
    Transient,
    /// Any other failure reported by the driver.
    Device,
}

/// Memory allocation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// Host or device memory is exhausted.
    #[error("out of memory")]
    OutOfMemory,

    /// The requested usage and memory policy cannot be satisfied by this device.
    #[error("unsupported usage/memory combination: {0}")]
    Unsupported(String),

    /// Other allocator failure.
    #[error("{0}")]
    Other(String),
}

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// The Vulkan loader could not be found.
    #[error("Vulkan loader unavailable: {0}")]
    LoaderUnavailable(String),

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Required validation layer not available.
    #[error("Required layer not supported: {0}")]
    LayerNotSupported(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// No queue family can serve the given queue type.
    #[error("No suitable queue family for {0:?} queue")]
    NoSuitableQueueFamily(QueueType),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    /// A binding was added to, or recompiled on, a compiled descriptor set layout.
    #[error("Descriptor set layout is already compiled")]
    LayoutFrozen,

    /// A descriptor set was requested for a layout that has not been compiled.
    #[error("Descriptor set layout is not compiled")]
    LayoutNotCompiled,

    /// A descriptor write does not match the type declared by the layout.
    #[error("Descriptor type mismatch at binding {binding}: layout declares {expected:?}, write uses {actual:?}")]
    DescriptorTypeMismatch {
        binding: u32,
        expected: vk::DescriptorType,
        actual: vk::DescriptorType,
    },

    /// A descriptor write targets a binding the layout does not have.
    #[error("Binding {binding} out of range, layout has {count} bindings")]
    BindingOutOfRange { binding: u32, count: u32 },

    /// A command buffer operation was issued in the wrong state.
    #[error("Cannot {operation} a command buffer in the {state:?} state")]
    InvalidCommandBufferState {
        operation: &'static str,
        state: CommandBufferState,
    },

    /// A buffer was mapped while already mapped.
    #[error("Buffer is already mapped")]
    AlreadyMapped,

    /// A buffer was unmapped while not mapped.
    #[error("Buffer is not mapped")]
    NotMapped,

    /// A buffer without host-visible memory was mapped.
    #[error("Buffer memory is not host visible")]
    NotHostVisible,

    /// A host access range falls outside the buffer.
    #[error("Host access out of bounds: offset {offset} + {len} bytes exceeds {size}")]
    MapOutOfBounds { offset: u64, len: u64, size: u64 },

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The swapchain no longer matches the surface and must be recreated.
    #[error("Swapchain is out of date")]
    SwapchainOutOfDate,

    /// The presentation surface was lost.
    #[error("Surface lost")]
    SurfaceLost,

    /// Queue submission failed.
    #[error("Queue submission failed: {0}")]
    Submit(vk::Result),

    /// Shader compilation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Shader parameters could not be turned into descriptor set layouts.
    #[error("Shader reflection failed: {0}")]
    ShaderReflection(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                Self::Allocation(AllocationError::OutOfMemory)
            }
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::SwapchainOutOfDate,
            vk::Result::ERROR_SURFACE_LOST_KHR => Self::SurfaceLost,
            vk::Result::ERROR_EXTENSION_NOT_PRESENT => {
                Self::ExtensionNotSupported("unknown extension".to_string())
            }
            vk::Result::ERROR_LAYER_NOT_PRESENT => {
                Self::LayerNotSupported("unknown layer".to_string())
            }
            other => Self::Vulkan(other),
        }
    }
}

impl From<gpu_allocator::AllocationError> for GpuError {
    fn from(error: gpu_allocator::AllocationError) -> Self {
        let error = match error {
            gpu_allocator::AllocationError::OutOfMemory => AllocationError::OutOfMemory,
            gpu_allocator::AllocationError::NoCompatibleMemoryTypeFound => {
                AllocationError::Unsupported("no compatible memory type".to_string())
            }
            gpu_allocator::AllocationError::InvalidAllocationCreateDesc => {
                AllocationError::Unsupported("invalid allocation description".to_string())
            }
            other => AllocationError::Other(other.to_string()),
        };
        Self::Allocation(error)
    }
}

impl GpuError {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::LoaderUnavailable(_)
            | Self::ExtensionNotSupported(_)
            | Self::LayerNotSupported(_)
            | Self::NoSuitableDevice
            | Self::NoSuitableQueueFamily(_)
            | Self::SurfaceCreation(_) => ErrorCategory::Setup,

            Self::Allocation(_) => ErrorCategory::Allocation,

            Self::LayoutFrozen
            | Self::LayoutNotCompiled
            | Self::DescriptorTypeMismatch { .. }
            | Self::BindingOutOfRange { .. }
            | Self::InvalidCommandBufferState { .. }
            | Self::AlreadyMapped
            | Self::NotMapped
            | Self::NotHostVisible
            | Self::MapOutOfBounds { .. }
            | Self::InvalidState(_) => ErrorCategory::Contract,

            Self::SwapchainOutOfDate | Self::SurfaceLost => ErrorCategory::Transient,

            Self::Submit(_)
            | Self::ShaderCompilation(_)
            | Self::ShaderReflection(_)
            | Self::PipelineCreation(_)
            | Self::Vulkan(_) => ErrorCategory::Device,
        }
    }

    /// Whether the caller can recover by recreating the swapchain.
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Whether the error reports misuse of the API.
    pub fn is_contract_violation(&self) -> bool {
        self.category() == ErrorCategory::Contract
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_is_an_allocation_error() {
        let err = GpuError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(matches!(
            err,
            GpuError::Allocation(AllocationError::OutOfMemory)
        ));
        assert_eq!(err.category(), ErrorCategory::Allocation);
    }

    #[test]
    fn out_of_date_is_transient() {
        let err = GpuError::from(vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert!(matches!(err, GpuError::SwapchainOutOfDate));
        assert!(err.is_transient());
        assert!(!GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST).is_transient());
    }

    #[test]
    fn contract_errors() {
        assert!(GpuError::LayoutFrozen.is_contract_violation());
        assert!(GpuError::AlreadyMapped.is_contract_violation());
        let err = GpuError::InvalidCommandBufferState {
            operation: "end",
            state: CommandBufferState::Initial,
        };
        assert!(err.is_contract_violation());
        assert_eq!(
            err.to_string(),
            "Cannot end a command buffer in the Initial state"
        );
    }

    #[test]
    fn setup_errors() {
        assert_eq!(
            GpuError::NoSuitableQueueFamily(QueueType::Compute).category(),
            ErrorCategory::Setup
        );
        assert_eq!(
            GpuError::LayerNotSupported("VK_LAYER_KHRONOS_validation".into()).category(),
            ErrorCategory::Setup
        );
    }
}
