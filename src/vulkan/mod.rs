pub mod compute;
pub mod device;
pub mod instance;
pub mod kernel;
pub mod memory;

pub use compute::{VulkanComputeDevice, VulkanDeviceBuffer, VulkanEvent};
pub use device::VulkanDevice;
pub use instance::VulkanInstance;
pub use kernel::{KernelPipeline, TileMatchParams, compile_kernel};
pub use memory::{VulkanBuffer, VulkanMemoryManager};

use crate::error::{DeviceErrorKind, MosaicError};
use ash::vk;
use gpu_allocator::AllocationError;

/// Category of a failed Vulkan call.
pub fn error_kind(result: vk::Result) -> DeviceErrorKind {
    match result {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY
        | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
        | vk::Result::ERROR_OUT_OF_POOL_MEMORY
        | vk::Result::ERROR_FRAGMENTED_POOL
        | vk::Result::ERROR_TOO_MANY_OBJECTS => DeviceErrorKind::ResourceExhausted,
        vk::Result::ERROR_DEVICE_LOST => DeviceErrorKind::DeviceLost,
        vk::Result::ERROR_INITIALIZATION_FAILED
        | vk::Result::ERROR_LAYER_NOT_PRESENT
        | vk::Result::ERROR_EXTENSION_NOT_PRESENT
        | vk::Result::ERROR_FEATURE_NOT_PRESENT
        | vk::Result::ERROR_INCOMPATIBLE_DRIVER => DeviceErrorKind::InvalidConfiguration,
        vk::Result::ERROR_FORMAT_NOT_SUPPORTED | vk::Result::ERROR_INVALID_EXTERNAL_HANDLE => {
            DeviceErrorKind::InvalidArgument
        }
        _ => DeviceErrorKind::Other,
    }
}

pub fn device_error(operation: &'static str, result: vk::Result) -> MosaicError {
    MosaicError::device(operation, error_kind(result), format!("{result:?}"))
}

pub fn allocation_error(error: AllocationError) -> MosaicError {
    let kind = match error {
        AllocationError::OutOfMemory => DeviceErrorKind::ResourceExhausted,
        AllocationError::NoCompatibleMemoryTypeFound => DeviceErrorKind::InvalidConfiguration,
        AllocationError::InvalidAllocationCreateDesc => DeviceErrorKind::InvalidArgument,
        _ => DeviceErrorKind::Other,
    };
    MosaicError::device("allocate", kind, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_categories() {
        assert_eq!(error_kind(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY), DeviceErrorKind::ResourceExhausted);
        assert_eq!(error_kind(vk::Result::ERROR_DEVICE_LOST), DeviceErrorKind::DeviceLost);
        assert_eq!(error_kind(vk::Result::ERROR_INCOMPATIBLE_DRIVER), DeviceErrorKind::InvalidConfiguration);
        assert_eq!(error_kind(vk::Result::ERROR_UNKNOWN), DeviceErrorKind::Other);
        assert!(matches!(
            allocation_error(AllocationError::OutOfMemory),
            MosaicError::DeviceOperation {
                kind: DeviceErrorKind::ResourceExhausted,
                ..
            }
        ));
    }
}
