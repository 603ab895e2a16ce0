use super::{allocation_error, device_error};
use crate::error::{DeviceErrorKind, MosaicError, Result};
use ash::{Device, vk};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::{AllocationSizes, MemoryLocation};
use std::sync::{Arc, Mutex, MutexGuard};

pub struct VulkanBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
}

impl std::fmt::Debug for VulkanBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBuffer")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .finish()
    }
}

#[derive(Clone)]
pub struct VulkanMemoryManager {
    device: Device,
    allocator: Arc<Mutex<Allocator>>,
}

impl std::fmt::Debug for VulkanMemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanMemoryManager")
            .field("device", &"Device")
            .field("allocator", &self.allocator)
            .finish()
    }
}

impl VulkanMemoryManager {
    pub fn new(instance: &ash::Instance, device: Device, physical_device: vk::PhysicalDevice) -> Result<Self> {
        let debug_settings = gpu_allocator::AllocatorDebugSettings {
            log_leaks_on_shutdown: true,
            ..Default::default()
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings,
            buffer_device_address: false,
            allocation_sizes: AllocationSizes::default(),
        })?;

        Ok(Self {
            device,
            allocator: Arc::new(Mutex::new(allocator)),
        })
    }

    fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory_location: MemoryLocation,
        name: &str,
    ) -> Result<VulkanBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size.max(4))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer =
            unsafe { self.device.create_buffer(&buffer_info, None) }.map_err(|e| device_error("allocate", e))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: memory_location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(allocation_error(e));
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        let buffer = VulkanBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        };
        if let Err(e) = bound {
            self.destroy_buffer(buffer)?;
            return Err(device_error("allocate", e));
        }
        Ok(buffer)
    }

    fn mapped(buffer: &VulkanBuffer, operation: &'static str) -> Result<std::ptr::NonNull<std::ffi::c_void>> {
        buffer
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .ok_or_else(|| MosaicError::device(operation, DeviceErrorKind::InvalidArgument, "buffer is not host visible"))
    }

    /// Copy `data` into a host-visible buffer.
    pub fn upload_data(&self, buffer: &VulkanBuffer, data: &[u8]) -> Result<()> {
        if data.len() as u64 != buffer.size {
            return Err(MosaicError::device(
                "write",
                DeviceErrorKind::InvalidArgument,
                format!("{} bytes written to a {} byte buffer", data.len(), buffer.size),
            ));
        }
        let mapped = Self::mapped(buffer, "write")?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.as_ptr() as *mut u8, data.len());
        }
        Ok(())
    }

    /// Copy a host-visible buffer into `data`.
    pub fn device_to_host(&self, buffer: &VulkanBuffer, data: &mut [u8]) -> Result<()> {
        if data.len() as u64 != buffer.size {
            return Err(MosaicError::device(
                "read",
                DeviceErrorKind::InvalidArgument,
                format!("{} byte buffer read into {} bytes", buffer.size, data.len()),
            ));
        }
        let mapped = Self::mapped(buffer, "read")?;
        unsafe {
            std::ptr::copy_nonoverlapping(mapped.as_ptr() as *const u8, data.as_mut_ptr(), data.len());
        }
        Ok(())
    }

    pub fn destroy_buffer(&self, buffer: VulkanBuffer) -> Result<()> {
        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        if let Some(allocation) = buffer.allocation {
            self.allocator().free(allocation).map_err(allocation_error)?;
        }
        Ok(())
    }
}
