use crate::device::Lane;
use crate::error::{MosaicError, Result};
use ash::{Device, Instance, vk};
use log::{debug, info};
use std::ffi::CStr;

/// Logical device with up to one queue per [`Lane`], all from one compute-capable family.
pub struct VulkanDevice {
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,
    pub name: String,
    /// Distinct queues; lanes share the last one when the family has fewer than three.
    pub queues: Vec<vk::Queue>,
    pub compute_queue_family_index: u32,
    pub device_properties: vk::PhysicalDeviceProperties,
}

impl std::fmt::Debug for VulkanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDevice")
            .field("name", &self.name)
            .field("physical_device", &self.physical_device)
            .field("queues", &self.queues.len())
            .field("compute_queue_family_index", &self.compute_queue_family_index)
            .finish()
    }
}

impl VulkanDevice {
    /// Physical devices that expose a compute queue family, in enumeration order.
    pub fn compute_capable(instance: &Instance) -> Result<Vec<(vk::PhysicalDevice, u32)>> {
        let physical_devices = unsafe { instance.enumerate_physical_devices() }?;
        Ok(physical_devices
            .into_iter()
            .filter_map(|device| Self::find_compute_queue_family(instance, device).map(|family| (device, family)))
            .collect())
    }

    /// Open the `index`-th compute-capable device.
    pub fn new(instance: &Instance, index: usize) -> Result<Self> {
        let (physical_device, compute_queue_family_index) = Self::compute_capable(instance)?
            .get(index)
            .copied()
            .ok_or(MosaicError::NoDeviceFound)?;

        let name = Self::get_device_name(instance, physical_device);
        info!("Selected GPU {}: {}", index, name);

        let device_properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let limits = &device_properties.limits;
        debug!(
            "   Max compute workgroup invocations: {}",
            limits.max_compute_work_group_invocations
        );
        debug!(
            "   Max compute shared memory: {} KB",
            limits.max_compute_shared_memory_size / 1024
        );

        let family = unsafe { instance.get_physical_device_queue_family_properties(physical_device) }
            [compute_queue_family_index as usize];
        let queue_count = family.queue_count.clamp(1, Lane::ALL.len() as u32);
        let queue_priorities = vec![1.0f32; queue_count as usize];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(compute_queue_family_index)
            .queue_priorities(&queue_priorities);

        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .push_next(&mut vulkan12);

        let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }?;
        let queues = (0..queue_count)
            .map(|queue| unsafe { device.get_device_queue(compute_queue_family_index, queue) })
            .collect();
        debug!("{}: {} queue(s) from family {}", name, queue_count, compute_queue_family_index);

        Ok(Self {
            physical_device,
            device,
            name,
            queues,
            compute_queue_family_index,
            device_properties,
        })
    }

    pub fn queue(&self, lane: Lane) -> vk::Queue {
        self.queues[lane.index().min(self.queues.len() - 1)]
    }

    fn find_compute_queue_family(instance: &Instance, device: vk::PhysicalDevice) -> Option<u32> {
        let queue_family_properties = unsafe { instance.get_physical_device_queue_family_properties(device) };

        queue_family_properties
            .iter()
            .enumerate()
            .find(|(_, properties)| properties.queue_flags.contains(vk::QueueFlags::COMPUTE))
            .map(|(index, _)| index as u32)
    }

    fn get_device_name(instance: &Instance, device: vk::PhysicalDevice) -> String {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        device_name.to_string_lossy().into_owned()
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}
