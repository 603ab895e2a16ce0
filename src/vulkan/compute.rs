//! [`ComputeDevice`] on a Vulkan GPU.
//!
//! Every lane owns a command pool and a timeline semaphore; an event is a point on
//! a lane's timeline. Buffers pair a device-local allocation with a host-visible
//! one: uploads copy staging to device on the transfer-in lane, read-backs copy
//! device to host on the transfer-out lane.

use super::device::VulkanDevice;
use super::device_error;
use super::instance::VulkanInstance;
use super::kernel::{KernelPipeline, TileMatchParams, compile_kernel};
use super::memory::{VulkanBuffer, VulkanMemoryManager};
use crate::device::{BufferUsage, ComputeDevice, KernelLaunch, Lane};
use crate::error::{MosaicError, Result};
use crate::kernel::WorkGroupLayout;
use ash::vk;
use gpu_allocator::MemoryLocation;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const SETS_PER_POOL: u32 = 64;

// Field order is drop order: everything allocated from the device goes before it.
struct Context {
    pipeline: KernelPipeline,
    memory: VulkanMemoryManager,
    device: VulkanDevice,
    _instance: Arc<VulkanInstance>,
}

struct LaneState {
    pool: vk::CommandPool,
    semaphore: vk::Semaphore,
    value: u64,
    submitted: Vec<vk::CommandBuffer>,
}

#[derive(Default)]
struct DescriptorPools {
    pools: Vec<vk::DescriptorPool>,
    current: usize,
}

/// Point on a lane's timeline semaphore.
#[derive(Debug, Clone, Copy)]
pub struct VulkanEvent {
    semaphore: vk::Semaphore,
    value: u64,
}

pub struct VulkanDeviceBuffer {
    usage: BufferUsage,
    device_local: Option<VulkanBuffer>,
    host: Option<VulkanBuffer>,
    context: Arc<Context>,
}

impl std::fmt::Debug for VulkanDeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDeviceBuffer")
            .field("usage", &self.usage)
            .field("device_local", &self.device_local)
            .finish()
    }
}

impl VulkanDeviceBuffer {
    fn device_local(&self) -> Result<&VulkanBuffer> {
        self.device_local
            .as_ref()
            .ok_or_else(|| MosaicError::TaskGraph("buffer used after release".into()))
    }

    fn host(&self) -> Result<&VulkanBuffer> {
        self.host
            .as_ref()
            .ok_or_else(|| MosaicError::TaskGraph("buffer used after release".into()))
    }
}

impl Drop for VulkanDeviceBuffer {
    fn drop(&mut self) {
        for buffer in [self.device_local.take(), self.host.take()].into_iter().flatten() {
            if let Err(e) = self.context.memory.destroy_buffer(buffer) {
                warn!("Failed to release {:?} buffer: {}", self.usage, e);
            }
        }
    }
}

pub struct VulkanComputeDevice {
    index: usize,
    layout: WorkGroupLayout,
    lanes: Vec<Mutex<LaneState>>,
    /// One lock per distinct queue; lanes may share a queue.
    queue_locks: Vec<Mutex<()>>,
    descriptors: Mutex<DescriptorPools>,
    context: Arc<Context>,
}

impl std::fmt::Debug for VulkanComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanComputeDevice")
            .field("index", &self.index)
            .field("device", &self.context.device)
            .field("layout", &self.layout)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl VulkanComputeDevice {
    /// Open up to `count` GPUs and build the kernel from `kernel_path` on each.
    pub fn create_all(count: usize, kernel_path: &Path, layout: WorkGroupLayout) -> Result<Vec<Self>> {
        if layout.pixels_per_thread() % 4 != 0 {
            return Err(MosaicError::InvalidWorkGroup {
                threads: layout.threads(),
                reason: "the Vulkan kernel packs four bytes per word and needs at most 256 threads".into(),
            });
        }

        let instance = Arc::new(VulkanInstance::new(false)?);
        let available = VulkanDevice::compute_capable(&instance.instance)?.len();
        if available == 0 {
            return Err(MosaicError::NoDeviceFound);
        }
        if available < count {
            warn!("{} GPU(s) requested, {} available", count, available);
        }
        (0..count.min(available))
            .map(|index| Self::new(Arc::clone(&instance), index, kernel_path, layout))
            .collect()
    }

    pub fn new(instance: Arc<VulkanInstance>, index: usize, kernel_path: &Path, layout: WorkGroupLayout) -> Result<Self> {
        let device = VulkanDevice::new(&instance.instance, index)?;
        let max_threads = device.device_properties.limits.max_compute_work_group_invocations;
        if layout.threads() > max_threads {
            return Err(MosaicError::InvalidWorkGroup {
                threads: layout.threads(),
                reason: format!("{} supports at most {} threads per work-group", device.name, max_threads),
            });
        }

        let spirv = compile_kernel(kernel_path, layout, &device.name)?;
        let pipeline = KernelPipeline::new(&device.device, &spirv)?;
        let memory = VulkanMemoryManager::new(&instance.instance, device.device.clone(), device.physical_device)?;
        let context = Arc::new(Context {
            pipeline,
            memory,
            device,
            _instance: instance,
        });

        let mut compute = Self {
            index,
            layout,
            lanes: Vec::with_capacity(Lane::ALL.len()),
            queue_locks: (0..context.device.queues.len()).map(|_| Mutex::new(())).collect(),
            descriptors: Mutex::new(DescriptorPools::default()),
            context,
        };
        for _ in Lane::ALL {
            let lane = compute.create_lane()?;
            compute.lanes.push(Mutex::new(lane));
        }
        info!(
            "{} ready: {} threads per work-group, {} queue(s)",
            compute.context.device.name,
            layout.threads(),
            compute.queue_locks.len()
        );
        Ok(compute)
    }

    fn raw(&self) -> &ash::Device {
        &self.context.device.device
    }

    fn create_lane(&self) -> Result<LaneState> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.context.device.compute_queue_family_index);
        let pool = unsafe { self.raw().create_command_pool(&pool_info, None) }.map_err(|e| device_error("create", e))?;

        let mut timeline = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore_info = vk::SemaphoreCreateInfo::default().push_next(&mut timeline);
        let semaphore = match unsafe { self.raw().create_semaphore(&semaphore_info, None) } {
            Ok(semaphore) => semaphore,
            Err(e) => {
                unsafe { self.raw().destroy_command_pool(pool, None) };
                return Err(device_error("create", e));
            }
        };
        Ok(LaneState {
            pool,
            semaphore,
            value: 0,
            submitted: Vec::new(),
        })
    }

    /// Record one command buffer on `lane`, waiting on `wait`, and signal the lane's next timeline value.
    fn submit<F>(&self, lane: Lane, operation: &'static str, wait: &[VulkanEvent], record: F) -> Result<VulkanEvent>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = self.raw();
        let mut state = lock(&self.lanes[lane.index()]);

        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(state.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { device.allocate_command_buffers(&allocate_info) }.map_err(|e| device_error(operation, e))?[0];

        let recorded = unsafe {
            device
                .begin_command_buffer(
                    cmd,
                    &vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .and_then(|()| {
                    record(device, cmd);
                    device.end_command_buffer(cmd)
                })
        };

        let signal = state.value + 1;
        let submitted = recorded.and_then(|()| {
            let wait_semaphores: Vec<vk::Semaphore> = wait.iter().map(|event| event.semaphore).collect();
            let wait_values: Vec<u64> = wait.iter().map(|event| event.value).collect();
            let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait.len()];
            let signal_semaphores = [state.semaphore];
            let signal_values = [signal];
            let command_buffers = [cmd];
            let mut timeline = vk::TimelineSemaphoreSubmitInfo::default()
                .wait_semaphore_values(&wait_values)
                .signal_semaphore_values(&signal_values);
            let submit_info = vk::SubmitInfo::default()
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .command_buffers(&command_buffers)
                .signal_semaphores(&signal_semaphores)
                .push_next(&mut timeline);

            let queue_slot = lane.index().min(self.queue_locks.len() - 1);
            let _queue = lock(&self.queue_locks[queue_slot]);
            unsafe { device.queue_submit(self.context.device.queue(lane), &[submit_info], vk::Fence::null()) }
        });

        if let Err(e) = submitted {
            unsafe { device.free_command_buffers(state.pool, &[cmd]) };
            return Err(device_error(operation, e));
        }
        state.value = signal;
        state.submitted.push(cmd);
        Ok(VulkanEvent {
            semaphore: state.semaphore,
            value: signal,
        })
    }

    fn allocate_descriptor_set(&self) -> Result<vk::DescriptorSet> {
        let mut pools = lock(&self.descriptors);
        let set_layouts = [self.context.pipeline.descriptor_set_layout];
        loop {
            if pools.current == pools.pools.len() {
                let sizes = [vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_BUFFER,
                    descriptor_count: 3 * SETS_PER_POOL,
                }];
                let pool_info = vk::DescriptorPoolCreateInfo::default()
                    .max_sets(SETS_PER_POOL)
                    .pool_sizes(&sizes);
                let pool = unsafe { self.raw().create_descriptor_pool(&pool_info, None) }
                    .map_err(|e| device_error("launch", e))?;
                pools.pools.push(pool);
            }

            let allocate_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pools.pools[pools.current])
                .set_layouts(&set_layouts);
            match unsafe { self.raw().allocate_descriptor_sets(&allocate_info) } {
                Ok(sets) => return Ok(sets[0]),
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => pools.current += 1,
                Err(e) => return Err(device_error("launch", e)),
            }
        }
    }

    fn copy(device: &ash::Device, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: u64) {
        let region = vk::BufferCopy::default().size(size);
        unsafe { device.cmd_copy_buffer(cmd, src, dst, &[region]) };
    }
}

impl ComputeDevice for VulkanComputeDevice {
    type Buffer = VulkanDeviceBuffer;
    type Event = VulkanEvent;

    fn name(&self) -> String {
        format!("{} (gpu {})", self.context.device.name, self.index)
    }

    fn allocate(&self, usage: BufferUsage, bytes: usize) -> Result<VulkanDeviceBuffer> {
        let size = bytes as u64;
        let storage = vk::BufferUsageFlags::STORAGE_BUFFER;
        let (device_usage, host_usage, host_location) = match usage {
            BufferUsage::Corpus | BufferUsage::RowInput => (
                storage | vk::BufferUsageFlags::TRANSFER_DST,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryLocation::CpuToGpu,
            ),
            BufferUsage::RowOutput => (
                storage | vk::BufferUsageFlags::TRANSFER_SRC,
                vk::BufferUsageFlags::TRANSFER_DST,
                MemoryLocation::GpuToCpu,
            ),
        };

        let mut buffer = VulkanDeviceBuffer {
            usage,
            device_local: None,
            host: None,
            context: Arc::clone(&self.context),
        };
        let memory = &self.context.memory;
        buffer.device_local = Some(memory.create_buffer(size, device_usage, MemoryLocation::GpuOnly, "tile match device")?);
        buffer.host = Some(memory.create_buffer(size, host_usage, host_location, "tile match host")?);
        Ok(buffer)
    }

    fn write(&self, buffer: &VulkanDeviceBuffer, data: &[u8], wait: &[VulkanEvent]) -> Result<VulkanEvent> {
        let (host, device_local) = (buffer.host()?, buffer.device_local()?);
        self.context.memory.upload_data(host, data)?;
        let (src, dst, size) = (host.buffer, device_local.buffer, host.size);
        self.submit(Lane::TransferIn, "write", wait, |device, cmd| {
            Self::copy(device, cmd, src, dst, size)
        })
    }

    fn launch(&self, launch: &KernelLaunch<'_, VulkanDeviceBuffer>, wait: &[VulkanEvent]) -> Result<VulkanEvent> {
        let set = self.allocate_descriptor_set()?;
        let infos = [
            launch.corpus.device_local()?,
            launch.row.device_local()?,
            launch.output.device_local()?,
        ]
        .map(|buffer| [vk::DescriptorBufferInfo::default().buffer(buffer.buffer).offset(0).range(vk::WHOLE_SIZE)]);
        let writes: Vec<_> = infos
            .iter()
            .enumerate()
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(binding as u32)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(info)
            })
            .collect();
        unsafe { self.raw().update_descriptor_sets(&writes, &[]) };

        let params = TileMatchParams {
            width: launch.width,
            columns: launch.columns,
            corpus_len: launch.corpus_len,
        };
        let pipeline = &self.context.pipeline;
        debug!("{}: launching {} work-groups", self.context.device.name, launch.columns);
        self.submit(Lane::Compute, "launch", wait, |device, cmd| unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.pipeline_layout,
                0,
                &[set],
                &[],
            );
            device.cmd_push_constants(
                cmd,
                pipeline.pipeline_layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&params),
            );
            device.cmd_dispatch(cmd, launch.columns, 1, 1);
        })
    }

    fn read_back(&self, buffer: &VulkanDeviceBuffer, wait: &[VulkanEvent]) -> Result<VulkanEvent> {
        let (host, device_local) = (buffer.host()?, buffer.device_local()?);
        let (src, dst, size) = (device_local.buffer, host.buffer, host.size);
        self.submit(Lane::TransferOut, "read", wait, |device, cmd| {
            Self::copy(device, cmd, src, dst, size);
            let to_host = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::HOST_READ);
            unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::HOST,
                    vk::DependencyFlags::empty(),
                    &[to_host],
                    &[],
                    &[],
                );
            }
        })
    }

    fn wait(&self, events: &[VulkanEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let semaphores: Vec<vk::Semaphore> = events.iter().map(|event| event.semaphore).collect();
        let values: Vec<u64> = events.iter().map(|event| event.value).collect();
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.raw().wait_semaphores(&wait_info, u64::MAX) }.map_err(|e| device_error("wait", e))
    }

    fn download(&self, buffer: &VulkanDeviceBuffer, out: &mut [u32]) -> Result<()> {
        self.context
            .memory
            .device_to_host(buffer.host()?, bytemuck::cast_slice_mut(out))
    }

    fn drain(&self) -> Result<()> {
        let mut first_error = None;
        for lane in &self.lanes {
            let mut state = lock(lane);
            let event = VulkanEvent {
                semaphore: state.semaphore,
                value: state.value,
            };
            if let Err(e) = self.wait(&[event]) {
                // work may still be pending; the command pool frees it on drop
                first_error.get_or_insert(e);
                continue;
            }
            let submitted = std::mem::take(&mut state.submitted);
            if !submitted.is_empty() {
                unsafe { self.raw().free_command_buffers(state.pool, &submitted) };
            }
        }

        let mut pools = lock(&self.descriptors);
        for &pool in &pools.pools {
            if let Err(e) = unsafe { self.raw().reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty()) } {
                first_error.get_or_insert(device_error("drain", e));
            }
        }
        pools.current = 0;
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for VulkanComputeDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.raw().device_wait_idle();
        }
        for lane in &self.lanes {
            let state = lock(lane);
            unsafe {
                // destroying the pool frees its command buffers
                self.raw().destroy_command_pool(state.pool, None);
                self.raw().destroy_semaphore(state.semaphore, None);
            }
        }
        for &pool in &lock(&self.descriptors).pools {
            unsafe { self.raw().destroy_descriptor_pool(pool, None) };
        }
    }
}
