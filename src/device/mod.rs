//! Device resource management for the GPU pipeline.
//!
//! [`ResourceManager`] turns a [`TaskGraph`] into submissions on a [`ComputeDevice`]:
//! corpus and row uploads on the transfer-in lane, one kernel launch per tile row on
//! the compute lane, and one read-back per row on the transfer-out lane. Buffers live
//! in a [`RowResources`] set that drains the device and releases every allocation
//! exactly once when it goes out of scope, whichever way `run` exits.

pub mod graph;
pub mod host;

use crate::error::{MosaicError, Result};
use crate::image::{PixelBuffer, ReferenceCorpus, TILE_BYTES, check_result_len};
use log::{debug, warn};

pub use graph::{Lane, Task, TaskGraph, TaskId, TaskKind};
pub use host::HostDevice;

/// What a buffer holds; devices pick memory placement from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Corpus,
    RowInput,
    RowOutput,
}

/// Arguments of one kernel launch (one tile row).
#[derive(Debug)]
pub struct KernelLaunch<'b, B> {
    pub row: &'b B,
    pub corpus: &'b B,
    pub output: &'b B,
    /// Image width in pixels.
    pub width: u32,
    /// Tile columns, i.e. work-groups to launch.
    pub columns: u32,
    pub corpus_len: u32,
}

/// One compute device with three in-order lanes (see [`Lane`]).
///
/// Every enqueue returns an event that completes when the operation has finished on
/// the device; operations start only after all their `wait` events completed.
/// Buffers are released when dropped, which callers must not do before `drain`.
pub trait ComputeDevice: Send + Sync {
    type Buffer: Send + Sync;
    type Event: Clone + Send + Sync;

    fn name(&self) -> String;

    fn allocate(&self, usage: BufferUsage, bytes: usize) -> Result<Self::Buffer>;

    /// Transfer-in lane: copy host `data` into `buffer`.
    fn write(&self, buffer: &Self::Buffer, data: &[u8], wait: &[Self::Event]) -> Result<Self::Event>;

    /// Compute lane: run the tile matching kernel over one tile row.
    fn launch(&self, launch: &KernelLaunch<'_, Self::Buffer>, wait: &[Self::Event]) -> Result<Self::Event>;

    /// Transfer-out lane: make `buffer` readable by the host.
    fn read_back(&self, buffer: &Self::Buffer, wait: &[Self::Event]) -> Result<Self::Event>;

    /// Block until every event has completed; fails if any operation failed.
    fn wait(&self, events: &[Self::Event]) -> Result<()>;

    /// Copy a read-back buffer into host indices. Only valid after its read-back completed.
    fn download(&self, buffer: &Self::Buffer, out: &mut [u32]) -> Result<()>;

    /// Block until every lane is idle.
    fn drain(&self) -> Result<()>;
}

/// Buffers of one `ResourceManager::run`, drained then released on drop.
pub struct RowResources<'d, D: ComputeDevice> {
    device: &'d D,
    corpus: Option<D::Buffer>,
    inputs: Vec<D::Buffer>,
    outputs: Vec<D::Buffer>,
    drained: bool,
}

impl<'d, D: ComputeDevice> RowResources<'d, D> {
    fn new(device: &'d D, rows: usize) -> Self {
        Self {
            device,
            corpus: None,
            inputs: Vec::with_capacity(rows),
            outputs: Vec::with_capacity(rows),
            drained: false,
        }
    }

    fn corpus(&self) -> Result<&D::Buffer> {
        self.corpus
            .as_ref()
            .ok_or_else(|| MosaicError::TaskGraph("corpus buffer used before allocation".into()))
    }

    fn buffer(buffers: &[D::Buffer], row: usize) -> Result<&D::Buffer> {
        buffers
            .get(row)
            .ok_or_else(|| MosaicError::TaskGraph(format!("no buffer allocated for row {row}")))
    }

    /// Drain explicitly so a failure is reported instead of only logged.
    fn finish(mut self) -> Result<()> {
        self.drained = true;
        self.device.drain()
    }
}

impl<D: ComputeDevice> Drop for RowResources<'_, D> {
    fn drop(&mut self) {
        if !self.drained
            && let Err(e) = self.device.drain()
        {
            warn!("Failed to drain {} before releasing buffers: {}", self.device.name(), e);
        }
        // buffers are released as the fields drop
    }
}

/// Drives one device through the per-row pipeline.
#[derive(Debug)]
pub struct ResourceManager<'d, D> {
    device: &'d D,
}

impl<'d, D: ComputeDevice> ResourceManager<'d, D> {
    pub fn new(device: &'d D) -> Self {
        Self { device }
    }

    /// Match every tile of `pixels` on the device; returns once every slot of `out` is written.
    pub fn run(&self, pixels: &PixelBuffer<'_>, corpus: &ReferenceCorpus<'_>, out: &mut [u32]) -> Result<()> {
        let grid = pixels.grid();
        check_result_len(grid, out)?;
        if grid.is_empty() {
            return Ok(());
        }

        let graph = TaskGraph::for_rows(grid.rows);
        graph.validate()?;
        debug!(
            "{}: {} tile rows, {} tasks",
            self.device.name(),
            grid.rows,
            graph.len()
        );

        let mut resources = RowResources::new(self.device, grid.rows);
        resources.corpus = Some(self.device.allocate(BufferUsage::Corpus, corpus.len() * TILE_BYTES)?);
        for _ in 0..grid.rows {
            resources
                .inputs
                .push(self.device.allocate(BufferUsage::RowInput, pixels.tile_row_bytes())?);
            resources
                .outputs
                .push(self.device.allocate(BufferUsage::RowOutput, grid.cols * size_of::<u32>())?);
        }

        let mut events: Vec<Option<D::Event>> = vec![None; graph.len()];
        for task in graph.tasks() {
            let wait = task
                .deps
                .iter()
                .map(|&dep| {
                    events[dep].clone().ok_or_else(|| {
                        MosaicError::TaskGraph(format!("task {} waits on unsubmitted task {}", task.id, dep))
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let event = match task.kind {
                TaskKind::UploadCorpus => self.device.write(resources.corpus()?, corpus.as_bytes(), &wait)?,
                TaskKind::UploadRow(row) => {
                    let buffer = RowResources::<D>::buffer(&resources.inputs, row)?;
                    self.device.write(buffer, pixels.tile_row(row), &wait)?
                }
                TaskKind::Launch(row) => {
                    let launch = KernelLaunch {
                        row: RowResources::<D>::buffer(&resources.inputs, row)?,
                        corpus: resources.corpus()?,
                        output: RowResources::<D>::buffer(&resources.outputs, row)?,
                        width: pixels.width(),
                        columns: grid.cols as u32,
                        corpus_len: corpus.len() as u32,
                    };
                    self.device.launch(&launch, &wait)?
                }
                TaskKind::ReadBack(row) => {
                    let buffer = RowResources::<D>::buffer(&resources.outputs, row)?;
                    self.device.read_back(buffer, &wait)?
                }
            };
            events[task.id] = Some(event);
        }

        for (row, row_out) in out.chunks_exact_mut(grid.cols).enumerate() {
            let read = graph
                .find(TaskKind::ReadBack(row))
                .and_then(|id| events[id].clone())
                .ok_or_else(|| MosaicError::TaskGraph(format!("no read-back submitted for row {row}")))?;
            self.device.wait(&[read])?;
            self.device
                .download(RowResources::<D>::buffer(&resources.outputs, row)?, row_out)?;
        }

        resources.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::WorkGroupLayout;
    use crate::test_support::{noise, noise_corpus};

    #[test]
    fn releases_every_buffer_after_success() {
        let device = HostDevice::new(WorkGroupLayout::new(32).unwrap());
        let data = noise(64 * 64 * 3, 2);
        let pixels = PixelBuffer::new(&data, 64, 64).unwrap();
        let corpus_bytes = noise_corpus(2, 9);
        let corpus = ReferenceCorpus::new(&corpus_bytes, 2).unwrap();

        let mut out = vec![u32::MAX; 4];
        ResourceManager::new(&device).run(&pixels, &corpus, &mut out).unwrap();
        assert!(out.iter().all(|&i| i < 2));
        assert_eq!(device.live_allocations(), 0);
        assert_eq!(device.total_allocations(), 1 + 2 * 2);
    }

    #[test]
    fn releases_every_buffer_after_a_failed_launch() {
        let device = HostDevice::new(WorkGroupLayout::new(32).unwrap()).fail_launch_of_row(1);
        let data = noise(32 * 96 * 3, 4);
        let pixels = PixelBuffer::new(&data, 32, 96).unwrap();
        let corpus_bytes = noise_corpus(2, 1);
        let corpus = ReferenceCorpus::new(&corpus_bytes, 2).unwrap();

        let mut out = vec![0u32; 3];
        let result = ResourceManager::new(&device).run(&pixels, &corpus, &mut out);
        assert!(matches!(result, Err(MosaicError::DeviceOperation { .. })));
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    fn releases_every_buffer_after_a_failed_allocation() {
        let device = HostDevice::new(WorkGroupLayout::new(32).unwrap()).with_allocation_limit(3);
        let data = noise(32 * 96 * 3, 4);
        let pixels = PixelBuffer::new(&data, 32, 96).unwrap();
        let corpus_bytes = noise_corpus(1, 1);
        let corpus = ReferenceCorpus::new(&corpus_bytes, 1).unwrap();

        let mut out = vec![0u32; 3];
        let result = ResourceManager::new(&device).run(&pixels, &corpus, &mut out);
        assert!(matches!(result, Err(MosaicError::DeviceOperation { .. })));
        assert_eq!(device.live_allocations(), 0);
        assert_eq!(device.total_allocations(), 3);
    }
}
