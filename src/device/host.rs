//! In-process compute device.
//!
//! Each lane is a worker thread fed through a channel, so lanes execute in
//! submission order and overlap with each other exactly as device queues do.
//! Buffers keep a device copy and a host-visible staging copy; uploads stage
//! synchronously and copy on the transfer-in lane, read-backs copy on the
//! transfer-out lane. Kernel launches run the work-group kernel of
//! [`crate::kernel`].

use super::{BufferUsage, ComputeDevice, KernelLaunch, Lane};
use crate::error::{DeviceErrorKind, MosaicError, Result};
use crate::image::ReferenceCorpus;
use crate::kernel::{WorkGroupLayout, dispatch_row};
use crossbeam_channel::{Sender, unbounded};
use log::debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;

type Outcome = std::result::Result<(), (DeviceErrorKind, String)>;

/// Completion flag of one submitted operation.
#[derive(Debug, Default)]
struct Completion {
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
}

/// Event handle returned by every [`HostDevice`] enqueue.
#[derive(Debug, Clone)]
pub struct HostEvent {
    operation: &'static str,
    completion: Arc<Completion>,
}

impl HostEvent {
    fn new(operation: &'static str) -> Self {
        Self {
            operation,
            completion: Arc::new(Completion::default()),
        }
    }

    fn complete(&self, outcome: Outcome) {
        let mut slot = lock(&self.completion.outcome);
        *slot = Some(outcome);
        self.completion.ready.notify_all();
    }

    /// Block until the operation finished.
    fn outcome(&self) -> Outcome {
        let mut slot = lock(&self.completion.outcome);
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            slot = self
                .completion
                .ready
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub fn is_complete(&self) -> bool {
        lock(&self.completion.outcome).is_some()
    }
}

fn other(e: impl std::fmt::Display) -> (DeviceErrorKind, String) {
    (DeviceErrorKind::Other, e.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
/// Lane closures lock `device` before `staging`.
struct BufferStorage {
    usage: BufferUsage,
    device: RwLock<Vec<u8>>,
    staging: Mutex<Vec<u8>>,
}

/// Buffer handle; dropping it releases the allocation.
#[derive(Debug)]
pub struct HostBuffer {
    storage: Arc<BufferStorage>,
    live: Arc<AtomicUsize>,
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Job {
    wait: Vec<HostEvent>,
    work: Box<dyn FnOnce() -> Outcome + Send>,
    done: HostEvent,
}

pub struct HostDevice {
    name: String,
    layout: WorkGroupLayout,
    lanes: Vec<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    pending: Mutex<Vec<HostEvent>>,
    live: Arc<AtomicUsize>,
    total: AtomicUsize,
    allocation_limit: Option<usize>,
    failing_launch: Option<usize>,
    launches: AtomicUsize,
}

impl std::fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDevice")
            .field("name", &self.name)
            .field("layout", &self.layout)
            .field("live", &self.live)
            .finish()
    }
}

impl HostDevice {
    pub fn new(layout: WorkGroupLayout) -> Self {
        Self::named("host-device-0", layout)
    }

    pub fn named(name: impl Into<String>, layout: WorkGroupLayout) -> Self {
        let name = name.into();
        let mut lanes = Vec::with_capacity(Lane::ALL.len());
        let mut workers = Vec::with_capacity(Lane::ALL.len());
        for lane in Lane::ALL {
            let (sender, receiver) = unbounded::<Job>();
            let worker = std::thread::Builder::new()
                .name(format!("{name}-{lane:?}"))
                .spawn(move || {
                    for job in receiver {
                        let outcome = match job.wait.iter().map(HostEvent::outcome).find(|outcome| outcome.is_err()) {
                            Some(Err((kind, detail))) => Err((kind, format!("dependency failed: {detail}"))),
                            _ => (job.work)(),
                        };
                        job.done.complete(outcome);
                    }
                });
            match worker {
                Ok(handle) => workers.push(handle),
                Err(e) => log::error!("Failed to start {lane:?} lane of {name}: {e}"),
            }
            lanes.push(sender);
        }
        debug!("{} started with {} threads per work-group", name, layout.threads());
        Self {
            name,
            layout,
            lanes,
            workers,
            pending: Mutex::new(Vec::new()),
            live: Arc::new(AtomicUsize::new(0)),
            total: AtomicUsize::new(0),
            allocation_limit: None,
            failing_launch: None,
            launches: AtomicUsize::new(0),
        }
    }

    /// Fail allocations once `limit` buffers have been handed out in total.
    pub fn with_allocation_limit(mut self, limit: usize) -> Self {
        self.allocation_limit = Some(limit);
        self
    }

    /// Make the launch for tile row `row` fail with a resource error.
    pub fn fail_launch_of_row(mut self, row: usize) -> Self {
        self.failing_launch = Some(row);
        self
    }

    pub fn layout(&self) -> WorkGroupLayout {
        self.layout
    }

    /// Buffers currently allocated.
    pub fn live_allocations(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Buffers ever allocated.
    pub fn total_allocations(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    fn submit(
        &self,
        lane: Lane,
        operation: &'static str,
        wait: &[HostEvent],
        work: Box<dyn FnOnce() -> Outcome + Send>,
    ) -> Result<HostEvent> {
        let done = HostEvent::new(operation);
        let job = Job {
            wait: wait.to_vec(),
            work,
            done: done.clone(),
        };
        self.lanes[lane.index()].send(job).map_err(|_| {
            MosaicError::device(operation, DeviceErrorKind::DeviceLost, format!("{lane:?} lane of {} is gone", self.name))
        })?;
        lock(&self.pending).push(done.clone());
        Ok(done)
    }

    fn storage(buffer: &HostBuffer) -> Arc<BufferStorage> {
        Arc::clone(&buffer.storage)
    }
}

impl ComputeDevice for HostDevice {
    type Buffer = HostBuffer;
    type Event = HostEvent;

    fn name(&self) -> String {
        self.name.clone()
    }

    fn allocate(&self, usage: BufferUsage, bytes: usize) -> Result<HostBuffer> {
        if let Some(limit) = self.allocation_limit
            && self.total.load(Ordering::SeqCst) >= limit
        {
            return Err(MosaicError::device(
                "allocate",
                DeviceErrorKind::ResourceExhausted,
                format!("{} cannot allocate {} more bytes for {:?}", self.name, bytes, usage),
            ));
        }
        self.total.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(HostBuffer {
            storage: Arc::new(BufferStorage {
                usage,
                device: RwLock::new(vec![0u8; bytes]),
                staging: Mutex::new(vec![0u8; bytes]),
            }),
            live: Arc::clone(&self.live),
        })
    }

    fn write(&self, buffer: &HostBuffer, data: &[u8], wait: &[HostEvent]) -> Result<HostEvent> {
        let storage = Self::storage(buffer);
        {
            let mut staging = lock(&storage.staging);
            if staging.len() != data.len() {
                return Err(MosaicError::device(
                    "write",
                    DeviceErrorKind::InvalidArgument,
                    format!("{} bytes written to a {} byte {:?} buffer", data.len(), staging.len(), storage.usage),
                ));
            }
            staging.copy_from_slice(data);
        }
        self.submit(
            Lane::TransferIn,
            "write",
            wait,
            Box::new(move || {
                let mut device = storage.device.write().map_err(other)?;
                let staging = lock(&storage.staging);
                device.copy_from_slice(&staging);
                Ok(())
            }),
        )
    }

    fn launch(&self, launch: &KernelLaunch<'_, HostBuffer>, wait: &[HostEvent]) -> Result<HostEvent> {
        let row_index = self.launches.fetch_add(1, Ordering::SeqCst);
        let fail = self.failing_launch == Some(row_index);
        let layout = self.layout;
        let (row, corpus, output) = (
            Self::storage(launch.row),
            Self::storage(launch.corpus),
            Self::storage(launch.output),
        );
        let (width, columns, corpus_len) = (launch.width, launch.columns as usize, launch.corpus_len as usize);

        self.submit(
            Lane::Compute,
            "launch",
            wait,
            Box::new(move || {
                if fail {
                    return Err((
                        DeviceErrorKind::ResourceExhausted,
                        format!("out of resources launching row {row_index}"),
                    ));
                }
                let row = row.device.read().map_err(other)?;
                let corpus = corpus.device.read().map_err(other)?;
                let corpus = ReferenceCorpus::new(&corpus, corpus_len).map_err(other)?;
                let mut indices = vec![u32::MAX; columns];
                dispatch_row(layout, &row, width, corpus, &mut indices).map_err(other)?;
                let mut output = output.device.write().map_err(other)?;
                output.copy_from_slice(bytemuck::cast_slice(&indices));
                Ok(())
            }),
        )
    }

    fn read_back(&self, buffer: &HostBuffer, wait: &[HostEvent]) -> Result<HostEvent> {
        let storage = Self::storage(buffer);
        self.submit(
            Lane::TransferOut,
            "read",
            wait,
            Box::new(move || {
                let device = storage.device.read().map_err(other)?;
                lock(&storage.staging).copy_from_slice(&device);
                Ok(())
            }),
        )
    }

    fn wait(&self, events: &[HostEvent]) -> Result<()> {
        for event in events {
            event
                .outcome()
                .map_err(|(kind, detail)| MosaicError::device(event.operation, kind, detail))?;
        }
        Ok(())
    }

    fn download(&self, buffer: &HostBuffer, out: &mut [u32]) -> Result<()> {
        let staging = lock(&buffer.storage.staging);
        if staging.len() != out.len() * size_of::<u32>() {
            return Err(MosaicError::device(
                "download",
                DeviceErrorKind::InvalidArgument,
                format!("{} byte buffer read into {} indices", staging.len(), out.len()),
            ));
        }
        for (slot, bytes) in out.iter_mut().zip(staging.chunks_exact(size_of::<u32>())) {
            *slot = bytemuck::pod_read_unaligned(bytes);
        }
        Ok(())
    }

    fn drain(&self) -> Result<()> {
        let pending: Vec<HostEvent> = std::mem::take(&mut *lock(&self.pending));
        self.launches.store(0, Ordering::SeqCst);
        let mut first_error = None;
        for event in &pending {
            if let Err(e) = self.wait(std::slice::from_ref(event))
                && first_error.is_none()
            {
                first_error = Some(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        let _ = self.drain();
        // closing the channels ends the lane threads
        self.lanes.clear();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::TILE_BYTES;

    fn device() -> HostDevice {
        HostDevice::new(WorkGroupLayout::new(32).unwrap())
    }

    #[test]
    fn write_then_read_back_round_trips() {
        let device = device();
        let buffer = device.allocate(BufferUsage::RowOutput, 8).unwrap();
        let data: Vec<u8> = bytemuck::cast_slice(&[7u32, 42u32]).to_vec();

        let written = device.write(&buffer, &data, &[]).unwrap();
        let read = device.read_back(&buffer, &[written]).unwrap();
        device.wait(&[read.clone()]).unwrap();
        assert!(read.is_complete());

        let mut out = [0u32; 2];
        device.download(&buffer, &mut out).unwrap();
        assert_eq!(out, [7, 42]);
        device.drain().unwrap();
    }

    #[test]
    fn failure_propagates_to_dependants() {
        let device = device();
        let failing = device
            .submit(Lane::Compute, "launch", &[], Box::new(|| Err((DeviceErrorKind::DeviceLost, "boom".to_string()))))
            .unwrap();
        let buffer = device.allocate(BufferUsage::RowOutput, 4).unwrap();
        let read = device.read_back(&buffer, &[failing]).unwrap();
        assert!(device.wait(&[read]).is_err());
        assert!(device.drain().is_err());
        // pending work was consumed by the first drain
        device.drain().unwrap();
    }

    #[test]
    fn launch_overlaps_a_stalled_upload_of_the_next_row() {
        let device = device();
        let corpus = device.allocate(BufferUsage::Corpus, TILE_BYTES).unwrap();
        let rows: Vec<HostBuffer> = (0..2)
            .map(|_| device.allocate(BufferUsage::RowInput, TILE_BYTES).unwrap())
            .collect();
        let output = device.allocate(BufferUsage::RowOutput, 4).unwrap();

        let uploaded_corpus = device.write(&corpus, &[9u8; TILE_BYTES], &[]).unwrap();
        let uploaded_row0 = device.write(&rows[0], &[9u8; TILE_BYTES], &[]).unwrap();

        // hold row 1's device copy so its upload cannot finish
        let stall = rows[1].storage.device.write().unwrap();
        let uploaded_row1 = device.write(&rows[1], &[1u8; TILE_BYTES], &[]).unwrap();

        let launch = KernelLaunch {
            row: &rows[0],
            corpus: &corpus,
            output: &output,
            width: 32,
            columns: 1,
            corpus_len: 1,
        };
        let launched = device.launch(&launch, &[uploaded_corpus, uploaded_row0]).unwrap();
        let read = device.read_back(&output, &[launched.clone()]).unwrap();
        device.wait(&[read]).unwrap();

        assert!(launched.is_complete());
        assert!(!uploaded_row1.is_complete());
        let mut out = [u32::MAX];
        device.download(&output, &mut out).unwrap();
        assert_eq!(out, [0]);

        drop(stall);
        device.wait(&[uploaded_row1]).unwrap();
        device.drain().unwrap();
    }

    #[test]
    fn write_and_read_back_of_one_buffer_do_not_deadlock() {
        let device = device();
        let buffer = device.allocate(BufferUsage::RowOutput, 16).unwrap();
        for round in 0..64u32 {
            let data: Vec<u8> = bytemuck::cast_slice(&[round; 4]).to_vec();
            let written = device.write(&buffer, &data, &[]).unwrap();
            // no dependency: the two lanes race on the same buffer
            let read = device.read_back(&buffer, &[]).unwrap();
            device.wait(&[written, read]).unwrap();
        }
        device.drain().unwrap();
    }

    #[test]
    fn wrong_sized_writes_are_rejected() {
        let device = device();
        let buffer = device.allocate(BufferUsage::RowInput, 4).unwrap();
        assert!(matches!(
            device.write(&buffer, &[0u8; 5], &[]),
            Err(MosaicError::DeviceOperation {
                kind: DeviceErrorKind::InvalidArgument,
                ..
            })
        ));
        drop(buffer);
        assert_eq!(device.live_allocations(), 0);
    }
}
