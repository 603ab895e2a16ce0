//! Engine configuration.
//!
//! Tile geometry is fixed (see [`crate::image::TILE_DIM`]); everything else that the
//! matching engines used to hard-code lives here and is checked by
//! [`MosaicConfig::validate`] before any work is launched.

use crate::error::{MosaicError, Result};
use crate::kernel::WorkGroupLayout;
use std::path::PathBuf;

/// Number of entries in the reference corpus the engine was built around.
pub const DEFAULT_CORPUS_LEN: usize = 60_000;

/// Threads per work-group for the tile matching kernel.
pub const DEFAULT_WORK_GROUP_SIZE: u32 = 64;

/// Location of the GLSL source for the tile matching kernel.
pub const DEFAULT_KERNEL_PATH: &str = "kernels/tile_match.comp";

/// Images whose tile grid is below this in both dimensions are matched on the CPU.
pub const DEFAULT_CPU_FALLBACK_GRID: usize = 8;

/// How many GPU devices to use for a given image height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuScaling {
    /// Always use every configured device.
    Fixed,
    /// Divide the device count by `divisor` once for every threshold the
    /// image's tile-row count falls below.
    ShrinkForShortImages { divisor: usize, thresholds: [usize; 2] },
}

impl Default for GpuScaling {
    fn default() -> Self {
        GpuScaling::ShrinkForShortImages {
            divisor: 4,
            thresholds: [24, 8],
        }
    }
}

impl GpuScaling {
    /// Device count to use for an image with `tile_rows` rows. Never below one.
    pub fn devices_for(&self, requested: usize, tile_rows: usize) -> usize {
        let scaled = match *self {
            GpuScaling::Fixed => requested,
            GpuScaling::ShrinkForShortImages { divisor, thresholds } => thresholds
                .iter()
                .filter(|&&threshold| tile_rows < threshold)
                .fold(requested, |count, _| count / divisor.max(1)),
        };
        scaled.max(1)
    }
}

#[derive(Debug, Clone)]
pub struct MosaicConfig {
    /// Expected number of entries in the reference corpus.
    pub corpus_len: usize,
    /// Size of the fixed CPU thread pool.
    pub cpu_threads: usize,
    /// Threads per work-group for GPU kernels.
    pub work_group_size: u32,
    /// Number of GPU devices requested.
    pub gpu_devices: usize,
    pub gpu_scaling: GpuScaling,
    /// Grids smaller than this in both dimensions skip the GPU. `None` disables the fallback.
    pub cpu_fallback_grid: Option<usize>,
    pub kernel_path: PathBuf,
}

impl Default for MosaicConfig {
    fn default() -> Self {
        Self {
            corpus_len: DEFAULT_CORPUS_LEN,
            cpu_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            work_group_size: DEFAULT_WORK_GROUP_SIZE,
            gpu_devices: 1,
            gpu_scaling: GpuScaling::default(),
            cpu_fallback_grid: Some(DEFAULT_CPU_FALLBACK_GRID),
            kernel_path: PathBuf::from(DEFAULT_KERNEL_PATH),
        }
    }
}

impl MosaicConfig {
    pub fn with_corpus_len(mut self, corpus_len: usize) -> Self {
        self.corpus_len = corpus_len;
        self
    }

    pub fn with_cpu_threads(mut self, threads: usize) -> Self {
        self.cpu_threads = threads;
        self
    }

    pub fn with_work_group_size(mut self, threads: u32) -> Self {
        self.work_group_size = threads;
        self
    }

    pub fn with_gpu_devices(mut self, devices: usize) -> Self {
        self.gpu_devices = devices;
        self
    }

    pub fn with_gpu_scaling(mut self, scaling: GpuScaling) -> Self {
        self.gpu_scaling = scaling;
        self
    }

    pub fn with_cpu_fallback_grid(mut self, grid: Option<usize>) -> Self {
        self.cpu_fallback_grid = grid;
        self
    }

    pub fn with_kernel_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.kernel_path = path.into();
        self
    }

    /// Check every value before anything is launched.
    pub fn validate(&self) -> Result<WorkGroupLayout> {
        if self.corpus_len == 0 {
            return Err(MosaicError::InvalidConfig("corpus_len must be at least 1".into()));
        }
        if self.corpus_len > u32::MAX as usize {
            return Err(MosaicError::InvalidConfig(format!(
                "corpus_len {} does not fit a 32-bit result index",
                self.corpus_len
            )));
        }
        if self.cpu_threads == 0 {
            return Err(MosaicError::InvalidConfig("cpu_threads must be at least 1".into()));
        }
        if self.gpu_devices == 0 {
            return Err(MosaicError::InvalidConfig("gpu_devices must be at least 1".into()));
        }
        if let GpuScaling::ShrinkForShortImages { divisor: 0, .. } = self.gpu_scaling {
            return Err(MosaicError::InvalidConfig("gpu_scaling divisor must be non-zero".into()));
        }
        WorkGroupLayout::new(self.work_group_size)
    }

    /// Whether a grid of `rows` x `cols` tiles should bypass the GPU.
    pub fn prefers_cpu(&self, rows: usize, cols: usize) -> bool {
        self.cpu_fallback_grid
            .is_some_and(|limit| rows < limit && cols < limit)
    }
}
