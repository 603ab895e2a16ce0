use thiserror::Error;

/// Broad category of a failed device operation (buffer write, launch, read-back).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    ResourceExhausted,
    InvalidArgument,
    InvalidConfiguration,
    DeviceLost,
    Other,
}

impl std::fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceErrorKind::ResourceExhausted => "resource exhaustion",
            DeviceErrorKind::InvalidArgument => "invalid argument",
            DeviceErrorKind::InvalidConfiguration => "invalid configuration",
            DeviceErrorKind::DeviceLost => "device lost",
            DeviceErrorKind::Other => "device failure",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum MosaicError {
    #[error("Image dimensions {width}x{height} are not non-zero multiples of {tile}")]
    InvalidDimensions { width: u32, height: u32, tile: u32 },

    #[error("Pixel buffer holds {actual} bytes, expected {expected}")]
    PixelBufferSize { expected: usize, actual: usize },

    #[error("Reference corpus holds {actual} bytes, expected {expected} ({entries} entries)")]
    CorpusSize { expected: usize, actual: usize, entries: usize },

    #[error("Result buffer holds {actual} slots, expected {expected}")]
    ResultSize { expected: usize, actual: usize },

    #[error("Invalid work-group size {threads}: {reason}")]
    InvalidWorkGroup { threads: u32, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Kernel build failed for {device}:\n{log}")]
    KernelBuild { device: String, log: String },

    #[error("No compatible compute device found")]
    NoDeviceFound,

    #[error("Device operation '{operation}' failed ({kind}): {detail}")]
    DeviceOperation {
        operation: &'static str,
        kind: DeviceErrorKind,
        detail: String,
    },

    #[error("Task graph error: {0}")]
    TaskGraph(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Rank {rank} aborted the run: {reason}")]
    RankAborted { rank: usize, reason: String },

    #[error("Corpus index {index} out of range for {len} entries")]
    IndexOutOfRange { index: u32, len: usize },

    #[cfg(feature = "vulkan")]
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] ash::vk::Result),

    #[cfg(feature = "vulkan")]
    #[error("GPU allocator error: {0}")]
    GpuAllocatorError(#[from] gpu_allocator::AllocationError),

    #[cfg(feature = "vulkan")]
    #[error("Vulkan entry load error: {0}")]
    VulkanEntryLoadError(String),
}

impl MosaicError {
    pub fn device(operation: &'static str, kind: DeviceErrorKind, detail: impl Into<String>) -> Self {
        MosaicError::DeviceOperation {
            operation,
            kind,
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MosaicError>;
