//! Matching engines: the SSD metric, the row partitioner, and the CPU and GPU
//! engines behind the [`TileMatcher`] trait.

pub mod cpu;
pub mod engine;
pub mod gpu;
pub mod metric;
pub mod partition;

pub use cpu::CpuMatcher;
pub use engine::{MosaicEngine, TileMatcher};
pub use gpu::GpuMatcher;
pub use metric::{CorpusMatch, best_match, ssd};
pub use partition::{RowRange, partition, partition_of};
