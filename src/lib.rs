//! Vulkan Photomosaic Library
//!
//! Matches every 32×32 tile of an RGB image against a fixed reference corpus and
//! returns, per tile, the index of the corpus entry with the smallest sum of squared
//! differences. The indices are all a caller needs to assemble the mosaic
//! (see [`image::render_mosaic`]).
//!
//! ## Data Layout
//!
//! - **Image**: `width × height × 3` bytes, row-major, interleaved RGB. Both
//!   dimensions are multiples of 32.
//! - **Corpus**: `N × 3 × 32 × 32` bytes, channel-planar per entry
//!   (`entry[(c * 32 + h) * 32 + w]`). Tiles are converted to this layout once
//!   before any comparison.
//! - **Result**: one `u32` corpus index per tile, row-major over the tile grid.
//!
//! ## Engines
//!
//! 1. **CPU** (`matching::CpuMatcher`)
//!    - Fixed rayon pool, tile rows statically partitioned across threads
//!    - Private per-thread row scratch, no locking in the scan
//!
//! 2. **GPU** (`matching::GpuMatcher`)
//!    - One work-group per tile, shared-memory tile staging and a
//!      barrier-synchronised tree reduction of partial sums (`kernel`)
//!    - Per-row write → compute → read pipeline on three queues (`device`)
//!    - Runs on Vulkan with the `vulkan` feature, or on the in-process
//!      `device::HostDevice`
//!
//! 3. **Distributed** (`distributed`)
//!    - Rows split across nodes, then across each node's devices
//!    - Results gathered to rank 0 and reordered by tile position
//!
//! Every partition level uses the same rule: `R / K` rows each, with the first
//! `R mod K` workers taking one extra row. Ties between equally distant corpus
//! entries resolve to the lowest index.

pub mod config;
pub mod device;
pub mod distributed;
pub mod error;
pub mod image;
pub mod kernel;
pub mod matching;
#[cfg(feature = "vulkan")]
pub mod vulkan;

#[cfg(test)]
#[path = "../tests/common/mod.rs"]
mod test_support;

pub use config::{GpuScaling, MosaicConfig};
pub use error::{DeviceErrorKind, MosaicError, Result};
pub use image::{PixelBuffer, ReferenceCorpus, TILE_BYTES, TILE_CHANNELS, TILE_DIM, TileGrid, render_mosaic};
pub use matching::{CorpusMatch, CpuMatcher, GpuMatcher, MosaicEngine, RowRange, TileMatcher, partition};
