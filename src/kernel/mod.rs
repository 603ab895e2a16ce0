//! Cooperative tile matching kernel.
//!
//! One work-group of `threads` items handles one tile column: the items load and
//! transform the tile into on-chip scratch, then scan the corpus together, each item
//! summing squared differences over its own slice and a barrier-synchronised tree
//! reduction producing the total. [`group`] supplies the execution primitives
//! (barrier, shared scratch, work items) and [`tile_match`] the phases themselves.
//! `kernels/tile_match.comp` is the GLSL rendition of the same phases.

pub mod group;
pub mod tile_match;

use crate::error::{MosaicError, Result};
use crate::image::{TILE_BYTES, TILE_DIM};

pub use group::{GroupBarrier, SharedScratch, WorkItem, dispatch_group};
pub use tile_match::{TileMatchKernel, dispatch_row};

/// Validated thread layout of one work-group.
///
/// Items are laid out `threads_per_row` to a pixel row of the tile, each owning
/// `pixels_per_thread` consecutive pixels during load/transform and
/// `bytes_per_thread` consecutive planar bytes during accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkGroupLayout {
    threads: u32,
}

impl WorkGroupLayout {
    pub fn new(threads: u32) -> Result<Self> {
        let invalid = |reason: &str| MosaicError::InvalidWorkGroup {
            threads,
            reason: reason.to_string(),
        };
        let t = threads as usize;
        if t == 0 {
            return Err(invalid("must be non-zero"));
        }
        if !t.is_power_of_two() {
            return Err(invalid("tree reduction needs a power of two"));
        }
        if t % TILE_DIM != 0 {
            return Err(invalid("must be a multiple of the tile height so every pixel row gets whole threads"));
        }
        if TILE_DIM % (t / TILE_DIM) != 0 {
            return Err(invalid("threads per pixel row must evenly divide the tile width"));
        }
        if TILE_BYTES % t != 0 {
            return Err(invalid("must evenly divide the tile element count"));
        }
        Ok(Self { threads })
    }

    pub fn threads(&self) -> u32 {
        self.threads
    }

    pub fn threads_per_row(&self) -> usize {
        self.threads as usize / TILE_DIM
    }

    pub fn pixels_per_thread(&self) -> usize {
        TILE_DIM / self.threads_per_row()
    }

    pub fn bytes_per_thread(&self) -> usize {
        TILE_BYTES / self.threads as usize
    }

    /// Pixel row of the tile that item `local_id` loads and transforms.
    pub fn pixel_row(&self, local_id: usize) -> usize {
        local_id / self.threads_per_row()
    }

    /// First pixel (column within the tile) owned by item `local_id`.
    pub fn first_pixel(&self, local_id: usize) -> usize {
        (local_id % self.threads_per_row()) * self.pixels_per_thread()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_power_of_two_layouts() {
        for threads in [32, 64, 128, 256, 512, 1024] {
            let layout = WorkGroupLayout::new(threads).unwrap();
            assert_eq!(layout.threads_per_row() * layout.pixels_per_thread(), TILE_DIM);
            assert_eq!(layout.bytes_per_thread() * threads as usize, TILE_BYTES);
        }
    }

    #[test]
    fn rejects_layouts_that_do_not_divide_the_tile() {
        for threads in [0, 16, 48, 96, 2048] {
            assert!(
                matches!(WorkGroupLayout::new(threads), Err(MosaicError::InvalidWorkGroup { .. })),
                "{threads} should be rejected"
            );
        }
    }

    #[test]
    fn items_cover_every_pixel_once() {
        let layout = WorkGroupLayout::new(128).unwrap();
        let mut seen = vec![0u8; TILE_DIM * TILE_DIM];
        for id in 0..128 {
            let h = layout.pixel_row(id);
            let w0 = layout.first_pixel(id);
            for w in w0..w0 + layout.pixels_per_thread() {
                seen[h * TILE_DIM + w] += 1;
            }
        }
        assert!(seen.iter().all(|&n| n == 1));
    }
}
