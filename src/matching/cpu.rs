//! Shared-memory engine: a fixed rayon pool with rows statically sliced across threads.

use crate::error::{MosaicError, Result};
use crate::image::{PixelBuffer, ReferenceCorpus, TILE_BYTES, check_result_len, extract_tile_row};
use crate::matching::engine::TileMatcher;
use crate::matching::metric::best_match;
use crate::matching::partition::{RowRange, partition};
use log::debug;

pub struct CpuMatcher {
    pool: rayon::ThreadPool,
    threads: usize,
}

impl std::fmt::Debug for CpuMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuMatcher")
            .field("threads", &self.threads)
            .finish()
    }
}

impl CpuMatcher {
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(MosaicError::InvalidConfig("cpu thread count must be at least 1".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("mosaic-cpu-{i}"))
            .build()
            .map_err(|e| MosaicError::InvalidConfig(format!("failed to build thread pool: {e}")))?;
        Ok(Self { pool, threads })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Match every tile of `pixels`, writing one corpus index per tile into `out`.
    ///
    /// Each pool thread gets one contiguous block of tile rows and the matching
    /// block of `out`; there is no rebalancing and no locking inside the scan.
    pub fn match_rows(&self, pixels: &PixelBuffer<'_>, corpus: &ReferenceCorpus<'_>, out: &mut [u32]) -> Result<()> {
        let grid = pixels.grid();
        check_result_len(grid, out)?;
        let ranges = partition(grid.rows, self.threads);
        debug!("CPU partition of {} tile rows over {} threads: {:?}", grid.rows, self.threads, ranges);

        let mut rest = out;
        let mut blocks = Vec::with_capacity(ranges.len());
        for range in ranges {
            let (block, tail) = std::mem::take(&mut rest).split_at_mut(range.len() * grid.cols);
            blocks.push((range, block));
            rest = tail;
        }

        self.pool.scope(|scope| {
            for (range, block) in blocks.into_iter().filter(|(range, _)| !range.is_empty()) {
                scope.spawn(move |_| match_range(pixels, corpus, range, block));
            }
        });
        Ok(())
    }
}

impl TileMatcher for CpuMatcher {
    fn name(&self) -> &str {
        "cpu"
    }

    fn match_rows(&self, pixels: &PixelBuffer<'_>, corpus: &ReferenceCorpus<'_>, out: &mut [u32]) -> Result<()> {
        CpuMatcher::match_rows(self, pixels, corpus, out)
    }
}

/// Match tile rows `range`; `out` holds exactly those rows.
fn match_range(pixels: &PixelBuffer<'_>, corpus: &ReferenceCorpus<'_>, range: RowRange, out: &mut [u32]) {
    let cols = pixels.grid().cols;
    let mut scratch = vec![0u8; cols * TILE_BYTES];
    for (row, row_out) in range.iter().zip(out.chunks_exact_mut(cols)) {
        extract_tile_row(pixels, row, &mut scratch);
        for (tile, slot) in scratch.chunks_exact(TILE_BYTES).zip(row_out.iter_mut()) {
            *slot = best_match(tile, corpus).index;
        }
    }
}
