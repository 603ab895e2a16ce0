//! Phases of the tile matching kernel.
//!
//! Barrier discipline per group:
//! - none between `load` and `transform` (an item transforms exactly the pixels it loaded);
//! - one after `transform`, before anyone reads the planar tile;
//! - per corpus entry, one after `accumulate` and one closing each reduction round.
//!
//! The running minimum is private to item 0, so nothing after the reduction needs a barrier.

use super::WorkGroupLayout;
use super::group::{WorkItem, dispatch_group, load_i32, load_u8, store_i32, store_u8};
use crate::error::{DeviceErrorKind, MosaicError, Result};
use crate::image::{ReferenceCorpus, TILE_CHANNELS, TILE_DIM};
use crate::matching::metric::CorpusMatch;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};

/// Kernel bound to one interleaved tile row and the corpus.
#[derive(Debug, Clone, Copy)]
pub struct TileMatchKernel<'a> {
    row: &'a [u8],
    stride: usize,
    corpus: ReferenceCorpus<'a>,
}

impl<'a> TileMatchKernel<'a> {
    /// `row` holds `TILE_DIM` pixel rows of an image `width` pixels wide.
    pub fn new(row: &'a [u8], width: u32, corpus: ReferenceCorpus<'a>) -> Self {
        let stride = width as usize * TILE_CHANNELS;
        debug_assert_eq!(row.len(), stride * TILE_DIM);
        Self { row, stride, corpus }
    }

    pub fn columns(&self) -> usize {
        self.stride / (TILE_DIM * TILE_CHANNELS)
    }

    /// Copy this item's pixels of tile `col` into `staged`, still interleaved.
    pub fn load(&self, item: &WorkItem<'_>, col: usize) {
        let (h, pixels) = Self::own_pixels(item);
        let count = pixels.len() * TILE_CHANNELS;
        let src = h * self.stride + (col * TILE_DIM + pixels.start) * TILE_CHANNELS;
        let dst = (h * TILE_DIM + pixels.start) * TILE_CHANNELS;
        for (cell, &value) in item.shared.staged[dst..dst + count]
            .iter()
            .zip(&self.row[src..src + count])
        {
            store_u8(cell, value);
        }
    }

    /// Rewrite this item's pixels into planar order in `tile`.
    pub fn transform(&self, item: &WorkItem<'_>) {
        let (h, pixels) = Self::own_pixels(item);
        let shared = item.shared;
        for w in pixels {
            for c in 0..TILE_CHANNELS {
                let value = load_u8(&shared.staged[(h * TILE_DIM + w) * TILE_CHANNELS + c]);
                store_u8(&shared.tile[(c * TILE_DIM + h) * TILE_DIM + w], value);
            }
        }
    }

    /// Copy this item's slice of corpus entry `entry` into `reference`.
    pub fn load_reference(&self, item: &WorkItem<'_>, entry: usize) {
        let span = Self::own_bytes(item);
        let source = &self.corpus.entry(entry)[span.clone()];
        for (cell, &value) in item.shared.reference[span].iter().zip(source) {
            store_u8(cell, value);
        }
    }

    /// Sum of squared differences over this item's slice, stored in its slot.
    pub fn accumulate(&self, item: &WorkItem<'_>) {
        let shared = item.shared;
        let sum: i32 = Self::own_bytes(item)
            .map(|k| {
                let d = load_u8(&shared.tile[k]) as i32 - load_u8(&shared.reference[k]) as i32;
                d * d
            })
            .sum();
        store_i32(&shared.slots[item.local_id], sum);
    }

    /// Binary tree reduction of the slots into slot 0; halves the active count each round.
    pub fn reduce(&self, item: &WorkItem<'_>) {
        let slots = &item.shared.slots;
        let mut active = item.layout.threads() as usize / 2;
        while active > 0 {
            if item.local_id < active {
                let sum = load_i32(&slots[item.local_id]) + load_i32(&slots[item.local_id + active]);
                store_i32(&slots[item.local_id], sum);
            }
            item.barrier.wait();
            active /= 2;
        }
    }

    /// Item 0 folds the reduced total for `entry` into the running minimum.
    pub fn update_minimum(&self, item: &WorkItem<'_>, entry: usize, best: &mut CorpusMatch) {
        if !item.is_leader() {
            return;
        }
        let candidate = CorpusMatch {
            index: entry as u32,
            distance: load_i32(&item.shared.slots[0]),
        };
        if candidate.improves_on(best) {
            *best = candidate;
        }
    }

    /// Item 0 publishes the result for tile `col`.
    pub fn write(&self, item: &WorkItem<'_>, best: &CorpusMatch, out: &[AtomicU32], col: usize) {
        if item.is_leader() {
            out[col].store(best.index, Ordering::Relaxed);
        }
    }

    /// Full kernel body for one item of the group handling tile `col`.
    pub fn run(&self, item: WorkItem<'_>, col: usize, out: &[AtomicU32]) -> Option<CorpusMatch> {
        self.load(&item, col);
        self.transform(&item);
        item.barrier.wait();

        let mut best = CorpusMatch::WORST;
        for entry in 0..self.corpus.len() {
            self.load_reference(&item, entry);
            self.accumulate(&item);
            item.barrier.wait();
            self.reduce(&item);
            self.update_minimum(&item, entry, &mut best);
        }

        self.write(&item, &best, out, col);
        item.is_leader().then_some(best)
    }

    fn own_pixels(item: &WorkItem<'_>) -> (usize, Range<usize>) {
        let layout: WorkGroupLayout = item.layout;
        let start = layout.first_pixel(item.local_id);
        (
            layout.pixel_row(item.local_id),
            start..start + layout.pixels_per_thread(),
        )
    }

    fn own_bytes(item: &WorkItem<'_>) -> Range<usize> {
        let per_item = item.layout.bytes_per_thread();
        item.local_id * per_item..(item.local_id + 1) * per_item
    }
}

/// Launch one group per tile column of `row` and write each column's corpus index into `out`.
pub fn dispatch_row(
    layout: WorkGroupLayout,
    row: &[u8],
    width: u32,
    corpus: ReferenceCorpus<'_>,
    out: &mut [u32],
) -> Result<()> {
    let kernel = TileMatchKernel::new(row, width, corpus);
    let cols = kernel.columns();
    if out.len() != cols {
        return Err(MosaicError::device(
            "launch",
            DeviceErrorKind::InvalidArgument,
            format!("output row has {} slots for {} tile columns", out.len(), cols),
        ));
    }

    let slots: Vec<AtomicU32> = (0..cols).map(|_| AtomicU32::new(u32::MAX)).collect();
    for col in 0..cols {
        dispatch_group(layout, |item| kernel.run(item, col, &slots)).ok_or_else(|| {
            MosaicError::device(
                "launch",
                DeviceErrorKind::Other,
                format!("work-group for tile column {col} returned no result"),
            )
        })?;
    }

    for (slot, cell) in out.iter_mut().zip(&slots) {
        *slot = cell.load(Ordering::Relaxed);
    }
    Ok(())
}
