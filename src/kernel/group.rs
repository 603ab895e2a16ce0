//! Host execution of a work-group: one OS thread per item, a shared barrier, and
//! scratch arrays standing in for on-chip shared memory.

use super::WorkGroupLayout;
use crate::image::TILE_BYTES;
use std::sync::Barrier;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

/// Group-wide barrier. Every item must reach the same sequence of `wait` calls.
#[derive(Debug)]
pub struct GroupBarrier {
    inner: Barrier,
}

impl GroupBarrier {
    pub fn new(threads: u32) -> Self {
        Self {
            inner: Barrier::new(threads as usize),
        }
    }

    /// Block until every item of the group arrives. Writes made by any item before
    /// the barrier are visible to every item after it.
    pub fn wait(&self) {
        self.inner.wait();
    }
}

/// Scratch memory shared by the items of one group.
///
/// Items write disjoint elements; reading another item's element is only valid
/// after a [`GroupBarrier::wait`] that follows the write.
#[derive(Debug)]
pub struct SharedScratch {
    /// Tile bytes as loaded (interleaved).
    pub staged: Vec<AtomicU8>,
    /// Tile bytes after the planar transform.
    pub tile: Vec<AtomicU8>,
    /// Current corpus entry.
    pub reference: Vec<AtomicU8>,
    /// One partial sum per item; slot 0 ends up holding the reduced total.
    pub slots: Vec<AtomicI32>,
}

impl SharedScratch {
    pub fn new(layout: WorkGroupLayout) -> Self {
        let bytes = || -> Vec<AtomicU8> { (0..TILE_BYTES).map(|_| AtomicU8::new(0)).collect() };
        Self {
            staged: bytes(),
            tile: bytes(),
            reference: bytes(),
            slots: (0..layout.threads()).map(|_| AtomicI32::new(0)).collect(),
        }
    }
}

// Ordering across items comes from the barrier, so plain relaxed accesses suffice.
#[inline]
pub(crate) fn load_u8(cell: &AtomicU8) -> u8 {
    cell.load(Ordering::Relaxed)
}

#[inline]
pub(crate) fn store_u8(cell: &AtomicU8, value: u8) {
    cell.store(value, Ordering::Relaxed);
}

#[inline]
pub(crate) fn load_i32(cell: &AtomicI32) -> i32 {
    cell.load(Ordering::Relaxed)
}

#[inline]
pub(crate) fn store_i32(cell: &AtomicI32, value: i32) {
    cell.store(value, Ordering::Relaxed);
}

/// One item of a running group.
#[derive(Debug, Clone, Copy)]
pub struct WorkItem<'g> {
    pub local_id: usize,
    pub layout: WorkGroupLayout,
    pub shared: &'g SharedScratch,
    pub barrier: &'g GroupBarrier,
}

impl WorkItem<'_> {
    pub fn is_leader(&self) -> bool {
        self.local_id == 0
    }
}

/// Run `body` once per item of a fresh group and return what item 0 returned.
///
/// The group has its own scratch and barrier; nothing is shared between groups.
pub fn dispatch_group<F, T>(layout: WorkGroupLayout, body: F) -> Option<T>
where
    F: Fn(WorkItem<'_>) -> Option<T> + Sync,
    T: Send,
{
    let shared = SharedScratch::new(layout);
    let barrier = GroupBarrier::new(layout.threads());
    let body = &body;

    let results: Vec<Option<T>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..layout.threads() as usize)
            .map(|local_id| {
                let item = WorkItem {
                    local_id,
                    layout,
                    shared: &shared,
                    barrier: &barrier,
                };
                scope.spawn(move || body(item))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    });

    results.into_iter().next().flatten()
}
