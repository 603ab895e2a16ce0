//! Static row partitioning.
//!
//! The same rule is applied at every level (nodes, devices within a node, threads
//! within a device): `total / workers` rows each, with the first `total % workers`
//! workers taking one extra row. Workers beyond `total` get an empty range.

use std::ops::Range;

/// Half-open range of tile rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RowRange {
    pub start: usize,
    pub end: usize,
}

impl RowRange {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn iter(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Same range shifted by `base` rows.
    pub fn offset(&self, base: usize) -> Self {
        Self::new(self.start + base, self.end + base)
    }
}

/// Split `[0, total)` into `workers` contiguous ranges.
pub fn partition(total: usize, workers: usize) -> Vec<RowRange> {
    if workers == 0 {
        return Vec::new();
    }
    let base = total / workers;
    let extra = total % workers;
    let mut start = 0;
    (0..workers)
        .map(|worker| {
            let len = base + usize::from(worker < extra);
            let range = RowRange::new(start, start + len);
            start += len;
            range
        })
        .collect()
}

/// Range of worker `worker` without materialising the whole table.
pub fn partition_of(total: usize, workers: usize, worker: usize) -> RowRange {
    debug_assert!(worker < workers);
    let base = total / workers;
    let extra = total % workers;
    let start = worker * base + worker.min(extra);
    RowRange::new(start, start + base + usize::from(worker < extra))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn extra_rows_go_to_the_first_workers() {
        let ranges = partition(10, 4);
        let lens: Vec<usize> = ranges.iter().map(RowRange::len).collect();
        assert_eq!(lens, vec![3, 3, 2, 2]);
        assert_eq!(ranges[0], RowRange::new(0, 3));
        assert_eq!(ranges[3], RowRange::new(8, 10));
    }

    #[test]
    fn surplus_workers_get_empty_ranges() {
        let ranges = partition(2, 5);
        assert_eq!(ranges.len(), 5);
        assert_eq!(ranges[0], RowRange::new(0, 1));
        assert_eq!(ranges[1], RowRange::new(1, 2));
        assert!(ranges[2..].iter().all(RowRange::is_empty));
    }

    #[test]
    fn zero_workers_yield_nothing() {
        assert!(partition(7, 0).is_empty());
    }

    proptest! {
        #[test]
        fn ranges_tile_the_input(total in 0usize..500, workers in 1usize..64) {
            let ranges = partition(total, workers);
            prop_assert_eq!(ranges.len(), workers);
            prop_assert_eq!(ranges[0].start, 0);
            prop_assert_eq!(ranges[workers - 1].end, total);
            for pair in ranges.windows(2) {
                prop_assert_eq!(pair[0].end, pair[1].start);
            }

            let max = ranges.iter().map(RowRange::len).max().unwrap();
            let min = ranges.iter().map(RowRange::len).min().unwrap();
            prop_assert!(max - min <= 1);

            let extra = total % workers;
            for (worker, range) in ranges.iter().enumerate() {
                let expected = total / workers + usize::from(worker < extra);
                prop_assert_eq!(range.len(), expected);
                prop_assert_eq!(*range, partition_of(total, workers, worker));
            }
        }

        #[test]
        fn nested_partitions_cover_each_parent(total in 0usize..300, outer in 1usize..8, inner in 1usize..8) {
            let mut covered = 0;
            for parent in partition(total, outer) {
                let children = partition(parent.len(), inner);
                prop_assert_eq!(children.iter().map(RowRange::len).sum::<usize>(), parent.len());
                for child in children {
                    let absolute = child.offset(parent.start);
                    prop_assert_eq!(absolute.start, covered);
                    covered = absolute.end;
                }
            }
            prop_assert_eq!(covered, total);
        }
    }
}
