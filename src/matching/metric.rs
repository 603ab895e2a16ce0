//! Sum-of-squared-differences metric and the exhaustive corpus scan.

use crate::image::ReferenceCorpus;

/// SSD between two planar tiles.
///
/// The largest possible value is `3072 * 255^2 = 199_756_800`, which fits an `i32`
/// but nothing narrower.
#[inline]
pub fn ssd(a: &[u8], b: &[u8]) -> i32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x as i32 - y as i32;
            d * d
        })
        .sum()
}

/// Best corpus entry found for one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorpusMatch {
    pub index: u32,
    pub distance: i32,
}

impl CorpusMatch {
    /// Placeholder every real candidate improves on.
    pub const WORST: CorpusMatch = CorpusMatch {
        index: u32::MAX,
        distance: i32::MAX,
    };

    /// Ordering used everywhere a minimum is tracked: smaller distance wins, and on
    /// equal distance the lower corpus index wins.
    pub fn improves_on(&self, other: &CorpusMatch) -> bool {
        (self.distance, self.index) < (other.distance, other.index)
    }
}

/// Scan the corpus in ascending order; ties keep the lowest index.
pub fn best_match(tile: &[u8], corpus: &ReferenceCorpus<'_>) -> CorpusMatch {
    let mut best = CorpusMatch::WORST;
    for (index, entry) in corpus.iter().enumerate() {
        let candidate = CorpusMatch {
            index: index as u32,
            distance: ssd(tile, entry),
        };
        if candidate.improves_on(&best) {
            best = candidate;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::TILE_BYTES;

    fn tile_of(value: u8) -> Vec<u8> {
        vec![value; TILE_BYTES]
    }

    #[test]
    fn ssd_basic_properties() {
        let a: Vec<u8> = (0..TILE_BYTES).map(|i| (i % 256) as u8).collect();
        let b: Vec<u8> = (0..TILE_BYTES).map(|i| ((i * 31) % 256) as u8).collect();
        assert_eq!(ssd(&a, &a), 0);
        assert_eq!(ssd(&a, &b), ssd(&b, &a));
        assert!(ssd(&a, &b) > 0);
    }

    #[test]
    fn ssd_extreme_fits_in_i32() {
        assert_eq!(ssd(&tile_of(0), &tile_of(255)), 199_756_800);
    }

    #[test]
    fn lowest_index_wins_ties() {
        let tile = tile_of(10);
        let mut bytes = tile_of(200);
        bytes.extend(tile_of(12));
        bytes.extend(tile_of(8));
        bytes.extend(tile_of(12));
        let corpus = ReferenceCorpus::new(&bytes, 4).unwrap();

        let found = best_match(&tile, &corpus);
        assert_eq!(found.index, 1);
        assert_eq!(found.distance, 4 * TILE_BYTES as i32);
    }

    #[test]
    fn lower_index_wins_on_equal_distance() {
        let early = CorpusMatch { index: 3, distance: 5 };
        let late = CorpusMatch { index: 7, distance: 5 };
        let closer = CorpusMatch { index: 9, distance: 2 };
        assert!(early.improves_on(&late));
        assert!(!late.improves_on(&early));
        assert!(!early.improves_on(&early));
        assert!(closer.improves_on(&early));
        assert!(early.improves_on(&CorpusMatch::WORST));
    }
}
