//! Deterministic fixtures shared by unit tests, integration tests and benches.
#![allow(dead_code)]

/// Bytes in one 32x32 RGB tile.
const TILE_BYTES: usize = 32 * 32 * 3;

/// Xorshift byte noise; the same seed always yields the same bytes.
pub fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

/// Planar corpus of `entries` noise tiles.
pub fn noise_corpus(entries: usize, seed: u32) -> Vec<u8> {
    noise(entries * TILE_BYTES, seed)
}
