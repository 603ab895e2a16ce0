//! Tile layout transforms.
//!
//! Images arrive interleaved (`RGBRGB...` per pixel row) while corpus entries are
//! channel-planar (`[c][h][w]`). Every tile is converted exactly once, before any
//! corpus comparison, so the inner scan compares two planar buffers directly.

use super::{PixelBuffer, TILE_BYTES, TILE_CHANNELS, TILE_DIM};

/// Convert one contiguous interleaved tile (`[h][w][c]`) into planar layout (`[c][h][w]`).
pub fn interleaved_to_planar(src: &[u8], dst: &mut [u8]) {
    debug_assert_eq!(src.len(), TILE_BYTES);
    debug_assert_eq!(dst.len(), TILE_BYTES);
    for (pixel, rgb) in src.chunks_exact(TILE_CHANNELS).enumerate() {
        for (c, &value) in rgb.iter().enumerate() {
            dst[c * TILE_DIM * TILE_DIM + pixel] = value;
        }
    }
}

/// Inverse of [`interleaved_to_planar`].
pub fn planar_to_interleaved(src: &[u8], dst: &mut [u8]) {
    debug_assert_eq!(src.len(), TILE_BYTES);
    debug_assert_eq!(dst.len(), TILE_BYTES);
    for (pixel, rgb) in dst.chunks_exact_mut(TILE_CHANNELS).enumerate() {
        for (c, value) in rgb.iter_mut().enumerate() {
            *value = src[c * TILE_DIM * TILE_DIM + pixel];
        }
    }
}

/// Gather every tile of tile row `row` into `scratch`, planar, laid out by column.
///
/// `scratch` must hold `cols * TILE_BYTES` bytes; tile `col` ends up at
/// `scratch[col * TILE_BYTES..(col + 1) * TILE_BYTES]`.
pub fn extract_tile_row(pixels: &PixelBuffer<'_>, row: usize, scratch: &mut [u8]) {
    let cols = pixels.grid().cols;
    let stride = pixels.stride();
    debug_assert_eq!(scratch.len(), cols * TILE_BYTES);

    let source = pixels.tile_row(row);
    for (h, line) in source.chunks_exact(stride).enumerate() {
        for (col, tile) in scratch.chunks_exact_mut(TILE_BYTES).enumerate() {
            let span = &line[col * TILE_DIM * TILE_CHANNELS..(col + 1) * TILE_DIM * TILE_CHANNELS];
            for (w, rgb) in span.chunks_exact(TILE_CHANNELS).enumerate() {
                for (c, &value) in rgb.iter().enumerate() {
                    tile[(c * TILE_DIM + h) * TILE_DIM + w] = value;
                }
            }
        }
    }
}

/// Planar copy of the single tile at `(row, col)`.
pub fn planar_tile_at(pixels: &PixelBuffer<'_>, row: usize, col: usize) -> Vec<u8> {
    let stride = pixels.stride();
    let source = pixels.tile_row(row);
    let mut tile = vec![0u8; TILE_BYTES];
    for (h, line) in source.chunks_exact(stride).enumerate() {
        let span = &line[col * TILE_DIM * TILE_CHANNELS..(col + 1) * TILE_DIM * TILE_CHANNELS];
        for (w, rgb) in span.chunks_exact(TILE_CHANNELS).enumerate() {
            for (c, &value) in rgb.iter().enumerate() {
                tile[(c * TILE_DIM + h) * TILE_DIM + w] = value;
            }
        }
    }
    tile
}
