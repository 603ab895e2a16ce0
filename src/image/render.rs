use super::tile::planar_to_interleaved;
use super::{ReferenceCorpus, TileGrid, TILE_BYTES, TILE_CHANNELS, TILE_DIM, check_result_len};
use crate::error::{MosaicError, Result};
use image::RgbImage;
use log::debug;

/// Build the mosaic image: tile `(row, col)` is replaced by corpus entry `indices[row * cols + col]`.
pub fn render_mosaic(corpus: &ReferenceCorpus<'_>, grid: TileGrid, indices: &[u32]) -> Result<RgbImage> {
    check_result_len(grid, indices)?;
    let width = grid.cols * TILE_DIM;
    let height = grid.rows * TILE_DIM;
    let stride = width * TILE_CHANNELS;
    let mut data = vec![0u8; stride * height];
    let mut tile = vec![0u8; TILE_BYTES];

    for (slot, &index) in indices.iter().enumerate() {
        if index as usize >= corpus.len() {
            return Err(MosaicError::IndexOutOfRange {
                index,
                len: corpus.len(),
            });
        }
        planar_to_interleaved(corpus.entry(index as usize), &mut tile);

        let (row, col) = grid.position(slot);
        let span = TILE_DIM * TILE_CHANNELS;
        for (h, line) in tile.chunks_exact(span).enumerate() {
            let offset = (row * TILE_DIM + h) * stride + col * span;
            data[offset..offset + span].copy_from_slice(line);
        }
    }

    debug!("Rendered {}x{} mosaic from {} tiles", width, height, indices.len());
    RgbImage::from_raw(width as u32, height as u32, data)
        .ok_or_else(|| MosaicError::InvalidConfig("mosaic buffer does not match its dimensions".into()))
}
