pub mod render;
pub mod tile;

use crate::error::{MosaicError, Result};
use crate::matching::partition::RowRange;
use image::RgbImage;

/// Edge length of a tile in pixels.
pub const TILE_DIM: usize = 32;
/// Interleaved RGB.
pub const TILE_CHANNELS: usize = 3;
/// Bytes in one tile (and in one corpus entry).
pub const TILE_BYTES: usize = TILE_DIM * TILE_DIM * TILE_CHANNELS;

/// Dimensions of the tile grid covering an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub rows: usize,
    pub cols: usize,
}

impl TileGrid {
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row-major slot of tile `(row, col)` in a result array.
    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.cols + col
    }

    pub fn position(&self, index: usize) -> (usize, usize) {
        (index / self.cols, index % self.cols)
    }
}

/// Borrowed view of an interleaved RGB image whose sides are multiples of [`TILE_DIM`].
#[derive(Debug, Clone, Copy)]
pub struct PixelBuffer<'a> {
    data: &'a [u8],
    width: u32,
    height: u32,
}

impl<'a> PixelBuffer<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32) -> Result<Self> {
        let tile = TILE_DIM as u32;
        if width == 0 || height == 0 || width % tile != 0 || height % tile != 0 {
            return Err(MosaicError::InvalidDimensions { width, height, tile });
        }
        let expected = width as usize * height as usize * TILE_CHANNELS;
        if data.len() != expected {
            return Err(MosaicError::PixelBufferSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { data, width, height })
    }

    pub fn from_rgb_image(image: &'a RgbImage) -> Result<Self> {
        Self::new(image.as_raw(), image.width(), image.height())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn grid(&self) -> TileGrid {
        TileGrid {
            rows: self.height as usize / TILE_DIM,
            cols: self.width as usize / TILE_DIM,
        }
    }

    /// Bytes in one pixel row.
    pub fn stride(&self) -> usize {
        self.width as usize * TILE_CHANNELS
    }

    /// Bytes in one row of tiles (`TILE_DIM` pixel rows).
    pub fn tile_row_bytes(&self) -> usize {
        self.stride() * TILE_DIM
    }

    /// Interleaved bytes of tile row `row`.
    pub fn tile_row(&self, row: usize) -> &'a [u8] {
        let size = self.tile_row_bytes();
        &self.data[row * size..(row + 1) * size]
    }

    /// View over a contiguous range of tile rows. An empty range yields a zero-height view.
    pub fn tile_rows(&self, rows: RowRange) -> PixelBuffer<'a> {
        let size = self.tile_row_bytes();
        PixelBuffer {
            data: &self.data[rows.start * size..rows.end * size],
            width: self.width,
            height: (rows.len() * TILE_DIM) as u32,
        }
    }
}

/// Borrowed, read-only reference corpus in channel-planar layout.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceCorpus<'a> {
    data: &'a [u8],
    len: usize,
}

impl<'a> ReferenceCorpus<'a> {
    /// Wrap `data`, which must hold exactly `expected_len` planar entries.
    pub fn new(data: &'a [u8], expected_len: usize) -> Result<Self> {
        let expected = expected_len * TILE_BYTES;
        if expected_len == 0 || data.len() != expected {
            return Err(MosaicError::CorpusSize {
                expected,
                actual: data.len(),
                entries: expected_len,
            });
        }
        Ok(Self {
            data,
            len: expected_len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn entry(&self, index: usize) -> &'a [u8] {
        &self.data[index * TILE_BYTES..(index + 1) * TILE_BYTES]
    }

    /// Entries in ascending index order.
    pub fn iter(&self) -> std::slice::ChunksExact<'a, u8> {
        self.data.chunks_exact(TILE_BYTES)
    }
}

/// Check that a caller-provided result buffer has one slot per tile.
pub fn check_result_len(grid: TileGrid, out: &[u32]) -> Result<()> {
    if out.len() != grid.len() {
        return Err(MosaicError::ResultSize {
            expected: grid.len(),
            actual: out.len(),
        });
    }
    Ok(())
}

pub use render::render_mosaic;
pub use tile::{extract_tile_row, interleaved_to_planar, planar_tile_at};
