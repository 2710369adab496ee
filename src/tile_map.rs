//! Grid-over-full-image structure driving the tiled render/save path.
//!
//! A fixed grid with a lookup from `(col, row)` to a tile identity, plus a
//! generation id (`TileMapId`) so the cache can detect staleness.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::tile_cache::{TileId, TileMapId};
use crate::types::{Rect, Size};

static NEXT_TILE_MAP_ID: AtomicU64 = AtomicU64::new(1);

fn next_tile_map_id() -> TileMapId {
    NEXT_TILE_MAP_ID.fetch_add(1, Ordering::Relaxed)
}

/// A fixed grid over a full-image size, with a fixed tile size. Cells are
/// addressed `(col, row)`, row-major, left-to-right, top-to-bottom.
#[derive(Debug, Clone)]
pub struct TileMap {
    pub id: TileMapId,
    pub file_id: u64,
    pub full_image_size: Size,
    pub tile_size: Size,
    pub columns: u32,
    pub rows: u32,
}

impl TileMap {
    pub fn new(file_id: u64, full_image_size: Size, tile_size: Size) -> Self {
        let columns = div_ceil(full_image_size.width, tile_size.width);
        let rows = div_ceil(full_image_size.height, tile_size.height);
        Self {
            id: next_tile_map_id(),
            file_id,
            full_image_size,
            tile_size,
            columns,
            rows,
        }
    }

    /// Derive a new generation over the same file/tile-size from a filter
    /// that is spatially local, i.e. the grid geometry is unchanged and
    /// only the cache generation advances so stale tiles stop matching.
    /// Filters that are not spatially local should discard this map
    /// entirely and build a fresh one instead.
    pub fn derive(&self) -> Self {
        Self {
            id: next_tile_map_id(),
            ..self.clone()
        }
    }

    pub fn tile_count(&self) -> u32 {
        self.columns * self.rows
    }

    pub fn tile_id(&self, col: u32, row: u32) -> TileId {
        debug_assert!(col < self.columns && row < self.rows);
        TileId { file_id: self.file_id, col, row }
    }

    /// The full-image-coordinate rectangle a tile covers, clipped to the
    /// full image bounds (edge tiles are typically smaller than
    /// `tile_size`).
    pub fn tile_rect(&self, col: u32, row: u32) -> Rect {
        let x = col * self.tile_size.width;
        let y = row * self.tile_size.height;
        let width = self.tile_size.width.min(self.full_image_size.width.saturating_sub(x));
        let height = self.tile_size.height.min(self.full_image_size.height.saturating_sub(y));
        Rect::new(x as i32, y as i32, width, height)
    }

    pub fn cells(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (0..self.rows).flat_map(move |row| (0..self.columns).map(move |col| (col, row)))
    }

    /// Which tiles intersect an arbitrary full-image-coordinate rectangle,
    /// used by [`crate::save_map::SaveMap`] to compute each output buffer's
    /// required inputs.
    pub fn tiles_intersecting(&self, area: Rect) -> Vec<(u32, u32)> {
        self.cells().filter(|(col, row)| self.tile_rect(*col, *row).intersects(&area)).collect()
    }
}

fn div_ceil(numerator: u32, denominator: u32) -> u32 {
    if denominator == 0 {
        0
    } else {
        (numerator + denominator - 1) / denominator
    }
}
