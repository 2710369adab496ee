//! Tiled save pipeline bookkeeping.
//!
//! A save buffer is a contiguous slice of the encoded output; it needs a
//! set of input tiles (from the current command's `TileMap`) before it can
//! be handed to the save filter. `SaveMap` tracks, across the whole save,
//! which buffer the Scheduler should advance next.

use std::collections::HashSet;

use crate::tile_cache::TileId;
use crate::tile_map::TileMap;
use crate::types::Size;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    NeedsInput,
    ReadyToEncode,
    Flushed,
}

#[derive(Debug)]
pub struct SaveBuffer {
    pub index: usize,
    pub state: BufferState,
    required_tiles: Vec<TileId>,
    satisfied: HashSet<TileId>,
}

impl SaveBuffer {
    fn new(index: usize, required_tiles: Vec<TileId>) -> Self {
        let state = if required_tiles.is_empty() {
            BufferState::ReadyToEncode
        } else {
            BufferState::NeedsInput
        };
        Self { index, state, required_tiles, satisfied: HashSet::new() }
    }

    /// Tiles this buffer still needs, in map order, excluding ones already
    /// satisfied.
    pub fn missing_tiles(&self) -> Vec<TileId> {
        self.required_tiles.iter().filter(|t| !self.satisfied.contains(t)).copied().collect()
    }

    /// Every tile this buffer draws input from, in map order, regardless of
    /// whether it has been satisfied yet.
    pub fn required_tiles(&self) -> &[TileId] {
        &self.required_tiles
    }

    fn mark_satisfied(&mut self, tile: TileId) {
        if self.required_tiles.contains(&tile) {
            self.satisfied.insert(tile);
            if self.missing_tiles().is_empty() {
                self.state = BufferState::ReadyToEncode;
            }
        }
    }
}

/// Default save-buffer budget: 64 KiB times 16 buffers in flight.
pub const DEFAULT_SAVE_BUFFER_BYTES: usize = 64 * 1024;
pub const DEFAULT_SAVE_BUFFER_COUNT: usize = 16;

/// Drives one tiled save end to end: an ordered list of buffers, each
/// needing a subset of the current command's tiles.
pub struct SaveMap {
    pub tile_map: TileMap,
    buffers: Vec<SaveBuffer>,
}

impl SaveMap {
    /// Partition the full image into `buffer_count` horizontal strips (the
    /// save filter's natural scan order) and compute each strip's required
    /// input tiles from `tile_map`.
    pub fn new(tile_map: TileMap, buffer_count: usize) -> Self {
        let buffer_count = buffer_count.max(1);
        let full = tile_map.full_image_size;
        let strip_height = div_ceil(full.height, buffer_count as u32).max(1);
        let mut buffers = Vec::with_capacity(buffer_count);
        for index in 0..buffer_count {
            let y = index as u32 * strip_height;
            if y >= full.height {
                break;
            }
            let height = strip_height.min(full.height - y);
            let area = crate::types::Rect::new(0, y as i32, full.width, height);
            let tiles: Vec<TileId> = tile_map
                .tiles_intersecting(area)
                .into_iter()
                .map(|(col, row)| tile_map.tile_id(col, row))
                .collect();
            buffers.push(SaveBuffer::new(index, tiles));
        }
        Self { tile_map, buffers }
    }

    /// Build a save map for a non-tiled save: a single buffer needing no
    /// tile inputs, because the whole image is handed to the encoder at
    /// once (the single-command save path).
    pub fn single_buffer(tile_map: TileMap) -> Self {
        Self { tile_map, buffers: vec![SaveBuffer::new(0, Vec::new())] }
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer(&self, index: usize) -> Option<&SaveBuffer> {
        self.buffers.get(index)
    }

    /// The lowest-numbered buffer that is not yet flushed; this is the
    /// buffer the Scheduler advances next.
    pub fn next_unflushed(&self) -> Option<&SaveBuffer> {
        self.buffers.iter().find(|b| b.state != BufferState::Flushed)
    }

    pub fn mark_tile_satisfied(&mut self, index: usize, tile: TileId) {
        if let Some(buffer) = self.buffers.get_mut(index) {
            buffer.mark_satisfied(tile);
        }
    }

    pub fn mark_flushed(&mut self, index: usize) {
        if let Some(buffer) = self.buffers.get_mut(index) {
            buffer.state = BufferState::Flushed;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.buffers.iter().all(|b| b.state == BufferState::Flushed)
    }
}

fn div_ceil(numerator: u32, denominator: u32) -> u32 {
    if denominator == 0 {
        0
    } else {
        (numerator + denominator - 1) / denominator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> TileMap {
        TileMap::new(1, Size::new(256, 256), Size::new(128, 128))
    }

    #[test]
    fn single_buffer_needs_no_input() {
        let save = SaveMap::single_buffer(map());
        assert_eq!(save.buffer(0).unwrap().state, BufferState::ReadyToEncode);
    }

    #[test]
    fn tiled_save_buffers_become_ready_once_all_tiles_satisfied() {
        let mut save = SaveMap::new(map(), 2);
        assert_eq!(save.buffer_count(), 2);
        let missing = save.buffer(0).unwrap().missing_tiles();
        assert!(!missing.is_empty());
        for tile in missing {
            save.mark_tile_satisfied(0, tile);
        }
        assert_eq!(save.buffer(0).unwrap().state, BufferState::ReadyToEncode);
    }

    #[test]
    fn next_unflushed_advances_in_order() {
        let mut save = SaveMap::new(map(), 2);
        for tile in save.buffer(0).unwrap().missing_tiles() {
            save.mark_tile_satisfied(0, tile);
        }
        assert_eq!(save.next_unflushed().unwrap().index, 0);
        save.mark_flushed(0);
        assert_eq!(save.next_unflushed().unwrap().index, 1);
    }

    #[test]
    fn is_complete_once_all_buffers_flushed() {
        let mut save = SaveMap::single_buffer(map());
        assert!(!save.is_complete());
        save.mark_flushed(0);
        assert!(save.is_complete());
    }
}
