//! Process-wide tile cache.
//!
//! A `DashMap` keyed by tile id, with a `parking_lot::Mutex`-guarded LRU
//! order list, generalized from a byte-bound to a count-bound cache and
//! extended with a `tileMapId` staleness check: a mismatched id returns
//! absent but the entry is left in place, since a later `TileMap`
//! generation may reuse the same tile grid slot.

use std::collections::VecDeque;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::types::Image;

/// Identifies one grid cell within a `TileMap`: which file-command's tile
/// map, and which row/column within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileId {
    pub file_id: u64,
    pub col: u32,
    pub row: u32,
}

/// Monotonic id stamped on a `TileMap` generation; see `TileMap::id`.
pub type TileMapId = u64;

struct Entry {
    image: Image,
    tile_map_id: TileMapId,
}

/// Bounded, process-wide tile store. Safe to share behind an `Arc` across
/// every open File, mirroring the single global `TileCache` Core owns.
pub struct TileCache {
    entries: DashMap<TileId, Entry>,
    /// Most-recently-used order, front = most recent. Guarded separately
    /// from `entries` since DashMap shards don't give us a global order.
    order: Mutex<VecDeque<TileId>>,
    max_tiles: Mutex<usize>,
}

impl TileCache {
    pub fn new(max_tiles: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            max_tiles: Mutex::new(max_tiles),
        }
    }

    /// Insert or replace a tile, touching it as most-recently-used.
    pub fn put(&self, id: TileId, tile_map_id: TileMapId, image: Image) {
        self.entries.insert(id, Entry { image, tile_map_id });
        self.touch(id);
        self.evict_if_needed();
    }

    /// Look up a tile. Returns `None` if absent, or if present but stamped
    /// with a different `tileMapId` than requested — in which case the
    /// entry is left untouched, not evicted.
    pub fn get(&self, id: TileId, tile_map_id: TileMapId) -> Option<Image> {
        let entry = self.entries.get(&id)?;
        if entry.tile_map_id != tile_map_id {
            return None;
        }
        let image = entry.image.clone();
        drop(entry);
        self.touch(id);
        Some(image)
    }

    /// Change the capacity, evicting immediately if it shrank.
    pub fn resize(&self, n: usize) {
        *self.max_tiles.lock() = n;
        self.evict_if_needed();
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.order.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&self, id: TileId) {
        let mut order = self.order.lock();
        if let Some(pos) = order.iter().position(|existing| *existing == id) {
            order.remove(pos);
        }
        order.push_front(id);
    }

    fn evict_if_needed(&self) {
        let max = *self.max_tiles.lock();
        while self.entries.len() > max {
            let victim = {
                let mut order = self.order.lock();
                order.pop_back()
            };
            match victim {
                Some(id) => {
                    self.entries.remove(&id);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Size, ZLevel};

    fn img() -> Image {
        Image::new(vec![0u8; 4], Size::new(2, 2), Size::new(2, 2), ZLevel::Tile { level: 0, col: 0, row: 0 })
    }

    #[test]
    fn mismatched_tile_map_id_is_absent_not_evicted() {
        let cache = TileCache::new(8);
        let id = TileId { file_id: 1, col: 0, row: 0 };
        cache.put(id, 1, img());
        assert!(cache.get(id, 2).is_none());
        assert_eq!(cache.len(), 1, "stale lookup must not evict the entry");
        assert!(cache.get(id, 1).is_some());
    }

    #[test]
    fn evicts_lru_over_capacity() {
        let cache = TileCache::new(2);
        let a = TileId { file_id: 1, col: 0, row: 0 };
        let b = TileId { file_id: 1, col: 1, row: 0 };
        let c = TileId { file_id: 1, col: 2, row: 0 };
        cache.put(a, 1, img());
        cache.put(b, 1, img());
        cache.get(a, 1);
        cache.put(c, 1, img());
        assert_eq!(cache.len(), 2);
        assert!(cache.get(b, 1).is_none());
        assert!(cache.get(a, 1).is_some());
        assert!(cache.get(c, 1).is_some());
    }

    #[test]
    fn resize_shrinks_immediately() {
        let cache = TileCache::new(4);
        for i in 0..4u32 {
            cache.put(TileId { file_id: 1, col: i, row: 0 }, 1, img());
        }
        cache.resize(1);
        assert_eq!(cache.len(), 1);
    }
}
