//! Core data model: pixel buffers, geometry, and the per-command metadata
//! the undo stack attaches to each filter invocation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::filter::FilterHandle;
use crate::tile_map::TileMap;

/// Integer width/height pair. Used for full-image sizes, level bounding
/// boxes, and tile grid geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Scale `self` down to fit within `bound`, preserving aspect ratio,
    /// never upscaling. Mirrors `QuillUndoCommand::scaleBounding`.
    pub fn scale_bounding(&self, bound: Size) -> Size {
        if self.is_empty() || bound.is_empty() {
            return Size::default();
        }
        let wr = bound.width as f64 / self.width as f64;
        let hr = bound.height as f64 / self.height as f64;
        let ratio = wr.min(hr).min(1.0);
        Size::new(
            ((self.width as f64) * ratio).round().max(1.0) as u32,
            ((self.height as f64) * ratio).round().max(1.0) as u32,
        )
    }
}

/// Integer point in full-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Integer rectangle in full-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        let ax2 = self.x + self.width as i32;
        let ay2 = self.y + self.height as i32;
        let bx2 = other.x + other.width as i32;
        let by2 = other.y + other.height as i32;
        self.x < bx2 && ax2 > other.x && self.y < by2 && ay2 > other.y
    }
}

/// Which z-level an [`Image`] represents: a preview level, the full image,
/// or a tile within the full image at a given command index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZLevel {
    /// A preview/display level index (0 = coarsest).
    Level(u32),
    /// The full, untiled image.
    Full,
    /// A single tile of a tiled full image.
    Tile { level: u32, col: u32, row: u32 },
}

/// An owned pixel buffer tagged with its full-image and tile geometry.
/// Cloning an `Image` is cheap (shares the underlying buffer) because
/// `Image` is treated as immutable after production, using the same
/// `Bytes`-backed buffer convention as a decoded tile.
#[derive(Debug, Clone)]
pub struct Image {
    data: Bytes,
    /// Pixel dimensions of this specific buffer (may be a tile or a
    /// bounded preview, not necessarily `full_image_size`).
    pub size: Size,
    /// Size of the full image this buffer was derived from.
    pub full_image_size: Size,
    /// Non-empty only if this buffer is a tile.
    pub tile_area: Option<Rect>,
    pub z_level: ZLevel,
}

impl Image {
    pub fn new(data: Vec<u8>, size: Size, full_image_size: Size, z_level: ZLevel) -> Self {
        Self {
            data: Bytes::from(data),
            size,
            full_image_size,
            tile_area: None,
            z_level,
        }
    }

    pub fn new_tile(data: Vec<u8>, size: Size, full_image_size: Size, tile_area: Rect, z_level: ZLevel) -> Self {
        Self {
            data: Bytes::from(data),
            size,
            full_image_size,
            tile_area: Some(tile_area),
            z_level,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn is_null(&self) -> bool {
        self.size.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

/// Process-wide monotonic id generator for [`FilterCommand`]s.
static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

fn next_command_id() -> u64 {
    NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed)
}

/// An opaque filter handle bound with parameters, plus the metadata the
/// undo stack assigns to it on placement.
#[derive(Clone)]
pub struct FilterCommand {
    pub unique_id: u64,
    pub filter: Arc<FilterHandle>,
    /// Index this command occupies in the stack (0 = synthetic load).
    pub stack_index: usize,
    pub session_id: Option<u64>,
    pub full_image_size: Option<Size>,
    pub tile_map: Option<Arc<TileMap>>,
}

impl FilterCommand {
    pub fn new(filter: Arc<FilterHandle>, stack_index: usize) -> Self {
        Self {
            unique_id: next_command_id(),
            filter,
            stack_index,
            session_id: None,
            full_image_size: None,
            tile_map: None,
        }
    }

    pub fn belongs_to_session(&self, session_id: Option<u64>) -> bool {
        match session_id {
            Some(id) => self.session_id == Some(id),
            None => self.session_id.is_some(),
        }
    }
}

impl std::fmt::Debug for FilterCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterCommand")
            .field("unique_id", &self.unique_id)
            .field("filter", &self.filter.name)
            .field("stack_index", &self.stack_index)
            .field("session_id", &self.session_id)
            .field("full_image_size", &self.full_image_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_bounding_never_upscales() {
        let small = Size::new(10, 10);
        assert_eq!(small.scale_bounding(Size::new(1000, 1000)), small);
    }

    #[test]
    fn scale_bounding_preserves_aspect() {
        let big = Size::new(200, 100);
        let scaled = big.scale_bounding(Size::new(50, 50));
        assert_eq!(scaled, Size::new(50, 25));
    }

    #[test]
    fn rect_intersects() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, 5, 10, 10);
        let c = Rect::new(20, 20, 5, 5);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn command_ids_are_monotonic() {
        let filter = Arc::new(crate::filter::FilterHandle::test_identity());
        let a = FilterCommand::new(filter.clone(), 0);
        let b = FilterCommand::new(filter, 1);
        assert!(b.unique_id > a.unique_id);
    }
}
