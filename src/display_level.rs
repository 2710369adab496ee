//! Preview-level configuration.
//!
//! Each level is a bounding size, an optional "minimum size" that marks
//! the level as cropped, and a thumbnail flavor name. The per-level
//! [`ImageCache`] lives here since a level's cache capacity is part of
//! its configuration.

use crate::types::{Rect, Size};

#[derive(Debug, Clone)]
pub struct DisplayLevelConfig {
    /// Maximum bounding box this level renders into.
    pub size: Size,
    /// If set and different from `size`, this level is cropped: it always
    /// renders exactly at this size rather than substituting for other
    /// levels.
    pub minimum_size: Option<Size>,
    pub thumbnail_flavor: Option<String>,
    pub cache_size: usize,
}

impl DisplayLevelConfig {
    pub fn new(size: Size) -> Self {
        Self { size, minimum_size: None, thumbnail_flavor: None, cache_size: 4 }
    }

    pub fn cropped(mut self, minimum_size: Size) -> Self {
        self.minimum_size = Some(minimum_size);
        self
    }

    pub fn with_thumbnail_flavor(mut self, flavor: impl Into<String>) -> Self {
        self.thumbnail_flavor = Some(flavor.into());
        self
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn is_cropped(&self) -> bool {
        matches!(self.minimum_size, Some(min) if min != self.size)
    }

    /// The bounding rectangle this level should produce for a given
    /// full-image size: scaled-down-to-fit for uncropped levels, a fixed
    /// size for cropped ones.
    pub fn target_size(&self, full_image_size: Size) -> Size {
        if self.is_cropped() {
            self.size
        } else {
            full_image_size.scale_bounding(self.size)
        }
    }

    /// The visible crop area for a cropped level, centered within the full
    /// image. Empty for uncropped levels (no cropping occurs).
    pub fn target_area(&self, full_image_size: Size) -> Rect {
        if !self.is_cropped() {
            return Rect::default();
        }
        let x = (full_image_size.width as i32 - self.size.width as i32) / 2;
        let y = (full_image_size.height as i32 - self.size.height as i32) / 2;
        Rect::new(x.max(0), y.max(0), self.size.width.min(full_image_size.width), self.size.height.min(full_image_size.height))
    }
}

/// The full ordered set of preview levels for a Core instance. Adding a
/// level defaults its size to twice the previous level's.
#[derive(Debug, Clone, Default)]
pub struct DisplayLevelConfigs(pub Vec<DisplayLevelConfig>);

impl DisplayLevelConfigs {
    pub fn push_default(&mut self) {
        let size = match self.0.last() {
            Some(prev) => Size::new(prev.size.width * 2, prev.size.height * 2),
            None => Size::new(128, 128),
        };
        self.0.push(DisplayLevelConfig::new(size));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The last configured level index: the full-image/tile level with no
    /// size bound in practice (an application typically configures its
    /// size generously or relies on tiling).
    pub fn full_level(&self) -> usize {
        self.0.len().saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncropped_level_scales_to_fit() {
        let level = DisplayLevelConfig::new(Size::new(100, 100));
        assert_eq!(level.target_size(Size::new(400, 200)), Size::new(100, 50));
    }

    #[test]
    fn cropped_level_always_renders_fixed_size() {
        let level = DisplayLevelConfig::new(Size::new(100, 100)).cropped(Size::new(50, 50));
        assert!(level.is_cropped());
        assert_eq!(level.target_size(Size::new(1000, 1000)), Size::new(100, 100));
    }

    #[test]
    fn same_minimum_size_is_not_cropped() {
        let level = DisplayLevelConfig::new(Size::new(100, 100)).cropped(Size::new(100, 100));
        assert!(!level.is_cropped());
    }

    #[test]
    fn push_default_doubles_previous_size() {
        let mut levels = DisplayLevelConfigs::default();
        levels.push_default();
        levels.push_default();
        assert_eq!(levels.0[0].size, Size::new(128, 128));
        assert_eq!(levels.0[1].size, Size::new(256, 256));
    }
}
