//! Engine-wide configuration.
//!
//! All knobs here are frozen once the first File is opened: every setter
//! guards on whether any file is already registered and silently no-ops
//! otherwise. `EngineConfig::freeze`/`is_frozen` model that guard
//! explicitly rather than relying on a hidden file registry, so this
//! module has no dependency on `engine.rs`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::display_level::DisplayLevelConfigs;
use crate::value::Color;
use crate::types::Size;

/// Save-buffer budget: `bytes` per buffer, `count` buffers held in flight
/// at once. Default: 64 KiB × 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveBufferSize {
    pub bytes: usize,
    pub count: usize,
}

impl Default for SaveBufferSize {
    fn default() -> Self {
        Self {
            bytes: crate::save_map::DEFAULT_SAVE_BUFFER_BYTES,
            count: crate::save_map::DEFAULT_SAVE_BUFFER_COUNT,
        }
    }
}

/// A snapshot of the configured size/pixel-count limits, threaded into
/// [`crate::undo_stack::UndoStack::add`] so a command whose result would
/// exceed them is rejected distinctly from one whose result is merely
/// empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageSizeLimit {
    pub max_size: Option<Size>,
    pub max_pixels: Option<u64>,
}

impl ImageSizeLimit {
    pub fn allows(&self, size: Size) -> bool {
        if let Some(limit) = self.max_size {
            if size.width > limit.width || size.height > limit.height {
                return false;
            }
        }
        if let Some(limit) = self.max_pixels {
            if size.area() > limit {
                return false;
            }
        }
        true
    }
}

pub struct EngineConfig {
    frozen: AtomicBool,
    levels: DisplayLevelConfigs,
    thumbnail_extension: String,
    thumbnail_base_path: Option<PathBuf>,
    edit_history_path: Option<PathBuf>,
    crash_dump_path: Option<PathBuf>,
    temporary_file_path: PathBuf,
    image_size_limit: Option<Size>,
    image_pixels_limit: Option<u64>,
    non_tiled_image_pixels_limit: Option<u64>,
    default_tile_size: Option<Size>,
    tile_cache_size: usize,
    save_buffer_size: SaveBufferSize,
    background_rendering_color: Color,
    vector_graphics_rendering_size: Option<Size>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut levels = DisplayLevelConfigs::default();
        levels.push_default();
        levels.push_default();
        Self {
            frozen: AtomicBool::new(false),
            levels,
            thumbnail_extension: "png".to_string(),
            thumbnail_base_path: None,
            edit_history_path: None,
            crash_dump_path: None,
            temporary_file_path: std::env::temp_dir(),
            image_size_limit: None,
            image_pixels_limit: None,
            non_tiled_image_pixels_limit: None,
            default_tile_size: None,
            tile_cache_size: 100,
            save_buffer_size: SaveBufferSize::default(),
            background_rendering_color: Color::WHITE,
            vector_graphics_rendering_size: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Called by `Engine` the moment the first File is created. Idempotent.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn levels(&self) -> &DisplayLevelConfigs {
        &self.levels
    }

    pub fn tile_cache_size(&self) -> usize {
        self.tile_cache_size
    }

    pub fn default_tile_size(&self) -> Option<Size> {
        self.default_tile_size
    }

    pub fn save_buffer_size(&self) -> SaveBufferSize {
        self.save_buffer_size
    }

    pub fn thumbnail_extension(&self) -> &str {
        &self.thumbnail_extension
    }

    pub fn thumbnail_base_path(&self) -> Option<&PathBuf> {
        self.thumbnail_base_path.as_ref()
    }

    pub fn edit_history_path(&self) -> Option<&PathBuf> {
        self.edit_history_path.as_ref()
    }

    pub fn crash_dump_path(&self) -> Option<&PathBuf> {
        self.crash_dump_path.as_ref()
    }

    pub fn temporary_file_path(&self) -> &PathBuf {
        &self.temporary_file_path
    }

    pub fn image_size_limit(&self) -> Option<Size> {
        self.image_size_limit
    }

    pub fn image_pixels_limit(&self) -> Option<u64> {
        self.image_pixels_limit
    }

    pub fn non_tiled_image_pixels_limit(&self) -> Option<u64> {
        self.non_tiled_image_pixels_limit
    }

    pub fn background_rendering_color(&self) -> Color {
        self.background_rendering_color
    }

    pub fn vector_graphics_rendering_size(&self) -> Option<Size> {
        self.vector_graphics_rendering_size
    }

    /// The effective size/pixel-count limit for a newly computed image:
    /// `imageSizeLimit`/`imagePixelsLimit` always apply, tightened further
    /// by `nonTiledImagePixelsLimit` when tiling is disabled, since the
    /// whole image then has to live in memory at once rather than being
    /// processed tile by tile.
    pub fn effective_image_size_limit(&self) -> ImageSizeLimit {
        let mut limit = ImageSizeLimit { max_size: self.image_size_limit, max_pixels: self.image_pixels_limit };
        if self.default_tile_size.is_none() {
            if let Some(non_tiled) = self.non_tiled_image_pixels_limit {
                limit.max_pixels = Some(match limit.max_pixels {
                    Some(existing) => existing.min(non_tiled),
                    None => non_tiled,
                });
            }
        }
        limit
    }

    // Setters below are silent no-ops once the config is frozen (see
    // DESIGN.md for why this mirrors a `setPreviewLevelCount`
    // once-files-exist guard rather than erroring).

    pub fn add_display_level(&mut self) {
        if self.is_frozen() {
            tracing::debug!("ignoring add_display_level on frozen config");
            return;
        }
        self.levels.push_default();
    }

    pub fn set_display_level(&mut self, index: usize, config: crate::display_level::DisplayLevelConfig) {
        if self.is_frozen() {
            tracing::debug!("ignoring set_display_level on frozen config");
            return;
        }
        if let Some(slot) = self.levels.0.get_mut(index) {
            *slot = config;
        }
    }

    pub fn set_thumbnail_extension(&mut self, ext: impl Into<String>) {
        if self.is_frozen() {
            return;
        }
        self.thumbnail_extension = ext.into();
    }

    pub fn set_thumbnail_base_path(&mut self, path: impl Into<PathBuf>) {
        if self.is_frozen() {
            return;
        }
        self.thumbnail_base_path = Some(path.into());
    }

    pub fn set_edit_history_path(&mut self, path: impl Into<PathBuf>) {
        if self.is_frozen() {
            return;
        }
        self.edit_history_path = Some(path.into());
    }

    pub fn set_crash_dump_path(&mut self, path: impl Into<PathBuf>) {
        if self.is_frozen() {
            return;
        }
        self.crash_dump_path = Some(path.into());
    }

    pub fn set_temporary_file_path(&mut self, path: impl Into<PathBuf>) {
        if self.is_frozen() {
            return;
        }
        self.temporary_file_path = path.into();
    }

    pub fn set_image_size_limit(&mut self, limit: Size) {
        if self.is_frozen() {
            return;
        }
        self.image_size_limit = Some(limit);
    }

    pub fn set_image_pixels_limit(&mut self, limit: u64) {
        if self.is_frozen() {
            return;
        }
        self.image_pixels_limit = Some(limit);
    }

    pub fn set_non_tiled_image_pixels_limit(&mut self, limit: u64) {
        if self.is_frozen() {
            return;
        }
        self.non_tiled_image_pixels_limit = Some(limit);
    }

    pub fn set_default_tile_size(&mut self, size: Size) {
        if self.is_frozen() {
            return;
        }
        self.default_tile_size = Some(size);
    }

    pub fn set_tile_cache_size(&mut self, n: usize) {
        if self.is_frozen() {
            return;
        }
        self.tile_cache_size = n;
    }

    pub fn set_save_buffer_size(&mut self, size: SaveBufferSize) {
        if self.is_frozen() {
            return;
        }
        self.save_buffer_size = size;
    }

    pub fn set_background_rendering_color(&mut self, color: Color) {
        if self.is_frozen() {
            return;
        }
        self.background_rendering_color = color;
    }

    pub fn set_vector_graphics_rendering_size(&mut self, size: Size) {
        if self.is_frozen() {
            return;
        }
        self.vector_graphics_rendering_size = Some(size);
    }
}
