//! Cross-file task selection.
//!
//! The scheduler itself holds no File state — it is handed a snapshot of
//! every open File's scheduling-relevant facts (`FileView`) each time
//! `select` is called, and returns at most one `Task`. A generation
//! counter discards results from a superseded selection the same way a
//! viewport-driven tile scheduler discards stale prefetch results, but
//! ownership differs: rather than owning its cache and slide pool
//! directly, this scheduler stays a pure function over caller-supplied
//! views so `Engine` remains the only place that actually mutates File
//! state.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::save_map::BufferState;
use crate::tile_cache::TileId;

/// One level's scheduling-relevant state for a single File, as of the
/// moment `Scheduler::select` is called.
#[derive(Debug, Clone)]
pub struct LevelView {
    pub level: usize,
    pub cropped: bool,
    /// Lowest stack index in `0..=current` not yet cached for this level.
    /// A level that has never been viewed needs rendering forward one
    /// index at a time from here, each using the previous index's own
    /// cached output as input; `None` once the current index is cached
    /// too.
    pub missing_index: Option<usize>,
    pub has_thumbnail_on_disk: bool,
    pub thumbnail_loaded: bool,
    pub thumbnail_saved: bool,
}

impl LevelView {
    pub fn present(&self) -> bool {
        self.missing_index.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct SaveStepView {
    pub next_missing_tile: Option<TileId>,
    pub ready_buffer: Option<usize>,
}

/// A read-only snapshot of one open File, as much as the scheduler needs
/// to decide what runs next.
#[derive(Debug, Clone)]
pub struct FileView {
    pub id: u64,
    pub insertion_order: u64,
    pub can_view: bool,
    pub display_level: usize,
    pub levels: Vec<LevelView>,
    pub stack_index: usize,
    pub saved_index: usize,
    pub save_in_progress: Option<SaveStepView>,
    /// True if the format needs the external thumbnailer rather than the
    /// in-process decoder.
    pub needs_external_thumbnailer: bool,
}

impl FileView {
    fn needed_levels(&self) -> Vec<usize> {
        let n = self.display_level;
        self.levels
            .iter()
            .filter(|lv| lv.level == n || !lv.cropped)
            .filter(|lv| lv.level <= n)
            .map(|lv| lv.level)
            .collect()
    }

    fn level(&self, index: usize) -> Option<&LevelView> {
        self.levels.iter().find(|lv| lv.level == index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStep {
    EncodeBuffer(usize),
    FilterTile(TileId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    SaveStep { file_id: u64, step: SaveStep },
    /// `index` is the stack index this task was selected against, pinned at
    /// selection time so a later completion writes into the slot it was
    /// actually computed for even if the stack has since moved on.
    ThumbnailLoad { file_id: u64, level: usize, index: usize },
    ThumbnailSave { file_id: u64, level: usize, index: usize },
    RenderLevel { file_id: u64, level: usize, index: usize },
    ThumbnailerRequest { file_id: u64 },
}

/// Cross-file priority selection plus a generation counter the caller can
/// use to discard a result whose target slot is no longer needed by the
/// time the worker reports back.
pub struct Scheduler {
    generation: AtomicU64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self { generation: AtomicU64::new(0) }
    }

    /// Bump the generation. Call whenever a push, undo, redo, or display
    /// level change supersedes in-flight work.
    pub fn invalidate(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether a result computed at `observed_generation` is still usable.
    pub fn is_current(&self, observed_generation: u64) -> bool {
        observed_generation == self.generation()
    }

    /// Pick the single next task, in strict priority order.
    pub fn select(&self, files: &[FileView]) -> Option<Task> {
        // 1. Active save: any file mid-save takes priority over everything.
        for file in files {
            if let Some(save) = &file.save_in_progress {
                if let Some(buffer) = save.ready_buffer {
                    return Some(Task::SaveStep { file_id: file.id, step: SaveStep::EncodeBuffer(buffer) });
                }
                if let Some(tile) = save.next_missing_tile {
                    return Some(Task::SaveStep { file_id: file.id, step: SaveStep::FilterTile(tile) });
                }
            }
        }

        // 2. Priority-viewing file: highest displayLevel, ties broken by
        // earlier insertion order.
        let priority = files
            .iter()
            .filter(|f| f.can_view)
            .min_by_key(|f| (std::cmp::Reverse(f.display_level), f.insertion_order));

        if let Some(priority) = priority {
            let mut needed = priority.needed_levels();
            needed.sort_unstable();
            for level in &needed {
                let view = match priority.level(*level) {
                    Some(v) => v,
                    None => continue,
                };
                let index = match view.missing_index {
                    Some(i) => i,
                    None => continue,
                };
                if view.has_thumbnail_on_disk && !view.thumbnail_loaded {
                    return Some(Task::ThumbnailLoad { file_id: priority.id, level: *level, index });
                }
                return Some(Task::RenderLevel { file_id: priority.id, level: *level, index });
            }
        }

        // 3. Thumbnail load for any other file with a missing level that
        // has a stored thumbnail, before any computational work elsewhere.
        for file in files {
            if Some(file.id) == priority.map(|p| p.id) {
                continue;
            }
            for level in file.needed_levels() {
                if let Some(view) = file.level(level) {
                    if let Some(index) = view.missing_index {
                        if view.has_thumbnail_on_disk && !view.thumbnail_loaded {
                            return Some(Task::ThumbnailLoad { file_id: file.id, level, index });
                        }
                    }
                }
            }
            if file.needs_external_thumbnailer && file.levels.iter().any(|lv| !lv.present()) {
                return Some(Task::ThumbnailerRequest { file_id: file.id });
            }
        }

        // 4. Thumbnail save: a level image exists for a file whose stack
        // is at the saved index, and no thumbnail has been written yet.
        for file in files {
            if file.stack_index != file.saved_index {
                continue;
            }
            for view in &file.levels {
                if view.present() && !view.thumbnail_saved {
                    let index = file.stack_index.saturating_sub(1);
                    return Some(Task::ThumbnailSave { file_id: file.id, level: view.level, index });
                }
            }
        }

        // 5. Precomputation: missing levels for non-priority files.
        for file in files {
            if Some(file.id) == priority.map(|p| p.id) || !file.can_view {
                continue;
            }
            let mut needed = file.needed_levels();
            needed.sort_unstable();
            for level in needed {
                if let Some(view) = file.level(level) {
                    if let Some(index) = view.missing_index {
                        return Some(Task::RenderLevel { file_id: file.id, level, index });
                    }
                }
            }
        }

        None
    }
}

/// Build a `SaveStepView` from a `SaveMap`'s current state: the first
/// ready-to-encode buffer, else the first missing tile of the
/// lowest-numbered unflushed buffer.
pub fn save_step_view(save_map: &crate::save_map::SaveMap) -> Option<SaveStepView> {
    let buffer = save_map.next_unflushed()?;
    match buffer.state {
        BufferState::ReadyToEncode => Some(SaveStepView { next_missing_tile: None, ready_buffer: Some(buffer.index) }),
        BufferState::NeedsInput => {
            let tile = buffer.missing_tiles().first().copied();
            Some(SaveStepView { next_missing_tile: tile, ready_buffer: None })
        }
        BufferState::Flushed => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(idx: usize, cropped: bool, present: bool) -> LevelView {
        let missing_index = if present { None } else { Some(0) };
        LevelView { level: idx, cropped, missing_index, has_thumbnail_on_disk: false, thumbnail_loaded: false, thumbnail_saved: true }
    }

    fn file(id: u64, order: u64, display_level: usize, levels: Vec<LevelView>) -> FileView {
        FileView {
            id,
            insertion_order: order,
            can_view: true,
            display_level,
            levels,
            stack_index: 1,
            saved_index: 1,
            save_in_progress: None,
            needs_external_thumbnailer: false,
        }
    }

    #[test]
    fn active_save_wins_over_everything() {
        let scheduler = Scheduler::new();
        let mut f = file(1, 0, 1, vec![level(0, false, false), level(1, false, false)]);
        f.save_in_progress = Some(SaveStepView { next_missing_tile: None, ready_buffer: Some(0) });
        let task = scheduler.select(&[f]).unwrap();
        assert_eq!(task, Task::SaveStep { file_id: 1, step: SaveStep::EncodeBuffer(0) });
    }

    #[test]
    fn priority_file_renders_coarsest_missing_level_first() {
        let scheduler = Scheduler::new();
        let f = file(1, 0, 1, vec![level(0, false, false), level(1, false, false)]);
        let task = scheduler.select(&[f]).unwrap();
        assert_eq!(task, Task::RenderLevel { file_id: 1, level: 0, index: 0 });
    }

    #[test]
    fn higher_display_level_file_is_priority() {
        let scheduler = Scheduler::new();
        let low = file(1, 0, 0, vec![level(0, false, false)]);
        let high = file(2, 1, 1, vec![level(0, false, false), level(1, false, false)]);
        let task = scheduler.select(&[low, high]).unwrap();
        assert_eq!(task, Task::RenderLevel { file_id: 2, level: 0, index: 0 });
    }

    #[test]
    fn cropped_level_does_not_substitute() {
        let scheduler = Scheduler::new();
        let f = file(1, 0, 1, vec![level(0, false, true), level(1, true, false)]);
        let task = scheduler.select(&[f]).unwrap();
        assert_eq!(task, Task::RenderLevel { file_id: 1, level: 1, index: 0 });
    }

    #[test]
    fn thumbnail_save_runs_once_levels_are_present_and_saved() {
        let scheduler = Scheduler::new();
        let f = file(1, 0, 0, vec![LevelView { level: 0, cropped: false, missing_index: None, has_thumbnail_on_disk: false, thumbnail_loaded: false, thumbnail_saved: false }]);
        let task = scheduler.select(&[f]).unwrap();
        assert_eq!(task, Task::ThumbnailSave { file_id: 1, level: 0, index: 0 });
    }

    #[test]
    fn render_targets_the_earliest_missing_index_not_the_current_one() {
        let scheduler = Scheduler::new();
        let lv = LevelView {
            level: 0,
            cropped: false,
            missing_index: Some(2),
            has_thumbnail_on_disk: false,
            thumbnail_loaded: false,
            thumbnail_saved: true,
        };
        let f = file(1, 0, 0, vec![lv]);
        let task = scheduler.select(&[f]).unwrap();
        assert_eq!(task, Task::RenderLevel { file_id: 1, level: 0, index: 2 });
    }

    #[test]
    fn no_task_when_everything_present() {
        let scheduler = Scheduler::new();
        let f = file(1, 0, 0, vec![level(0, false, true)]);
        assert_eq!(scheduler.select(&[f]), None);
    }
}
