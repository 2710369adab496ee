//! Per-file edit stack.
//!
//! Implements session grouping on undo/redo, the intermediate-load
//! double-step, and the revert/restore checkpoint. Owns a plain
//! `Vec<FilterCommand>` and a `usize` index (`index` = number of
//! committed commands, 0 before the stack is ever loaded).

use std::sync::Arc;

use crate::config::ImageSizeLimit;
use crate::filter::{FilterHandle, FilterRole};
use crate::save_map::SaveMap;
use crate::tile_map::TileMap;
use crate::types::{FilterCommand, Size};

/// Why `add` (or the load it wraps) refused a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddError {
    /// The initial load filter produced no usable size; the caller should
    /// demote the File to `Unsupported` and emit an error.
    LoadFailed,
    /// A non-load filter would have produced an empty image; the stack is
    /// left exactly as it was before the call.
    EmptyResult,
    /// The result's dimensions or pixel count exceed the configured
    /// limits; the stack is left exactly as it was before the call.
    SizeLimitExceeded,
}

pub struct UndoStack {
    file_id: u64,
    commands: Vec<FilterCommand>,
    index: usize,
    saved_index: usize,
    revert_index: usize,
    is_session_recording: bool,
    recording_session_id: u64,
    next_session_id: u64,
    save_command: Option<FilterCommand>,
    save_map: Option<SaveMap>,
}

impl UndoStack {
    pub fn new(file_id: u64) -> Self {
        Self {
            file_id,
            commands: Vec::new(),
            index: 0,
            saved_index: 0,
            revert_index: 0,
            is_session_recording: false,
            recording_session_id: 0,
            next_session_id: 1,
            save_command: None,
            save_map: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn count(&self) -> usize {
        self.commands.len()
    }

    pub fn saved_index(&self) -> usize {
        self.saved_index
    }

    pub fn revert_index(&self) -> usize {
        self.revert_index
    }

    pub fn is_clean(&self) -> bool {
        self.index == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.index != self.saved_index
    }

    /// The currently active command, i.e. the top of the applied prefix.
    /// `None` only before the stack has ever been loaded.
    pub fn current_command(&self) -> Option<&FilterCommand> {
        if self.index > 0 {
            self.commands.get(self.index - 1)
        } else {
            None
        }
    }

    pub fn command_at(&self, stack_index: usize) -> Option<&FilterCommand> {
        self.commands.get(stack_index)
    }

    /// Idempotently ensure command 0 exists. A second call is a no-op and
    /// returns the existing load command's id. Whatever is on disk at open
    /// time is clean by definition, so `savedIndex` catches up to `index`:
    /// a freshly opened File is clean until its first edit.
    pub fn load(&mut self, filter: Arc<FilterHandle>, tile_size: Option<Size>, size_limit: ImageSizeLimit) -> Result<u64, AddError> {
        if let Some(existing) = self.commands.first() {
            return Ok(existing.unique_id);
        }
        let id = self.add(filter, tile_size, size_limit)?;
        self.saved_index = self.index;
        Ok(id)
    }

    /// Truncate any redo tail, append `filter` as a new command, and
    /// compute its full-image size. Rejects (leaving the stack unchanged,
    /// except for a load failure which is reported to the caller to act
    /// on) filters that would produce an empty image or one that exceeds
    /// `size_limit`.
    pub fn add(&mut self, filter: Arc<FilterHandle>, tile_size: Option<Size>, size_limit: ImageSizeLimit) -> Result<u64, AddError> {
        let is_load = filter.role == FilterRole::Load;
        let previous_full_size = if is_load {
            Size::default()
        } else {
            self.current_command().and_then(|c| c.full_image_size).unwrap_or_default()
        };
        let full_size = filter.new_full_image_size(previous_full_size);

        if full_size.is_empty() {
            return if is_load {
                Err(AddError::LoadFailed)
            } else {
                Err(AddError::EmptyResult)
            };
        }
        if !size_limit.allows(full_size) {
            return Err(AddError::SizeLimitExceeded);
        }

        self.commands.truncate(self.index);
        let mut command = FilterCommand::new(filter.clone(), self.index);
        if self.is_session_recording && !is_load {
            command.session_id = Some(self.recording_session_id);
        }
        command.full_image_size = Some(full_size);

        if let Some(tile_size) = tile_size {
            let tile_map = if is_load {
                TileMap::new(self.file_id, full_size, tile_size)
            } else {
                match self.current_command().and_then(|c| c.tile_map.as_ref()) {
                    Some(prev) if filter.spatially_local => prev.derive(),
                    _ => TileMap::new(self.file_id, full_size, tile_size),
                }
            };
            command.tile_map = Some(Arc::new(tile_map));
        }

        let unique_id = command.unique_id;
        self.commands.push(command);
        self.index += 1;
        self.revert_index = 0;
        Ok(unique_id)
    }

    pub fn can_undo(&self) -> bool {
        if self.index <= 1 {
            return false;
        }
        if self.is_session_recording {
            match self.current_command() {
                Some(cmd) if cmd.belongs_to_session(Some(self.recording_session_id)) => {}
                _ => return false,
            }
        }
        true
    }

    /// Step back one user-visible edit. Returns the stack index that
    /// should now be protected from cache eviction across every level, or
    /// `None` if nothing moved.
    pub fn undo(&mut self) -> Option<usize> {
        if !self.can_undo() {
            return None;
        }

        // Intermediate load: skip transparently with a second step, but
        // never past the very first load at index 1.
        let at_intermediate_load = self
            .current_command()
            .map(|c| c.filter.role == FilterRole::Load)
            .unwrap_or(false);
        if at_intermediate_load && self.index > 2 {
            self.index -= 1;
        }

        if self.is_session_recording {
            self.index -= 1;
        } else if let Some(session_id) = self.current_command().and_then(|c| c.session_id) {
            loop {
                self.index -= 1;
                if !self.can_undo() {
                    break;
                }
                if self.current_command().and_then(|c| c.session_id) != Some(session_id) {
                    break;
                }
            }
        } else {
            self.index -= 1;
        }

        Some(self.index - 1)
    }

    pub fn can_redo(&self) -> bool {
        if self.index >= self.commands.len() {
            return false;
        }
        if self.is_session_recording {
            match self.commands.get(self.index) {
                Some(cmd) if cmd.belongs_to_session(Some(self.recording_session_id)) => {}
                _ => return false,
            }
        }
        true
    }

    /// Step forward one user-visible edit. Returns the newly protected
    /// stack index, or `None` if nothing moved.
    pub fn redo(&mut self) -> Option<usize> {
        if !self.can_redo() {
            return None;
        }

        if self.is_session_recording {
            self.index += 1;
        } else if let Some(session_id) = self.commands.get(self.index).and_then(|c| c.session_id) {
            loop {
                self.index += 1;
                if !self.can_redo() {
                    break;
                }
                if self.commands.get(self.index).and_then(|c| c.session_id) != Some(session_id) {
                    break;
                }
            }
        } else {
            self.index += 1;
        }

        // Intermediate load: transparently redo past it too.
        if self.can_redo() {
            if let Some(next) = self.commands.get(self.index) {
                if next.filter.role == FilterRole::Load {
                    self.index += 1;
                }
            }
        }

        self.revert_index = 0;
        Some(self.index - 1)
    }

    pub fn can_revert(&self) -> bool {
        self.can_undo()
    }

    pub fn can_restore(&self) -> bool {
        self.revert_index > 0
    }

    /// Set the revert checkpoint and undo all the way back. Returns the
    /// list of stack indices that became current along the way, so the
    /// caller can protect each in turn (`protectImages` runs once per
    /// `undo()` invocation).
    pub fn revert(&mut self) -> Vec<usize> {
        self.revert_index = self.index;
        let mut protected = Vec::new();
        loop {
            match self.undo() {
                Some(idx) => protected.push(idx),
                None => break,
            }
            if !self.can_undo() {
                break;
            }
        }
        protected
    }

    pub fn restore(&mut self) -> Vec<usize> {
        let target = self.revert_index;
        let mut protected = Vec::new();
        while self.can_redo() && self.index < target {
            if let Some(idx) = self.redo() {
                protected.push(idx);
            } else {
                break;
            }
        }
        self.revert_index = 0;
        protected
    }

    pub fn start_session(&mut self) -> u64 {
        if !self.is_session_recording {
            self.is_session_recording = true;
            self.recording_session_id = self.next_session_id;
            self.next_session_id += 1;
        }
        self.recording_session_id
    }

    pub fn end_session(&mut self) {
        self.is_session_recording = false;
    }

    pub fn is_session_recording(&self) -> bool {
        self.is_session_recording
    }

    /// Close any open session and build the save command/map for a
    /// save targeting the current command's image. A File whose commands
    /// carry no `TileMap` (tiling disabled, or a non-spatially-local
    /// filter discarded it) still gets a single-buffer `SaveMap` over the
    /// whole image (the single-command save path), so every save drives
    /// through the same buffer-by-buffer loop.
    pub fn prepare_save(&mut self, save_filter: Arc<FilterHandle>, save_buffer_count: usize) {
        self.is_session_recording = false;
        self.save_command = None;
        self.save_map = None;

        let current = self.current_command();
        let full_size = current.and_then(|c| c.full_image_size).unwrap_or_default();
        let current_tile_map = current.and_then(|c| c.tile_map.clone());
        let stack_index = self.index.saturating_sub(1);

        let mut command = FilterCommand::new(save_filter, stack_index);
        let save_map = match current_tile_map {
            Some(tile_map) => {
                let save_tile_map = tile_map.derive();
                command.tile_map = Some(Arc::new(save_tile_map.clone()));
                SaveMap::new(save_tile_map, save_buffer_count)
            }
            None => SaveMap::single_buffer(TileMap::new(self.file_id, full_size, full_size)),
        };
        self.save_map = Some(save_map);
        self.save_command = Some(command);
    }

    pub fn save_command(&self) -> Option<&FilterCommand> {
        self.save_command.as_ref()
    }

    pub fn save_map(&self) -> Option<&SaveMap> {
        self.save_map.as_ref()
    }

    pub fn save_map_mut(&mut self) -> Option<&mut SaveMap> {
        self.save_map.as_mut()
    }

    /// Mark the save as concluded: `savedIndex` catches up to `index`, and
    /// the in-progress save command/map are dropped. The caller is
    /// responsible for rewriting command 0 via [`Self::set_load_filter`]
    /// so reopening starts from the now-canonical file.
    pub fn conclude_save(&mut self) -> usize {
        self.saved_index = self.index;
        self.save_command = None;
        self.save_map = None;
        self.saved_index
    }

    /// Abort an in-progress save: drop the save command/map without
    /// advancing `savedIndex`. A failed save must not touch `savedIndex`.
    pub fn prepare_save_abort(&mut self) {
        self.save_command = None;
        self.save_map = None;
    }

    /// Permanently drop the redo tail beyond the current index, without
    /// undoing. Used by `saveAs` (`dropRedoHistory`) so an exported copy
    /// starts with no inheritable future history.
    pub fn drop_redo_tail(&mut self) {
        self.commands.truncate(self.index);
    }

    pub fn set_load_filter(&mut self, filter: Arc<FilterHandle>) {
        if let Some(load_command) = self.commands.first_mut() {
            load_command.filter = filter;
        }
    }

    pub fn find(&self, unique_id: u64) -> Option<&FilterCommand> {
        self.commands
            .iter()
            .find(|c| c.unique_id == unique_id)
            .or_else(|| self.save_command.as_ref().filter(|c| c.unique_id == unique_id))
    }

    pub fn commands(&self) -> &[FilterCommand] {
        &self.commands
    }

    /// Rebuild the stack wholesale from a crash dump (`recover()`). Clears
    /// any in-progress save/session state, since a
    /// recovered stack is recreated fresh before its save is re-issued.
    pub fn restore_from_dump(&mut self, commands: Vec<FilterCommand>, index: usize, saved_index: usize) {
        self.commands = commands;
        self.index = index;
        self.saved_index = saved_index;
        self.revert_index = 0;
        self.is_session_recording = false;
        self.save_command = None;
        self.save_map = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn load_filter() -> Arc<FilterHandle> {
        Arc::new(FilterHandle::new(
            "load",
            FilterRole::Load,
            BTreeMap::new(),
            false,
            Arc::new(|_input, _p| {
                Ok(crate::types::Image::new(vec![0; 4], Size::new(10, 10), Size::new(10, 10), crate::types::ZLevel::Full))
            }),
            Arc::new(|_prev, _p| Size::new(10, 10)),
        ))
    }

    fn transform_filter() -> Arc<FilterHandle> {
        Arc::new(FilterHandle::new(
            "crop",
            FilterRole::Transform,
            BTreeMap::new(),
            true,
            Arc::new(|input, _p| Ok(input.cloned().unwrap())),
            Arc::new(|prev, _p| prev),
        ))
    }

    fn empty_result_filter() -> Arc<FilterHandle> {
        Arc::new(FilterHandle::new(
            "degenerate-crop",
            FilterRole::Transform,
            BTreeMap::new(),
            true,
            Arc::new(|input, _p| Ok(input.cloned().unwrap())),
            Arc::new(|_prev, _p| Size::default()),
        ))
    }

    #[test]
    fn load_is_idempotent() {
        let mut stack = UndoStack::new(1);
        let first = stack.load(load_filter(), None, ImageSizeLimit::default()).unwrap();
        let second = stack.load(load_filter(), None, ImageSizeLimit::default()).unwrap();
        assert_eq!(first, second);
        assert_eq!(stack.index(), 1);
    }

    #[test]
    fn cannot_undo_past_load() {
        let mut stack = UndoStack::new(1);
        stack.load(load_filter(), None, ImageSizeLimit::default()).unwrap();
        assert!(!stack.can_undo());
        assert_eq!(stack.undo(), None);
    }

    #[test]
    fn add_truncates_redo_tail() {
        let mut stack = UndoStack::new(1);
        stack.load(load_filter(), None, ImageSizeLimit::default()).unwrap();
        stack.add(transform_filter(), None, ImageSizeLimit::default()).unwrap();
        stack.add(transform_filter(), None, ImageSizeLimit::default()).unwrap();
        assert_eq!(stack.count(), 3);
        stack.undo();
        assert_eq!(stack.index(), 2);
        stack.add(transform_filter(), None, ImageSizeLimit::default()).unwrap();
        assert_eq!(stack.count(), 3, "pushing after undo must drop the old redo tail");
    }

    #[test]
    fn add_rejects_empty_result_without_mutating_stack() {
        let mut stack = UndoStack::new(1);
        stack.load(load_filter(), None, ImageSizeLimit::default()).unwrap();
        let before = stack.index();
        let err = stack.add(empty_result_filter(), None, ImageSizeLimit::default()).unwrap_err();
        assert_eq!(err, AddError::EmptyResult);
        assert_eq!(stack.index(), before);
        assert_eq!(stack.count(), 1);
    }

    #[test]
    fn add_rejects_oversized_result_distinctly_from_empty() {
        let mut stack = UndoStack::new(1);
        stack.load(load_filter(), None, ImageSizeLimit::default()).unwrap();
        let before = stack.index();
        let tiny = ImageSizeLimit { max_size: Some(Size::new(1, 1)), max_pixels: None };
        let err = stack.add(transform_filter(), None, tiny).unwrap_err();
        assert_eq!(err, AddError::SizeLimitExceeded);
        assert_ne!(err, AddError::EmptyResult);
        assert_eq!(stack.index(), before, "a rejected command must leave the stack untouched");
        assert_eq!(stack.count(), 1);
    }

    #[test]
    fn session_grouping_undoes_whole_session_at_once() {
        let mut stack = UndoStack::new(1);
        stack.load(load_filter(), None, ImageSizeLimit::default()).unwrap();
        stack.start_session();
        stack.add(transform_filter(), None, ImageSizeLimit::default()).unwrap();
        stack.add(transform_filter(), None, ImageSizeLimit::default()).unwrap();
        stack.end_session();
        assert_eq!(stack.index(), 3);
        stack.undo();
        assert_eq!(stack.index(), 1, "undo outside a session consumes the whole session");
    }

    #[test]
    fn revert_then_restore_round_trips() {
        let mut stack = UndoStack::new(1);
        stack.load(load_filter(), None, ImageSizeLimit::default()).unwrap();
        stack.add(transform_filter(), None, ImageSizeLimit::default()).unwrap();
        stack.add(transform_filter(), None, ImageSizeLimit::default()).unwrap();
        let at_top = stack.index();
        stack.revert();
        assert_eq!(stack.index(), 1);
        assert!(stack.can_restore());
        stack.restore();
        assert_eq!(stack.index(), at_top);
        assert!(!stack.can_restore());
    }

    #[test]
    fn new_add_clears_revert_checkpoint() {
        let mut stack = UndoStack::new(1);
        stack.load(load_filter(), None, ImageSizeLimit::default()).unwrap();
        stack.add(transform_filter(), None, ImageSizeLimit::default()).unwrap();
        stack.revert();
        assert!(stack.can_restore());
        stack.add(transform_filter(), None, ImageSizeLimit::default()).unwrap();
        assert!(!stack.can_restore());
    }

    #[test]
    fn conclude_save_advances_saved_index() {
        let mut stack = UndoStack::new(1);
        stack.load(load_filter(), None, ImageSizeLimit::default()).unwrap();
        stack.add(transform_filter(), None, ImageSizeLimit::default()).unwrap();
        assert!(stack.is_dirty());
        stack.prepare_save(transform_filter(), 1);
        stack.conclude_save();
        assert!(!stack.is_dirty());
        assert_eq!(stack.saved_index(), stack.index());
    }
}
