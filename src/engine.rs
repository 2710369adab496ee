//! Process-wide coordinator: the file registry, the dispatch loop, and
//! crash-dump lifecycle.
//!
//! Shaped around a file registry, a `Scheduler`, and a `ThreadManager`
//! plus `dump`/`can_recover`/`recover`, with the process-wide singleton
//! re-expressed as an explicit value an application owns and threads
//! through. A thin `OnceLock`-backed accessor (`Engine::shared`) keeps
//! the singleton convenience available without hiding ownership.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::config::{EngineConfig, ImageSizeLimit};
use crate::crash_dump::{self, DumpCommand, DumpDocument, DumpFile, DumpParam};
use crate::error::{EngineError, EngineResult, ErrorSink, ErrorSource, TracingErrorSink};
use crate::file::{File, FileState};
use crate::filter::FilterHandle;
use crate::scheduler::{FileView, LevelView, SaveStep, SaveStepView, Scheduler, Task};
use crate::thread_manager::{Busy, ThreadManager};
use crate::thumbnailer::Thumbnailer;
use crate::tile_cache::{TileCache, TileId};
use crate::types::{FilterCommand, Image, Size};
use crate::value::Value;

/// Reconstructs a runnable [`FilterHandle`] from a crash-dumped name plus
/// parameters. Supplied by the host application's filter library, which is
/// out of scope for this crate.
pub trait FilterResolver: Send + Sync {
    fn resolve(&self, name: &str, params: &BTreeMap<String, Value>) -> Option<Arc<FilterHandle>>;
}

/// One finished background task, ready for the coordinator to fold into
/// File/cache state.
struct Completion {
    task: Task,
    generation: u64,
    result: EngineResult<Image>,
}

/// The process-wide engine: file registry, shared caches, scheduler, and
/// the single background worker.
pub struct Engine {
    config: EngineConfig,
    files: HashMap<u64, File>,
    path_index: HashMap<PathBuf, u64>,
    next_file_id: AtomicU64,
    next_insertion_order: AtomicU64,
    tile_cache: Arc<TileCache>,
    scheduler: Scheduler,
    threads: ThreadManager<Task>,
    error_sink: Arc<dyn ErrorSink>,
    thumbnailer: Option<Arc<dyn Thumbnailer>>,
}

static SHARED: OnceLock<Mutex<Engine>> = OnceLock::new();

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let tile_cache_size = config.tile_cache_size();
        Self {
            config,
            files: HashMap::new(),
            path_index: HashMap::new(),
            next_file_id: AtomicU64::new(1),
            next_insertion_order: AtomicU64::new(0),
            tile_cache: Arc::new(TileCache::new(tile_cache_size)),
            scheduler: Scheduler::new(),
            threads: ThreadManager::new(),
            error_sink: Arc::new(TracingErrorSink),
            thumbnailer: None,
        }
    }

    /// Install a custom error sink, used for errors not tied to any one
    /// File (a File may also carry its own per-file sink).
    pub fn set_error_sink(&mut self, sink: Arc<dyn ErrorSink>) {
        self.error_sink = sink;
    }

    pub fn set_thumbnailer(&mut self, thumbnailer: Arc<dyn Thumbnailer>) {
        self.thumbnailer = Some(thumbnailer);
    }

    /// Optional process-wide singleton accessor retaining the convenience
    /// of a global engine while keeping ownership explicit. Initializes on
    /// first use with a default configuration; callers who need a custom
    /// one should build their own `Engine` instead.
    pub fn shared() -> &'static Mutex<Engine> {
        SHARED.get_or_init(|| Mutex::new(Engine::new(EngineConfig::new())))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tile_cache(&self) -> &Arc<TileCache> {
        &self.tile_cache
    }

    pub fn file(&self, id: u64) -> Option<&File> {
        self.files.get(&id)
    }

    pub fn file_mut(&mut self, id: u64) -> Option<&mut File> {
        self.files.get_mut(&id)
    }

    pub fn file_id_for_path(&self, path: &Path) -> Option<u64> {
        self.path_index.get(path).copied()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    fn report(&self, error: EngineError) {
        self.error_sink.report(&error);
    }

    /// Open (or return the already-registered) File for `path`. Freezes
    /// configuration on the very first call (configuration is considered
    /// frozen once the first File is opened). Runs
    /// `load_filter` immediately; a load failure demotes the File to
    /// `Unsupported` and is reported, but the File itself remains
    /// registered regardless of load outcome.
    pub fn open(&mut self, path: PathBuf, load_filter: Arc<FilterHandle>) -> u64 {
        self.config.freeze();

        if let Some(&id) = self.path_index.get(&path) {
            return id;
        }

        let id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        let order = self.next_insertion_order.fetch_add(1, Ordering::Relaxed);
        let mut file = File::new(id, order, path.clone(), &self.config.levels().0);

        let tile_size = self.config.default_tile_size();
        let size_limit = self.config.effective_image_size_limit();
        if let Err(err) = file.load(load_filter, tile_size, size_limit) {
            self.report(err);
        }

        self.path_index.insert(path, id);
        self.files.insert(id, file);
        self.scheduler.invalidate();
        id
    }

    /// Remove a File: transitions it to `Removed`, then drops it from the
    /// registry entirely (the caller is responsible for deleting on-disk
    /// artifacts first via [`File::removed_thumbnail_levels`] and its own
    /// original-backup/edit-history cleanup).
    pub fn remove(&mut self, id: u64) {
        if let Some(mut file) = self.files.remove(&id) {
            file.remove();
            self.path_index.remove(&file.file_name);
        }
        self.scheduler.invalidate();
    }

    pub fn set_display_level(&mut self, id: u64, level: usize) -> bool {
        let level_count = self.config.levels().len();
        let changed = match self.files.get_mut(&id) {
            Some(file) => file.set_display_level(level, level_count),
            None => false,
        };
        if changed {
            self.scheduler.invalidate();
        }
        changed
    }

    pub fn run_filter(&mut self, id: u64, filter: Arc<FilterHandle>) -> EngineResult<u64> {
        let tile_size = self.config.default_tile_size();
        let size_limit = self.config.effective_image_size_limit();
        let Some(file) = self.files.get_mut(&id) else {
            return Err(EngineError::FileNonexistent(PathBuf::new()));
        };
        let result = file.run_filter(filter, tile_size, size_limit).map_err(|_| EngineError::ImageSize(Size::default()));
        if result.is_ok() {
            self.scheduler.invalidate();
        }
        result
    }

    pub fn undo(&mut self, id: u64) -> bool {
        let moved = self.files.get_mut(&id).and_then(|f| f.undo());
        if moved.is_some() {
            self.scheduler.invalidate();
        }
        moved.is_some()
    }

    pub fn redo(&mut self, id: u64) -> bool {
        let moved = self.files.get_mut(&id).and_then(|f| f.redo());
        if moved.is_some() {
            self.scheduler.invalidate();
        }
        moved.is_some()
    }

    pub fn revert(&mut self, id: u64) -> bool {
        let moved = self.files.get_mut(&id).map(|f| !f.revert().is_empty()).unwrap_or(false);
        if moved {
            self.scheduler.invalidate();
        }
        moved
    }

    pub fn restore(&mut self, id: u64) -> bool {
        let moved = self.files.get_mut(&id).map(|f| !f.restore().is_empty()).unwrap_or(false);
        if moved {
            self.scheduler.invalidate();
        }
        moved
    }

    pub fn start_session(&mut self, id: u64) -> Option<u64> {
        self.files.get_mut(&id).map(|f| f.start_session())
    }

    pub fn end_session(&mut self, id: u64) {
        if let Some(file) = self.files.get_mut(&id) {
            file.end_session();
        }
    }

    pub fn save(&mut self, id: u64, save_filter: Arc<FilterHandle>) -> bool {
        let count = self.config.save_buffer_size().count;
        let started = self.files.get_mut(&id).map(|f| f.save(save_filter, count)).unwrap_or(false);
        if started {
            self.scheduler.invalidate();
        }
        started
    }

    pub fn save_as(&mut self, id: u64, target: PathBuf, save_filter: Arc<FilterHandle>) {
        let count = self.config.save_buffer_size().count;
        if let Some(file) = self.files.get_mut(&id) {
            file.save_as(target, save_filter, count);
            self.scheduler.invalidate();
        }
    }

    /// Whether `filter_unique_id` may be safely dropped (`allowDelete`).
    pub fn allow_delete(&self, filter_unique_id: u64) -> bool {
        self.threads.allow_delete(filter_unique_id)
    }

    // -- Scheduling -----------------------------------------------------

    /// Lowest stack index in `0..=stack_index` not yet cached for `level`.
    /// A level viewed for the first time after several edits needs
    /// rendering forward from whatever its earliest gap is, not from the
    /// current index directly, or its render input would be missing.
    fn first_missing_level_index(file: &File, level: usize, stack_index: usize) -> Option<usize> {
        let cache = file.level_cache(level)?;
        (0..=stack_index).find(|idx| !cache.contains(*idx))
    }

    fn level_view(&self, file: &File, level: usize) -> LevelView {
        let config = &self.config.levels().0[level];
        let stack_index = file.stack.index().saturating_sub(1);
        let missing_index = Self::first_missing_level_index(file, level, stack_index);
        LevelView {
            level,
            cropped: config.is_cropped(),
            missing_index,
            has_thumbnail_on_disk: file.has_thumbnail(level),
            thumbnail_loaded: missing_index.is_none(),
            thumbnail_saved: file.thumbnail_saved(level),
        }
    }

    fn save_step_view(&self, file: &File) -> Option<SaveStepView> {
        file.stack.save_map().and_then(crate::scheduler::save_step_view)
    }

    fn file_view(&self, file: &File) -> FileView {
        let levels = (0..self.config.levels().len()).map(|l| self.level_view(file, l)).collect();
        FileView {
            id: file.id,
            insertion_order: file.insertion_order,
            can_view: file.display_level.is_some() && !file.is_removed(),
            display_level: file.display_level.unwrap_or(0),
            levels,
            stack_index: file.stack.index(),
            saved_index: file.stack.saved_index(),
            save_in_progress: self.save_step_view(file),
            needs_external_thumbnailer: matches!(file.state, FileState::ExternallySupportedFormat),
        }
    }

    /// Pick the single next task, in strict priority order. Does not submit it.
    pub fn suggest_new_task(&self) -> Option<Task> {
        let mut views: Vec<FileView> = self.files.values().filter(|f| !f.is_removed()).map(|f| self.file_view(f)).collect();
        // `HashMap` iteration order is arbitrary; every tie-break in
        // `Scheduler::select` assumes earlier insertion order wins.
        views.sort_unstable_by_key(|f| f.insertion_order);
        self.scheduler.select(&views)
    }

    /// A filter scoped to one level: same apply/size functions, with
    /// `targetSize`/`targetArea` parameters bound for this level so an
    /// externally-supplied `apply_fn` can honor per-level geometry (the
    /// pixel-filter library is an external collaborator; this is the seam
    /// through which Engine tells it what to produce).
    fn level_scoped_filter(&self, filter: &Arc<FilterHandle>, level: usize, full_image_size: Size) -> Arc<FilterHandle> {
        let config = &self.config.levels().0[level];
        let mut params = filter.params.clone();
        params.insert("targetSize".into(), Value::from(config.target_size(full_image_size)));
        if config.is_cropped() {
            params.insert("targetArea".into(), Value::Rect(config.target_area(full_image_size)));
        }
        Arc::new(FilterHandle::new(
            filter.name.clone(),
            filter.role,
            params,
            filter.spatially_local,
            Arc::new({
                let filter = Arc::clone(filter);
                move |input, params| filter.apply_fn_with(input, params)
            }),
            Arc::new({
                let filter = Arc::clone(filter);
                move |prev, params| filter.size_fn_with(prev, params)
            }),
        ))
    }

    /// Build the job for `task` and submit it to the background worker.
    /// Returns `Ok(false)` when there was nothing to submit, `Err(Busy)`
    /// when the worker is already running something.
    pub fn dispatch_next(&mut self) -> Result<bool, Busy> {
        let Some(task) = self.suggest_new_task() else {
            return Ok(false);
        };
        let generation = self.scheduler.generation();

        let Some((filter_unique_id, work)) = self.build_job(&task) else {
            return Ok(false);
        };

        self.threads.submit(task, generation, filter_unique_id, work)?;
        Ok(true)
    }

    fn build_job(&self, task: &Task) -> Option<(u64, Box<dyn FnOnce() -> EngineResult<Image> + Send>)> {
        match *task {
            Task::RenderLevel { file_id, level, index } => {
                let file = self.files.get(&file_id)?;
                let command = file.stack.command_at(index)?;
                let full_size = command.full_image_size.unwrap_or_default();
                let scoped = self.level_scoped_filter(&command.filter, level, full_size);
                let input = if index == 0 {
                    None
                } else {
                    file.level_cache(level).and_then(|c| c.get(index - 1))
                };
                let unique_id = command.unique_id;
                Some((unique_id, Box::new(move || scoped.apply(input.as_ref()))))
            }
            Task::ThumbnailLoad { file_id, level, index } => {
                let file = self.files.get(&file_id)?;
                let command = file.stack.command_at(index)?;
                let full_size = command.full_image_size.unwrap_or_default();
                let scoped = self.level_scoped_filter(&command.filter, level, full_size);
                let unique_id = command.unique_id;
                Some((unique_id, Box::new(move || scoped.apply(None))))
            }
            Task::ThumbnailSave { file_id, level, index } => {
                let file = self.files.get(&file_id)?;
                let image = file.level_cache(level)?.get(index)?;
                Some((0, Box::new(move || Ok(image))))
            }
            Task::ThumbnailerRequest { file_id } => {
                let file = self.files.get(&file_id)?;
                let thumbnailer = self.thumbnailer.clone()?;
                let uri = crate::file::file_uri(&file.file_name);
                let flavor = self
                    .config
                    .levels()
                    .0
                    .first()
                    .and_then(|l| l.thumbnail_flavor.clone())
                    .unwrap_or_else(|| "normal".to_string());
                Some((
                    0,
                    Box::new(move || {
                        let request = crate::thumbnailer::ThumbnailRequest { uri, mime_type: String::new(), flavor };
                        match thumbnailer.request(&request) {
                            crate::thumbnailer::ThumbnailOutcome::Generated { .. } => {
                                Ok(Image::new(Vec::new(), Size::default(), Size::default(), crate::types::ZLevel::Full))
                            }
                            crate::thumbnailer::ThumbnailOutcome::Error { message, .. } => {
                                Err(EngineError::FileFormatUnsupported(PathBuf::from(message)))
                            }
                        }
                    }),
                ))
            }
            Task::SaveStep { file_id, step: SaveStep::FilterTile(tile) } => {
                let file = self.files.get(&file_id)?;
                let command = file.stack.save_command()?;
                command.tile_map.as_ref()?;
                let tile_cache = Arc::clone(&self.tile_cache);
                let source_tile_map_id = file.stack.current_command().and_then(|c| c.tile_map.as_ref()).map(|m| m.id);
                let input = source_tile_map_id.and_then(|id| tile_cache.get(tile, id));
                let scoped_params = command.filter.params.clone();
                let filter = Arc::clone(&command.filter);
                Some((command.unique_id, Box::new(move || filter.apply_fn_with(input.as_ref(), &scoped_params))))
            }
            Task::SaveStep { file_id, step: SaveStep::EncodeBuffer(index) } => {
                let file = self.files.get(&file_id)?;
                let command = file.stack.save_command()?;
                let save_map = file.stack.save_map()?;
                let buffer = save_map.buffer(index)?;
                let tile_map_id = command.tile_map.as_ref().map(|m| m.id).unwrap_or(0);
                let tile_cache = Arc::clone(&self.tile_cache);
                let required: Vec<TileId> = buffer.required_tiles().to_vec();
                let full_size = save_map.tile_map.full_image_size;
                let filter = Arc::clone(&command.filter);
                let params = command.filter.params.clone();
                // Non-tiled saves have no required tiles: fall back to the
                // full image cached at the current command (the
                // single-command save path).
                let full_level = self.config.levels().full_level();
                let whole_image = if required.is_empty() {
                    let stack_index = file.stack.index().saturating_sub(1);
                    file.level_cache(full_level).and_then(|c| c.get(stack_index))
                } else {
                    None
                };
                Some((
                    command.unique_id,
                    Box::new(move || {
                        // Stitching real tile geometry belongs to the external
                        // encoder; here we hand it each tile's bytes in map
                        // order as the input to the save filter's apply_fn.
                        let composite = if let Some(image) = whole_image {
                            Some(image)
                        } else {
                            let mut bytes = Vec::new();
                            for tile in &required {
                                if let Some(image) = tile_cache.get(*tile, tile_map_id) {
                                    bytes.extend_from_slice(image.data());
                                }
                            }
                            if bytes.is_empty() {
                                None
                            } else {
                                Some(Image::new(bytes, full_size, full_size, crate::types::ZLevel::Full))
                            }
                        };
                        filter.apply_fn_with(composite.as_ref(), &params)
                    }),
                ))
            }
        }
    }

    /// Drain any finished result and fold it into File/cache state. Returns
    /// whether a result was processed.
    pub fn poll_completed(&mut self) -> bool {
        let Some(result) = self.threads.poll_result() else {
            return false;
        };
        self.complete(Completion { task: result.meta, generation: result.generation, result: result.result });
        true
    }

    /// Block until a result is posted or `timeout_ms` elapses; folds it in
    /// if one arrived. Returns whether a result was processed.
    pub fn wait_for_completed(&mut self, timeout_ms: u64) -> bool {
        let Some(result) = self.threads.wait_for_result(timeout_ms) else {
            return false;
        };
        self.complete(Completion { task: result.meta, generation: result.generation, result: result.result });
        true
    }

    fn complete(&mut self, completion: Completion) {
        let stale = !self.scheduler.is_current(completion.generation);
        match completion.task {
            Task::RenderLevel { file_id, level, index } => match completion.result {
                Ok(image) => {
                    if !stale {
                        if let Some(file) = self.files.get(&file_id) {
                            if let Some(cache) = file.level_cache(level) {
                                cache.insert(index, image);
                            }
                        }
                    }
                }
                Err(err) => self.report(err),
            },
            Task::ThumbnailLoad { file_id, level, index } => match completion.result {
                Ok(image) => {
                    if let Some(file) = self.files.get_mut(&file_id) {
                        if !stale {
                            if let Some(cache) = file.level_cache(level) {
                                cache.insert(index, image);
                            }
                        }
                        file.mark_thumbnail_on_disk(level);
                    }
                }
                Err(err) => self.report(err),
            },
            Task::ThumbnailSave { file_id, level, index: _ } => match completion.result {
                Ok(_) => {
                    if let Some(file) = self.files.get_mut(&file_id) {
                        file.mark_thumbnail_saved(level);
                        file.mark_thumbnail_on_disk(level);
                    }
                }
                Err(err) => self.report(err),
            },
            Task::ThumbnailerRequest { file_id } => match completion.result {
                Ok(_) => {
                    if let Some(file) = self.files.get_mut(&file_id) {
                        file.mark_thumbnail_on_disk(0);
                    }
                }
                Err(err) => {
                    if let Some(file) = self.files.get_mut(&file_id) {
                        file.set_supported(false);
                    }
                    self.report(err);
                }
            },
            Task::SaveStep { file_id, step: SaveStep::FilterTile(tile) } => match completion.result {
                Ok(image) => {
                    let tile_map_id = self
                        .files
                        .get(&file_id)
                        .and_then(|f| f.stack.save_command())
                        .and_then(|c| c.tile_map.as_ref())
                        .map(|m| m.id);
                    if let Some(tile_map_id) = tile_map_id {
                        self.tile_cache.put(tile, tile_map_id, image);
                    }
                    if !stale {
                        if let Some(file) = self.files.get_mut(&file_id) {
                            if let Some(map) = file.stack.save_map_mut() {
                                for idx in 0..map.buffer_count() {
                                    map.mark_tile_satisfied(idx, tile);
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    self.abort_save_on_error(file_id, err);
                }
            },
            Task::SaveStep { file_id, step: SaveStep::EncodeBuffer(index) } => match completion.result {
                Ok(image) => {
                    let complete = match self.files.get_mut(&file_id) {
                        Some(file) => {
                            file.record_encoded_buffer(index, image.data().to_vec());
                            match file.stack.save_map_mut() {
                                Some(map) => {
                                    map.mark_flushed(index);
                                    map.is_complete()
                                }
                                None => false,
                            }
                        }
                        None => false,
                    };
                    if complete {
                        if let Err(err) = self.conclude_save_internal(file_id) {
                            self.abort_save_on_error(file_id, err);
                        }
                    }
                }
                Err(err) => {
                    self.abort_save_on_error(file_id, err);
                }
            },
        }
    }

    fn abort_save_on_error(&mut self, file_id: u64, err: EngineError) {
        if let Some(file) = self.files.get_mut(&file_id) {
            file.abort_save();
        }
        self.report(err);
    }

    /// `concludeSave` finisher: writes the accumulated encoded bytes to the
    /// working file (or the `save_as` target), advances `savedIndex`,
    /// rewrites command 0, and (if configured) serializes the finished
    /// stack to the edit history path. A write failure leaves the working
    /// file and `savedIndex` untouched; the caller aborts the save instead.
    fn conclude_save_internal(&mut self, file_id: u64) -> EngineResult<()> {
        let Some(file) = self.files.get_mut(&file_id) else { return Ok(()) };
        let Some(save_command) = file.stack.save_command() else { return Ok(()) };
        let new_load_filter = Arc::clone(&save_command.filter);
        let target = file.save_target().cloned();
        let encoded = file.take_encoded_output();

        if let Some((target_path, is_save_as)) = target {
            self.write_save_output(file_id, &target_path, is_save_as, &encoded)?;
        }

        let file = self.files.get_mut(&file_id).expect("file present for the duration of save conclusion");
        file.conclude_save(new_load_filter);

        if let Some(history_dir) = self.config.edit_history_path() {
            if let Err(err) = self.write_edit_history(history_dir, file_id) {
                self.report(err.from_source(ErrorSource::CrashDump));
            }
        }
        Ok(())
    }

    /// Write `bytes` to the working path (or `save_as` target): a
    /// temp file under the configured temporary directory, then an
    /// atomic replace onto `target_path`. On a plain `save()` (not
    /// `save_as`), the pre-existing working file is copied to
    /// `<dir>/.original/<basename>` first, but only the first time —
    /// a later save must not clobber that pristine backup.
    fn write_save_output(&self, file_id: u64, target_path: &Path, is_save_as: bool, bytes: &[u8]) -> EngineResult<()> {
        let file = self.files.get(&file_id).ok_or_else(|| EngineError::FileNonexistent(PathBuf::new()))?;

        if !is_save_as && !file.original_file_name.exists() && file.file_name.exists() {
            if let Some(parent) = file.original_file_name.parent() {
                fs::create_dir_all(parent).map_err(|_| EngineError::DirCreate(parent.to_path_buf()))?;
            }
            fs::copy(&file.file_name, &file.original_file_name)
                .map_err(|_| EngineError::FileWrite(file.original_file_name.clone()))?;
        }

        let temp_dir = self.config.temporary_file_path();
        fs::create_dir_all(temp_dir).map_err(|_| EngineError::DirCreate(temp_dir.clone()))?;
        let temp_path = temp_dir.join(format!(".quill-save-{file_id}-{}.tmp", next_temp_suffix()));
        fs::write(&temp_path, bytes).map_err(|_| EngineError::FileOpenForWrite(temp_path.clone()))?;

        if let Some(parent) = target_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|_| EngineError::DirCreate(parent.to_path_buf()))?;
        }
        atomic_replace(&temp_path, target_path).map_err(|_| EngineError::FileWrite(target_path.to_path_buf()))?;
        Ok(())
    }

    fn write_edit_history(&self, history_dir: &Path, file_id: u64) -> EngineResult<()> {
        let file = self.files.get(&file_id).ok_or_else(|| EngineError::FileNonexistent(PathBuf::new()))?;
        let dump = self.dump_file(file);
        let path = crash_dump::edit_history_path(history_dir, &file.file_name);
        std::fs::create_dir_all(history_dir).map_err(|_| EngineError::DirCreate(history_dir.to_path_buf()))?;
        let xml = quick_xml::se::to_string(&dump).map_err(EngineError::from)?;
        std::fs::write(&path, xml).map_err(|_| EngineError::FileWrite(path))?;
        Ok(())
    }

    /// Block until every File's `savedIndex == index`, or `timeout_ms`
    /// elapses. Returns whether completion won (`waitUntilFinished`).
    pub fn wait_until_finished(&mut self, timeout_ms: u64) -> bool {
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
        loop {
            if self.all_saved() {
                return true;
            }
            if self.dispatch_next().is_err() {
                // worker busy; fall through to waiting for its result
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return self.all_saved();
            }
            if !self.wait_for_completed(remaining.as_millis() as u64) && !self.threads.is_busy() {
                // nothing in flight and nothing to dispatch: quiescent
                if self.suggest_new_task().is_none() {
                    return self.all_saved();
                }
            }
        }
    }

    fn all_saved(&self) -> bool {
        self.files.values().all(|f| !f.is_dirty())
    }

    // -- Crash dump -------------------------------------------------------

    fn dump_file(&self, file: &File) -> DumpFile {
        let commands = file
            .stack
            .commands()
            .iter()
            .map(|c| dump_command(c))
            .collect();
        DumpFile {
            file_name: file.file_name.to_string_lossy().into_owned(),
            target_format: file.target_format.clone(),
            original_file_name: file.original_file_name.to_string_lossy().into_owned(),
            read_only: file.is_read_only(),
            index: file.stack.index(),
            saved_index: file.stack.saved_index(),
            commands,
        }
    }

    /// Write a crash dump of every dirty-or-saving File.
    pub fn dump(&self) -> EngineResult<()> {
        let Some(path) = self.config.crash_dump_path().cloned() else {
            return Ok(());
        };
        let files: Vec<DumpFile> = self
            .files
            .values()
            .filter(|f| f.is_dirty() || f.is_save_in_progress())
            .map(|f| self.dump_file(f))
            .collect();
        if files.is_empty() {
            return Ok(());
        }
        crash_dump::dump(&path, &files)
    }

    pub fn can_recover(&self) -> bool {
        match self.config.crash_dump_path() {
            Some(path) => crash_dump::can_recover(path, !self.files.is_empty()),
            None => false,
        }
    }

    /// Reconstitute Files from the crash dump and immediately re-issue
    /// their `save()`. A marker (empty) dump is written first so a crash
    /// mid-recovery does not loop.
    pub fn recover(&mut self, resolver: &dyn FilterResolver, save_filter: Arc<FilterHandle>) -> EngineResult<Vec<u64>> {
        let path = self.config.crash_dump_path().cloned().ok_or_else(|| {
            EngineError::FileNonexistent(PathBuf::new()).from_source(ErrorSource::CrashDump)
        })?;
        let doc: DumpDocument = crash_dump::recover(&path)?;
        crash_dump::dump(&path, &[])?;

        self.config.freeze();
        let mut recovered = Vec::new();
        for dumped in doc.files {
            let file_name = PathBuf::from(&dumped.file_name);
            let id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
            let order = self.next_insertion_order.fetch_add(1, Ordering::Relaxed);
            let mut file = File::new(id, order, file_name.clone(), &self.config.levels().0);
            file.target_format = dumped.target_format.clone();
            file.original_file_name = PathBuf::from(&dumped.original_file_name);
            if dumped.read_only {
                file.set_read_only();
            }

            let mut commands = Vec::with_capacity(dumped.commands.len());
            for dumped_command in &dumped.commands {
                let mut params = BTreeMap::new();
                for param in &dumped_command.params {
                    params.insert(param.name.clone(), param.to_value()?);
                }
                let filter = resolver
                    .resolve(&dumped_command.filter_name, &params)
                    .ok_or_else(|| EngineError::FilterGenerator(dumped_command.filter_name.clone()))?;
                let mut command = FilterCommand::new(filter, commands.len());
                command.session_id = dumped_command.session_id;
                commands.push(command);
            }
            file.stack.restore_from_dump(commands, dumped.index, dumped.saved_index);

            self.path_index.insert(file_name, id);
            self.files.insert(id, file);
            recovered.push(id);
        }

        self.scheduler.invalidate();
        for id in &recovered {
            self.save(*id, Arc::clone(&save_filter));
        }
        Ok(recovered)
    }
}

static NEXT_TEMP_SUFFIX: AtomicU64 = AtomicU64::new(0);

fn next_temp_suffix() -> u64 {
    NEXT_TEMP_SUFFIX.fetch_add(1, Ordering::Relaxed)
}

/// Rename `temp_path` onto `target_path`, falling back to copy-then-remove
/// if they live on different filesystems (rename can't cross those).
fn atomic_replace(temp_path: &Path, target_path: &Path) -> std::io::Result<()> {
    match fs::rename(temp_path, target_path) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(temp_path, target_path)?;
            fs::remove_file(temp_path)?;
            Ok(())
        }
    }
}

fn dump_command(command: &FilterCommand) -> DumpCommand {
    let params = command
        .filter
        .params
        .iter()
        .filter_map(|(name, value)| DumpParam::from_value(name.clone(), value).ok())
        .collect();
    DumpCommand {
        unique_id: command.unique_id,
        filter_name: command.filter.name.clone(),
        session_id: command.session_id,
        params,
    }
}
