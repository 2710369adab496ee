//! End-to-end scenario tests covering undo/redo, session grouping,
//! per-level rendering, tiled saving, and the revert checkpoint.
//!
//! These drive a real [`Engine`] through `dispatch_next`/`wait_for_completed`
//! the way a host application's event loop would, using small synthetic
//! filters that stand in for the external filter library.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::tempdir;

use quill_engine::display_level::DisplayLevelConfig;
use quill_engine::filter::{FilterHandle, FilterRole};
use quill_engine::thread_manager::Busy;
use quill_engine::types::{Image, Size, ZLevel};
use quill_engine::value::Value;
use quill_engine::{Engine, EngineConfig};

fn solid_image(size: Size) -> Image {
    let bytes: Vec<u8> = (0..size.area()).map(|i| (i % 256) as u8).collect();
    Image::new(bytes, size, size, ZLevel::Full)
}

/// A load filter that produces a `full_size` checkerboard, honoring the
/// `targetSize` parameter `Engine` binds per level.
fn load_filter(full_size: Size) -> Arc<FilterHandle> {
    Arc::new(FilterHandle::new(
        "load",
        FilterRole::Load,
        BTreeMap::new(),
        false,
        Arc::new(move |_input, params| {
            let target = params.get("targetSize").and_then(Value::as_size).unwrap_or(full_size);
            Ok(solid_image(target))
        }),
        Arc::new(move |_prev, _params| full_size),
    ))
}

fn brightness_filter(delta: i16) -> Arc<FilterHandle> {
    Arc::new(FilterHandle::new(
        "brightness",
        FilterRole::Transform,
        BTreeMap::from([("delta".to_string(), Value::Int(delta as i64))]),
        true,
        Arc::new(move |input, _params| {
            let input = input.ok_or_else(|| quill_engine::EngineError::ImageSize(Size::default()))?;
            let bytes: Vec<u8> = input.data().iter().map(|b| (*b as i16 + delta).clamp(0, 255) as u8).collect();
            Ok(Image::new(bytes, input.size, input.full_image_size, input.z_level))
        }),
        Arc::new(|prev, _params| prev),
    ))
}

fn flip_horizontal_filter() -> Arc<FilterHandle> {
    Arc::new(FilterHandle::new(
        "flip-horizontal",
        FilterRole::Transform,
        BTreeMap::new(),
        true,
        Arc::new(|input, _params| {
            let input = input.ok_or_else(|| quill_engine::EngineError::ImageSize(Size::default()))?;
            let width = input.size.width as usize;
            let height = input.size.height as usize;
            let mut bytes = vec![0u8; input.data().len()];
            for row in 0..height {
                let src_row = &input.data()[row * width..(row + 1) * width];
                let dst_row = &mut bytes[row * width..(row + 1) * width];
                for (col, value) in src_row.iter().rev().enumerate() {
                    dst_row[col] = *value;
                }
            }
            Ok(Image::new(bytes, input.size, input.full_image_size, input.z_level))
        }),
        Arc::new(|prev, _params| prev),
    ))
}

/// Passthrough save filter, standing in for an encoder (an external
/// collaborator).
fn save_filter() -> Arc<FilterHandle> {
    Arc::new(FilterHandle::new(
        "save",
        FilterRole::Save,
        BTreeMap::new(),
        false,
        Arc::new(|input, _params| input.cloned().ok_or_else(|| quill_engine::EngineError::ImageSize(Size::default()))),
        Arc::new(|prev, _params| prev),
    ))
}

/// Pump dispatch/complete until `done` holds, or panic after a generous
/// iteration budget (a stuck scheduler is a test failure, not a hang).
fn run_until<F: Fn(&Engine) -> bool>(engine: &mut Engine, done: F) {
    for _ in 0..500 {
        if done(engine) {
            return;
        }
        match engine.dispatch_next() {
            Ok(true) => {
                engine.wait_for_completed(2000);
            }
            Ok(false) => {
                if done(engine) {
                    return;
                }
                panic!("scheduler produced no task but the expected condition never held");
            }
            Err(Busy) => {
                engine.wait_for_completed(2000);
            }
        }
    }
    panic!("run_until exceeded its iteration budget");
}

/// S1: open a 4x4 image, push brightness+20 then contrast+20 (a second
/// brightness-shaped filter), save. Saving must drive the file clean, write
/// the encoded bytes to the working path, back up the pre-existing file to
/// `.original/`, and a second `save()` must then enqueue no work.
#[test]
fn s1_push_two_filters_then_save_reaches_clean() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s1.png");
    std::fs::write(&path, b"pre-existing bytes").unwrap();

    let mut engine = Engine::new(EngineConfig::new());
    let id = engine.open(path.clone(), load_filter(Size::new(4, 4)));

    engine.run_filter(id, brightness_filter(20)).unwrap();
    engine.run_filter(id, brightness_filter(20)).unwrap();
    assert!(engine.file(id).unwrap().is_dirty());

    let full_level = engine.config().levels().full_level();
    engine.set_display_level(id, full_level);
    run_until(&mut engine, |e| {
        let stack_index = e.file(id).unwrap().stack.index().saturating_sub(1);
        e.file(id).unwrap().level_cache(full_level).unwrap().contains(stack_index)
    });

    assert!(engine.save(id, save_filter()));
    run_until(&mut engine, |e| !e.file(id).unwrap().is_dirty());

    let file = engine.file(id).unwrap();
    assert_eq!(file.stack.saved_index(), file.stack.index());
    assert!(!file.is_save_in_progress());

    assert_eq!(std::fs::read(&path).unwrap().len(), 16, "the working path now holds the encoded save output");
    let original = dir.path().join(".original").join("s1.png");
    assert_eq!(
        std::fs::read(&original).unwrap(),
        b"pre-existing bytes",
        "the first save on a file with pre-existing content backs it up before overwriting it"
    );

    assert!(!engine.save(id, save_filter()), "save() on a clean file must enqueue no work");
}

/// S2: push A, B, C; undo twice leaves a redo tail of [B, C]. Pushing D
/// truncates that tail.
#[test]
fn s2_push_truncates_redo_tail() {
    let mut engine = Engine::new(EngineConfig::new());
    let id = engine.open(PathBuf::from("/tmp/s2.png"), load_filter(Size::new(4, 4)));

    engine.run_filter(id, brightness_filter(1)).unwrap(); // A
    engine.run_filter(id, brightness_filter(2)).unwrap(); // B
    engine.run_filter(id, brightness_filter(3)).unwrap(); // C
    assert_eq!(engine.file(id).unwrap().stack.index(), 4);

    engine.undo(id);
    engine.undo(id);
    assert_eq!(engine.file(id).unwrap().stack.index(), 2);
    assert!(engine.file(id).unwrap().can_redo());

    engine.run_filter(id, brightness_filter(4)).unwrap(); // D
    assert!(!engine.file(id).unwrap().can_redo(), "pushing D must drop the old redo tail");
    assert_eq!(engine.file(id).unwrap().stack.index(), 3);
    assert_eq!(engine.file(id).unwrap().stack.count(), 3);
}

/// S3: a session around A and B groups them as one undo unit; C outside the
/// session is its own step.
#[test]
fn s3_session_grouping_undoes_and_redoes_as_one_unit() {
    let mut engine = Engine::new(EngineConfig::new());
    let id = engine.open(PathBuf::from("/tmp/s3.png"), load_filter(Size::new(4, 4)));

    engine.start_session(id);
    engine.run_filter(id, brightness_filter(1)).unwrap(); // A
    engine.run_filter(id, brightness_filter(2)).unwrap(); // B
    engine.end_session(id);
    engine.run_filter(id, brightness_filter(3)).unwrap(); // C
    assert_eq!(engine.file(id).unwrap().stack.index(), 4);

    engine.undo(id); // removes C alone
    assert_eq!(engine.file(id).unwrap().stack.index(), 3);

    engine.undo(id); // removes A and B together
    assert_eq!(engine.file(id).unwrap().stack.index(), 1);

    engine.redo(id); // reapplies A and B together
    assert_eq!(engine.file(id).unwrap().stack.index(), 3);
}

/// S4: preview level 0 sized 8x2, opening a 16x4 image. Level 0 renders at
/// 8x2; the full level renders at the untouched 16x4.
#[test]
fn s4_cropped_and_full_levels_render_at_their_configured_sizes() {
    let mut config = EngineConfig::new();
    config.set_display_level(0, DisplayLevelConfig::new(Size::new(8, 2)));
    config.set_display_level(1, DisplayLevelConfig::new(Size::new(4096, 4096)));

    let mut engine = Engine::new(config);
    let id = engine.open(PathBuf::from("/tmp/s4.png"), load_filter(Size::new(16, 4)));

    let full_level = engine.config().levels().full_level();
    engine.set_display_level(id, full_level);
    run_until(&mut engine, |e| {
        let f = e.file(id).unwrap();
        f.level_cache(0).unwrap().contains(0) && f.level_cache(full_level).unwrap().contains(0)
    });

    let level0_image = engine.file(id).unwrap().level_cache(0).unwrap().get(0).unwrap();
    assert_eq!(level0_image.size, Size::new(8, 2));

    let full_image = engine.file(id).unwrap().level_cache(full_level).unwrap().get(0).unwrap();
    assert_eq!(full_image.size, Size::new(16, 4));
}

/// S5: a 4x4 image tiled 2x2, saved with a buffer budget of 4 output
/// buffers. Every distinct tile is filtered exactly once even though two
/// buffers each need the same tile row: the `mark_tile_satisfied`-across-
/// all-buffers step lets one `FilterTile` result satisfy every buffer
/// waiting on it.
#[test]
fn s5_tiled_save_produces_one_buffer_per_budget_unit_and_filters_each_tile_once() {
    let mut config = EngineConfig::new();
    config.set_default_tile_size(Size::new(2, 2));
    config.set_save_buffer_size(quill_engine::config::SaveBufferSize { bytes: 4, count: 4 });
    config.set_tile_cache_size(32);

    let mut engine = Engine::new(config);
    let dir = tempdir().unwrap();
    let path = dir.path().join("s5.png");
    let id = engine.open(path.clone(), load_filter(Size::new(4, 4)));

    engine.run_filter(id, flip_horizontal_filter()).unwrap();

    // Seed the tile cache as if the flip had already been rendered for
    // viewing: one source tile per grid cell, keyed under the current
    // command's tile map generation.
    let current_tile_map = engine.file(id).unwrap().stack.current_command().unwrap().tile_map.clone().unwrap();
    for (col, row) in current_tile_map.cells() {
        let tile_id = current_tile_map.tile_id(col, row);
        engine.tile_cache().put(tile_id, current_tile_map.id, solid_image(Size::new(2, 2)));
    }

    assert!(engine.save(id, save_filter()));
    let save_tile_map_id = engine.file(id).unwrap().stack.save_command().unwrap().tile_map.as_ref().unwrap().id;
    {
        let save_map = engine.file(id).unwrap().stack.save_map().unwrap();
        assert_eq!(save_map.buffer_count(), 4, "16 pixels / 4-pixel budget = 4 output buffers");
    }

    run_until(&mut engine, |e| !e.file(id).unwrap().is_save_in_progress());
    assert!(!engine.file(id).unwrap().is_dirty());

    // Each grid cell's slot now holds the save generation's output, not the
    // seeded source generation: the TileCache holds one entry per tile id,
    // so a tile filtered once overwrites its own source entry rather than
    // coexisting alongside it.
    for (col, row) in current_tile_map.cells() {
        let tile_id = current_tile_map.tile_id(col, row);
        assert!(
            engine.tile_cache().get(tile_id, save_tile_map_id).is_some(),
            "every grid cell must have been filtered into the save generation exactly once"
        );
        assert!(
            engine.tile_cache().get(tile_id, current_tile_map.id).is_none(),
            "the seeded source generation must no longer be current for this tile id"
        );
    }

    assert_eq!(
        std::fs::read(&path).unwrap().len(),
        16,
        "the four tile buffers concatenate to the full 16-pixel image on disk"
    );
}

/// S6: reverting then pushing a new filter clears the revert checkpoint and
/// makes `restore()` unavailable.
#[test]
fn s6_push_after_revert_clears_the_checkpoint() {
    let mut engine = Engine::new(EngineConfig::new());
    let id = engine.open(PathBuf::from("/tmp/s6.png"), load_filter(Size::new(4, 4)));

    engine.run_filter(id, brightness_filter(1)).unwrap();
    engine.run_filter(id, brightness_filter(2)).unwrap();
    engine.run_filter(id, brightness_filter(3)).unwrap();
    assert_eq!(engine.file(id).unwrap().stack.index(), 4);

    engine.revert(id);
    assert_eq!(engine.file(id).unwrap().stack.index(), 1);
    assert!(engine.file(id).unwrap().can_restore());
    assert_eq!(engine.file(id).unwrap().stack.revert_index(), 4);

    engine.run_filter(id, brightness_filter(5)).unwrap(); // D
    assert!(!engine.file(id).unwrap().can_restore());
    assert_eq!(engine.file(id).unwrap().stack.revert_index(), 0);
}
