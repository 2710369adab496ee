//! Shared unit-test fixtures: a synthetic load filter, a couple of simple
//! transforms, and tiny deterministic pixel buffers. Kept internal
//! (`#[cfg(test)]`) since it leans on crate-private constructors that would
//! otherwise have to be exposed publicly just for tests to use.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::filter::{FilterHandle, FilterRole};
use crate::types::{Image, Size, ZLevel};

/// A load filter that "decodes" a fixed-size checkerboard of `size`,
/// ignoring any source path (the decoder itself is an external
/// collaborator).
pub fn load_filter(size: Size) -> Arc<FilterHandle> {
    Arc::new(FilterHandle::new(
        "load",
        FilterRole::Load,
        BTreeMap::new(),
        false,
        Arc::new(move |_input, _params| Ok(solid_image(size))),
        Arc::new(move |_prev, _params| size),
    ))
}

/// A brightness-style transform: adds `delta` to every byte, saturating.
/// Spatially local (each output pixel only depends on itself).
pub fn brightness_filter(delta: i16) -> Arc<FilterHandle> {
    Arc::new(FilterHandle::new(
        "brightness",
        FilterRole::Transform,
        BTreeMap::from([("delta".to_string(), crate::value::Value::Int(delta as i64))]),
        true,
        Arc::new(move |input, _params| {
            let input = input.ok_or_else(|| crate::error::EngineError::ImageSize(Size::default()))?;
            let bytes: Vec<u8> = input
                .data()
                .iter()
                .map(|b| (*b as i16 + delta).clamp(0, 255) as u8)
                .collect();
            Ok(Image::new(bytes, input.size, input.full_image_size, input.z_level))
        }),
        Arc::new(|prev, _params| prev),
    ))
}

/// Horizontal flip: reverses each row. Spatially local within the row.
pub fn flip_horizontal_filter() -> Arc<FilterHandle> {
    Arc::new(FilterHandle::new(
        "flip-horizontal",
        FilterRole::Transform,
        BTreeMap::new(),
        true,
        Arc::new(|input, _params| {
            let input = input.ok_or_else(|| crate::error::EngineError::ImageSize(Size::default()))?;
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

/// A save filter that just hands its input back unchanged, standing in for
/// an encoder that is an external collaborator.
pub fn save_filter() -> Arc<FilterHandle> {
    Arc::new(FilterHandle::new(
        "save",
        FilterRole::Save,
        BTreeMap::new(),
        false,
        Arc::new(|input, _params| input.cloned().ok_or_else(|| crate::error::EngineError::ImageSize(Size::default()))),
        Arc::new(|prev, _params| prev),
    ))
}

pub fn solid_image(size: Size) -> Image {
    let bytes: Vec<u8> = (0..size.area()).map(|i| (i % 256) as u8).collect();
    Image::new(bytes, size, size, ZLevel::Full)
}
