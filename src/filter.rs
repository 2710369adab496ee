//! Filter capability set.
//!
//! The filter library (parameter schemas, registry, pixel implementations)
//! is an external collaborator; this module only defines the opaque handle
//! the rest of the engine programs against. Re-expresses inheritance-based
//! filter polymorphism as a flat capability set instead of a class
//! hierarchy: a filter is data (name, parameters, role) plus two function
//! pointers, never a trait object the engine has to downcast.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::EngineResult;
use crate::types::{Image, Size};
use crate::value::Value;

/// What a filter is used for. Drives scheduler priority and whether the
/// filter participates in the tiled save pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterRole {
    /// Produces the synthetic command at stack index 0.
    Load,
    /// Consumes the current image and writes it to disk; not placed on the
    /// undo stack as a normal command.
    Save,
    /// Produces a thumbnail-sized preview, independent of the main stack.
    Preview,
    /// An ordinary edit operation placed on the undo stack.
    Transform,
    /// Produces a filter dynamically (e.g. resolving a generator preset
    /// into concrete transforms); failure is `FilterGeneratorError`.
    Generator,
}

type ApplyFn = dyn Fn(Option<&Image>, &BTreeMap<String, Value>) -> EngineResult<Image> + Send + Sync;
type SizeFn = dyn Fn(Size, &BTreeMap<String, Value>) -> Size + Send + Sync;

/// An opaque, cheaply-cloned handle to a filter bound with parameters.
///
/// `apply` and `new_full_image_size` are supplied by the filter library at
/// construction time; the engine never inspects a filter's identity beyond
/// `name` and `role`.
pub struct FilterHandle {
    pub name: String,
    pub role: FilterRole,
    pub params: BTreeMap<String, Value>,
    /// Whether this filter only reads/writes pixels within a bounded
    /// neighborhood of each output pixel. Spatially-local filters let a
    /// [`TileMap`](crate::tile_map::TileMap) be derived incrementally
    /// instead of invalidated wholesale.
    pub spatially_local: bool,
    apply_fn: Arc<ApplyFn>,
    size_fn: Arc<SizeFn>,
}

impl FilterHandle {
    pub fn new(
        name: impl Into<String>,
        role: FilterRole,
        params: BTreeMap<String, Value>,
        spatially_local: bool,
        apply_fn: Arc<ApplyFn>,
        size_fn: Arc<SizeFn>,
    ) -> Self {
        Self {
            name: name.into(),
            role,
            params,
            spatially_local,
            apply_fn,
            size_fn,
        }
    }

    /// Run this filter against its input (`None` for a Load filter reading
    /// from disk, handled by the filter implementation itself).
    pub fn apply(&self, input: Option<&Image>) -> EngineResult<Image> {
        (self.apply_fn)(input, &self.params)
    }

    /// The full-image size this filter produces given the previous
    /// command's full-image size, per `FilterCommand::fullImageSize`.
    pub fn new_full_image_size(&self, previous: Size) -> Size {
        (self.size_fn)(previous, &self.params)
    }

    /// Run the apply function against caller-supplied parameters instead of
    /// `self.params`. Used by `Engine` to bind per-level `targetSize`/
    /// `targetArea` onto a shared filter without re-registering it.
    pub fn apply_fn_with(&self, input: Option<&Image>, params: &BTreeMap<String, Value>) -> EngineResult<Image> {
        (self.apply_fn)(input, params)
    }

    pub fn size_fn_with(&self, previous: Size, params: &BTreeMap<String, Value>) -> Size {
        (self.size_fn)(previous, params)
    }

    /// An identity transform used by tests that need a placeholder filter
    /// with no real pixel semantics.
    #[cfg(test)]
    pub fn test_identity() -> Self {
        Self::new(
            "identity",
            FilterRole::Transform,
            BTreeMap::new(),
            true,
            Arc::new(|input, _params| {
                input.cloned().ok_or_else(|| {
                    crate::error::EngineError::FilterGenerator("identity requires input".into())
                })
            }),
            Arc::new(|previous, _params| previous),
        )
    }
}

impl fmt::Debug for FilterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterHandle")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("params", &self.params)
            .field("spatially_local", &self.spatially_local)
            .finish()
    }
}
