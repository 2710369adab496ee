//! External thumbnailer protocol collaborator.
//!
//! One request in flight at a time, a queue keyed by
//! `(uri, mime type, flavor)`, and a result that is either a generated
//! thumbnail path or an error code plus message that demotes the File to
//! `Unsupported`. The transport itself (D-Bus, typically) is external to
//! this crate; this module only defines the request/response contract
//! and the FreeDesktop thumbnail path convention.

use std::path::{Path, PathBuf};

/// One outstanding request, keyed by the single in-flight task a
/// D-Bus-style thumbnailer tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailRequest {
    pub uri: String,
    pub mime_type: String,
    pub flavor: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThumbnailOutcome {
    Generated { path: PathBuf },
    Error { code: u32, message: String },
}

/// Collaborator applications implement to bridge to whatever out-of-
/// process thumbnailer service is available (D-Bus tumbler, a platform
/// service, or a stub for testing). Exactly one request may be in flight;
/// the engine enforces that invariant, not this trait.
pub trait Thumbnailer: Send + Sync {
    fn request(&self, request: &ThumbnailRequest) -> ThumbnailOutcome;
}

/// `<thumbBaseDir>/<flavor>/<md5(uri)>.<ext>`, per the FreeDesktop
/// thumbnail naming convention.
pub fn thumbnail_path(base_dir: &Path, flavor: &str, uri: &str, extension: &str) -> PathBuf {
    let digest = md5::compute(uri.as_bytes());
    let hash = format!("{digest:x}");
    base_dir.join(flavor).join(format!("{hash}.{extension}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thumbnail_path_is_deterministic() {
        let a = thumbnail_path(Path::new("/home/user/.thumbnails"), "normal", "file:///tmp/a.jpg", "png");
        let b = thumbnail_path(Path::new("/home/user/.thumbnails"), "normal", "file:///tmp/a.jpg", "png");
        assert_eq!(a, b);
        assert!(a.starts_with("/home/user/.thumbnails/normal"));
        assert_eq!(a.extension().unwrap(), "png");
    }

    #[test]
    fn different_uris_hash_differently() {
        let a = thumbnail_path(Path::new("/thumbs"), "normal", "file:///tmp/a.jpg", "png");
        let b = thumbnail_path(Path::new("/thumbs"), "normal", "file:///tmp/b.jpg", "png");
        assert_ne!(a, b);
    }
}
