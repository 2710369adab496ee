//! Error types for the engine.

use std::path::PathBuf;

use thiserror::Error;

/// Where an error originated, attached to every [`EngineError`] that is
/// routed through an [`ErrorSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    /// The error happened while operating on a specific file.
    File,
    /// The error happened in the crash-dump/recovery subsystem.
    CrashDump,
}

/// Error kinds surfaced to a [`File`](crate::file::File) and/or the
/// engine-wide sink.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("source file does not exist: {0}")]
    FileNonexistent(PathBuf),

    #[error("decoder rejected file contents: {0}")]
    FileCorrupt(PathBuf),

    #[error("no decoder or thumbnailer available for: {0}")]
    FileFormatUnsupported(PathBuf),

    #[error("could not open for reading: {0}")]
    FileOpenForRead(PathBuf),

    #[error("could not open for writing: {0}")]
    FileOpenForWrite(PathBuf),

    #[error("read failed: {0}")]
    FileRead(PathBuf),

    #[error("write failed: {0}")]
    FileWrite(PathBuf),

    #[error("could not create directory: {0}")]
    DirCreate(PathBuf),

    #[error("image dimensions or pixel count exceed configured limits: {0:?}")]
    ImageSize(crate::types::Size),

    #[error("dynamic filter generation produced no filter: {0}")]
    FilterGenerator(String),

    #[error("crash dump error: {0}")]
    CrashDump(#[source] Box<EngineError>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("crash dump xml error: {0}")]
    Xml(String),

    #[error("crash dump parameter encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<quick_xml::de::DeError> for EngineError {
    fn from(err: quick_xml::de::DeError) -> Self {
        EngineError::Xml(err.to_string())
    }
}

impl From<quick_xml::se::SeError> for EngineError {
    fn from(err: quick_xml::se::SeError) -> Self {
        EngineError::Xml(err.to_string())
    }
}

impl EngineError {
    /// Tag this error as having originated from the given source, wrapping
    /// it if it is a crash-dump-path error: crash-dump errors are reported
    /// but never propagated to caller operations.
    pub fn from_source(self, source: ErrorSource) -> Self {
        match source {
            ErrorSource::CrashDump => EngineError::CrashDump(Box::new(self)),
            ErrorSource::File => self,
        }
    }
}

/// Result alias used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;

/// Collaborator that receives errors reported by a [`File`](crate::file::File)
/// or the engine. Applications implement this with a channel sender, a
/// logging bridge, or a UI notification queue.
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: &EngineError);
}

/// An [`ErrorSink`] that only logs via `tracing`. Used as the default sink
/// so errors are never silently dropped even if the host never registers
/// one of their own.
#[derive(Debug, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, error: &EngineError) {
        tracing::error!("{error}");
    }
}
