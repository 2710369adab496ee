//! Crash dump and recovery.
//!
//! Walks every File, serializing its stack rather than its pixels. The
//! document shape is expressed as plain `serde`-derived structs and
//! read/written with `quick-xml`, since the filter parameter alphabet is
//! already the closed [`Value`] union and serializes without any custom
//! variant handling.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{EngineError, EngineResult, ErrorSource};
use crate::value::Value;

pub const DUMP_FILE_NAME: &str = "dump.xml";

/// One filter parameter, written as `<param name="..." kind="...">json</param>`:
/// `kind` names the [`Value`] variant, the element text is that variant's
/// JSON payload. A tag-plus-string-representation round trip for each
/// parameter, without hand-rolling a parser per type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpParam {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@kind")]
    pub kind: String,
    #[serde(rename = "$text")]
    pub json: String,
}

impl DumpParam {
    pub fn from_value(name: impl Into<String>, value: &Value) -> EngineResult<Self> {
        let kind = value_kind(value).to_string();
        let json = serde_json::to_string(value)?;
        Ok(Self { name: name.into(), kind, json })
    }

    pub fn to_value(&self) -> EngineResult<Value> {
        Ok(serde_json::from_str(&self.json)?)
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Int(_) => "int",
        Value::Double(_) => "double",
        Value::String(_) => "string",
        Value::Bytes(_) => "bytes",
        Value::Size(_) => "size",
        Value::Rect(_) => "rect",
        Value::Point(_) => "point",
        Value::Color(_) => "color",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpCommand {
    #[serde(rename = "@uniqueId")]
    pub unique_id: u64,
    #[serde(rename = "@filterName")]
    pub filter_name: String,
    #[serde(rename = "@sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
    #[serde(rename = "param", default)]
    pub params: Vec<DumpParam>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpFile {
    #[serde(rename = "@fileName")]
    pub file_name: String,
    #[serde(rename = "@targetFormat", skip_serializing_if = "Option::is_none")]
    pub target_format: Option<String>,
    #[serde(rename = "@originalFileName")]
    pub original_file_name: String,
    #[serde(rename = "@readOnly")]
    pub read_only: bool,
    #[serde(rename = "@index")]
    pub index: usize,
    #[serde(rename = "@savedIndex")]
    pub saved_index: usize,
    #[serde(rename = "command", default)]
    pub commands: Vec<DumpCommand>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename = "dump")]
pub struct DumpDocument {
    #[serde(rename = "file", default)]
    pub files: Vec<DumpFile>,
}

/// Write `files` (already filtered down by the caller to dirty-or-saving
/// Files) to `<crash_dump_path>/dump.xml`. A recovery-in-progress marker
/// dump (an empty-looking document is still a valid, harmless dump) is
/// just a normal call to this function with an empty `files` list skipped
/// entirely when there is nothing to dump and no recovery is in progress.
pub fn dump(crash_dump_path: &Path, files: &[DumpFile]) -> EngineResult<()> {
    fs::create_dir_all(crash_dump_path)
        .map_err(|_| EngineError::DirCreate(crash_dump_path.to_path_buf()).from_source(ErrorSource::CrashDump))?;

    let doc = DumpDocument { files: files.to_vec() };
    let xml = quick_xml::se::to_string(&doc).map_err(EngineError::from).map_err(|e| e.from_source(ErrorSource::CrashDump))?;

    let path = crash_dump_path.join(DUMP_FILE_NAME);
    fs::write(&path, xml).map_err(|_| EngineError::FileWrite(path).from_source(ErrorSource::CrashDump))?;
    Ok(())
}

/// True when no Files are currently registered and a non-empty dump
/// exists.
pub fn can_recover(crash_dump_path: &Path, any_files_open: bool) -> bool {
    if any_files_open {
        return false;
    }
    let path = crash_dump_path.join(DUMP_FILE_NAME);
    match fs::metadata(&path) {
        Ok(meta) => meta.len() > 0,
        Err(_) => false,
    }
}

/// Read back the dump. The caller is responsible for writing a marker
/// dump (an empty `DumpDocument`) before acting on the result, so that a
/// crash mid-recovery does not loop: write the marker immediately after
/// reading, before re-issuing saves.
pub fn recover(crash_dump_path: &Path) -> EngineResult<DumpDocument> {
    let path = crash_dump_path.join(DUMP_FILE_NAME);
    let xml = fs::read_to_string(&path)
        .map_err(|_| EngineError::FileRead(path.clone()).from_source(ErrorSource::CrashDump))?;
    let doc: DumpDocument = quick_xml::de::from_str(&xml)
        .map_err(EngineError::from)
        .map_err(|e| e.from_source(ErrorSource::CrashDump))?;
    Ok(doc)
}

/// `<editHistoryDir>/<lowercase-hex-sha1(canonical path)>`.
pub fn edit_history_path(edit_history_dir: &Path, canonical_path: &Path) -> PathBuf {
    let mut hasher = Sha1::new();
    hasher.update(canonical_path.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    edit_history_dir.join(hex)
}
