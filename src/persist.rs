//! Durable file helpers shared by the ledger, caches, and phase outputs
//!
//! Every write goes to a temp file in the destination directory and is then
//! renamed over the target, so a crash mid-write never leaves a half-written
//! file behind. State files are pretty-printed JSON so operators can read,
//! diff, and hand-edit them.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Errors from reading or writing persisted files
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("YAML error in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

impl PersistError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn json(path: &Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result type for persistence operations
pub type PersistResult<T> = Result<T, PersistError>;

/// Atomically replace `path` with `bytes`.
///
/// Creates the parent directory if needed.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> PersistResult<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent).map_err(|e| PersistError::io(&parent, e))?;

    let mut tmp = NamedTempFile::new_in(&parent).map_err(|e| PersistError::io(path, e))?;
    tmp.write_all(bytes).map_err(|e| PersistError::io(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| PersistError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| PersistError::io(path, e.error))?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> PersistResult<()> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|e| PersistError::json(path, e))?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

/// Read a JSON file, returning `None` if it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> PersistResult<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PersistError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| PersistError::json(path, e))
}

/// Serialize rows to CSV (with header) and write them atomically.
///
/// An empty row set still produces a file so downstream phases can tell
/// "nothing relevant" apart from "never written".
pub fn write_csv<T: Serialize>(path: &Path, headers: &[&str], rows: &[T]) -> PersistResult<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .write_record(headers)
        .map_err(|e| PersistError::csv(path, e))?;
    for row in rows {
        writer.serialize(row).map_err(|e| PersistError::csv(path, e))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| PersistError::io(path, e.into_error()))?;
    write_atomic(path, &bytes)
}

/// Read all rows from a CSV file, returning `None` if it does not exist.
pub fn read_csv<T: DeserializeOwned>(path: &Path) -> PersistResult<Option<Vec<T>>> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PersistError::io(path, e)),
    };
    let mut reader = csv::Reader::from_reader(file);
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row.map_err(|e| PersistError::csv(path, e))?);
    }
    Ok(Some(rows))
}

/// A JSON-backed document held in memory and flushed on `save()`.
///
/// With no path the document lives only in memory, which is what tests use.
#[derive(Debug)]
pub struct JsonDocument<T> {
    path: Option<PathBuf>,
    value: T,
}

impl<T> JsonDocument<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Load from `path`, starting from `T::default()` if the file is absent.
    pub fn open(path: impl Into<PathBuf>) -> PersistResult<Self> {
        let path = path.into();
        let value = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path: Some(path),
            value,
        })
    }

    /// A document that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            value: T::default(),
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.value
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Flush the current value to disk.
    pub fn save(&self) -> PersistResult<()> {
        match &self.path {
            Some(path) => write_json(path, &self.value),
            None => Ok(()),
        }
    }
}
