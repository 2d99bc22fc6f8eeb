//! Directory-backed state store.
//!
//! # Storage Layout
//!
//! ```text
//! <state_dir>/
//! ├── .lock                          # advisory lock + holder metadata
//! └── resources/<type>/<name>.json   # {"version": 1, "record": {...}}
//! ```
//!
//! Every record lives in its own file. Writes go to a temporary file in the
//! same directory, are synced, then renamed over the old file, so a crash
//! between two writes never leaves a committed record half-written.
//! Leftover temporary files are ignored by `list_all`.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, trace, warn};

use crate::consts::{RESOURCES_DIR, STATE_FORMAT_VERSION};
use crate::resource::ResourceKey;

use super::StateStore;
use super::lock::{LockMode, StateLock};
use super::types::{StateError, StateRecord};

#[derive(Serialize)]
struct RecordFileRef<'a> {
  version: u32,
  record: &'a StateRecord,
}

#[derive(Deserialize)]
struct RecordFile {
  version: u32,
  record: serde_json::Value,
}

/// State store persisting one JSON file per resource.
#[derive(Debug, Clone)]
pub struct FileStateStore {
  root: PathBuf,
}

impl FileStateStore {
  /// Open (and create if needed) a state directory.
  pub fn open(root: impl AsRef<Path>) -> Result<Self, StateError> {
    let root = root.as_ref();
    fs::create_dir_all(root).map_err(|source| StateError::CreateDir {
      path: root.to_path_buf(),
      source,
    })?;
    let root = dunce::canonicalize(root).map_err(|source| StateError::Read {
      path: root.to_path_buf(),
      source,
    })?;
    debug!(path = %root.display(), "opened state directory");
    Ok(Self { root })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn resources_dir(&self) -> PathBuf {
    self.root.join(RESOURCES_DIR)
  }

  /// Path of the record file for a key.
  ///
  /// Keys are validated first so a name can never escape the state directory.
  pub fn record_path(&self, key: &ResourceKey) -> Result<PathBuf, StateError> {
    ResourceKey::parse_parts(&key.resource_type, &key.name).map_err(|source| StateError::InvalidKey {
      key: key.clone(),
      source,
    })?;
    Ok(
      self
        .resources_dir()
        .join(&key.resource_type)
        .join(format!("{}.json", key.name)),
    )
  }

  /// Load a record file, or `None` if it is gone.
  fn load_file(&self, path: &Path) -> Result<Option<StateRecord>, StateError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(source) => {
        return Err(StateError::Read {
          path: path.to_path_buf(),
          source,
        });
      }
    };
    parse_record(path, &content).map(Some)
  }
}

fn parse_record(path: &Path, content: &str) -> Result<StateRecord, StateError> {
  let parse_err = |source| StateError::Parse {
    path: path.to_path_buf(),
    source,
  };

  let file: RecordFile = serde_json::from_str(content).map_err(parse_err)?;
  if file.version != STATE_FORMAT_VERSION {
    return Err(StateError::UnsupportedVersion {
      path: path.to_path_buf(),
      version: file.version,
    });
  }
  serde_json::from_value(file.record).map_err(parse_err)
}

/// Write `content` to `path` via a synced temporary file and a rename.
fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StateError> {
  let write_err = |source| StateError::Write {
    path: path.to_path_buf(),
    source,
  };

  let dir = path
    .parent()
    .ok_or_else(|| write_err(io::Error::other("record path has no parent directory")))?;
  fs::create_dir_all(dir).map_err(|source| StateError::CreateDir {
    path: dir.to_path_buf(),
    source,
  })?;

  let mut temp = NamedTempFile::new_in(dir).map_err(write_err)?;
  temp.write_all(content).map_err(write_err)?;
  temp.as_file().sync_all().map_err(write_err)?;
  temp.persist(path).map_err(|e| write_err(e.error))?;

  sync_dir(dir);
  Ok(())
}

/// Make a rename or unlink in `dir` durable.
///
/// The change itself already happened, so a failed sync is only logged.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
  if let Err(e) = fs::File::open(dir).and_then(|handle| handle.sync_all()) {
    warn!(path = %dir.display(), error = %e, "failed to sync state directory");
  }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

impl StateStore for FileStateStore {
  fn get(&self, key: &ResourceKey) -> Result<Option<StateRecord>, StateError> {
    let path = self.record_path(key)?;
    let Some(record) = self.load_file(&path)? else {
      return Ok(None);
    };
    if &record.key != key {
      return Err(StateError::KeyMismatch {
        path,
        expected: key.clone(),
        found: record.key,
      });
    }
    Ok(Some(record))
  }

  fn put(&self, record: StateRecord) -> Result<(), StateError> {
    let path = self.record_path(&record.key)?;
    let content = serde_json::to_vec_pretty(&RecordFileRef {
      version: STATE_FORMAT_VERSION,
      record: &record,
    })
    .map_err(StateError::Serialize)?;

    write_atomic(&path, &content)?;
    trace!(key = %record.key, path = %path.display(), "wrote state record");
    Ok(())
  }

  fn remove(&self, key: &ResourceKey) -> Result<bool, StateError> {
    let path = self.record_path(key)?;
    match fs::remove_file(&path) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
      Err(source) => return Err(StateError::Write { path, source }),
    }

    // Drop the type directory once its last record is gone; a non-empty
    // directory simply stays.
    if let Some(dir) = path.parent() {
      match fs::remove_dir(dir) {
        Ok(()) => {
          if let Some(resources) = dir.parent() {
            sync_dir(resources);
          }
        }
        Err(_) => sync_dir(dir),
      }
    }
    trace!(key = %key, "removed state record");
    Ok(true)
  }

  fn list_all(&self) -> Result<Vec<StateRecord>, StateError> {
    let resources = self.resources_dir();
    let type_dirs = match fs::read_dir(&resources) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(source) => return Err(StateError::Read { path: resources, source }),
    };

    let read_err = |path: &Path| {
      let path = path.to_path_buf();
      move |source| StateError::Read { path, source }
    };

    let mut records = Vec::new();
    for type_entry in type_dirs {
      let type_entry = type_entry.map_err(read_err(&resources))?;
      let type_path = type_entry.path();
      if !type_path.is_dir() {
        continue;
      }

      // A concurrent remove may delete a record, or its emptied type
      // directory, between listing and reading. Either is an absent record.
      let entries = match fs::read_dir(&type_path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
        Err(source) => return Err(StateError::Read { path: type_path, source }),
      };
      for entry in entries {
        let path = entry.map_err(read_err(&type_path))?.path();
        if !path.is_file() || path.extension().is_none_or(|ext| ext != "json") {
          continue;
        }
        if let Some(record) = self.load_file(&path)? {
          records.push(record);
        }
      }
    }

    records.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(records)
  }

  fn lock(&self, mode: LockMode, operation: &str) -> Result<StateLock, StateError> {
    Ok(StateLock::acquire_file(&self.root, mode, operation)?)
  }
}
