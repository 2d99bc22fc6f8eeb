//! Advisory locking for state stores.
//!
//! A file-backed store takes an OS-level lock on `<state_dir>/.lock` and
//! writes holder metadata into it so a contended caller can report who holds
//! the state. The in-memory store uses an in-process flag with the same
//! semantics. Locks are never waited on: contention fails immediately.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::consts::LOCK_FILENAME;
use crate::util::unix_now;

const LOCK_METADATA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  /// Read-only access, e.g. computing a plan.
  Shared,
  /// Mutating access, e.g. applying a plan.
  Exclusive,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub operation: String,
  pub state_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum LockError {
  #[error(
    "state is locked by another process: {operation} (PID {pid}, started {started_at})\n\
     If you're sure no converge process is running, remove the lock file:\n  {lock_path}"
  )]
  Contention {
    operation: String,
    pid: u32,
    started_at: String,
    lock_path: PathBuf,
  },

  #[error(
    "state is locked (could not read lock metadata)\n\
     If you're sure no converge process is running, remove the lock file:\n  {lock_path}"
  )]
  ContentionUnknown { lock_path: PathBuf },

  #[error("state is locked by in-process operation: {operation}")]
  Held { operation: String },

  #[error("failed to create state directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error("failed to open lock file: {0}")]
  OpenFile(#[source] io::Error),

  #[error("failed to write lock metadata: {0}")]
  WriteMetadata(#[source] io::Error),

  #[error("failed to acquire lock: {0}")]
  LockFailed(#[source] io::Error),
}

/// Holder state of an in-process lock.
#[derive(Debug, Default)]
pub(crate) struct MemoryLockState {
  exclusive: Option<String>,
  shared: usize,
}

/// A held lock on a state store. Released on drop.
#[derive(Debug)]
pub struct StateLock {
  mode: LockMode,
  handle: LockHandle,
}

#[derive(Debug)]
enum LockHandle {
  File { file: File, lock_path: PathBuf },
  Memory(Arc<Mutex<MemoryLockState>>),
}

impl StateLock {
  /// Take a non-blocking lock on `<state_dir>/.lock`.
  pub(crate) fn acquire_file(state_dir: &Path, mode: LockMode, operation: &str) -> Result<Self, LockError> {
    let lock_path = state_dir.join(LOCK_FILENAME);

    if !state_dir.exists() {
      std::fs::create_dir_all(state_dir).map_err(LockError::CreateDir)?;
    }

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(LockError::OpenFile)?;

    if let Err(err) = try_lock(&file, mode) {
      if err.kind() == io::ErrorKind::WouldBlock {
        let contention = read_contention_error(&lock_path);
        warn!(path = %lock_path.display(), operation, "state lock contended");
        return Err(contention);
      }
      return Err(LockError::LockFailed(err));
    }

    if mode == LockMode::Exclusive {
      write_metadata(&file, operation, state_dir)?;
    }

    debug!(path = %lock_path.display(), ?mode, operation, "acquired state lock");
    Ok(Self {
      mode,
      handle: LockHandle::File { file, lock_path },
    })
  }

  /// Take an in-process lock.
  pub(crate) fn acquire_memory(
    state: &Arc<Mutex<MemoryLockState>>,
    mode: LockMode,
    operation: &str,
  ) -> Result<Self, LockError> {
    let mut guard = state.lock().map_err(|_| LockError::Held {
      operation: "unknown (lock poisoned)".to_string(),
    })?;

    if let Some(holder) = &guard.exclusive {
      return Err(LockError::Held {
        operation: holder.clone(),
      });
    }

    match mode {
      LockMode::Shared => guard.shared += 1,
      LockMode::Exclusive => {
        if guard.shared > 0 {
          return Err(LockError::Held {
            operation: format!("{} shared holder(s)", guard.shared),
          });
        }
        guard.exclusive = Some(operation.to_string());
      }
    }

    Ok(Self {
      mode,
      handle: LockHandle::Memory(Arc::clone(state)),
    })
  }

  pub fn mode(&self) -> LockMode {
    self.mode
  }

  /// Path of the lock file, for file-backed locks.
  pub fn lock_path(&self) -> Option<&Path> {
    match &self.handle {
      LockHandle::File { lock_path, .. } => Some(lock_path),
      LockHandle::Memory(_) => None,
    }
  }

  /// Reads the lock metadata from the held file handle.
  ///
  /// Reading through the held handle avoids opening the file again, which
  /// would fail on Windows while the lock is held.
  pub fn read_metadata(&self) -> io::Result<Option<LockMetadata>> {
    use std::io::{Seek, SeekFrom};

    let LockHandle::File { file, .. } = &self.handle else {
      return Ok(None);
    };

    let mut file = file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map(Some).map_err(io::Error::other)
  }
}

impl Drop for StateLock {
  fn drop(&mut self) {
    // File locks are released when the handle closes.
    if let LockHandle::Memory(state) = &self.handle
      && let Ok(mut guard) = state.lock()
    {
      match self.mode {
        LockMode::Shared => guard.shared = guard.shared.saturating_sub(1),
        LockMode::Exclusive => guard.exclusive = None,
      }
    }
  }
}

fn write_metadata(file: &File, operation: &str, state_dir: &Path) -> Result<(), LockError> {
  let metadata = LockMetadata {
    version: LOCK_METADATA_VERSION,
    pid: std::process::id(),
    started_at_unix: unix_now(),
    operation: operation.to_string(),
    state_dir: state_dir.to_path_buf(),
  };

  file.set_len(0).map_err(LockError::WriteMetadata)?;
  let mut writer = io::BufWriter::new(file);
  serde_json::to_writer_pretty(&mut writer, &metadata).map_err(|e| LockError::WriteMetadata(io::Error::other(e)))?;
  writer.flush().map_err(LockError::WriteMetadata)?;

  Ok(())
}

fn read_contention_error(lock_path: &Path) -> LockError {
  if let Ok(mut file) = File::open(lock_path) {
    let mut contents = String::new();
    if file.read_to_string(&mut contents).is_ok()
      && let Ok(metadata) = serde_json::from_str::<LockMetadata>(&contents)
    {
      let started_at = format!("Unix timestamp {}", metadata.started_at_unix);

      return LockError::Contention {
        operation: metadata.operation,
        pid: metadata.pid,
        started_at,
        lock_path: lock_path.to_path_buf(),
      };
    }
  }

  LockError::ContentionUnknown {
    lock_path: lock_path.to_path_buf(),
  }
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };

  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;
  let flags = match mode {
    LockMode::Shared => LOCKFILE_FAIL_IMMEDIATELY,
    LockMode::Exclusive => LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
  };

  // SAFETY: OVERLAPPED is a plain data struct that is valid when zero-initialized.
  // LockFileEx is safe to call with a valid file handle and zeroed OVERLAPPED.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
  };

  if result == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}
