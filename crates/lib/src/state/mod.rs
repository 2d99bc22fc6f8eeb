//! Persistent record of what has been applied.
//!
//! The state store is the only data that survives between runs. It maps each
//! tracked [`ResourceKey`] to the [`StateRecord`] written after its last
//! successful apply.
//!
//! Implementations must make `put` and `remove` atomic with respect to
//! concurrent `get` and `list_all` calls: a reader sees either the old record
//! or the new one, never a mix.

mod file;
mod lock;
mod memory;
mod types;

pub use file::FileStateStore;
pub use lock::{LockError, LockMetadata, LockMode, StateLock};
pub use memory::MemoryStateStore;
pub use types::{DeposedObject, StateError, StateRecord};

use crate::resource::ResourceKey;
use crate::util::hash::{Hashable, ObjectHash};

/// Storage for state records.
pub trait StateStore: Send + Sync {
  fn get(&self, key: &ResourceKey) -> Result<Option<StateRecord>, StateError>;

  /// Insert or replace the record for `record.key`.
  fn put(&self, record: StateRecord) -> Result<(), StateError>;

  /// Remove a record. Returns whether one existed.
  fn remove(&self, key: &ResourceKey) -> Result<bool, StateError>;

  /// Every record, sorted by key.
  fn list_all(&self) -> Result<Vec<StateRecord>, StateError>;

  /// Take the advisory lock guarding this store. Fails immediately if held.
  fn lock(&self, mode: LockMode, operation: &str) -> Result<StateLock, StateError>;
}

/// Fingerprint of the full store contents.
///
/// Two stores with the same records have the same fingerprint.
pub fn fingerprint(store: &dyn StateStore) -> Result<ObjectHash, StateError> {
  store.list_all()?.compute_hash().map_err(StateError::Serialize)
}
