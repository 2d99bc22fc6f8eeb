use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::resource::ResourceKey;

use super::StateStore;
use super::lock::{LockMode, MemoryLockState, StateLock};
use super::types::{StateError, StateRecord};

/// Volatile state store backed by a map. Intended for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
  records: RwLock<BTreeMap<ResourceKey, StateRecord>>,
  lock_state: Arc<Mutex<MemoryLockState>>,
}

impl MemoryStateStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Create a store pre-populated with records.
  pub fn with_records(records: impl IntoIterator<Item = StateRecord>) -> Self {
    let store = Self::new();
    if let Ok(mut map) = store.records.write() {
      for record in records {
        map.insert(record.key.clone(), record);
      }
    }
    store
  }
}

impl StateStore for MemoryStateStore {
  fn get(&self, key: &ResourceKey) -> Result<Option<StateRecord>, StateError> {
    let map = self.records.read().map_err(|_| StateError::Poisoned)?;
    Ok(map.get(key).cloned())
  }

  fn put(&self, record: StateRecord) -> Result<(), StateError> {
    let mut map = self.records.write().map_err(|_| StateError::Poisoned)?;
    map.insert(record.key.clone(), record);
    Ok(())
  }

  fn remove(&self, key: &ResourceKey) -> Result<bool, StateError> {
    let mut map = self.records.write().map_err(|_| StateError::Poisoned)?;
    Ok(map.remove(key).is_some())
  }

  fn list_all(&self) -> Result<Vec<StateRecord>, StateError> {
    let map = self.records.read().map_err(|_| StateError::Poisoned)?;
    Ok(map.values().cloned().collect())
  }

  fn lock(&self, mode: LockMode, operation: &str) -> Result<StateLock, StateError> {
    Ok(StateLock::acquire_memory(&self.lock_state, mode, operation)?)
  }
}
