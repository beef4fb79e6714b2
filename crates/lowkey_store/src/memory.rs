//! In-memory reference backend.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::trace;

use crate::{SessionStore, StoreError, StoreKey};

/// Process-local store. Atomicity per key falls out of the single map
/// lock; nothing survives a restart, which is exactly what the test
/// suites want.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<StoreKey, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &StoreKey, value: Vec<u8>) -> Result<(), StoreError> {
        trace!(%key, bytes = value.len(), "put");
        self.entries.write().insert(key.clone(), value);
        Ok(())
    }

    fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        trace!(%key, "delete");
        self.entries.write().remove(key);
        Ok(())
    }

    fn session_ids(&self, remote_identity_key: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.read();
        Ok(entries
            .keys()
            .filter_map(|key| match key {
                StoreKey::Session { remote_identity_key: remote, session_id }
                    if remote == remote_identity_key =>
                {
                    Some(session_id.clone())
                }
                _ => None,
            })
            .collect())
    }
}
