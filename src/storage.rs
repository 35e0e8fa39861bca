//! In-memory key-value store.
//!
//! The store is owned by the reactor thread and handed to the command
//! dispatcher by `&mut`, so no synchronization is involved. Keys and values
//! are arbitrary byte strings.

use std::collections::HashMap;
use tracing::trace;

/// Mapping from key to value with no ordering and no size bound.
#[derive(Debug, Default)]
pub struct Store {
    data: HashMap<Vec<u8>, Vec<u8>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a key.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }

    /// Insert or overwrite a key.
    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        trace!(key_len = key.len(), value_len = value.len(), "set");
        match self.data.get_mut(key) {
            Some(existing) => {
                existing.clear();
                existing.extend_from_slice(value);
            }
            None => {
                self.data.insert(key.to_vec(), value.to_vec());
            }
        }
    }

    /// Remove a key. Returns whether it was present.
    pub fn del(&mut self, key: &[u8]) -> bool {
        let existed = self.data.remove(key).is_some();
        trace!(key_len = key.len(), existed, "del");
        existed
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
