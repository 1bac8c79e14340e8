use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// In-process lock per container key.
///
/// Writers of one key exclude each other and that key's readers; distinct
/// keys never contend. Entries live as long as the map: the key space is the
/// set of scanned containers, which is small and stable.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_key(&self, key: &str) -> Arc<RwLock<()>> {
        let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(key.to_string()).or_default())
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
