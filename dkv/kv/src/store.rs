// Copyright 2022-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::command::Command;

/// Shared handle to the in-memory key-value map.
///
/// The inner mutex is held only for the duration of a single map operation;
/// callers that need multi-step atomicity (admission pre-checks followed by a
/// replicated apply) serialize above this handle. A `BTreeMap` keeps the
/// serialized snapshot bytes identical across replicas holding the same
/// entries.
#[derive(Debug, Clone, Default)]
pub struct KvMap {
    inner: Arc<Mutex<BTreeMap<String, String>>>,
}

impl KvMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Apply one committed command.
    ///
    /// `Set` assigns unconditionally and `Del` tolerates absent keys; the
    /// create-only conflict rules live in the admission layer, so replaying
    /// a log suffix stays deterministic on every replica.
    pub fn apply(&self, cmd: &Command) {
        let mut map = self.lock();
        match cmd {
            Command::Set { key, val } => {
                map.insert(key.clone(), val.clone());
            }
            Command::Del { key } => {
                map.remove(key);
            }
        }
    }

    /// Point-in-time clone, atomic with respect to concurrent applies.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.lock().clone()
    }

    /// Replace the whole map, e.g. when restoring from a snapshot.
    pub fn restore(&self, map: BTreeMap<String, String>) {
        *self.lock() = map;
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.inner.lock().expect("kv map mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str, val: &str) -> Command {
        Command::Set {
            key: key.to_string(),
            val: val.to_string(),
        }
    }

    fn del(key: &str) -> Command {
        Command::Del {
            key: key.to_string(),
        }
    }

    #[test]
    fn apply_set_and_del() {
        let kv = KvMap::new();
        kv.apply(&set("a", "1"));
        assert_eq!(kv.get("a"), Some("1".to_string()));
        assert_eq!(kv.len(), 1);

        // The map itself overwrites; create-only is an admission rule.
        kv.apply(&set("a", "2"));
        assert_eq!(kv.get("a"), Some("2".to_string()));

        kv.apply(&del("a"));
        assert_eq!(kv.get("a"), None);
        assert!(kv.is_empty());

        // Deleting an absent key is a no-op.
        kv.apply(&del("a"));
        assert!(kv.is_empty());
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let kv = KvMap::new();
        kv.apply(&set("a", "1"));
        let snap = kv.snapshot();
        kv.apply(&set("b", "2"));
        assert_eq!(snap.len(), 1);
        assert_eq!(kv.len(), 2);
    }

    #[test]
    fn restore_replaces_everything() {
        let kv = KvMap::new();
        kv.apply(&set("stale", "x"));
        let mut fresh = std::collections::BTreeMap::new();
        fresh.insert("a".to_string(), "1".to_string());
        kv.restore(fresh);
        assert_eq!(kv.get("stale"), None);
        assert_eq!(kv.get("a"), Some("1".to_string()));
    }
}
