//! In-memory storage implementation.
//!
//! This provides a simple in-memory implementation of [`DocStorage`] for use
//! in unit tests and local-only draft spaces.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::storage::{DocStorage, StorageResult};
use crate::types::{UpdateOrigin, UpdateRecord};

/// In-memory document storage.
///
/// This implementation stores all data in memory using `HashMap` and `Vec`.
/// It's thread-safe via `RwLock` but data is lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    /// Document snapshots (name -> binary state)
    docs: Arc<RwLock<HashMap<String, Vec<u8>>>>,

    /// Update logs (name -> list of updates)
    updates: Arc<RwLock<HashMap<String, Vec<StoredUpdate>>>>,

    /// Counter for generating update IDs
    next_id: Arc<RwLock<i64>>,
}

#[derive(Debug, Clone)]
struct StoredUpdate {
    id: i64,
    data: Vec<u8>,
    timestamp: i64,
    origin: UpdateOrigin,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_update_id(&self) -> i64 {
        let mut id = self.next_id.write().unwrap();
        *id += 1;
        *id
    }
}

impl DocStorage for MemoryStorage {
    fn load_doc(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let docs = self.docs.read().unwrap();
        Ok(docs.get(name).cloned())
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> StorageResult<()> {
        let mut docs = self.docs.write().unwrap();
        docs.insert(name.to_string(), state.to_vec());
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> StorageResult<()> {
        let mut docs = self.docs.write().unwrap();
        docs.remove(name);
        let mut updates = self.updates.write().unwrap();
        updates.remove(name);
        Ok(())
    }

    fn list_docs(&self) -> StorageResult<Vec<String>> {
        let docs = self.docs.read().unwrap();
        Ok(docs.keys().cloned().collect())
    }

    fn append_update(
        &self,
        name: &str,
        update: &[u8],
        origin: UpdateOrigin,
    ) -> StorageResult<i64> {
        let id = self.next_update_id();
        let mut updates = self.updates.write().unwrap();
        updates.entry(name.to_string()).or_default().push(StoredUpdate {
            id,
            data: update.to_vec(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            origin,
        });
        Ok(id)
    }

    fn get_all_updates(&self, name: &str) -> StorageResult<Vec<UpdateRecord>> {
        let updates = self.updates.read().unwrap();
        Ok(updates
            .get(name)
            .map(|stored| {
                stored
                    .iter()
                    .map(|update| UpdateRecord {
                        id: update.id,
                        doc_name: name.to_string(),
                        data: update.data.clone(),
                        timestamp: update.timestamp,
                        origin: update.origin,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_latest_update_id(&self, name: &str) -> StorageResult<i64> {
        let updates = self.updates.read().unwrap();
        Ok(updates
            .get(name)
            .and_then(|stored| stored.last())
            .map(|update| update.id)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let storage = MemoryStorage::new();
        assert!(storage.load_doc("a").unwrap().is_none());

        storage.save_doc("a", &[1, 2, 3]).unwrap();
        assert_eq!(storage.load_doc("a").unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_delete_removes_snapshot_and_updates() {
        let storage = MemoryStorage::new();
        storage.save_doc("a", &[1]).unwrap();
        storage.append_update("a", &[2], UpdateOrigin::Local).unwrap();

        storage.delete_doc("a").unwrap();
        assert!(storage.load_doc("a").unwrap().is_none());
        assert!(storage.get_all_updates("a").unwrap().is_empty());
    }

    #[test]
    fn test_update_log_order_and_ids() {
        let storage = MemoryStorage::new();
        let first = storage.append_update("a", &[1], UpdateOrigin::Local).unwrap();
        let second = storage.append_update("a", &[2], UpdateOrigin::Remote).unwrap();
        assert!(second > first);

        let updates = storage.get_all_updates("a").unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].data, vec![1]);
        assert_eq!(updates[0].origin, UpdateOrigin::Local);
        assert_eq!(updates[1].origin, UpdateOrigin::Remote);
        assert_eq!(storage.get_latest_update_id("a").unwrap(), second);
    }

    #[test]
    fn test_list_docs() {
        let storage = MemoryStorage::new();
        storage.save_doc("a", &[]).unwrap();
        storage.save_doc("b", &[]).unwrap();

        let mut docs = storage.list_docs().unwrap();
        docs.sort();
        assert_eq!(docs, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_latest_update_id_empty() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get_latest_update_id("missing").unwrap(), 0);
    }
}
