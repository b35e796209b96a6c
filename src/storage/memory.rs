// In-memory storage, used by tests and ephemeral runs

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

use super::{ChangeNotifier, KeyValueStore, StorageChange};

/// Non-persistent store; data is lost when the process exits
pub struct MemoryStore {
    data: RwLock<HashMap<String, Value>>,
    notifier: ChangeNotifier,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            notifier: ChangeNotifier::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.data.try_read().map(|d| d.len()).unwrap_or(0);
        f.debug_struct("MemoryStore")
            .field("keys_count", &count)
            .finish()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.data
            .write()
            .await
            .insert(key.to_string(), value.clone());
        self.notifier.publish(key, Some(value));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.data.write().await.remove(key);
        self.notifier.publish(key, None);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.notifier.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_remove() {
        let store = MemoryStore::new();
        assert!(store.get("userProfile").await.unwrap().is_none());

        store
            .set("userProfile", json!({"accessToken": "abc"}))
            .await
            .unwrap();
        assert_eq!(
            store.get("userProfile").await.unwrap(),
            Some(json!({"accessToken": "abc"}))
        );

        store.remove("userProfile").await.unwrap();
        assert!(store.get("userProfile").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_changes_are_broadcast() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();

        store.set("pendingClippings", json!([])).await.unwrap();
        store.remove("pendingClippings").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.key, "pendingClippings");
        assert_eq!(first.new_value, Some(json!([])));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.new_value, None);
    }
}
