// Offline write queue
// Clippings the server has not acknowledged yet, persisted under one key

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::storage::{KeyValueStore, PENDING_KEY, UNREADABLE_PENDING_KEY};

/// Prefix reserved for client-generated ids; server ids never start with it
pub const TEMP_ID_PREFIX: &str = "temp_";

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// A write waiting for server acknowledgment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWrite {
    pub temp_id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    /// Set right before the POST goes out, cleared on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight_since: Option<DateTime<Utc>>,
}

impl PendingWrite {
    /// Whether another sender marked this entry recently enough to leave it alone
    pub fn is_in_flight(&self, stale_after: Duration, now: DateTime<Utc>) -> bool {
        self.in_flight_since
            .map(|since| now - since < stale_after)
            .unwrap_or(false)
    }

    /// The record as the UI renders it before the server has confirmed it
    pub fn optimistic_record(&self) -> Value {
        let mut record = match &self.payload {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("content".to_string(), other.clone());
                map
            }
        };
        record.insert("id".to_string(), Value::String(self.temp_id.clone()));
        record.insert("pending".to_string(), Value::Bool(true));
        record
            .entry("createdAt")
            .or_insert_with(|| Value::String(self.created_at.to_rfc3339()));
        Value::Object(record)
    }
}

/// Temp id source: `temp_<millis>_<random>` with strictly increasing millis
#[derive(Debug, Default)]
struct TempIdGenerator {
    last_millis: AtomicI64,
}

impl TempIdGenerator {
    fn next(&self) -> String {
        let now = Utc::now().timestamp_millis();
        let mut prev = self.last_millis.load(Ordering::SeqCst);
        let millis = loop {
            let candidate = now.max(prev + 1);
            match self.last_millis.compare_exchange(
                prev,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break candidate,
                Err(actual) => prev = actual,
            }
        };

        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}{}_{}", TEMP_ID_PREFIX, millis, &suffix[..8])
    }
}

/// Persisted list of pending writes.
///
/// Read-modify-write cycles are serialized inside this process. Other
/// contexts writing the same key are last-write-wins; the backend offers no
/// compare-and-swap.
pub struct OfflineQueue {
    storage: Arc<dyn KeyValueStore>,
    ids: TempIdGenerator,
    lock: Mutex<()>,
}

impl OfflineQueue {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            storage,
            ids: TempIdGenerator::default(),
            lock: Mutex::new(()),
        }
    }

    /// Append a write and return it immediately for optimistic rendering
    pub async fn enqueue(&self, payload: Value) -> Result<PendingWrite> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;

        let mut temp_id = self.ids.next();
        while entries.iter().any(|e| e.temp_id == temp_id) {
            temp_id = self.ids.next();
        }

        let pending = PendingWrite {
            temp_id,
            payload,
            created_at: Utc::now(),
            attempts: 0,
            in_flight_since: None,
        };
        entries.push(pending.clone());
        self.save(&entries).await?;

        tracing::info!(
            temp_id = %pending.temp_id,
            queued = entries.len(),
            "Queued clipping for later sync"
        );
        Ok(pending)
    }

    pub async fn list(&self) -> Result<Vec<PendingWrite>> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.list().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Remove an entry; returns false if it was not queued
    pub async fn remove(&self, temp_id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        let before = entries.len();
        entries.retain(|e| e.temp_id != temp_id);
        if entries.len() == before {
            return Ok(false);
        }
        self.save(&entries).await?;
        Ok(true)
    }

    /// Mark an entry as being sent; returns false if it is gone
    pub async fn mark_in_flight(&self, temp_id: &str) -> Result<bool> {
        self.update(temp_id, |entry| entry.in_flight_since = Some(Utc::now()))
            .await
            .map(|found| found.is_some())
    }

    /// Count a failed attempt and release the in-flight mark.
    /// Returns the new attempt count, or `None` if the entry is gone.
    pub async fn record_failure(&self, temp_id: &str) -> Result<Option<u32>> {
        self.update(temp_id, |entry| {
            entry.attempts += 1;
            entry.in_flight_since = None;
        })
        .await
    }

    async fn update<F>(&self, temp_id: &str, apply: F) -> Result<Option<u32>>
    where
        F: FnOnce(&mut PendingWrite),
    {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        let Some(entry) = entries.iter_mut().find(|e| e.temp_id == temp_id) else {
            return Ok(None);
        };
        apply(entry);
        let attempts = entry.attempts;
        self.save(&entries).await?;
        Ok(Some(attempts))
    }

    async fn load(&self) -> Result<Vec<PendingWrite>> {
        let Some(raw) = self.storage.get(PENDING_KEY).await? else {
            return Ok(Vec::new());
        };

        let items = match raw {
            Value::Array(items) => items,
            other => {
                tracing::error!(raw = %other, "Pending queue is not an array, moving it aside");
                self.quarantine(vec![other]).await?;
                self.save(&[]).await?;
                return Ok(Vec::new());
            }
        };

        let total = items.len();
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(total);
        let mut unreadable = Vec::new();
        for item in items {
            match serde_json::from_value::<PendingWrite>(item.clone()) {
                Ok(entry) => {
                    if seen.insert(entry.temp_id.clone()) {
                        entries.push(entry);
                    } else {
                        tracing::warn!(temp_id = %entry.temp_id, "Dropping duplicate queue entry");
                    }
                }
                Err(e) => {
                    tracing::error!(raw = %item, "Unreadable queue entry, moving it aside: {}", e);
                    unreadable.push(item);
                }
            }
        }

        if !unreadable.is_empty() {
            self.quarantine(unreadable).await?;
        }
        if entries.len() != total {
            self.save(&entries).await?;
        }
        Ok(entries)
    }

    /// Append values to the unreadable key so a later save cannot lose them
    async fn quarantine(&self, values: Vec<Value>) -> Result<()> {
        let mut kept = match self.storage.get(UNREADABLE_PENDING_KEY).await? {
            Some(Value::Array(existing)) => existing,
            Some(other) => vec![other],
            None => Vec::new(),
        };
        kept.extend(values);
        self.storage
            .set(UNREADABLE_PENDING_KEY, Value::Array(kept))
            .await
            .context("Failed to keep unreadable queue data")
    }

    async fn save(&self, entries: &[PendingWrite]) -> Result<()> {
        let value = serde_json::to_value(entries).context("Failed to encode pending queue")?;
        self.storage.set(PENDING_KEY, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use proptest::prelude::*;
    use serde_json::json;

    fn queue() -> (OfflineQueue, Arc<MemoryStore>) {
        let storage = Arc::new(MemoryStore::new());
        (OfflineQueue::new(storage.clone()), storage)
    }

    #[tokio::test]
    async fn test_enqueue_then_list() {
        let (queue, _) = queue();
        let first = queue.enqueue(json!({"content": "one"})).await.unwrap();

        let listed = queue.list().await.unwrap();
        assert_eq!(listed, vec![first.clone()]);
        assert!(is_temp_id(&first.temp_id));
        assert_eq!(first.attempts, 0);

        let second = queue.enqueue(json!({"content": "two"})).await.unwrap();
        assert_ne!(first.temp_id, second.temp_id);
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_remove_only_matching_entry() {
        let (queue, _) = queue();
        let a = queue.enqueue(json!({"content": "a"})).await.unwrap();
        let b = queue.enqueue(json!({"content": "b"})).await.unwrap();

        assert!(queue.remove(&a.temp_id).await.unwrap());
        assert!(!queue.remove(&a.temp_id).await.unwrap());
        assert_eq!(queue.list().await.unwrap(), vec![b]);
    }

    #[tokio::test]
    async fn test_failure_increments_attempts_and_clears_mark() {
        let (queue, _) = queue();
        let entry = queue.enqueue(json!({"content": "a"})).await.unwrap();

        assert!(queue.mark_in_flight(&entry.temp_id).await.unwrap());
        assert!(queue.list().await.unwrap()[0].in_flight_since.is_some());

        assert_eq!(queue.record_failure(&entry.temp_id).await.unwrap(), Some(1));
        let listed = queue.list().await.unwrap();
        assert_eq!(listed[0].attempts, 1);
        assert!(listed[0].in_flight_since.is_none());

        assert_eq!(queue.record_failure("temp_missing").await.unwrap(), None);
        assert!(!queue.mark_in_flight("temp_missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_enqueues_are_not_lost() {
        let (queue, _) = queue();
        let results = futures::future::join_all(
            (0..20).map(|i| queue.enqueue(json!({"content": format!("clip {}", i)}))),
        )
        .await;

        let ids: HashSet<String> = results.into_iter().map(|r| r.unwrap().temp_id).collect();
        assert_eq!(ids.len(), 20);
        assert_eq!(queue.len().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_load_skips_garbage_and_duplicates() {
        let (queue, storage) = queue();
        let now = Utc::now().to_rfc3339();
        storage
            .set(
                PENDING_KEY,
                json!([
                    {"tempId": "temp_1_a", "payload": {}, "createdAt": now},
                    {"tempId": "temp_1_a", "payload": {}, "createdAt": now},
                    {"nonsense": true}
                ]),
            )
            .await
            .unwrap();

        let listed = queue.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].temp_id, "temp_1_a");

        // The unreadable entry survives the next write, under its own key
        queue.enqueue(json!({"content": "b"})).await.unwrap();
        assert_eq!(
            storage.get(UNREADABLE_PENDING_KEY).await.unwrap(),
            Some(json!([{"nonsense": true}]))
        );
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_non_array_queue_is_moved_aside() {
        let (queue, storage) = queue();
        storage
            .set(PENDING_KEY, json!({"legacy": "shape"}))
            .await
            .unwrap();

        assert!(queue.is_empty().await.unwrap());
        queue.enqueue(json!({"content": "a"})).await.unwrap();

        assert_eq!(
            storage.get(UNREADABLE_PENDING_KEY).await.unwrap(),
            Some(json!([{"legacy": "shape"}]))
        );
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[test]
    fn test_optimistic_record() {
        let entry = PendingWrite {
            temp_id: "temp_1_abcdef12".to_string(),
            payload: json!({"content": "hello", "url": "https://example.com"}),
            created_at: Utc::now(),
            attempts: 0,
            in_flight_since: None,
        };
        let record = entry.optimistic_record();
        assert_eq!(record["id"], "temp_1_abcdef12");
        assert_eq!(record["pending"], true);
        assert_eq!(record["content"], "hello");
        assert!(record["createdAt"].is_string());
    }

    #[test]
    fn test_in_flight_goes_stale() {
        let now = Utc::now();
        let mut entry = PendingWrite {
            temp_id: "temp_1_x".to_string(),
            payload: json!({}),
            created_at: now,
            attempts: 0,
            in_flight_since: Some(now - Duration::seconds(5)),
        };
        assert!(entry.is_in_flight(Duration::seconds(30), now));
        entry.in_flight_since = Some(now - Duration::minutes(5));
        assert!(!entry.is_in_flight(Duration::seconds(30), now));
    }

    proptest! {
        #[test]
        fn prop_temp_ids_are_unique_and_ordered(count in 1usize..200) {
            let generator = TempIdGenerator::default();
            let ids: Vec<String> = (0..count).map(|_| generator.next()).collect();

            let unique: HashSet<&String> = ids.iter().collect();
            prop_assert_eq!(unique.len(), ids.len());

            let millis: Vec<i64> = ids
                .iter()
                .map(|id| id[TEMP_ID_PREFIX.len()..].split('_').next().unwrap().parse().unwrap())
                .collect();
            prop_assert!(millis.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(ids.iter().all(|id| is_temp_id(id)));
        }
    }
}
