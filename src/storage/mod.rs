// Host key/value storage
// The "local" storage area the extension core persists into

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Key holding the active credential record
pub const CREDENTIAL_KEY: &str = "userProfile";

/// Key holding the pending clippings array
pub const PENDING_KEY: &str = "pendingClippings";

/// Queue data that could not be read, moved aside instead of overwritten
pub const UNREADABLE_PENDING_KEY: &str = "pendingClippingsUnreadable";

/// Storage area all keys are namespaced to
pub const LOCAL_AREA: &str = "local";

/// Capacity of the change notification channel
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Change notification published after every write or removal
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageChange {
    pub key: String,
    /// `None` when the key was removed
    pub new_value: Option<Value>,
}

/// Asynchronous key/value storage with last-write-wins semantics.
///
/// No transactions and no compare-and-swap: a read followed by a write can
/// lose a concurrent writer's update. Every successful `set`/`remove` is
/// broadcast to subscribers so other contexts can refresh their view.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

/// Broadcast sender shared by the store implementations
#[derive(Debug, Clone)]
pub(crate) struct ChangeNotifier {
    tx: broadcast::Sender<StorageChange>,
}

impl ChangeNotifier {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub(crate) fn publish(&self, key: &str, new_value: Option<Value>) {
        // No subscribers is fine
        let _ = self.tx.send(StorageChange {
            key: key.to_string(),
            new_value,
        });
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.tx.subscribe()
    }
}
