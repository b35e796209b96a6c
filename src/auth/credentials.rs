// Credential persistence in the host key/value storage

use anyhow::{Context, Result};
use std::sync::Arc;

use super::types::Credential;
use crate::storage::{KeyValueStore, CREDENTIAL_KEY};

/// Get/set/remove of the single credential record.
///
/// No validation and no retries; callers own the semantics. Writes surface
/// as storage change notifications for other contexts.
#[derive(Clone)]
pub struct CredentialStore {
    storage: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self { storage }
    }

    /// Load the stored credential; an unreadable record counts as absent
    pub async fn get(&self) -> Result<Option<Credential>> {
        let Some(raw) = self.storage.get(CREDENTIAL_KEY).await? else {
            return Ok(None);
        };

        match serde_json::from_value::<Credential>(raw) {
            Ok(credential) => Ok(Some(credential)),
            Err(e) => {
                tracing::warn!("Ignoring unreadable credential record: {}", e);
                Ok(None)
            }
        }
    }

    pub async fn set(&self, credential: &Credential) -> Result<()> {
        let value = serde_json::to_value(credential).context("Failed to encode credential")?;
        self.storage.set(CREDENTIAL_KEY, value).await
    }

    pub async fn remove(&self) -> Result<()> {
        self.storage.remove(CREDENTIAL_KEY).await
    }
}
