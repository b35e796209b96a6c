// Offline queue reconciliation
// Replays pending writes against the server once connectivity returns

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use crate::auth::AuthManager;
use crate::clippings::{record_id, server_record, strip_client_markers, CLIPPINGS_PATH};
use crate::config::{Config, MAX_REQUEST_TIMEOUT};
use crate::error::{ApiError, Result};
use crate::http_client::{ApiClient, RequestSpec};
use crate::network::NetworkMonitor;
use crate::queue::{OfflineQueue, PendingWrite};

/// Outcome of one flush
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    /// Temp ids confirmed by the server and removed from the queue
    pub synced_ids: Vec<String>,
    /// Temp ids that stay queued for the next flush
    pub failed_ids: Vec<String>,
}

/// Published for every write the server has confirmed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    #[serde(rename_all = "camelCase")]
    Synced {
        temp_id: String,
        server_id: String,
        record: Value,
        remaining: usize,
    },
}

pub struct SyncReconciler {
    api: Arc<ApiClient>,
    auth: Arc<AuthManager>,
    queue: Arc<OfflineQueue>,
    network: NetworkMonitor,
    events: broadcast::Sender<SyncEvent>,

    /// One flush at a time per process
    flush_lock: Mutex<()>,

    /// How long an in-flight mark keeps other senders away
    in_flight_window: Duration,
}

impl SyncReconciler {
    pub fn new(
        api: Arc<ApiClient>,
        auth: Arc<AuthManager>,
        queue: Arc<OfflineQueue>,
        network: NetworkMonitor,
        config: &Config,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        // A send may cover a refresh plus a retried call
        let in_flight_window = Duration::seconds(
            config
                .http_request_timeout
                .min(MAX_REQUEST_TIMEOUT)
                .saturating_mul(3)
                .max(1) as i64,
        );
        Self {
            api,
            auth,
            queue,
            network,
            events,
            flush_lock: Mutex::new(()),
            in_flight_window,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Send every pending write, one at a time.
    ///
    /// An entry leaves the queue only once the server has answered with a
    /// real id. A failed entry stays queued and does not stop the rest,
    /// except an auth rejection, which ends the flush and the session.
    pub async fn flush(&self) -> Result<FlushReport> {
        let _guard = self.flush_lock.lock().await;

        if !self.network.is_online() {
            tracing::debug!("Offline, skipping queue flush");
            return Ok(FlushReport::default());
        }

        let entries = self.queue.list().await?;
        if entries.is_empty() {
            return Ok(FlushReport::default());
        }

        tracing::info!(pending = entries.len(), "Syncing offline clippings");

        let mut report = FlushReport::default();
        for entry in entries {
            if entry.is_in_flight(self.in_flight_window, Utc::now()) {
                tracing::debug!(temp_id = %entry.temp_id, "Entry already being sent, skipping");
                continue;
            }
            if !self.queue.mark_in_flight(&entry.temp_id).await? {
                // Removed by another context since we listed it
                continue;
            }

            match self.send(&entry).await {
                Ok(record) => match self.confirm(&entry, record).await {
                    Ok(()) => report.synced_ids.push(entry.temp_id),
                    Err(e) => {
                        tracing::error!(temp_id = %entry.temp_id, "Synced but could not dequeue: {:#}", e);
                        report.failed_ids.push(entry.temp_id);
                    }
                },
                Err(e) => {
                    let attempts = self.queue.record_failure(&entry.temp_id).await?;
                    tracing::warn!(
                        temp_id = %entry.temp_id,
                        attempts = attempts.unwrap_or(entry.attempts + 1),
                        "Failed to sync clipping: {}",
                        e
                    );
                    report.failed_ids.push(entry.temp_id);

                    // Every remaining entry would be rejected the same way
                    match e {
                        ApiError::AuthError(_) => {
                            tracing::warn!("Session rejected during flush, logging out");
                            self.auth.force_logout().await;
                            break;
                        }
                        ApiError::RefreshFailed(_) => {
                            tracing::warn!("Token refresh unavailable, stopping flush");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        tracing::info!(
            synced = report.synced_ids.len(),
            failed = report.failed_ids.len(),
            "Queue flush finished"
        );
        Ok(report)
    }

    async fn send(&self, entry: &PendingWrite) -> Result<Value> {
        let payload = strip_client_markers(&entry.payload);
        let response = self
            .api
            .request(&RequestSpec::post(CLIPPINGS_PATH, payload))
            .await?;
        server_record(response.data, response.status)
    }

    async fn confirm(&self, entry: &PendingWrite, record: Value) -> anyhow::Result<()> {
        self.queue.remove(&entry.temp_id).await?;
        let remaining = self.queue.len().await?;
        let server_id = record_id(&record).unwrap_or_default();

        tracing::info!(temp_id = %entry.temp_id, server_id = %server_id, remaining, "Clipping synced");

        // No subscribers is fine
        let _ = self.events.send(SyncEvent::Synced {
            temp_id: entry.temp_id.clone(),
            server_id,
            record,
            remaining,
        });
        Ok(())
    }
}
