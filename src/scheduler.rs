// Background sync scheduling
// Periodic and event-driven runs of refresh + queue flush

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthManager;
use crate::config::Config;
use crate::network::NetworkMonitor;
use crate::sync::SyncReconciler;

/// What woke the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Interval,
    Visible,
    Focus,
    Online,
    Startup,
}

impl Trigger {
    /// Parse a lifecycle event name sent by a UI surface
    pub fn from_event(event: &str) -> Option<Self> {
        match event {
            "visible" | "visibilitychange" => Some(Trigger::Visible),
            "focus" => Some(Trigger::Focus),
            "online" => Some(Trigger::Online),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another run was in progress; this trigger was dropped
    Skipped,
    /// No usable credential, nothing sent
    Unauthenticated,
    Offline,
    Completed { synced: usize, failed: usize },
}

/// Clears the running flag when a run ends, however it ends
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct BackgroundScheduler {
    auth: Arc<AuthManager>,
    reconciler: Arc<SyncReconciler>,
    network: NetworkMonitor,
    interval: Duration,
    running: AtomicBool,
}

impl BackgroundScheduler {
    pub fn new(
        auth: Arc<AuthManager>,
        reconciler: Arc<SyncReconciler>,
        network: NetworkMonitor,
        config: &Config,
    ) -> Self {
        Self {
            auth,
            reconciler,
            network,
            interval: Duration::from_secs(config.sync_interval.max(1)),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One refresh-then-flush pass. A trigger that arrives while a pass is
    /// running is skipped, not queued.
    pub async fn run_once(&self, trigger: Trigger) -> RunOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(?trigger, "Sync already running, trigger skipped");
            return RunOutcome::Skipped;
        }
        let _guard = RunGuard(&self.running);

        tracing::debug!(?trigger, "Background sync run");

        if self.auth.ensure_valid().await.is_none() {
            tracing::debug!("Not authenticated, nothing to sync");
            return RunOutcome::Unauthenticated;
        }

        if !self.network.is_online() {
            return RunOutcome::Offline;
        }

        match self.reconciler.flush().await {
            Ok(report) => RunOutcome::Completed {
                synced: report.synced_ids.len(),
                failed: report.failed_ids.len(),
            },
            Err(e) => {
                tracing::error!("Queue flush failed: {}", e);
                RunOutcome::Completed {
                    synced: 0,
                    failed: 0,
                }
            }
        }
    }

    /// Run a pass in the background
    pub fn trigger(self: &Arc<Self>, trigger: Trigger) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run_once(trigger).await;
        });
    }

    /// Interval ticks plus the offline → online edge, until shutdown
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Background sync started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut online = self.network.subscribe();
        online.borrow_and_update();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown, stopping background sync");
                    return;
                }
                _ = ticker.tick() => {
                    self.trigger(Trigger::Interval);
                }
                changed = online.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if *online.borrow_and_update() {
                        self.trigger(Trigger::Online);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credential;
    use crate::context::SyncContext;
    use crate::storage::MemoryStore;
    use chrono::Utc;
    use serde_json::json;

    async fn context_for(url: &str, logged_in: bool) -> Arc<SyncContext> {
        let context =
            SyncContext::new(Config::for_api(url), Arc::new(MemoryStore::new())).unwrap();
        if logged_in {
            context
                .credentials
                .set(&Credential::new("token").with_expiry(Utc::now() + chrono::Duration::hours(1)))
                .await
                .unwrap();
        }
        context
    }

    fn created_mock(server: &mut mockito::Server) -> mockito::Mock {
        server
            .mock("POST", "/clippings")
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(json!({"id": "c_1"}).to_string())
    }

    #[test]
    fn test_trigger_from_event() {
        assert_eq!(Trigger::from_event("focus"), Some(Trigger::Focus));
        assert_eq!(Trigger::from_event("visible"), Some(Trigger::Visible));
        assert_eq!(Trigger::from_event("online"), Some(Trigger::Online));
        assert_eq!(Trigger::from_event("offline"), None);
    }

    #[tokio::test]
    async fn test_run_once_flushes_queue() {
        let mut server = mockito::Server::new_async().await;
        let mock = created_mock(&mut server).expect(2).create_async().await;
        let context = context_for(&server.url(), true).await;
        context.queue.enqueue(json!({"content": "a"})).await.unwrap();
        context.queue.enqueue(json!({"content": "b"})).await.unwrap();

        let outcome = context.scheduler.run_once(Trigger::Focus).await;
        assert_eq!(outcome, RunOutcome::Completed { synced: 2, failed: 0 });
        assert!(!context.scheduler.is_running());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_run_once_without_credential_sends_nothing() {
        let mut server = mockito::Server::new_async().await;
        let mock = created_mock(&mut server).expect(0).create_async().await;
        let context = context_for(&server.url(), false).await;
        context.queue.enqueue(json!({"content": "a"})).await.unwrap();

        assert_eq!(
            context.scheduler.run_once(Trigger::Interval).await,
            RunOutcome::Unauthenticated
        );
        assert_eq!(context.queue.len().await.unwrap(), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_run_once_offline() {
        let context = context_for("http://127.0.0.1:9", true).await;
        context.network.set_online(false);
        assert_eq!(
            context.scheduler.run_once(Trigger::Interval).await,
            RunOutcome::Offline
        );
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_skipped() {
        let context = context_for("http://127.0.0.1:9", true).await;
        let scheduler = &context.scheduler;

        scheduler.running.store(true, Ordering::SeqCst);
        assert_eq!(scheduler.run_once(Trigger::Visible).await, RunOutcome::Skipped);
        // The skipped trigger must not clear the flag owned by the active run
        assert!(scheduler.is_running());

        scheduler.running.store(false, Ordering::SeqCst);
        context.network.set_online(false);
        assert_eq!(scheduler.run_once(Trigger::Visible).await, RunOutcome::Offline);
    }

    #[tokio::test]
    async fn test_online_edge_triggers_flush() {
        let mut server = mockito::Server::new_async().await;
        let mock = created_mock(&mut server).expect(1).create_async().await;
        let mut config = Config::for_api(server.url());
        config.sync_interval = 3600;
        let context = SyncContext::new(config, Arc::new(MemoryStore::new())).unwrap();
        context
            .credentials
            .set(&Credential::new("token").with_expiry(Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();

        context.network.set_online(false);
        context.queue.enqueue(json!({"content": "a"})).await.unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(context.scheduler.clone().run(shutdown.clone()));

        // Let the immediate interval tick run while offline
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(context.queue.len().await.unwrap(), 1);

        context.network.set_online(true);
        for _ in 0..100 {
            if context.queue.is_empty().await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(context.queue.is_empty().await.unwrap());

        shutdown.cancel();
        task.await.unwrap();
        mock.assert_async().await;
    }
}
