// Message contract between UI surfaces and the background context
//
// Every request is `{name, body}` and gets exactly one JSON reply. Handler
// failures are replies too: `{success: false, kind, error}`.

use anyhow::anyhow;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::auth::{credential_expiry, Credential};
use crate::context::SyncContext;
use crate::error::{ApiError, Result};
use crate::scheduler::Trigger;

/// Default list size for `savedata` / `getAll`
pub const DEFAULT_LIST_LIMIT: usize = 20;

/// How long a caller waits for its reply
pub const MESSAGE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub name: String,
    #[serde(default)]
    pub body: Value,
}

impl Envelope {
    pub fn new(name: impl Into<String>, body: Value) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }
}

/// Routes a message by name to its handler
pub struct MessageRouter {
    context: Arc<SyncContext>,
}

impl MessageRouter {
    pub fn new(context: Arc<SyncContext>) -> Self {
        Self { context }
    }

    /// Always produces a reply
    pub async fn dispatch(&self, envelope: Envelope) -> Value {
        let result = match envelope.name.as_str() {
            "auth" => self.handle_auth(&envelope.body).await,
            "savedata" => self.handle_savedata(&envelope.body).await,
            "lifecycle" => self.handle_lifecycle(&envelope.body).await,
            other => Err(ApiError::ValidationError(format!(
                "Unknown message: {}",
                other
            ))),
        };

        result.unwrap_or_else(|e| {
            tracing::debug!(message = %envelope.name, "Handler failed: {}", e);
            e.to_reply()
        })
    }

    async fn handle_auth(&self, body: &Value) -> Result<Value> {
        let auth = &self.context.auth;
        match action(body)? {
            "checkAuth" => match auth.ensure_valid().await {
                Some(credential) => Ok(json!({
                    "success": true,
                    "authenticated": true,
                    "profile": credential.profile,
                    "expiresAt": credential_expiry(&credential).map(|t| t.to_rfc3339()),
                })),
                None => Ok(json!({"success": true, "authenticated": false})),
            },
            "login" => {
                let email = string_field(body, "email")?;
                let password = string_field(body, "password")?;
                let credential = auth.login(email, password).await?;
                self.context.scheduler.trigger(Trigger::Startup);
                Ok(json!({"success": true, "profile": credential.profile}))
            }
            "syncWebSession" => {
                let session = body.get("session").cloned().ok_or_else(|| {
                    ApiError::ValidationError("Missing session".to_string())
                })?;
                let credential: Credential = serde_json::from_value(session)
                    .map_err(|e| ApiError::ValidationError(format!("Invalid session: {}", e)))?;
                auth.adopt_session(credential).await?;
                self.context.scheduler.trigger(Trigger::Startup);
                Ok(json!({"success": true}))
            }
            "logout" => {
                auth.logout().await?;
                Ok(json!({"success": true}))
            }
            other => Err(unknown_action("auth", other)),
        }
    }

    async fn handle_savedata(&self, body: &Value) -> Result<Value> {
        // A message carrying an item is a save, whatever its action
        if let Some(item) = body.get("item") {
            let saved = self.context.clips.save_clipping(item.clone()).await?;
            return Ok(json!({"success": true, "item": saved}));
        }

        match action(body)? {
            "getAll" => {
                let limit = body
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize)
                    .unwrap_or(DEFAULT_LIST_LIMIT);
                let list = self.context.clips.get_all(limit).await?;
                Ok(json!({
                    "success": true,
                    "items": list.items,
                    "pendingCount": list.pending_count,
                    "offline": list.offline,
                }))
            }
            "syncOffline" => {
                let report = self.context.reconciler.flush().await?;
                Ok(json!({
                    "success": true,
                    "syncedIds": report.synced_ids,
                    "failedIds": report.failed_ids,
                }))
            }
            other => Err(unknown_action("savedata", other)),
        }
    }

    async fn handle_lifecycle(&self, body: &Value) -> Result<Value> {
        let event = string_field(body, "event")?;
        let network = &self.context.network;

        match event {
            "offline" => {
                network.set_online(false);
            }
            "online" => {
                network.set_online(true);
                self.context.scheduler.trigger(Trigger::Online);
            }
            other => match Trigger::from_event(other) {
                Some(trigger) => self.context.scheduler.trigger(trigger),
                None => return Err(unknown_action("lifecycle", other)),
            },
        }

        Ok(json!({"success": true, "online": network.is_online()}))
    }
}

fn action(body: &Value) -> Result<&str> {
    string_field(body, "action")
}

fn string_field<'a>(body: &'a Value, field: &str) -> Result<&'a str> {
    body.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::ValidationError(format!("Missing '{}'", field)))
}

fn unknown_action(message: &str, action: &str) -> ApiError {
    ApiError::ValidationError(format!("Unknown {} action: {}", message, action))
}

struct Correlated {
    id: String,
    envelope: Envelope,
}

struct Reply {
    id: String,
    body: Value,
}

/// Request/reply transport over channels.
///
/// Requests carry a generated id; replies are matched back to their caller
/// by that id, so concurrent callers never see each other's replies.
pub struct MessageBus {
    requests: mpsc::Sender<Correlated>,
    pending: Arc<DashMap<String, oneshot::Sender<Value>>>,
    timeout: Duration,
}

impl MessageBus {
    /// Start the dispatcher and reply pump; both stop when the bus is dropped
    pub fn spawn(router: Arc<MessageRouter>, timeout: Duration) -> Self {
        let (requests, mut request_rx) = mpsc::channel::<Correlated>(64);
        let (reply_tx, mut reply_rx) = mpsc::channel::<Reply>(64);
        let pending: Arc<DashMap<String, oneshot::Sender<Value>>> = Arc::new(DashMap::new());

        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                let router = router.clone();
                let reply_tx = reply_tx.clone();
                tokio::spawn(async move {
                    let body = router.dispatch(request.envelope).await;
                    let _ = reply_tx.send(Reply { id: request.id, body }).await;
                });
            }
        });

        let waiting = pending.clone();
        tokio::spawn(async move {
            while let Some(reply) = reply_rx.recv().await {
                match waiting.remove(&reply.id) {
                    Some((_, sender)) => {
                        // Caller may have timed out and gone away
                        let _ = sender.send(reply.body);
                    }
                    None => tracing::warn!(id = %reply.id, "Dropping reply with no waiting caller"),
                }
            }
        });

        Self {
            requests,
            pending,
            timeout,
        }
    }

    /// Send a message and wait for its reply
    pub async fn call(&self, envelope: Envelope) -> Result<Value> {
        let id = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(id.clone(), sender);

        let request = Correlated {
            id: id.clone(),
            envelope,
        };
        if self.requests.send(request).await.is_err() {
            self.pending.remove(&id);
            return Err(ApiError::Internal(anyhow!("Message dispatcher stopped")));
        }

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(ApiError::Internal(anyhow!("Reply channel closed"))),
            Err(_) => {
                self.pending.remove(&id);
                Err(ApiError::NetworkError {
                    kind: "timeout",
                    message: "No reply from background context".to_string(),
                })
            }
        }
    }

    /// Callers still waiting for a reply
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::{KeyValueStore, MemoryStore, CREDENTIAL_KEY};
    use chrono::Utc;

    fn router_for(url: &str) -> (MessageRouter, Arc<SyncContext>) {
        let context =
            SyncContext::new(Config::for_api(url), Arc::new(MemoryStore::new())).unwrap();
        (MessageRouter::new(context.clone()), context)
    }

    async fn log_in(context: &SyncContext) {
        context
            .credentials
            .set(&Credential::new("token").with_expiry(Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_message_is_validation_reply() {
        let (router, _) = router_for("http://127.0.0.1:9");
        let reply = router.dispatch(Envelope::new("nope", json!({}))).await;
        assert_eq!(reply["success"], false);
        assert_eq!(reply["kind"], "validation");
    }

    #[tokio::test]
    async fn test_check_auth_unauthenticated() {
        let (router, _) = router_for("http://127.0.0.1:9");
        let reply = router
            .dispatch(Envelope::new("auth", json!({"action": "checkAuth"})))
            .await;
        assert_eq!(reply["authenticated"], false);
    }

    #[tokio::test]
    async fn test_sync_web_session_then_check_auth() {
        let (router, context) = router_for("http://127.0.0.1:9");
        let expires = (Utc::now() + chrono::Duration::hours(2)).to_rfc3339();
        let reply = router
            .dispatch(Envelope::new(
                "auth",
                json!({
                    "action": "syncWebSession",
                    "session": {
                        "accessToken": "web-token",
                        "refreshToken": "web-refresh",
                        "expiresAt": expires,
                        "user": {"id": "u1", "email": "a@example.com"}
                    }
                }),
            ))
            .await;
        assert_eq!(reply["success"], true);

        let stored = context.credentials.get().await.unwrap().unwrap();
        assert_eq!(stored.access_token, "web-token");

        let reply = router
            .dispatch(Envelope::new("auth", json!({"action": "checkAuth"})))
            .await;
        assert_eq!(reply["authenticated"], true);
        assert_eq!(reply["profile"]["email"], "a@example.com");
    }

    #[tokio::test]
    async fn test_sync_web_session_requires_session() {
        let (router, _) = router_for("http://127.0.0.1:9");
        let reply = router
            .dispatch(Envelope::new("auth", json!({"action": "syncWebSession"})))
            .await;
        assert_eq!(reply["kind"], "validation");
    }

    #[tokio::test]
    async fn test_offline_save_returns_optimistic_item() {
        let (router, context) = router_for("http://127.0.0.1:9");
        log_in(&context).await;

        router
            .dispatch(Envelope::new("lifecycle", json!({"event": "offline"})))
            .await;
        let reply = router
            .dispatch(Envelope::new(
                "savedata",
                json!({"item": {"content": "saved on a plane"}}),
            ))
            .await;

        assert_eq!(reply["success"], true);
        assert_eq!(reply["item"]["pending"], true);
        assert!(reply["item"]["id"].as_str().unwrap().starts_with("temp_"));

        let reply = router
            .dispatch(Envelope::new("savedata", json!({"action": "getAll"})))
            .await;
        assert_eq!(reply["pendingCount"], 1);
        assert_eq!(reply["offline"], true);
        assert_eq!(reply["items"][0]["content"], "saved on a plane");
    }

    #[tokio::test]
    async fn test_invalid_item_is_rejected_not_queued() {
        let (router, context) = router_for("http://127.0.0.1:9");
        let reply = router
            .dispatch(Envelope::new("savedata", json!({"item": {"content": ""}})))
            .await;
        assert_eq!(reply["kind"], "validation");
        assert!(context.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_logout_removes_credential() {
        let (router, context) = router_for("http://127.0.0.1:9");
        log_in(&context).await;
        context.network.set_online(false);

        let reply = router
            .dispatch(Envelope::new("auth", json!({"action": "logout"})))
            .await;
        assert_eq!(reply["success"], true);
        assert!(context.storage.get(CREDENTIAL_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lifecycle_unknown_event() {
        let (router, _) = router_for("http://127.0.0.1:9");
        let reply = router
            .dispatch(Envelope::new("lifecycle", json!({"event": "sleep"})))
            .await;
        assert_eq!(reply["success"], false);
    }

    #[tokio::test]
    async fn test_bus_matches_replies_to_callers() {
        let (router, _) = router_for("http://127.0.0.1:9");
        let bus = MessageBus::spawn(Arc::new(router), Duration::from_secs(5));

        let calls = (0..10).map(|i| {
            let name = if i % 2 == 0 {
                "auth".to_string()
            } else {
                format!("unknown{}", i)
            };
            bus.call(Envelope::new(name, json!({"action": "checkAuth"})))
        });
        let replies = futures::future::join_all(calls).await;

        for (i, reply) in replies.into_iter().enumerate() {
            let reply = reply.unwrap();
            if i % 2 == 0 {
                assert_eq!(reply["authenticated"], false);
            } else {
                assert_eq!(reply["error"], format!("Unknown message: unknown{}", i));
            }
        }
        assert_eq!(bus.in_flight(), 0);
    }
}
