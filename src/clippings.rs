// Clipping writes and reads
// The caller side of the interceptor: failed writes become pending writes

use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::auth::AuthManager;
use crate::error::{ApiError, Result};
use crate::http_client::{ApiClient, RequestSpec};
use crate::network::NetworkMonitor;
use crate::queue::{is_temp_id, OfflineQueue};

pub const CLIPPINGS_PATH: &str = "/clippings";

/// Upper bound accepted for `limit` on list calls
pub const MAX_LIST_LIMIT: usize = 100;

/// Client-side fields never sent to the server
const CLIENT_MARKERS: [&str; 4] = ["id", "tempId", "pending", "offline"];

/// Pending records followed by server records
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClippingList {
    pub items: Vec<Value>,
    pub pending_count: usize,
    /// True when the server could not be reached and only pending items are listed
    pub offline: bool,
}

pub struct ClipService {
    api: Arc<ApiClient>,
    auth: Arc<AuthManager>,
    queue: Arc<OfflineQueue>,
    network: NetworkMonitor,
}

impl ClipService {
    pub fn new(
        api: Arc<ApiClient>,
        auth: Arc<AuthManager>,
        queue: Arc<OfflineQueue>,
        network: NetworkMonitor,
    ) -> Self {
        Self {
            api,
            auth,
            queue,
            network,
        }
    }

    /// Save a clipping. Never visibly fails for connectivity reasons: when
    /// the server is unreachable the clipping is queued and its optimistic
    /// record (temp id, `pending: true`) is returned instead.
    pub async fn save_clipping(&self, item: Value) -> Result<Value> {
        let payload = validate_clipping(item)?;

        if !self.network.is_online() {
            return self.park(payload).await;
        }

        match self
            .api
            .request(&RequestSpec::post(CLIPPINGS_PATH, payload.clone()))
            .await
        {
            Ok(response) => {
                let status = response.status;
                match server_record(response.data.clone(), status) {
                    Ok(record) => Ok(record),
                    Err(_) => {
                        tracing::warn!(status, "Clipping saved but response has no id");
                        Ok(response.data.unwrap_or(payload))
                    }
                }
            }
            Err(e) if e.should_queue_write() => {
                tracing::warn!("Clipping save failed, queueing for later: {}", e);
                self.park(payload).await
            }
            Err(ApiError::AuthError(message)) => {
                // Keep the clipping; the credential is gone, so the UI's
                // storage listener sends the user back to login
                tracing::warn!("Clipping save rejected, session ended: {}", message);
                self.auth.force_logout().await;
                self.park(payload).await
            }
            Err(e) => Err(e),
        }
    }

    /// GET /clippings?limit=N, returning the server's array untouched
    pub async fn get_recent_clippings(&self, limit: usize) -> Result<Vec<Value>> {
        if limit == 0 || limit > MAX_LIST_LIMIT {
            return Err(ApiError::ValidationError(format!(
                "limit must be between 1 and {}",
                MAX_LIST_LIMIT
            )));
        }

        let response = match self
            .api
            .request(&RequestSpec::get(CLIPPINGS_PATH).query("limit", limit))
            .await
        {
            Ok(response) => response,
            Err(ApiError::AuthError(message)) => {
                tracing::warn!("Listing rejected, session ended: {}", message);
                self.auth.force_logout().await;
                return Err(ApiError::AuthError(message));
            }
            Err(e) => return Err(e),
        };

        match response.data {
            Some(Value::Array(items)) => Ok(items),
            None => Ok(Vec::new()),
            Some(_) => Err(ApiError::ServerError {
                status: response.status,
                message: "Expected an array of clippings".to_string(),
            }),
        }
    }

    /// Pending clippings first, then the most recent server clippings
    pub async fn get_all(&self, limit: usize) -> Result<ClippingList> {
        let pending: Vec<Value> = self
            .queue
            .list()
            .await?
            .iter()
            .map(|entry| entry.optimistic_record())
            .collect();
        let pending_count = pending.len();

        let (server, offline) = match self.get_recent_clippings(limit).await {
            Ok(items) => (items, false),
            Err(e @ ApiError::NetworkError { .. }) => {
                tracing::debug!("Listing pending clippings only: {}", e);
                (Vec::new(), true)
            }
            Err(e) => return Err(e),
        };

        let mut items = pending;
        items.extend(server);
        Ok(ClippingList {
            items,
            pending_count,
            offline,
        })
    }

    async fn park(&self, payload: Value) -> Result<Value> {
        let pending = self.queue.enqueue(payload).await?;
        Ok(pending.optimistic_record())
    }
}

/// A clipping must be an object with some non-empty `content` or `text`
pub fn validate_clipping(item: Value) -> Result<Value> {
    let Value::Object(map) = item else {
        return Err(ApiError::ValidationError(
            "Clipping must be a JSON object".to_string(),
        ));
    };

    let has_content = ["content", "text"].iter().any(|field| {
        map.get(*field)
            .and_then(Value::as_str)
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false)
    });
    if !has_content {
        return Err(ApiError::ValidationError(
            "Clipping has no content".to_string(),
        ));
    }

    Ok(strip_client_markers(&Value::Object(map)))
}

/// Remove the temp id and offline markers before a payload goes out
pub fn strip_client_markers(payload: &Value) -> Value {
    match payload {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .iter()
                .filter(|(key, _)| !CLIENT_MARKERS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            Value::Object(cleaned)
        }
        other => other.clone(),
    }
}

/// The server-confirmed record: the body itself, or wrapped in
/// `clipping` / `data`, carrying a real (non-temp) id
pub fn server_record(data: Option<Value>, status: u16) -> Result<Value> {
    let missing = || ApiError::ServerError {
        status,
        message: "Response does not contain a saved record".to_string(),
    };

    let data = data.ok_or_else(missing)?;
    let record = match data {
        Value::Object(mut map) if !map.contains_key("id") => ["clipping", "data"]
            .iter()
            .find_map(|key| map.remove(*key))
            .ok_or_else(missing)?,
        other => other,
    };

    match record_id(&record) {
        Some(id) if !is_temp_id(&id) => Ok(record),
        _ => Err(missing()),
    }
}

/// Server ids may be strings or numbers
pub fn record_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_clipping() {
        assert!(validate_clipping(json!("just text")).is_err());
        assert!(validate_clipping(json!({"content": "   "})).is_err());
        assert!(validate_clipping(json!({"url": "https://example.com"})).is_err());

        let ok = validate_clipping(json!({"text": "hi", "id": "temp_1_x", "pending": true})).unwrap();
        assert_eq!(ok, json!({"text": "hi"}));
    }

    #[test]
    fn test_strip_client_markers() {
        let payload = json!({
            "id": "temp_1_abc",
            "tempId": "temp_1_abc",
            "offline": true,
            "pending": true,
            "content": "quote",
            "url": "https://example.com"
        });
        assert_eq!(
            strip_client_markers(&payload),
            json!({"content": "quote", "url": "https://example.com"})
        );
    }

    #[test]
    fn test_server_record_shapes() {
        let direct = server_record(Some(json!({"id": "c_1", "content": "x"})), 201).unwrap();
        assert_eq!(direct["id"], "c_1");

        let wrapped = server_record(Some(json!({"clipping": {"id": 42}})), 201).unwrap();
        assert_eq!(record_id(&wrapped).unwrap(), "42");

        let data = server_record(Some(json!({"data": {"id": "c_2"}})), 200).unwrap();
        assert_eq!(data["id"], "c_2");
    }

    #[test]
    fn test_server_record_requires_real_id() {
        assert!(server_record(None, 204).is_err());
        assert!(server_record(Some(json!({"ok": true})), 200).is_err());
        assert!(server_record(Some(json!({"id": "temp_1_abc"})), 200).is_err());
        assert!(server_record(Some(json!({"id": ""})), 200).is_err());
    }
}
