use anyhow::Result as AnyResult;
use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Client;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::credentials::CredentialStore;
use super::types::Credential;
use super::refresh::{self, RefreshError};
use super::{jwt, session};
use crate::config::{Config, MAX_REFRESH_THRESHOLD};
use crate::error::{ApiError, Result};
use crate::http_client::build_http_client;
use crate::network::NetworkMonitor;

/// How a refresh attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A usable credential is stored
    Refreshed,
    /// The session cannot be renewed: no credential, no refresh token, or
    /// the refresh endpoint refused it
    Rejected,
    /// Offline, timeout, 5xx. The stale credential stays stored.
    Failed,
}

impl RefreshOutcome {
    pub fn is_refreshed(self) -> bool {
        self == RefreshOutcome::Refreshed
    }
}

/// The one in-flight refresh, shared by every caller that needs it
type RefreshFuture = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Authentication manager
/// Owns the credential lifecycle: expiry prediction, single-flight refresh,
/// login, logout
pub struct AuthManager {
    store: CredentialStore,

    /// HTTP client for auth endpoints
    client: Client,

    network: NetworkMonitor,

    base_url: String,

    timezone: String,

    /// Pre-emptive refresh threshold
    refresh_threshold: Duration,

    /// Single slot holding the outstanding refresh, cleared once it settles
    refresh_slot: Arc<Mutex<Option<RefreshFuture>>>,

    /// Refresh failures since the last success
    refresh_failures: Arc<AtomicU32>,
}

impl AuthManager {
    pub fn new(store: CredentialStore, network: NetworkMonitor, config: &Config) -> AnyResult<Self> {
        Ok(Self {
            store,
            client: build_http_client(config)?,
            network,
            base_url: config.api_base_url.clone(),
            timezone: config.user_timezone.clone(),
            refresh_threshold: Duration::seconds(
                config.token_refresh_threshold.min(MAX_REFRESH_THRESHOLD) as i64,
            ),
            refresh_slot: Arc::new(Mutex::new(None)),
            refresh_failures: Arc::new(AtomicU32::new(0)),
        })
    }

    /// The stored credential, if it carries a non-empty access token
    pub async fn current(&self) -> Option<Credential> {
        load_credential(&self.store).await
    }

    pub async fn is_authenticated(&self) -> bool {
        self.current().await.is_some()
    }

    /// Check if the stored token expires within `threshold`.
    ///
    /// No credential means nothing to refresh. A credential whose expiry
    /// cannot be determined counts as expiring now.
    pub async fn is_expiring_soon(&self, threshold: Duration) -> bool {
        match self.current().await {
            None => false,
            Some(credential) => expires_within(&credential, threshold, Utc::now()),
        }
    }

    /// Whether the configured pre-emptive refresh threshold has been reached
    pub async fn needs_refresh(&self) -> bool {
        self.is_expiring_soon(self.refresh_threshold).await
    }

    /// A credential that is not already expired, refreshing first if needed.
    ///
    /// On refresh failure the stale credential stays stored; it is still
    /// returned while it has not actually expired.
    pub async fn ensure_valid(&self) -> Option<Credential> {
        let credential = self.current().await?;

        if !expires_within(&credential, self.refresh_threshold, Utc::now()) {
            return Some(credential);
        }

        if self.refresh().await.is_refreshed() {
            return self.current().await;
        }

        if expires_within(&credential, Duration::zero(), Utc::now()) {
            tracing::warn!("Token refresh failed and the stored token has expired");
            None
        } else {
            tracing::warn!("Using existing token despite refresh failure (not yet expired)");
            Some(credential)
        }
    }

    /// Refresh the access token; concurrent callers share one network call.
    pub async fn refresh(&self) -> RefreshOutcome {
        let refresh = {
            let mut slot = self
                .refresh_slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            match slot.as_ref() {
                Some(in_flight) => {
                    tracing::debug!("Joining in-flight token refresh");
                    in_flight.clone()
                }
                None => {
                    let fut = self.start_refresh();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };

        refresh.await
    }

    fn start_refresh(&self) -> RefreshFuture {
        let store = self.store.clone();
        let client = self.client.clone();
        let network = self.network.clone();
        let base_url = self.base_url.clone();
        let failures = Arc::clone(&self.refresh_failures);
        let slot = Arc::clone(&self.refresh_slot);

        async move {
            let outcome = run_refresh(&store, &client, &network, &base_url, &failures).await;
            slot.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            outcome
        }
        .boxed()
        .shared()
    }

    pub fn consecutive_refresh_failures(&self) -> u32 {
        self.refresh_failures.load(Ordering::SeqCst)
    }

    /// Log in with email and password; refused without I/O while offline
    pub async fn login(&self, email: &str, password: &str) -> Result<Credential> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(ApiError::ValidationError(
                "Email and password are required".to_string(),
            ));
        }
        if !self.network.is_online() {
            return Err(ApiError::offline());
        }

        let credential =
            session::login(&self.client, &self.base_url, &self.timezone, email, password).await?;
        self.store.set(&credential).await?;
        self.refresh_failures.store(0, Ordering::SeqCst);

        tracing::info!("Logged in as {}", email);
        Ok(credential)
    }

    /// Store a session handed over by the web frontend
    pub async fn adopt_session(&self, credential: Credential) -> Result<()> {
        if credential.access_token.trim().is_empty() {
            return Err(ApiError::ValidationError(
                "Session has no access token".to_string(),
            ));
        }

        self.store.set(&credential).await?;
        self.refresh_failures.store(0, Ordering::SeqCst);
        tracing::info!("Adopted web session");
        Ok(())
    }

    /// Notify the server (best effort), then always drop the local credential
    pub async fn logout(&self) -> Result<()> {
        if let Some(credential) = self.current().await {
            if self.network.is_online() {
                if let Err(e) =
                    session::logout(&self.client, &self.base_url, &credential.access_token).await
                {
                    tracing::warn!("Server logout failed, clearing local session anyway: {}", e);
                }
            }
        }

        self.store.remove().await?;
        self.refresh_failures.store(0, Ordering::SeqCst);
        tracing::info!("Logged out");
        Ok(())
    }

    /// Drop the local credential without contacting the server
    pub async fn force_logout(&self) {
        if let Err(e) = self.store.remove().await {
            tracing::error!("Failed to clear credential: {:#}", e);
        }
        self.refresh_failures.store(0, Ordering::SeqCst);
    }
}

async fn load_credential(store: &CredentialStore) -> Option<Credential> {
    match store.get().await {
        Ok(Some(credential)) if !credential.access_token.is_empty() => Some(credential),
        Ok(_) => None,
        Err(e) => {
            tracing::error!("Failed to read credential: {:#}", e);
            None
        }
    }
}

/// Expiry from the token's own `exp` claim, else the stored timestamp
pub fn credential_expiry(credential: &Credential) -> Option<DateTime<Utc>> {
    jwt::decode_expiry(&credential.access_token).or(credential.expires_at)
}

fn expires_within(credential: &Credential, threshold: Duration, now: DateTime<Utc>) -> bool {
    match credential_expiry(credential) {
        None => true,
        Some(expiry) => expiry - now <= threshold,
    }
}

/// Body of the shared refresh future
async fn run_refresh(
    store: &CredentialStore,
    client: &Client,
    network: &NetworkMonitor,
    base_url: &str,
    failures: &AtomicU32,
) -> RefreshOutcome {
    if !network.is_online() {
        tracing::debug!("Offline, skipping token refresh");
        return RefreshOutcome::Failed;
    }

    let Some(current) = load_credential(store).await else {
        tracing::debug!("No credential to refresh");
        return RefreshOutcome::Rejected;
    };

    let next = match refresh::refresh_credential(client, base_url, &current).await {
        Ok(next) => next,
        Err(RefreshError::MissingToken) => {
            tracing::debug!("Credential has no refresh token, cannot renew");
            return RefreshOutcome::Rejected;
        }
        Err(e) => {
            let count = failures.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::error!(failures = count, "Token refresh failed: {:#}", e);
            return if e.is_terminal() {
                RefreshOutcome::Rejected
            } else {
                RefreshOutcome::Failed
            };
        }
    };

    // Logout or a new login may have landed while the call was in flight
    match load_credential(store).await {
        Some(latest) if latest.refresh_token == current.refresh_token => {}
        Some(_) => {
            tracing::warn!("Session replaced during refresh, keeping the new session");
            return RefreshOutcome::Refreshed;
        }
        None => {
            tracing::warn!("Logged out during refresh, discarding refreshed token");
            return RefreshOutcome::Rejected;
        }
    }

    if let Err(e) = store.set(&next).await {
        failures.fetch_add(1, Ordering::SeqCst);
        tracing::error!("Failed to store refreshed credential: {:#}", e);
        return RefreshOutcome::Failed;
    }

    failures.store(0, Ordering::SeqCst);
    RefreshOutcome::Refreshed
}
