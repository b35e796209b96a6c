// Token refresh logic

use anyhow::Context;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use thiserror::Error;

use super::types::{Credential, TokenResponse};
use crate::http_client::join_url;

pub const REFRESH_PATH: &str = "/auth/refresh";

#[derive(Error, Debug)]
pub enum RefreshError {
    /// Nothing to exchange; the session cannot be renewed
    #[error("No refresh token available")]
    MissingToken,

    /// 401/403 from the refresh endpoint
    #[error("Refresh token rejected: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// Transport failure, 5xx, unreadable body
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

impl RefreshError {
    /// Whether retrying later cannot help
    pub fn is_terminal(&self) -> bool {
        matches!(self, RefreshError::MissingToken | RefreshError::Rejected { .. })
    }
}

/// Exchange the stored refresh token for a new credential.
///
/// The refresh token travels as the bearer. Fields the server omits
/// (refresh token, profile) are carried over from `current`.
pub async fn refresh_credential(
    client: &Client,
    base_url: &str,
    current: &Credential,
) -> Result<Credential, RefreshError> {
    let refresh_token = current
        .refresh_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or(RefreshError::MissingToken)?;

    tracing::info!("Refreshing access token...");

    let response = client
        .post(join_url(base_url, REFRESH_PATH))
        .header(AUTHORIZATION, format!("Bearer {}", refresh_token))
        .header(CONTENT_TYPE, "application/json")
        .send()
        .await
        .context("Failed to send refresh request")?;

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(RefreshError::Rejected {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        });
    }
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        return Err(anyhow::anyhow!("Token refresh failed: {} - {}", status, error_text).into());
    }

    let data: TokenResponse = response
        .json()
        .await
        .context("Failed to parse refresh response")?;

    if data.access_token.is_empty() {
        return Err(anyhow::anyhow!("Refresh response does not contain accessToken").into());
    }

    let expires_at = data.expiry();
    match expires_at {
        Some(at) => tracing::info!("Token refreshed, expires: {}", at.to_rfc3339()),
        None => tracing::warn!("Token refreshed without an expiry, treating it as expired"),
    }

    Ok(Credential {
        access_token: data.access_token,
        refresh_token: data
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| current.refresh_token.clone()),
        expires_at,
        profile: data.user.or_else(|| current.profile.clone()),
    })
}
