// Login and logout calls

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;

use super::types::{Credential, LoginRequest, TokenResponse};
use crate::error::{ApiError, Result};
use crate::http_client::{classify_transport_error, error_from_response, join_url};

pub const LOGIN_PATH: &str = "/auth/login";
pub const LOGOUT_PATH: &str = "/auth/logout";

/// POST /auth/login; a rejection carries the server's own message
pub async fn login(
    client: &Client,
    base_url: &str,
    timezone: &str,
    email: &str,
    password: &str,
) -> Result<Credential> {
    let response = client
        .post(join_url(base_url, LOGIN_PATH))
        .header(CONTENT_TYPE, "application/json")
        .header(crate::http_client::TIMEZONE_HEADER, timezone)
        .json(&LoginRequest { email, password })
        .send()
        .await
        .map_err(|e| classify_transport_error(&e))?;

    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    let status = response.status().as_u16();
    let data: TokenResponse = response
        .json()
        .await
        .map_err(|e| classify_transport_error(&e))?;

    if data.access_token.is_empty() {
        return Err(ApiError::ServerError {
            status,
            message: "Login response does not contain accessToken".to_string(),
        });
    }

    Ok(Credential {
        expires_at: data.expiry(),
        access_token: data.access_token,
        refresh_token: data.refresh_token.filter(|t| !t.is_empty()),
        profile: data.user,
    })
}

/// POST /auth/logout with the current access token
pub async fn logout(client: &Client, base_url: &str, access_token: &str) -> Result<()> {
    let response = client
        .post(join_url(base_url, LOGOUT_PATH))
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", access_token))
        .send()
        .await
        .map_err(|e| classify_transport_error(&e))?;

    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    Ok(())
}
