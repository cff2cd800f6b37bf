//! HTTP client for the authentication endpoints.
//!
//! This module provides the `AuthBackend` trait the session manager talks to
//! and `HttpAuthBackend`, its reqwest implementation.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::types::{ExchangeRequest, LogoutRequest, RefreshRequest};
use super::{ApiError, AuthResponse, ProfileResponse};
use crate::config::SessionConfig;

const EXCHANGE_PATH: &str = "/auth/exchange";
const REFRESH_PATH: &str = "/auth/refresh";
const LOGOUT_PATH: &str = "/auth/logout";
const PROFILE_PATH: &str = "/auth/me";

/// The authentication backend as seen from the client.
///
/// Returns boxed futures so the manager can hold it as `Arc<dyn AuthBackend>`
/// and move calls into `'static` shared futures.
pub trait AuthBackend: Send + Sync {
    /// Exchange a one-time authorization code for a token pair.
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        redirect_uri: Option<&'a str>,
        state: Option<&'a str>,
    ) -> BoxFuture<'a, Result<AuthResponse, ApiError>>;

    /// Exchange a refresh token for a new token pair.
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<AuthResponse, ApiError>>;

    /// Re-fetch identity, tenant and permissions for the current token.
    fn fetch_profile<'a>(&'a self, access_token: &'a str) -> BoxFuture<'a, Result<ProfileResponse, ApiError>>;

    /// Revoke the server-side session.
    fn revoke<'a>(
        &'a self,
        access_token: &'a str,
        refresh_token: Option<&'a str>,
        all_devices: bool,
    ) -> BoxFuture<'a, Result<(), ApiError>>;
}

/// reqwest-backed `AuthBackend`.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpAuthBackend {
    client: Client,
    base_url: String,
}

impl HttpAuthBackend {
    pub fn new(config: &SessionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response, what: &str) -> Result<T, ApiError> {
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse {} response: {}", what, e)))
    }

    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        bearer: Option<&str>,
        body: &B,
    ) -> Result<T, ApiError> {
        let url = self.url(path);
        let mut request = self
            .client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        debug!(url = %url, status = %response.status(), "Auth endpoint responded");
        let response = Self::check_response(response).await?;
        Self::parse(response, path).await
    }
}

impl AuthBackend for HttpAuthBackend {
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        redirect_uri: Option<&'a str>,
        state: Option<&'a str>,
    ) -> BoxFuture<'a, Result<AuthResponse, ApiError>> {
        async move {
            let body = ExchangeRequest { code, redirect_uri, state };
            self.post(EXCHANGE_PATH, None, &body).await
        }
        .boxed()
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<AuthResponse, ApiError>> {
        async move {
            let body = RefreshRequest { refresh_token };
            self.post(REFRESH_PATH, None, &body).await
        }
        .boxed()
    }

    fn fetch_profile<'a>(&'a self, access_token: &'a str) -> BoxFuture<'a, Result<ProfileResponse, ApiError>> {
        async move {
            let url = self.url(PROFILE_PATH);
            let response = self
                .client
                .get(&url)
                .header(header::ACCEPT, "application/json")
                .bearer_auth(access_token)
                .send()
                .await?;
            let response = Self::check_response(response).await?;
            Self::parse(response, PROFILE_PATH).await
        }
        .boxed()
    }

    fn revoke<'a>(
        &'a self,
        access_token: &'a str,
        refresh_token: Option<&'a str>,
        all_devices: bool,
    ) -> BoxFuture<'a, Result<(), ApiError>> {
        async move {
            let url = self.url(LOGOUT_PATH);
            let body = LogoutRequest { refresh_token, all_devices };
            let response = self
                .client
                .post(&url)
                .bearer_auth(access_token)
                .json(&body)
                .send()
                .await?;
            Self::check_response(response).await?;
            Ok(())
        }
        .boxed()
    }
}
