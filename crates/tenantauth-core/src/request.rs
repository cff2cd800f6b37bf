//! Authenticated request layer.
//!
//! Every outbound call goes through `AuthorizedClient`: it asks the session
//! for a valid token (refreshing if needed), attaches the bearer token and
//! the tenant header, and maps authorization failures back onto the session.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::ApiError;
use crate::error::AuthError;
use crate::session::SessionManager;

#[derive(Error, Debug)]
pub enum RequestError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl RequestError {
    /// The session-level error, if this failure has one.
    pub fn auth_error(&self) -> Option<&AuthError> {
        match self {
            RequestError::Auth(e) => Some(e),
            RequestError::Api(_) => None,
        }
    }
}

/// Map an authorization rejection onto the session taxonomy.
///
/// 401 means the session is gone; 403 and a 422 carrying the tenant-violation
/// marker are per-request failures that leave the session alone. Anything
/// else is not an authorization concern and yields `None`.
pub fn classify_rejection(status: StatusCode, body: &str) -> Option<AuthError> {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Some(AuthError::from_authenticated_call(ApiError::from_status(status, body)))
        }
        StatusCode::UNPROCESSABLE_ENTITY if ApiError::is_tenant_violation(body) => {
            match ApiError::from_status(status, body) {
                ApiError::Unprocessable(msg) => Some(AuthError::TenantIsolationViolation(msg)),
                _ => None,
            }
        }
        _ => None,
    }
}

/// HTTP client for tenant-scoped API calls on behalf of the session.
#[derive(Clone)]
pub struct AuthorizedClient {
    client: Client,
    base_url: String,
    session: SessionManager,
}

impl AuthorizedClient {
    pub fn new(session: SessionManager) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(session.config().request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::with_client(client, session))
    }

    pub fn with_client(client: Client, session: SessionManager) -> Self {
        let base_url = session.config().api_base_url.trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            session,
        }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RequestError> {
        let request = self.client.get(self.url(path));
        self.send(request).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, RequestError> {
        let request = self.client.post(self.url(path)).json(body);
        self.send(request).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), RequestError> {
        let request = self.client.delete(self.url(path));
        let response = self.dispatch(request).await?;
        drop(response);
        Ok(())
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RequestError> {
        let response = self.dispatch(request).await?;
        let text = response.text().await.map_err(ApiError::from)?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse response: {}", e)).into())
    }

    async fn dispatch(&self, request: RequestBuilder) -> Result<reqwest::Response, RequestError> {
        let request = self.authorize(request).await?;
        let response = request.send().await.map_err(ApiError::from)?;
        let status = response.status();
        debug!(url = %response.url(), status = %status, "API responded");
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(self.reject(status, &body).await)
    }

    /// Attach the bearer token and tenant header, both taken from one
    /// session snapshot. Fails without a session.
    pub(crate) async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, AuthError> {
        let bundle = self
            .session
            .ensure_valid_session()
            .await?
            .ok_or(AuthError::NotAuthenticated)?;

        Ok(request
            .header(header::ACCEPT, "application/json")
            .bearer_auth(&bundle.tokens.access_token)
            .header(self.session.config().tenant_header.as_str(), bundle.tenant.id.as_str()))
    }

    async fn reject(&self, status: StatusCode, body: &str) -> RequestError {
        match classify_rejection(status, body) {
            Some(AuthError::SessionExpired) => {
                warn!("API rejected the session token, logging out");
                self.session.handle_unauthorized().await;
                AuthError::SessionExpired.into()
            }
            Some(err) => {
                warn!(error = %err, "API rejected the request");
                err.into()
            }
            None => ApiError::from_status(status, body).into(),
        }
    }
}
