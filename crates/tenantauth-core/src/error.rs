use serde::Serialize;
use thiserror::Error;

use crate::api::ApiError;

/// Errors surfaced by the session manager and its collaborators.
///
/// `Clone` so that a single in-flight refresh can hand the same failure to
/// every caller awaiting it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authorization code has already been used")]
    ReplayedCode,

    #[error("Another login exchange is already in progress")]
    ExchangeInProgress,

    #[error("Authorization code was rejected: {0}")]
    InvalidCode(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Authentication server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Session expired - please sign in again")]
    SessionExpired,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Cross-tenant access rejected: {0}")]
    TenantIsolationViolation(String),

    #[error("Insufficient permissions: {0}")]
    InsufficientPermissions(String),

    #[error("Session ended after a period of inactivity")]
    IdleTimeout,

    #[error("Network error: {0}")]
    NetworkFailure(String),

    #[error("Invalid response from authentication server: {0}")]
    InvalidResponse(String),

    #[error("Credential storage error: {0}")]
    Storage(String),
}

/// Discriminant of [`AuthError`] without payload, for UI message lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum ErrorKind {
    ReplayedCode,
    ExchangeInProgress,
    InvalidCode,
    RateLimited,
    ServerUnavailable,
    RefreshFailed,
    NoRefreshToken,
    SessionExpired,
    NotAuthenticated,
    TenantIsolationViolation,
    InsufficientPermissions,
    IdleTimeout,
    NetworkFailure,
    InvalidResponse,
    Storage,
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::ReplayedCode => ErrorKind::ReplayedCode,
            AuthError::ExchangeInProgress => ErrorKind::ExchangeInProgress,
            AuthError::InvalidCode(_) => ErrorKind::InvalidCode,
            AuthError::RateLimited => ErrorKind::RateLimited,
            AuthError::ServerUnavailable(_) => ErrorKind::ServerUnavailable,
            AuthError::RefreshFailed(_) => ErrorKind::RefreshFailed,
            AuthError::NoRefreshToken => ErrorKind::NoRefreshToken,
            AuthError::SessionExpired => ErrorKind::SessionExpired,
            AuthError::NotAuthenticated => ErrorKind::NotAuthenticated,
            AuthError::TenantIsolationViolation(_) => ErrorKind::TenantIsolationViolation,
            AuthError::InsufficientPermissions(_) => ErrorKind::InsufficientPermissions,
            AuthError::IdleTimeout => ErrorKind::IdleTimeout,
            AuthError::NetworkFailure(_) => ErrorKind::NetworkFailure,
            AuthError::InvalidResponse(_) => ErrorKind::InvalidResponse,
            AuthError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether this error ends the session. The UI is expected to redirect to
    /// the login entry point for terminal errors and render the rest inline.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthError::RefreshFailed(_)
                | AuthError::NoRefreshToken
                | AuthError::SessionExpired
                | AuthError::IdleTimeout
        )
    }

    /// Map a failed authorization-code exchange onto the login error surface.
    pub fn from_exchange(err: ApiError) -> Self {
        match err {
            ApiError::RateLimited => AuthError::RateLimited,
            ApiError::ServerError(msg) => AuthError::ServerUnavailable(msg),
            ApiError::NetworkError(e) => AuthError::NetworkFailure(e.to_string()),
            ApiError::InvalidResponse(msg) => AuthError::InvalidResponse(msg),
            ApiError::Unauthorized => AuthError::InvalidCode("unauthorized".to_string()),
            ApiError::AccessDenied(msg)
            | ApiError::NotFound(msg)
            | ApiError::Unprocessable(msg)
            | ApiError::Rejected(msg) => AuthError::InvalidCode(msg),
        }
    }

    /// Every refresh failure collapses to `RefreshFailed`; the refresh token
    /// is treated as spent once the server has seen it.
    pub fn from_refresh(err: ApiError) -> Self {
        AuthError::RefreshFailed(err.to_string())
    }

    /// Map a failure of an authenticated call (identity re-fetch, revocation).
    pub fn from_authenticated_call(err: ApiError) -> Self {
        match err {
            ApiError::Unauthorized => AuthError::SessionExpired,
            ApiError::AccessDenied(msg) => AuthError::InsufficientPermissions(msg),
            ApiError::Unprocessable(msg) if ApiError::is_tenant_violation(&msg) => {
                AuthError::TenantIsolationViolation(msg)
            }
            ApiError::RateLimited => AuthError::RateLimited,
            ApiError::ServerError(msg) => AuthError::ServerUnavailable(msg),
            ApiError::NetworkError(e) => AuthError::NetworkFailure(e.to_string()),
            other => AuthError::InvalidResponse(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AuthError {
    fn from(err: anyhow::Error) -> Self {
        AuthError::Storage(format!("{:#}", err))
    }
}
