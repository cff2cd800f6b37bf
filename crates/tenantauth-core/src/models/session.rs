use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{PermissionSet, TenantDescriptor, UserIdentity};

/// Access/refresh token pair. Debug output never includes token material.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl TokenPair {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True when the token is within `threshold` of expiry (or past it).
    pub fn needs_refresh(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.expires_at - now <= threshold
    }

    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }
}

/// Everything a login or refresh yields. Always written and cleared as a
/// unit so the tenant can never drift from the token it was issued with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBundle {
    pub tokens: TokenPair,
    pub user: UserIdentity,
    pub tenant: TenantDescriptor,
    pub permissions: PermissionSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum SessionState {
    Uninitialized,
    Authenticating,
    Authenticated,
    Refreshing,
    IdleTimeout,
    LoggedOut,
}

impl SessionState {
    /// Transition table of the session state machine.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Uninitialized, Authenticated)
                | (Uninitialized, LoggedOut)
                | (Uninitialized, Authenticating)
                | (LoggedOut, Authenticating)
                | (Authenticating, Authenticated)
                | (Authenticating, LoggedOut)
                | (Authenticated, Authenticating)
                | (Authenticated, Refreshing)
                | (Authenticated, IdleTimeout)
                | (Authenticated, LoggedOut)
                | (Refreshing, Authenticated)
                | (Refreshing, IdleTimeout)
                | (Refreshing, LoggedOut)
                | (IdleTimeout, LoggedOut)
        )
    }

    /// States in which a usable token pair is held.
    pub fn has_session(self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Refreshing)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Authenticating => "authenticating",
            SessionState::Authenticated => "authenticated",
            SessionState::Refreshing => "refreshing",
            SessionState::IdleTimeout => "idle-timeout",
            SessionState::LoggedOut => "logged-out",
        };
        f.write_str(name)
    }
}

/// Why the most recent session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum EndReason {
    UserLogout,
    IdleTimeout,
    RefreshFailed,
    Unauthorized,
}
