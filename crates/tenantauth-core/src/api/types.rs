//! Wire types for the authentication endpoints.
//!
//! Identity providers are loose about field names and types (numeric ids,
//! camelCase vs snake_case, missing tenant blocks). Everything is validated
//! and normalized here into the fixed model types; raw payloads never leave
//! this module.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AuthError;
use crate::models::{PermissionSet, SessionBundle, TenantDescriptor, TokenPair, UserIdentity};

// ============================================================================
// Requests
// ============================================================================

#[derive(Serialize)]
pub struct ExchangeRequest<'a> {
    pub code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<&'a str>,
}

#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

#[derive(Serialize)]
pub struct LogoutRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<&'a str>,
    pub all_devices: bool,
}

// ============================================================================
// Responses
// ============================================================================

/// Body returned by the code exchange and refresh endpoints.
#[derive(Deserialize)]
pub struct AuthResponse {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(alias = "expiresIn")]
    pub expires_in: i64,
    pub user: RawUser,
    #[serde(default)]
    pub tenant: Option<RawTenant>,
    #[serde(default)]
    pub permissions: Option<Vec<String>>,
}

impl fmt::Debug for AuthResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthResponse")
            .field("expires_in", &self.expires_in)
            .field("user", &self.user)
            .field("tenant", &self.tenant)
            .field("permissions", &self.permissions)
            .finish_non_exhaustive()
    }
}

/// Body returned by the identity re-fetch endpoint.
#[derive(Debug, Deserialize)]
pub struct ProfileResponse {
    pub user: RawUser,
    #[serde(default)]
    pub tenant: Option<RawTenant>,
    #[serde(default)]
    pub permissions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawUser {
    pub id: Value,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "firstName")]
    pub first_name: Option<String>,
    #[serde(default, alias = "lastName")]
    pub last_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(
        default,
        alias = "organisationId",
        alias = "organizationId",
        alias = "organization_id"
    )]
    pub organisation_id: Option<Value>,
    #[serde(default, alias = "isActive")]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTenant {
    pub id: Value,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default, alias = "subscriptionPlan", alias = "plan")]
    pub subscription_plan: Option<String>,
}

/// Identity, tenant and permissions without tokens.
pub type Profile = (UserIdentity, TenantDescriptor, PermissionSet);

impl AuthResponse {
    /// Validate and normalize into a `SessionBundle`.
    ///
    /// `previous_refresh_token` is reused when a refresh response does not
    /// rotate the refresh token.
    pub fn into_bundle(
        self,
        now: DateTime<Utc>,
        previous_refresh_token: Option<&str>,
    ) -> Result<SessionBundle, AuthError> {
        let access_token = self.access_token.trim().to_string();
        if access_token.is_empty() {
            return Err(AuthError::InvalidResponse("empty access token".into()));
        }

        let refresh_token = self
            .refresh_token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .or_else(|| previous_refresh_token.map(str::to_string))
            .ok_or(AuthError::NoRefreshToken)?;

        let expires_at = Some(self.expires_in)
            .filter(|secs| *secs > 0)
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| AuthError::InvalidResponse(format!("expires_in out of range: {}", self.expires_in)))?;

        let (user, tenant, permissions) = normalize_profile(self.user, self.tenant, self.permissions)?;

        Ok(SessionBundle {
            tokens: TokenPair {
                access_token,
                refresh_token,
                expires_at,
            },
            user,
            tenant,
            permissions,
        })
    }
}

impl ProfileResponse {
    pub fn into_profile(self) -> Result<Profile, AuthError> {
        normalize_profile(self.user, self.tenant, self.permissions)
    }
}

fn normalize_profile(
    user: RawUser,
    tenant: Option<RawTenant>,
    permissions: Option<Vec<String>>,
) -> Result<Profile, AuthError> {
    let user = normalize_user(user)?;
    let tenant = tenant
        .ok_or_else(|| AuthError::InvalidResponse("response carries no tenant".into()))
        .and_then(normalize_tenant)?;

    // A user bound to another organisation must never be paired with this tenant
    if let Some(ref org) = user.organisation_id {
        if *org != tenant.id {
            return Err(AuthError::TenantIsolationViolation(format!(
                "user organisation {} does not match tenant {}",
                org, tenant.id
            )));
        }
    }

    let permissions = PermissionSet::new(
        permissions
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty()),
    );

    Ok((user, tenant, permissions))
}

fn normalize_user(raw: RawUser) -> Result<UserIdentity, AuthError> {
    let id = id_string(&raw.id).ok_or_else(|| AuthError::InvalidResponse("user has no id".into()))?;
    Ok(UserIdentity {
        id,
        email: raw.email.map(|e| e.trim().to_lowercase()).unwrap_or_default(),
        first_name: trimmed(raw.first_name),
        last_name: trimmed(raw.last_name),
        role: trimmed(raw.role),
        organisation_id: raw.organisation_id.as_ref().and_then(id_string),
        is_active: raw.is_active.unwrap_or(true),
    })
}

fn normalize_tenant(raw: RawTenant) -> Result<TenantDescriptor, AuthError> {
    let id = id_string(&raw.id).ok_or_else(|| AuthError::InvalidResponse("tenant has no id".into()))?;
    let name = raw
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| id.clone());
    Ok(TenantDescriptor {
        id,
        name,
        industry: raw.industry.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
        subscription_plan: raw
            .subscription_plan
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
    })
}

/// Ids arrive as strings or numbers; anything else is rejected.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn trimmed(value: Option<String>) -> String {
    value.map(|v| v.trim().to_string()).unwrap_or_default()
}
