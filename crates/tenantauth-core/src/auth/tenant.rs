//! Tenant guard.
//!
//! Pure functions over the session state and the active tenant. Safe to call
//! from render-time route guards: no locking, no side effects, no panics.

use crate::models::{SessionState, TenantDescriptor};

/// Outcome of checking a route or request against the active tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantAccess {
    Granted,
    /// No authenticated session; redirect to login.
    Unauthenticated,
    /// Authenticated under a different tenant; redirect to an unauthorized view.
    Mismatch { required: String, active: String },
}

impl TenantAccess {
    pub fn is_granted(&self) -> bool {
        matches!(self, TenantAccess::Granted)
    }
}

pub fn check_tenant_access(
    state: SessionState,
    tenant: Option<&TenantDescriptor>,
    required_tenant_id: &str,
) -> TenantAccess {
    if state != SessionState::Authenticated {
        return TenantAccess::Unauthenticated;
    }
    match tenant {
        None => TenantAccess::Unauthenticated,
        Some(t) if !required_tenant_id.is_empty() && t.id == required_tenant_id => TenantAccess::Granted,
        Some(t) => TenantAccess::Mismatch {
            required: required_tenant_id.to_string(),
            active: t.id.clone(),
        },
    }
}

/// True iff the session is `Authenticated` under `required_tenant_id`.
pub fn validate_tenant_access(
    state: SessionState,
    tenant: Option<&TenantDescriptor>,
    required_tenant_id: &str,
) -> bool {
    check_tenant_access(state, tenant, required_tenant_id).is_granted()
}

/// Value for the tenant-scoping header on outbound requests.
pub fn tenant_header_value(state: SessionState, tenant: Option<&TenantDescriptor>) -> Option<String> {
    if !state.has_session() {
        return None;
    }
    tenant.map(|t| t.id.clone())
}
