//! Client-resident authentication and session lifecycle for multi-tenant apps.
//!
//! The crate is organised leaves first:
//! - `auth`: credential storage, activity tracking, the login exchange guard,
//!   the refresh coordinator and the tenant guard
//! - `session`: the `SessionManager` state machine and its timers
//! - `api`: the backend contract and its reqwest implementation
//! - `request`: the authenticated request layer used for outbound calls
//!
//! A process creates exactly one `SessionManager`, calls `initialize()` at
//! startup and hands clones of it to UI and networking code.

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod request;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{ApiError, AuthBackend, HttpAuthBackend};
pub use auth::{CredentialStore, InteractionKind, TenantAccess};
pub use clock::{Clock, SystemClock};
pub use config::SessionConfig;
pub use error::{AuthError, ErrorKind};
pub use models::{
    EndReason, PermissionSet, SessionBundle, SessionState, TenantDescriptor, TokenPair,
    UserIdentity,
};
pub use request::{AuthorizedClient, RequestError};
pub use session::{LoginRequest, SessionManager};
