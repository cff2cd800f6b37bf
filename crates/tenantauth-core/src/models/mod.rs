//! Session data model: tokens, identity, tenant and permissions.

pub mod identity;
pub mod session;

pub use identity::{PermissionSet, TenantDescriptor, UserIdentity};
pub use session::{EndReason, SessionBundle, SessionState, TokenPair};
