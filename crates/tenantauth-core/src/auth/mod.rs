//! Authentication building blocks used by the session manager.
//!
//! This module provides:
//! - `CredentialStore`: tokens in the OS keychain, the identity/tenant record
//!   sealed on disk, always written and cleared as one unit
//! - `ActivityTracker`: last-interaction stamp for idle timeout
//! - `LoginExchangeGuard`: replay and overlap protection for code exchange
//! - `RefreshCoordinator`: single in-flight token refresh
//! - tenant guard functions for route and request checks

pub mod activity;
pub mod cipher;
pub mod credentials;
pub mod exchange;
pub mod refresh;
pub mod storage;
pub mod tenant;

pub use activity::{ActivityTracker, InteractionKind, TRACKED_INTERACTIONS};
pub use credentials::{CredentialStore, StoredSession};
pub use exchange::{AuthCodeLedger, ExchangeTicket, LoginExchangeGuard};
pub use refresh::{should_refresh, PendingRefresh, RefreshCoordinator, RefreshResult};
pub use storage::{
    FileRecordStore, KeyringSecretStore, MemoryRecordStore, MemorySecretStore, RecordStore, SecretStore,
};
pub use tenant::{check_tenant_access, tenant_header_value, validate_tenant_access, TenantAccess};
