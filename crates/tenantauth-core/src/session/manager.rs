//! The session manager: owner of the session state machine.
//!
//! ```text
//! Uninitialized ──► Authenticated ◄──► Refreshing
//!       │               │   ▲              │
//!       ▼               ▼   │              ▼
//!   LoggedOut ──► Authenticating      IdleTimeout ──► LoggedOut
//! ```
//!
//! All mutation goes through this type. Login and refresh each have a single
//! in-flight guard; logout is idempotent and revokes server-side at most once
//! per session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::FutureExt;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::timers::SessionTimers;
use crate::api::AuthBackend;
use crate::auth::refresh::RefreshResult;
use crate::auth::{
    check_tenant_access, should_refresh, tenant_header_value, validate_tenant_access, ActivityTracker,
    CredentialStore, ExchangeTicket, InteractionKind, LoginExchangeGuard, RefreshCoordinator, StoredSession,
    TenantAccess,
};
use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::error::AuthError;
use crate::models::{EndReason, PermissionSet, SessionBundle, SessionState, TenantDescriptor, UserIdentity};

/// Input to `SessionManager::login`.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub code: String,
    pub redirect_uri: Option<String>,
    pub state: Option<String>,
}

impl LoginRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            redirect_uri: None,
            state: None,
        }
    }

    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(redirect_uri.into());
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }
}

type CacheInvalidator = Box<dyn Fn() + Send + Sync>;

pub(crate) struct Inner {
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    backend: Arc<dyn AuthBackend>,
    credentials: CredentialStore,
    activity: ActivityTracker,
    exchange: LoginExchangeGuard,
    refresh: RefreshCoordinator,
    state: watch::Sender<SessionState>,
    timers: Mutex<Option<SessionTimers>>,
    /// Held while a server-side revocation is in flight.
    revoking: AtomicBool,
    /// Bumped on every successful login.
    login_epoch: AtomicU64,
    end_reason: Mutex<Option<EndReason>>,
    cache_invalidators: Mutex<Vec<CacheInvalidator>>,
}

/// Handle to the process-wide session. Clone is cheap; all clones share state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, backend: Arc<dyn AuthBackend>, credentials: CredentialStore) -> Self {
        Self::with_clock(config, backend, credentials, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: SessionConfig,
        backend: Arc<dyn AuthBackend>,
        credentials: CredentialStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Uninitialized);
        let now = clock.now();
        Self {
            inner: Arc::new(Inner {
                exchange: LoginExchangeGuard::new(config.code_ledger_capacity),
                activity: ActivityTracker::new(now),
                refresh: RefreshCoordinator::new(),
                config,
                clock,
                backend,
                credentials,
                state,
                timers: Mutex::new(None),
                revoking: AtomicBool::new(false),
                login_epoch: AtomicU64::new(0),
                end_reason: Mutex::new(None),
                cache_invalidators: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn from_weak(inner: &Weak<Inner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    // ===== Lifecycle =====

    /// Restore a stored session, if a valid one exists.
    ///
    /// Must be called from within a Tokio runtime: an authenticated start
    /// spawns the idle and refresh timers.
    pub fn initialize(&self) -> SessionState {
        if self.state() != SessionState::Uninitialized {
            return self.state();
        }

        let now = self.inner.clock.now();
        match self.inner.credentials.load() {
            Ok(Some(stored)) if !stored.bundle.tokens.is_expired(now) => {
                info!(
                    tenant = %stored.bundle.tenant.id,
                    minutes_left = stored.bundle.tokens.time_until_expiry(now).num_minutes(),
                    "Restored stored session"
                );
                self.inner.activity.track(now);
                if self.transition(SessionState::Authenticated) {
                    self.start_timers();
                }
            }
            Ok(Some(_)) => {
                info!("Stored session has expired");
                self.inner.credentials.clear();
                self.transition(SessionState::LoggedOut);
            }
            Ok(None) => {
                debug!("No stored session found");
                self.transition(SessionState::LoggedOut);
            }
            Err(e) => {
                warn!(error = %e, "Failed to load stored session");
                self.inner.credentials.clear();
                self.transition(SessionState::LoggedOut);
            }
        }
        self.state()
    }

    /// Stop the timers without touching stored credentials. For process teardown.
    pub fn shutdown(&self) {
        self.cancel_timers();
    }

    // ===== State =====

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state().has_session() && self.inner.credentials.current().is_some()
    }

    pub fn last_end_reason(&self) -> Option<EndReason> {
        *lock(&self.inner.end_reason)
    }

    fn transition(&self, next: SessionState) -> bool {
        let mut from = next;
        let changed = self.inner.state.send_if_modified(|current| {
            from = *current;
            if *current != next && current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });

        if changed {
            debug!(from = %from, to = %next, "Session state transition");
        } else if from != next {
            warn!(from = %from, to = %next, "Rejected session state transition");
        }
        changed
    }

    fn session(&self) -> Option<StoredSession> {
        if !self.state().has_session() {
            return None;
        }
        self.inner.credentials.current()
    }

    // ===== Login =====

    /// Exchange an authorization code for a session.
    pub async fn login(&self, request: LoginRequest) -> Result<Arc<SessionBundle>, AuthError> {
        let ticket = self.inner.exchange.begin(&request.code)?;
        let previous = self.state();
        if previous == SessionState::Refreshing {
            // Token rotation is in progress; retry once it settles
            return Err(AuthError::ExchangeInProgress);
        }

        let mut attempt = LoginAttempt {
            manager: self,
            previous,
            ticket: Some(ticket),
            finished: false,
        };
        if !self.transition(SessionState::Authenticating) {
            attempt.finished = true;
            return Err(match self.state() {
                // An idle logout is tearing the session down
                SessionState::IdleTimeout => AuthError::NotAuthenticated,
                _ => AuthError::ExchangeInProgress,
            });
        }

        let redirect_uri = request
            .redirect_uri
            .as_deref()
            .or(self.inner.config.redirect_uri.as_deref());
        let response = self
            .inner
            .backend
            .exchange_code(&request.code, redirect_uri, request.state.as_deref())
            .await
            .map_err(AuthError::from_exchange);

        let bundle = match response.and_then(|r| r.into_bundle(self.inner.clock.now(), None)) {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(error = %e, "Login exchange failed");
                return Err(e);
            }
        };

        let stored = self.inner.credentials.replace(bundle)?;
        attempt.succeed();

        if !self.transition(SessionState::Authenticated) {
            // Logged out while the exchange was in flight
            self.inner.credentials.clear_if_current(stored.generation);
            return Err(AuthError::NotAuthenticated);
        }

        self.inner.login_epoch.fetch_add(1, Ordering::SeqCst);
        *lock(&self.inner.end_reason) = None;
        self.inner.activity.track(self.inner.clock.now());
        self.start_timers();

        info!(
            tenant = %stored.bundle.tenant.id,
            user = %stored.bundle.user.id,
            "Login succeeded"
        );
        Ok(stored.bundle)
    }

    // ===== Refresh =====

    /// Whether the current token is within the refresh threshold.
    pub fn should_refresh(&self) -> bool {
        self.session()
            .map(|s| {
                should_refresh(
                    &s.bundle.tokens,
                    self.inner.clock.now(),
                    self.inner.config.refresh_threshold(),
                )
            })
            .unwrap_or(false)
    }

    /// Rotate the token pair. Concurrent callers share one network call.
    ///
    /// Any failure ends the session.
    pub async fn refresh(&self) -> RefreshResult {
        match self.state() {
            SessionState::Authenticating => return Err(AuthError::ExchangeInProgress),
            state if !state.has_session() => return Err(AuthError::NoRefreshToken),
            _ => {}
        }

        let manager = self.clone();
        let result = self
            .inner
            .refresh
            .run(move || async move { manager.perform_refresh().await }.boxed())
            .await;

        if let Err(ref e) = result {
            // The refresh task died before it could settle the session
            if e.is_terminal() && self.state() == SessionState::Refreshing {
                warn!(error = %e, "Refresh aborted, ending session");
                self.end_session(EndReason::RefreshFailed);
            }
        }
        result
    }

    async fn wait_for_refresh(&self) {
        if let Some(pending) = self.inner.refresh.pending() {
            let _ = pending.await;
        }
    }

    /// Leave `Refreshing` after a refresh that installed nothing.
    fn settle_refresh(&self) {
        if self.state() != SessionState::Refreshing {
            return;
        }
        if self.inner.credentials.current().is_some() {
            self.transition(SessionState::Authenticated);
        } else {
            self.end_session(EndReason::RefreshFailed);
        }
    }

    async fn perform_refresh(&self) -> RefreshResult {
        let stored = match self.inner.credentials.current() {
            Some(stored) if !stored.bundle.tokens.refresh_token.is_empty() => stored,
            _ => {
                warn!("Refresh requested without a refresh token");
                self.end_session(EndReason::RefreshFailed);
                return Err(AuthError::NoRefreshToken);
            }
        };
        if !self.transition(SessionState::Refreshing) {
            return Err(AuthError::NotAuthenticated);
        }

        let previous = &stored.bundle;
        let result = match self.inner.backend.refresh(&previous.tokens.refresh_token).await {
            Ok(response) => response
                .into_bundle(self.inner.clock.now(), Some(&previous.tokens.refresh_token))
                .map_err(|e| AuthError::RefreshFailed(e.to_string()))
                .and_then(|bundle| {
                    if bundle.tenant.id == previous.tenant.id {
                        Ok(bundle)
                    } else {
                        Err(AuthError::RefreshFailed(format!(
                            "tenant changed from {} to {} during refresh",
                            previous.tenant.id, bundle.tenant.id
                        )))
                    }
                }),
            Err(e) => Err(AuthError::from_refresh(e)),
        };

        let bundle = match result {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(error = %e, "Token refresh failed, ending session");
                self.end_session(EndReason::RefreshFailed);
                return Err(e);
            }
        };

        let mut generation = stored.generation;
        loop {
            match self.inner.credentials.replace_if_current(generation, bundle.clone()) {
                Ok(Some(updated)) => {
                    self.transition(SessionState::Authenticated);
                    debug!(expires_at = %updated.bundle.tokens.expires_at, "Token refreshed");
                    return Ok(updated.bundle);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Failed to store refreshed session, ending session");
                    self.end_session(EndReason::RefreshFailed);
                    return Err(e);
                }
            }

            match self.inner.credentials.current() {
                // Same token pair, only the identity was rewritten: the
                // rotated tokens still belong to this session
                Some(current) if current.bundle.tokens.refresh_token == previous.tokens.refresh_token => {
                    generation = current.generation;
                }
                _ => {
                    debug!("Session replaced during refresh, discarding rotated tokens");
                    self.settle_refresh();
                    return Err(AuthError::NotAuthenticated);
                }
            }
        }
    }

    /// A usable session, refreshed first if its token is close to expiry.
    /// `Ok(None)` when there is no session.
    ///
    /// Token and tenant are read from the one returned bundle, so callers
    /// never pair a token with another session's tenant.
    pub async fn ensure_valid_session(&self) -> Result<Option<Arc<SessionBundle>>, AuthError> {
        let Some(stored) = self.session() else {
            return Ok(None);
        };
        let now = self.inner.clock.now();
        if !should_refresh(&stored.bundle.tokens, now, self.inner.config.refresh_threshold()) {
            return Ok(Some(stored.bundle));
        }

        match self.refresh().await {
            Ok(bundle) => Ok(Some(bundle)),
            // Replaced by a newer session while refreshing
            Err(AuthError::NotAuthenticated) => Ok(self.session().map(|s| s.bundle)),
            Err(e) => Err(e),
        }
    }

    /// A usable access token. See `ensure_valid_session`.
    pub async fn ensure_valid_token(&self) -> Result<Option<String>, AuthError> {
        Ok(self
            .ensure_valid_session()
            .await?
            .map(|bundle| bundle.tokens.access_token.clone()))
    }

    /// Re-fetch identity and permissions without rotating tokens.
    pub async fn refresh_user(&self) -> Result<UserIdentity, AuthError> {
        self.ensure_valid_session().await?.ok_or(AuthError::NotAuthenticated)?;
        // Never write over a token rotation in progress
        self.wait_for_refresh().await;
        let stored = self.session().ok_or(AuthError::NotAuthenticated)?;

        let profile = match self.inner.backend.fetch_profile(&stored.bundle.tokens.access_token).await {
            Ok(profile) => profile,
            Err(e) => {
                let err = AuthError::from_authenticated_call(e);
                if err == AuthError::SessionExpired {
                    self.logout_with(EndReason::Unauthorized, false).await;
                }
                return Err(err);
            }
        };

        let (user, tenant, permissions) = profile.into_profile()?;
        if tenant.id != stored.bundle.tenant.id {
            warn!(
                active = %stored.bundle.tenant.id,
                reported = %tenant.id,
                "Identity refresh reported a different tenant"
            );
            return Err(AuthError::TenantIsolationViolation(format!(
                "profile belongs to tenant {}",
                tenant.id
            )));
        }

        let bundle = SessionBundle {
            tokens: stored.bundle.tokens.clone(),
            user,
            tenant,
            permissions,
        };
        self.wait_for_refresh().await;
        match self.inner.credentials.replace_if_current(stored.generation, bundle)? {
            Some(updated) => Ok(updated.bundle.user.clone()),
            // Tokens rotated underneath us; the newer bundle wins
            None => self
                .session()
                .map(|s| s.bundle.user.clone())
                .ok_or(AuthError::NotAuthenticated),
        }
    }

    // ===== Logout =====

    pub async fn logout(&self, all_devices: bool) {
        self.logout_with(EndReason::UserLogout, all_devices).await;
    }

    /// Reaction to a 401 from an authenticated call.
    pub async fn handle_unauthorized(&self) {
        self.logout_with(EndReason::Unauthorized, false).await;
    }

    pub(crate) async fn logout_with(&self, reason: EndReason, all_devices: bool) {
        let epoch = self.inner.login_epoch.load(Ordering::SeqCst);
        if reason == EndReason::IdleTimeout {
            self.transition(SessionState::IdleTimeout);
        }

        if let Some(stored) = self.inner.credentials.current() {
            match RevocationClaim::acquire(&self.inner.revoking) {
                Some(_claim) => {
                    let tokens = &stored.bundle.tokens;
                    if let Err(e) = self
                        .inner
                        .backend
                        .revoke(&tokens.access_token, Some(&tokens.refresh_token), all_devices)
                        .await
                    {
                        warn!(error = %e, "Server-side logout failed, clearing local session anyway");
                    }
                }
                None => debug!("Revocation already in flight"),
            }
        }

        if self.inner.login_epoch.load(Ordering::SeqCst) != epoch {
            debug!("New login completed during logout, keeping it");
            return;
        }
        self.end_session(reason);
    }

    /// Client-side teardown, in order: credentials, derived caches, timers,
    /// state. Synchronous and idempotent.
    fn end_session(&self, reason: EndReason) {
        let was_active = !matches!(self.state(), SessionState::LoggedOut | SessionState::Uninitialized);

        self.inner.credentials.clear();
        self.clear_caches();
        self.cancel_timers();

        if was_active {
            *lock(&self.inner.end_reason) = Some(reason);
            if reason == EndReason::IdleTimeout {
                self.transition(SessionState::IdleTimeout);
            }
            info!(reason = ?reason, "Session ended");
        }
        self.transition(SessionState::LoggedOut);
    }

    /// Register a callback run when a session ends, to drop UI state derived
    /// from the session (cached tenant data and the like).
    pub fn register_cache_invalidator<F>(&self, invalidate: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.inner.cache_invalidators).push(Box::new(invalidate));
    }

    fn clear_caches(&self) {
        for invalidate in lock(&self.inner.cache_invalidators).iter() {
            invalidate();
        }
    }

    // ===== Activity & timers =====

    pub fn track_activity(&self) {
        self.inner.activity.track(self.inner.clock.now());
    }

    pub fn record_interaction(&self, kind: InteractionKind) {
        trace!(interaction = kind.event_name(), "User interaction");
        self.track_activity();
    }

    pub fn idle_duration(&self) -> chrono::Duration {
        self.inner.activity.idle_duration(self.inner.clock.now())
    }

    /// Whether an authenticated session has gone idle past the threshold.
    pub fn is_idle_timed_out(&self) -> bool {
        self.inner.config.idle_timeout_enabled
            && self.is_authenticated()
            && self
                .inner
                .activity
                .is_idle_timed_out(self.inner.clock.now(), self.inner.config.idle_timeout())
    }

    fn start_timers(&self) {
        let timers = SessionTimers::spawn(self);
        if let Some(old) = lock(&self.inner.timers).replace(timers) {
            old.cancel();
        }
    }

    fn cancel_timers(&self) {
        if let Some(timers) = lock(&self.inner.timers).take() {
            timers.cancel();
            debug!("Cancelled session timers");
        }
    }

    pub(crate) fn timers_active(&self) -> bool {
        lock(&self.inner.timers).is_some()
    }

    // ===== Read accessors (never fail) =====

    pub fn current_user(&self) -> Option<UserIdentity> {
        self.session().map(|s| s.bundle.user.clone())
    }

    pub fn get_tenant_context(&self) -> Option<TenantDescriptor> {
        self.session().map(|s| s.bundle.tenant.clone())
    }

    pub fn permissions(&self) -> Option<PermissionSet> {
        self.session().map(|s| s.bundle.permissions.clone())
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.session()
            .map(|s| s.bundle.permissions.contains(permission))
            .unwrap_or(false)
    }

    pub fn has_any_permission<S: AsRef<str>>(&self, permissions: &[S]) -> bool {
        self.session()
            .map(|s| s.bundle.permissions.contains_any(permissions))
            .unwrap_or(false)
    }

    pub fn validate_tenant_access(&self, required_tenant_id: &str) -> bool {
        let stored = self.inner.credentials.current();
        validate_tenant_access(
            self.state(),
            stored.as_ref().map(|s| &s.bundle.tenant),
            required_tenant_id,
        )
    }

    pub fn check_tenant_access(&self, required_tenant_id: &str) -> TenantAccess {
        let stored = self.inner.credentials.current();
        check_tenant_access(
            self.state(),
            stored.as_ref().map(|s| &s.bundle.tenant),
            required_tenant_id,
        )
    }

    /// Name and value of the tenant-scoping header for outbound requests.
    pub fn tenant_header(&self) -> Option<(String, String)> {
        let stored = self.inner.credentials.current();
        tenant_header_value(self.state(), stored.as_ref().map(|s| &s.bundle.tenant))
            .map(|value| (self.inner.config.tenant_header.clone(), value))
    }

    pub fn time_until_expiry(&self) -> Option<chrono::Duration> {
        self.session()
            .map(|s| s.bundle.tokens.time_until_expiry(self.inner.clock.now()))
    }

    /// Minutes remaining on the access token (for display)
    pub fn minutes_until_expiry(&self) -> Option<i64> {
        self.time_until_expiry().map(|d| d.num_minutes().max(0))
    }
}

/// Restores the pre-login state if a login does not complete. The exchange
/// ticket is dropped with it, releasing the authorization code.
struct LoginAttempt<'a> {
    manager: &'a SessionManager,
    previous: SessionState,
    ticket: Option<ExchangeTicket>,
    finished: bool,
}

impl LoginAttempt<'_> {
    fn succeed(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            ticket.commit();
        }
        self.finished = true;
    }
}

impl Drop for LoginAttempt<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let restore = if self.previous.has_session() && self.manager.inner.credentials.current().is_some() {
            SessionState::Authenticated
        } else {
            SessionState::LoggedOut
        };
        self.manager.transition(restore);
    }
}

/// Exclusive right to call the revocation endpoint.
struct RevocationClaim<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RevocationClaim<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RevocationClaim<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    use chrono::Duration;
    use reqwest::StatusCode;

    use crate::auth::{MemoryRecordStore, MemorySecretStore};
    use crate::test_support::{bundle_for, fixed_now, ManualClock, MockBackend};

    fn setup_with(config: SessionConfig) -> (SessionManager, Arc<MockBackend>, Arc<ManualClock>) {
        let backend = MockBackend::new();
        let clock = ManualClock::new(fixed_now());
        let manager = SessionManager::with_clock(
            config,
            backend.clone(),
            CredentialStore::in_memory(),
            clock.clone(),
        );
        (manager, backend, clock)
    }

    fn setup() -> (SessionManager, Arc<MockBackend>, Arc<ManualClock>) {
        setup_with(SessionConfig::default())
    }

    async fn logged_in() -> (SessionManager, Arc<MockBackend>, Arc<ManualClock>) {
        let (manager, backend, clock) = setup();
        manager.initialize();
        manager.login(LoginRequest::new("code-1")).await.unwrap();
        (manager, backend, clock)
    }

    async fn wait_for_state(manager: &SessionManager, state: SessionState) {
        while manager.state() != state {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_initialize_without_stored_session() {
        let (manager, _, _) = setup();
        assert_eq!(manager.initialize(), SessionState::LoggedOut);
        assert!(!manager.is_authenticated());
        assert!(!manager.timers_active());
        assert_eq!(manager.ensure_valid_token().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_initialize_restores_stored_session() {
        let secrets = Arc::new(MemorySecretStore::default());
        let records = Arc::new(MemoryRecordStore::default());
        CredentialStore::new(Arc::clone(&secrets), Arc::clone(&records))
            .replace(bundle_for("t1", "at-stored", fixed_now() + Duration::minutes(20)))
            .unwrap();

        let backend = MockBackend::new();
        let manager = SessionManager::with_clock(
            SessionConfig::default(),
            backend.clone(),
            CredentialStore::new(secrets, records),
            ManualClock::new(fixed_now()),
        );

        assert_eq!(manager.initialize(), SessionState::Authenticated);
        assert!(manager.timers_active());
        assert_eq!(manager.ensure_valid_token().await.unwrap().as_deref(), Some("at-stored"));
        assert_eq!(MockBackend::count(&backend.refresh_calls), 0);
    }

    #[tokio::test]
    async fn test_initialize_discards_expired_session() {
        let secrets = Arc::new(MemorySecretStore::default());
        let records = Arc::new(MemoryRecordStore::default());
        CredentialStore::new(Arc::clone(&secrets), Arc::clone(&records))
            .replace(bundle_for("t1", "at-old", fixed_now() - Duration::minutes(1)))
            .unwrap();

        let manager = SessionManager::with_clock(
            SessionConfig::default(),
            MockBackend::new(),
            CredentialStore::new(Arc::clone(&secrets), Arc::clone(&records)),
            ManualClock::new(fixed_now()),
        );

        assert_eq!(manager.initialize(), SessionState::LoggedOut);
        let reopened = CredentialStore::new(secrets, records);
        assert!(reopened.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_login_populates_session() {
        let (manager, backend, _) = logged_in().await;

        assert_eq!(manager.state(), SessionState::Authenticated);
        assert!(manager.is_authenticated());
        assert!(manager.timers_active());
        assert_eq!(MockBackend::count(&backend.exchange_calls), 1);

        assert_eq!(manager.get_tenant_context().unwrap().id, "t1");
        assert!(manager.has_permission("read:market_edge"));
        assert!(!manager.has_permission("admin:all"));
        assert!(manager.has_any_permission(&["admin:all", "write:reports"]));
        assert!(!manager.has_any_permission::<&str>(&[]));
        assert_eq!(
            manager.tenant_header(),
            Some(("X-Tenant-ID".to_string(), "t1".to_string()))
        );
        assert_eq!(manager.minutes_until_expiry(), Some(15));
    }

    #[tokio::test]
    async fn test_two_tenant_access() {
        let (manager, _, _) = logged_in().await;
        assert!(manager.validate_tenant_access("t1"));
        assert!(!manager.validate_tenant_access("t2"));
        assert_eq!(
            manager.check_tenant_access("t2"),
            TenantAccess::Mismatch {
                required: "t2".into(),
                active: "t1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_replayed_code_rejected_before_io() {
        let (manager, backend, _) = logged_in().await;

        let err = manager.login(LoginRequest::new("code-1")).await.unwrap_err();
        assert_eq!(err, AuthError::ReplayedCode);
        assert_eq!(MockBackend::count(&backend.exchange_calls), 1);
        // The session is untouched by the rejected attempt
        assert_eq!(manager.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_overlapping_exchange_rejected() {
        let (manager, backend, _) = setup();
        manager.initialize();
        let release = backend.hold_exchange();

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.login(LoginRequest::new("code-1")).await })
        };
        wait_for_state(&manager, SessionState::Authenticating).await;

        let err = manager.login(LoginRequest::new("code-2")).await.unwrap_err();
        assert_eq!(err, AuthError::ExchangeInProgress);
        assert_eq!(manager.refresh().await.unwrap_err(), AuthError::ExchangeInProgress);
        assert_eq!(MockBackend::count(&backend.exchange_calls), 1);
        assert_eq!(MockBackend::count(&backend.refresh_calls), 0);

        release.send(()).unwrap();
        let bundle = first.await.unwrap().unwrap();
        assert_eq!(bundle.tokens.access_token, "at-1");
        assert_eq!(manager.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_failed_login_releases_code() {
        let (manager, backend, _) = setup();
        manager.initialize();
        backend.fail_exchange(Some(StatusCode::BAD_REQUEST));

        let err = manager.login(LoginRequest::new("code-1")).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCode(_)));
        assert_eq!(manager.state(), SessionState::LoggedOut);

        backend.fail_exchange(None);
        manager.login(LoginRequest::new("code-1")).await.unwrap();
        assert_eq!(MockBackend::count(&backend.exchange_calls), 2);
        assert_eq!(manager.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_login_error_surfaces_are_distinct() {
        let (manager, backend, _) = setup();
        manager.initialize();

        backend.fail_exchange(Some(StatusCode::TOO_MANY_REQUESTS));
        let err = manager.login(LoginRequest::new("code-1")).await.unwrap_err();
        assert_eq!(err, AuthError::RateLimited);

        backend.fail_exchange(Some(StatusCode::SERVICE_UNAVAILABLE));
        let err = manager.login(LoginRequest::new("code-2")).await.unwrap_err();
        assert!(matches!(err, AuthError::ServerUnavailable(_)));
        assert!(!err.is_terminal());
    }

    #[tokio::test]
    async fn test_concurrent_refresh_single_exchange() {
        let (manager, backend, _) = logged_in().await;
        let release = backend.hold_refresh();

        let waiters = futures::future::join_all((0..5).map(|_| manager.refresh()));
        let (results, _) = tokio::join!(waiters, async {
            tokio::task::yield_now().await;
            release.send(()).unwrap();
        });

        assert_eq!(MockBackend::count(&backend.refresh_calls), 1);
        let first = results[0].as_ref().unwrap();
        assert_eq!(first.tokens.access_token, "at-2");
        for result in &results {
            assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
        }
        assert_eq!(manager.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_ensure_valid_token_refreshes_near_expiry() {
        let (manager, backend, _) = setup();
        manager.initialize();
        backend.set_expires_in(3 * 60);
        manager.login(LoginRequest::new("code-1")).await.unwrap();
        assert!(manager.should_refresh());

        backend.set_expires_in(15 * 60);
        let token = manager.ensure_valid_token().await.unwrap();
        assert_eq!(token.as_deref(), Some("at-2"));
        assert_eq!(MockBackend::count(&backend.refresh_calls), 1);

        // Fresh token: no further refresh
        let token = manager.ensure_valid_token().await.unwrap();
        assert_eq!(token.as_deref(), Some("at-2"));
        assert_eq!(MockBackend::count(&backend.refresh_calls), 1);
    }

    #[tokio::test]
    async fn test_refresh_rejection_ends_session() {
        let (manager, backend, _) = logged_in().await;
        backend.fail_refresh(Some(StatusCode::UNAUTHORIZED));

        let err = manager.refresh().await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshFailed(_)));
        assert!(err.is_terminal());

        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert!(!manager.is_authenticated());
        assert!(manager.current_user().is_none());
        assert!(!manager.timers_active());
        assert_eq!(manager.last_end_reason(), Some(EndReason::RefreshFailed));

        assert_eq!(manager.ensure_valid_token().await.unwrap(), None);
        assert_eq!(MockBackend::count(&backend.refresh_calls), 1);
        assert_eq!(MockBackend::count(&backend.revoke_calls), 0);
    }

    #[tokio::test]
    async fn test_refresh_rejects_tenant_change() {
        let (manager, backend, _) = logged_in().await;
        backend.set_tenant("t2");

        let err = manager.refresh().await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshFailed(_)));
        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert!(manager.get_tenant_context().is_none());
    }

    #[tokio::test]
    async fn test_refresh_with_unrepresentable_expiry_ends_session() {
        let (manager, backend, _) = logged_in().await;
        backend.set_expires_in(i64::MAX);

        let err = manager.refresh().await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshFailed(_)));
        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert!(manager.current_user().is_none());
        assert!(!manager.timers_active());
        assert_eq!(manager.last_end_reason(), Some(EndReason::RefreshFailed));
    }

    #[tokio::test]
    async fn test_login_with_unrepresentable_expiry_fails() {
        let (manager, backend, _) = setup();
        manager.initialize();
        backend.set_expires_in(i64::MAX);

        let err = manager.login(LoginRequest::new("code-1")).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidResponse(_)));
        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_panicking_refresh_task_ends_session() {
        let (manager, backend, _) = logged_in().await;
        backend.panic_on_refresh();

        let err = manager.refresh().await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshFailed(ref msg) if msg.contains("refresh task failed")));
        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert!(manager.current_user().is_none());
        assert!(!manager.timers_active());
        assert_eq!(manager.last_end_reason(), Some(EndReason::RefreshFailed));
    }

    #[tokio::test]
    async fn test_refresh_user_during_refresh_waits_for_rotation() {
        let (manager, backend, _) = logged_in().await;
        let release = backend.hold_refresh();

        let refresh = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.refresh().await })
        };
        wait_for_state(&manager, SessionState::Refreshing).await;

        let refresh_user = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.refresh_user().await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        // Profile fetch waits for the rotation to land
        assert_eq!(MockBackend::count(&backend.profile_calls), 0);
        release.send(()).unwrap();

        let bundle = refresh.await.unwrap().unwrap();
        assert_eq!(bundle.tokens.access_token, "at-2");
        let user = refresh_user.await.unwrap().unwrap();
        assert_eq!(user.id, "u1");

        assert_eq!(manager.state(), SessionState::Authenticated);
        assert!(manager.validate_tenant_access("t1"));
        let stored = manager.session().unwrap();
        assert_eq!(stored.bundle.tokens.access_token, "at-2");
        assert_eq!(stored.bundle.tokens.refresh_token, "rt-2");

        // The rotated pair keeps working
        let bundle = manager.refresh().await.unwrap();
        assert_eq!(bundle.tokens.access_token, "at-3");
    }

    #[tokio::test]
    async fn test_identity_rewrite_during_refresh_keeps_rotated_tokens() {
        let (manager, backend, _) = logged_in().await;
        let release = backend.hold_refresh();

        let refresh = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.refresh().await })
        };
        wait_for_state(&manager, SessionState::Refreshing).await;

        // Same tokens, new identity: bumps the generation under the refresh
        let stored = manager.session().unwrap();
        let mut rewritten = (*stored.bundle).clone();
        rewritten.user.role = "admin".to_string();
        manager
            .inner
            .credentials
            .replace_if_current(stored.generation, rewritten)
            .unwrap()
            .unwrap();

        release.send(()).unwrap();
        let bundle = refresh.await.unwrap().unwrap();
        assert_eq!(bundle.tokens.access_token, "at-2");
        assert_eq!(manager.state(), SessionState::Authenticated);
        assert_eq!(manager.session().unwrap().bundle.tokens.refresh_token, "rt-2");
    }

    #[tokio::test]
    async fn test_session_replaced_during_refresh_leaves_refreshing() {
        let (manager, backend, _) = logged_in().await;
        let release = backend.hold_refresh();

        let refresh = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.refresh().await })
        };
        wait_for_state(&manager, SessionState::Refreshing).await;

        manager
            .inner
            .credentials
            .replace(bundle_for("t1", "at-other", fixed_now() + Duration::minutes(15)))
            .unwrap();

        release.send(()).unwrap();
        assert_eq!(refresh.await.unwrap().unwrap_err(), AuthError::NotAuthenticated);
        assert_eq!(manager.state(), SessionState::Authenticated);
        assert!(manager.validate_tenant_access("t1"));
        assert_eq!(manager.ensure_valid_token().await.unwrap().as_deref(), Some("at-other"));
    }

    #[tokio::test]
    async fn test_refresh_without_session() {
        let (manager, backend, _) = setup();
        manager.initialize();
        assert_eq!(manager.refresh().await.unwrap_err(), AuthError::NoRefreshToken);
        assert_eq!(MockBackend::count(&backend.refresh_calls), 0);
    }

    #[tokio::test]
    async fn test_login_then_refresh_user_round_trip() {
        let (manager, backend, _) = setup();
        manager.initialize();
        let bundle = manager.login(LoginRequest::new("code-1")).await.unwrap();

        let user = manager.refresh_user().await.unwrap();
        assert_eq!(user, bundle.user);
        assert_eq!(MockBackend::count(&backend.profile_calls), 1);
        // Tokens are not rotated
        assert_eq!(MockBackend::count(&backend.refresh_calls), 0);
        assert_eq!(manager.ensure_valid_token().await.unwrap().as_deref(), Some("at-1"));
    }

    #[tokio::test]
    async fn test_refresh_user_tenant_change_keeps_session() {
        let (manager, backend, _) = logged_in().await;
        backend.set_tenant("t2");

        let err = manager.refresh_user().await.unwrap_err();
        assert!(matches!(err, AuthError::TenantIsolationViolation(_)));
        assert!(!err.is_terminal());
        assert_eq!(manager.state(), SessionState::Authenticated);
        assert_eq!(manager.get_tenant_context().unwrap().id, "t1");
    }

    #[tokio::test]
    async fn test_refresh_user_unauthorized_logs_out() {
        let (manager, backend, _) = logged_in().await;
        backend.fail_profile(Some(StatusCode::UNAUTHORIZED));

        let err = manager.refresh_user().await.unwrap_err();
        assert_eq!(err, AuthError::SessionExpired);
        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert_eq!(manager.last_end_reason(), Some(EndReason::Unauthorized));
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_clears_session_and_silences_timers() {
        let (manager, backend, clock) = logged_in().await;
        let invalidations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invalidations);
        manager.register_cache_invalidator(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        manager.logout(false).await;

        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert!(!manager.is_authenticated());
        assert!(manager.get_tenant_context().is_none());
        assert!(!manager.validate_tenant_access("t1"));
        assert!(manager.tenant_header().is_none());
        assert!(!manager.timers_active());
        assert_eq!(invalidations.load(Ordering::SeqCst), 1);
        assert_eq!(manager.last_end_reason(), Some(EndReason::UserLogout));
        assert_eq!(MockBackend::count(&backend.revoke_calls), 1);

        // Well past both the refresh threshold and the idle timeout
        clock.advance(Duration::hours(2));
        tokio::time::sleep(StdDuration::from_secs(3600)).await;
        assert_eq!(MockBackend::count(&backend.refresh_calls), 0);
        assert_eq!(MockBackend::count(&backend.revoke_calls), 1);
        assert_eq!(manager.state(), SessionState::LoggedOut);
    }

    #[tokio::test]
    async fn test_concurrent_logout_revokes_once() {
        let (manager, backend, _) = logged_in().await;
        let release = backend.hold_revoke();

        tokio::join!(manager.logout(false), manager.logout(false), async {
            tokio::task::yield_now().await;
            release.send(()).unwrap();
        });

        assert_eq!(MockBackend::count(&backend.revoke_calls), 1);
        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert!(manager.current_user().is_none());

        manager.logout(false).await;
        assert_eq!(MockBackend::count(&backend.revoke_calls), 1);
    }

    #[tokio::test]
    async fn test_logout_survives_revoke_failure() {
        let (manager, backend, _) = logged_in().await;
        backend.fail_revoke(Some(StatusCode::INTERNAL_SERVER_ERROR));

        manager.logout(true).await;
        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_logout_during_exchange_discards_result() {
        let (manager, backend, _) = setup();
        manager.initialize();
        let release = backend.hold_exchange();

        let login = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.login(LoginRequest::new("code-1")).await })
        };
        wait_for_state(&manager, SessionState::Authenticating).await;

        manager.logout(false).await;
        assert_eq!(manager.state(), SessionState::LoggedOut);

        release.send(()).unwrap();
        let err = login.await.unwrap().unwrap_err();
        assert_eq!(err, AuthError::NotAuthenticated);
        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert!(manager.current_user().is_none());
    }

    #[tokio::test]
    async fn test_login_during_idle_logout_is_not_authenticated() {
        let (manager, backend, _) = logged_in().await;
        let release = backend.hold_revoke();

        let logout = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.logout_with(EndReason::IdleTimeout, false).await })
        };
        wait_for_state(&manager, SessionState::IdleTimeout).await;

        let err = manager.login(LoginRequest::new("code-2")).await.unwrap_err();
        assert_eq!(err, AuthError::NotAuthenticated);
        assert_eq!(MockBackend::count(&backend.exchange_calls), 1);

        release.send(()).unwrap();
        logout.await.unwrap();
        assert_eq!(manager.state(), SessionState::LoggedOut);

        // The code was never consumed and still works
        manager.login(LoginRequest::new("code-2")).await.unwrap();
        assert_eq!(manager.state(), SessionState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_logs_out_once() {
        let (manager, backend, clock) = setup();
        manager.initialize();
        backend.set_expires_in(2 * 3600);
        manager.login(LoginRequest::new("code-1")).await.unwrap();
        let mut states = manager.subscribe();

        clock.advance(Duration::minutes(31));
        assert!(manager.is_idle_timed_out());
        tokio::time::sleep(StdDuration::from_secs(301)).await;

        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert_eq!(manager.last_end_reason(), Some(EndReason::IdleTimeout));
        assert_eq!(MockBackend::count(&backend.revoke_calls), 1);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), SessionState::LoggedOut);

        clock.advance(Duration::minutes(31));
        tokio::time::sleep(StdDuration::from_secs(1800)).await;
        assert_eq!(MockBackend::count(&backend.revoke_calls), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_defers_idle_timeout() {
        let (manager, backend, clock) = setup();
        manager.initialize();
        backend.set_expires_in(2 * 3600);
        manager.login(LoginRequest::new("code-1")).await.unwrap();

        clock.advance(Duration::minutes(20));
        manager.record_interaction(InteractionKind::KeyPress);
        clock.advance(Duration::minutes(20));
        tokio::time::sleep(StdDuration::from_secs(301)).await;

        assert_eq!(manager.state(), SessionState::Authenticated);
        assert_eq!(manager.idle_duration(), Duration::minutes(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_can_be_disabled() {
        let config = SessionConfig {
            idle_timeout_enabled: false,
            ..SessionConfig::default()
        };
        let (manager, backend, clock) = setup_with(config);
        manager.initialize();
        backend.set_expires_in(2 * 3600);
        manager.login(LoginRequest::new("code-1")).await.unwrap();

        clock.advance(Duration::minutes(45));
        assert!(!manager.is_idle_timed_out());
        tokio::time::sleep(StdDuration::from_secs(301)).await;
        assert_eq!(manager.state(), SessionState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_proactive_refresh_timer() {
        let (manager, backend, clock) = setup();
        manager.initialize();
        backend.set_expires_in(10 * 60);
        manager.login(LoginRequest::new("code-1")).await.unwrap();

        clock.advance(Duration::minutes(6));
        tokio::time::sleep(StdDuration::from_secs(61)).await;

        assert_eq!(MockBackend::count(&backend.refresh_calls), 1);
        assert_eq!(manager.state(), SessionState::Authenticated);
        assert_eq!(manager.ensure_valid_token().await.unwrap().as_deref(), Some("at-2"));
    }

    #[tokio::test]
    async fn test_shutdown_keeps_credentials() {
        let (manager, _, _) = logged_in().await;
        manager.shutdown();
        assert!(!manager.timers_active());
        assert!(manager.is_authenticated());
    }
}
