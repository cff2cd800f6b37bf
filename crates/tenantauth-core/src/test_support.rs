//! Shared fixtures for unit tests: a scripted backend, a manual clock and
//! session bundles.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::StatusCode;
use serde_json::json;
use tokio::sync::oneshot;

use crate::api::{ApiError, AuthBackend, AuthResponse, ProfileResponse};
use crate::clock::Clock;
use crate::models::{PermissionSet, SessionBundle, TenantDescriptor, TokenPair, UserIdentity};

pub(crate) fn fixed_now() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

pub(crate) fn user_for(tenant_id: &str) -> UserIdentity {
    UserIdentity {
        id: "u1".to_string(),
        email: "ada@example.com".to_string(),
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
        role: "analyst".to_string(),
        organisation_id: Some(tenant_id.to_string()),
        is_active: true,
    }
}

pub(crate) fn bundle_for(tenant_id: &str, access_token: &str, expires_at: DateTime<Utc>) -> SessionBundle {
    SessionBundle {
        tokens: TokenPair {
            access_token: access_token.to_string(),
            refresh_token: format!("rt-for-{}", access_token),
            expires_at,
        },
        user: user_for(tenant_id),
        tenant: TenantDescriptor {
            id: tenant_id.to_string(),
            name: "Acme".to_string(),
            industry: Some("energy".to_string()),
            subscription_plan: Some("pro".to_string()),
        },
        permissions: PermissionSet::new(["read:market_edge", "write:reports"]),
    }
}

pub(crate) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub(crate) fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self { now: Mutex::new(start) })
    }

    pub(crate) fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

type Gate = Shared<oneshot::Receiver<()>>;

/// Scripted `AuthBackend` that counts calls and issues sequential tokens
/// (`at-1`, `at-2`, ...) for whichever tenant it is set to.
pub(crate) struct MockBackend {
    pub exchange_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub profile_calls: AtomicUsize,
    pub revoke_calls: AtomicUsize,
    issued: AtomicUsize,
    expires_in: AtomicI64,
    tenant: Mutex<String>,
    exchange_failure: Mutex<Option<StatusCode>>,
    refresh_failure: Mutex<Option<StatusCode>>,
    profile_failure: Mutex<Option<StatusCode>>,
    revoke_failure: Mutex<Option<StatusCode>>,
    refresh_panics: AtomicBool,
    exchange_gate: Mutex<Option<Gate>>,
    refresh_gate: Mutex<Option<Gate>>,
    revoke_gate: Mutex<Option<Gate>>,
}

impl MockBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            exchange_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            profile_calls: AtomicUsize::new(0),
            revoke_calls: AtomicUsize::new(0),
            issued: AtomicUsize::new(0),
            expires_in: AtomicI64::new(15 * 60),
            tenant: Mutex::new("t1".to_string()),
            exchange_failure: Mutex::new(None),
            refresh_failure: Mutex::new(None),
            profile_failure: Mutex::new(None),
            revoke_failure: Mutex::new(None),
            refresh_panics: AtomicBool::new(false),
            exchange_gate: Mutex::new(None),
            refresh_gate: Mutex::new(None),
            revoke_gate: Mutex::new(None),
        })
    }

    pub(crate) fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub(crate) fn set_tenant(&self, tenant: &str) {
        *self.tenant.lock().unwrap() = tenant.to_string();
    }

    pub(crate) fn set_expires_in(&self, seconds: i64) {
        self.expires_in.store(seconds, Ordering::SeqCst);
    }

    pub(crate) fn fail_exchange(&self, status: Option<StatusCode>) {
        *self.exchange_failure.lock().unwrap() = status;
    }

    pub(crate) fn fail_refresh(&self, status: Option<StatusCode>) {
        *self.refresh_failure.lock().unwrap() = status;
    }

    pub(crate) fn fail_profile(&self, status: Option<StatusCode>) {
        *self.profile_failure.lock().unwrap() = status;
    }

    pub(crate) fn fail_revoke(&self, status: Option<StatusCode>) {
        *self.revoke_failure.lock().unwrap() = status;
    }

    /// Make the next refreshes panic mid-flight.
    pub(crate) fn panic_on_refresh(&self) {
        self.refresh_panics.store(true, Ordering::SeqCst);
    }

    /// Hold code exchanges until the returned sender fires (or is dropped).
    pub(crate) fn hold_exchange(&self) -> oneshot::Sender<()> {
        Self::hold(&self.exchange_gate)
    }

    pub(crate) fn hold_refresh(&self) -> oneshot::Sender<()> {
        Self::hold(&self.refresh_gate)
    }

    pub(crate) fn hold_revoke(&self) -> oneshot::Sender<()> {
        Self::hold(&self.revoke_gate)
    }

    fn hold(slot: &Mutex<Option<Gate>>) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *slot.lock().unwrap() = Some(rx.shared());
        tx
    }

    async fn wait(slot: &Mutex<Option<Gate>>) {
        let gate = slot.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
    }

    fn profile_json(&self) -> serde_json::Value {
        let tenant = self.tenant.lock().unwrap().clone();
        json!({
            "user": {
                "id": "u1",
                "email": "ada@example.com",
                "firstName": "Ada",
                "lastName": "Lovelace",
                "role": "analyst",
                "organisationId": tenant,
                "isActive": true
            },
            "tenant": {"id": tenant, "name": "Acme", "industry": "energy", "subscriptionPlan": "pro"},
            "permissions": ["read:market_edge", "write:reports"]
        })
    }

    fn token_response(&self) -> AuthResponse {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let mut body = self.profile_json();
        body["access_token"] = json!(format!("at-{}", n));
        body["refresh_token"] = json!(format!("rt-{}", n));
        body["expires_in"] = json!(self.expires_in.load(Ordering::SeqCst));
        serde_json::from_value(body).unwrap()
    }

    fn failure(slot: &Mutex<Option<StatusCode>>) -> Option<ApiError> {
        slot.lock().unwrap().map(|status| ApiError::from_status(status, "scripted failure"))
    }
}

impl AuthBackend for MockBackend {
    fn exchange_code<'a>(
        &'a self,
        _code: &'a str,
        _redirect_uri: Option<&'a str>,
        _state: Option<&'a str>,
    ) -> BoxFuture<'a, Result<AuthResponse, ApiError>> {
        async move {
            self.exchange_calls.fetch_add(1, Ordering::SeqCst);
            Self::wait(&self.exchange_gate).await;
            match Self::failure(&self.exchange_failure) {
                Some(err) => Err(err),
                None => Ok(self.token_response()),
            }
        }
        .boxed()
    }

    fn refresh<'a>(&'a self, _refresh_token: &'a str) -> BoxFuture<'a, Result<AuthResponse, ApiError>> {
        async move {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            Self::wait(&self.refresh_gate).await;
            if self.refresh_panics.load(Ordering::SeqCst) {
                panic!("scripted refresh panic");
            }
            match Self::failure(&self.refresh_failure) {
                Some(err) => Err(err),
                None => Ok(self.token_response()),
            }
        }
        .boxed()
    }

    fn fetch_profile<'a>(&'a self, _access_token: &'a str) -> BoxFuture<'a, Result<ProfileResponse, ApiError>> {
        async move {
            self.profile_calls.fetch_add(1, Ordering::SeqCst);
            match Self::failure(&self.profile_failure) {
                Some(err) => Err(err),
                None => Ok(serde_json::from_value(self.profile_json()).unwrap()),
            }
        }
        .boxed()
    }

    fn revoke<'a>(
        &'a self,
        _access_token: &'a str,
        _refresh_token: Option<&'a str>,
        _all_devices: bool,
    ) -> BoxFuture<'a, Result<(), ApiError>> {
        async move {
            self.revoke_calls.fetch_add(1, Ordering::SeqCst);
            Self::wait(&self.revoke_gate).await;
            match Self::failure(&self.revoke_failure) {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
        .boxed()
    }
}
