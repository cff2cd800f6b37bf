//! Single in-flight refresh.
//!
//! The proactive timer and a reactive 401 handler can ask for a refresh at
//! nearly the same moment. The first caller starts the operation; everyone
//! else who arrives before it completes awaits the same shared future, so the
//! refresh token is presented to the server exactly once.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::error::AuthError;
use crate::models::{SessionBundle, TokenPair};

pub type RefreshResult = Result<Arc<SessionBundle>, AuthError>;

/// Handle to an in-flight refresh. Cloning it joins the same operation.
pub type PendingRefresh = Shared<BoxFuture<'static, RefreshResult>>;

/// Whether a token is close enough to expiry to be renewed now.
pub fn should_refresh(tokens: &TokenPair, now: DateTime<Utc>, threshold: Duration) -> bool {
    tokens.needs_refresh(now, threshold)
}

struct Pending {
    id: u64,
    future: PendingRefresh,
}

#[derive(Default)]
struct Slot {
    next_id: u64,
    pending: Option<Pending>,
}

#[derive(Clone, Default)]
pub struct RefreshCoordinator {
    slot: Arc<Mutex<Slot>>,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight refresh, or start one with `start`.
    ///
    /// `start` only builds the future; it runs under the coordinator lock and
    /// must not call back into the coordinator. The operation is spawned onto
    /// the runtime, so it completes even if every caller stops waiting.
    pub fn run<F>(&self, start: F) -> PendingRefresh
    where
        F: FnOnce() -> BoxFuture<'static, RefreshResult>,
    {
        let mut slot = lock(&self.slot);
        if let Some(ref pending) = slot.pending {
            debug!(refresh_id = pending.id, "Joining in-flight refresh");
            return pending.future.clone();
        }

        slot.next_id += 1;
        let id = slot.next_id;
        let guard = CompletionGuard {
            slot: Arc::clone(&self.slot),
            id,
        };
        let operation = start();
        let task = tokio::spawn(async move {
            // Clears the slot on completion and also if the task is aborted
            let _guard = guard;
            operation.await
        });
        let future = async move {
            task.await
                .unwrap_or_else(|e| Err(AuthError::RefreshFailed(format!("refresh task failed: {}", e))))
        }
        .boxed()
        .shared();

        debug!(refresh_id = id, "Starting refresh");
        slot.pending = Some(Pending {
            id,
            future: future.clone(),
        });
        future
    }

    pub fn is_in_flight(&self) -> bool {
        lock(&self.slot).pending.is_some()
    }

    /// The in-flight refresh, if any, without starting one.
    pub fn pending(&self) -> Option<PendingRefresh> {
        lock(&self.slot).pending.as_ref().map(|p| p.future.clone())
    }
}

struct CompletionGuard {
    slot: Arc<Mutex<Slot>>,
    id: u64,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let finished = {
            let mut slot = lock(&self.slot);
            match slot.pending {
                Some(ref pending) if pending.id == self.id => slot.pending.take(),
                _ => None,
            }
        };
        // Dropped outside the lock
        drop(finished);
    }
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
