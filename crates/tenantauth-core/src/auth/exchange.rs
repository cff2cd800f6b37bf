//! Guard around the authorization-code exchange.
//!
//! A code is recorded as consumed before the network call is dispatched, so a
//! duplicate click during a slow exchange is rejected locally. If the exchange
//! fails (or its future is dropped) the code is released again.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::AuthError;

/// Recently consumed authorization codes, oldest evicted first.
#[derive(Debug)]
pub struct AuthCodeLedger {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl AuthCodeLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    pub fn contains(&self, code: &str) -> bool {
        self.seen.contains(code)
    }

    pub fn insert(&mut self, code: &str) {
        if !self.seen.insert(code.to_string()) {
            return;
        }
        self.order.push_back(code.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }

    pub fn remove(&mut self, code: &str) {
        if self.seen.remove(code) {
            self.order.retain(|c| c != code);
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug)]
struct GuardState {
    ledger: AuthCodeLedger,
    in_flight: bool,
}

#[derive(Debug, Clone)]
pub struct LoginExchangeGuard {
    state: Arc<Mutex<GuardState>>,
}

impl LoginExchangeGuard {
    pub fn new(ledger_capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(GuardState {
                ledger: AuthCodeLedger::new(ledger_capacity),
                in_flight: false,
            })),
        }
    }

    /// Claim the single exchange slot for `code`.
    ///
    /// Replay is checked before the in-flight slot, so a second submission of
    /// the same code always reports `ReplayedCode`.
    pub fn begin(&self, code: &str) -> Result<ExchangeTicket, AuthError> {
        if code.trim().is_empty() {
            return Err(AuthError::InvalidCode("empty authorization code".into()));
        }

        let mut state = lock(&self.state);
        if state.ledger.contains(code) {
            debug!("Rejecting replayed authorization code");
            return Err(AuthError::ReplayedCode);
        }
        if state.in_flight {
            debug!("Rejecting overlapping login exchange");
            return Err(AuthError::ExchangeInProgress);
        }
        state.ledger.insert(code);
        state.in_flight = true;

        Ok(ExchangeTicket {
            code: code.to_string(),
            state: Arc::clone(&self.state),
            committed: false,
        })
    }

    pub fn is_in_flight(&self) -> bool {
        lock(&self.state).in_flight
    }

    pub fn is_consumed(&self, code: &str) -> bool {
        lock(&self.state).ledger.contains(code)
    }
}

/// Holds the exchange slot. Dropping without `commit` releases the code.
#[derive(Debug)]
pub struct ExchangeTicket {
    code: String,
    state: Arc<Mutex<GuardState>>,
    committed: bool,
}

impl ExchangeTicket {
    /// Mark the exchange successful; the code stays consumed.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for ExchangeTicket {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.in_flight = false;
        if !self.committed {
            state.ledger.remove(&self.code);
        }
    }
}

fn lock(state: &Mutex<GuardState>) -> MutexGuard<'_, GuardState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
