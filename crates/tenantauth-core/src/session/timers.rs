//! Idle-check and proactive-refresh loops.
//!
//! Both run as their own Tokio tasks holding only a weak reference to the
//! session, and are aborted together when the session ends.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::manager::{Inner, SessionManager};
use crate::models::{EndReason, SessionState};

pub(crate) struct SessionTimers {
    idle: Option<AbortHandle>,
    refresh: AbortHandle,
}

impl SessionTimers {
    pub(crate) fn spawn(manager: &SessionManager) -> Self {
        let config = manager.config();
        let refresh = tokio::spawn(refresh_loop(manager.downgrade(), config.refresh_check_interval()));
        let idle = config
            .idle_timeout_enabled
            .then(|| tokio::spawn(idle_loop(manager.downgrade(), config.idle_check_interval())));

        debug!(idle_check = idle.is_some(), "Started session timers");
        Self {
            idle: idle.map(|handle| handle.abort_handle()),
            refresh: refresh.abort_handle(),
        }
    }

    pub(crate) fn cancel(self) {
        if let Some(idle) = self.idle {
            idle.abort();
        }
        self.refresh.abort();
    }
}

async fn idle_loop(session: Weak<Inner>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(manager) = SessionManager::from_weak(&session) else {
            break;
        };
        if manager.is_idle_timed_out() {
            info!(
                idle_minutes = manager.idle_duration().num_minutes(),
                "Idle timeout reached, logging out"
            );
            // Detached: logout cancels this task
            tokio::spawn(async move {
                manager.logout_with(EndReason::IdleTimeout, false).await;
            });
            break;
        }
    }
}

async fn refresh_loop(session: Weak<Inner>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(manager) = SessionManager::from_weak(&session) else {
            break;
        };
        if manager.state() != SessionState::Authenticated || !manager.should_refresh() {
            continue;
        }

        debug!(minutes_left = ?manager.minutes_until_expiry(), "Proactive token refresh");
        if let Err(e) = manager.refresh().await {
            warn!(error = %e, "Proactive refresh failed");
            if e.is_terminal() {
                break;
            }
        }
    }
}
