use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, Utc};

/// User interactions that count as activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionKind {
    PointerDown,
    PointerMove,
    KeyPress,
    Scroll,
    TouchStart,
    Click,
}

/// The fixed set of interactions a UI registers listeners for, once per session.
pub const TRACKED_INTERACTIONS: [InteractionKind; 6] = [
    InteractionKind::PointerDown,
    InteractionKind::PointerMove,
    InteractionKind::KeyPress,
    InteractionKind::Scroll,
    InteractionKind::TouchStart,
    InteractionKind::Click,
];

impl InteractionKind {
    /// Map a DOM event name onto a tracked interaction.
    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "pointerdown" | "mousedown" => Some(InteractionKind::PointerDown),
            "pointermove" | "mousemove" => Some(InteractionKind::PointerMove),
            "keypress" | "keydown" => Some(InteractionKind::KeyPress),
            "scroll" => Some(InteractionKind::Scroll),
            "touchstart" => Some(InteractionKind::TouchStart),
            "click" => Some(InteractionKind::Click),
            _ => None,
        }
    }

    pub fn event_name(self) -> &'static str {
        match self {
            InteractionKind::PointerDown => "pointerdown",
            InteractionKind::PointerMove => "pointermove",
            InteractionKind::KeyPress => "keypress",
            InteractionKind::Scroll => "scroll",
            InteractionKind::TouchStart => "touchstart",
            InteractionKind::Click => "click",
        }
    }
}

/// Timestamp of the last observed interaction, in milliseconds since epoch.
///
/// Stamping is a single atomic store so listeners never contend with the
/// idle check.
#[derive(Debug)]
pub struct ActivityTracker {
    last_activity_ms: AtomicI64,
}

impl ActivityTracker {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn track(&self, now: DateTime<Utc>) {
        self.last_activity_ms.store(now.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let ms = self.last_activity_ms.load(Ordering::Relaxed);
        DateTime::from_timestamp_millis(ms).unwrap_or_default()
    }

    pub fn idle_duration(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity()).max(Duration::zero())
    }

    pub fn is_idle_timed_out(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.idle_duration(now) > threshold
    }
}
