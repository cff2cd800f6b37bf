//! Session lifecycle: the `SessionManager` state machine and its scheduled
//! idle and refresh checks.

mod manager;
mod timers;

pub use manager::{LoginRequest, SessionManager};
