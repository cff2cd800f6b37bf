//! Backend contract for the authentication endpoints.
//!
//! `AuthBackend` is the seam between the session manager and the network;
//! `HttpAuthBackend` implements it over reqwest. Provider payloads are
//! normalized in `types` before they reach the rest of the crate.

pub mod client;
pub mod error;
pub mod types;

pub use client::{AuthBackend, HttpAuthBackend};
pub use error::ApiError;
pub use types::{AuthResponse, ProfileResponse};
