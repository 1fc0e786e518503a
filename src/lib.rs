//! Session authentication service: bcrypt-hashed accounts, short-lived JWT
//! access tokens paired with revocable refresh tokens, password reset, and
//! per-IP rate limiting. Ships both the axum HTTP surface and a
//! session-aware client that refreshes transparently.

pub mod auth;
pub mod client;
pub mod middleware;
pub mod routes;

pub use auth::{AuthConfig, AuthState, TokenService};
pub use client::{SessionClient, SessionError};
pub use middleware::RateLimiter;
pub use routes::build_router;
