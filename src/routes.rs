//! HTTP surface: route table and router assembly.
//!
//! Rate limits guard the two abuse-prone surfaces: credential guessing
//! (register + login share one limiter) and reset-mail spam. The access
//! token gate wraps only `/api`; the auth endpoints themselves stay open
//! since their callers by definition lack a valid access token.

use crate::auth::api::{self, AuthState};
use crate::auth::middleware::auth_gate;
use crate::auth::models::Claims;
use crate::middleware::logging::request_logging;
use crate::middleware::rate_limit::{rate_limit_middleware, RateLimiter};
use axum::{
    middleware,
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;

pub fn build_router(
    state: AuthState,
    login_limiter: RateLimiter,
    reset_limiter: RateLimiter,
) -> Router {
    let credential_routes = Router::new()
        .route("/auth/register", post(api::register))
        .route("/auth/login", post(api::login))
        .route_layer(middleware::from_fn_with_state(
            login_limiter,
            rate_limit_middleware,
        ));

    let session_routes = Router::new()
        .route("/auth/refresh", post(api::refresh))
        .route("/auth/logout", post(api::logout));

    let reset_request_routes = Router::new()
        .route("/auth/request-reset", post(api::request_reset))
        .route_layer(middleware::from_fn_with_state(
            reset_limiter,
            rate_limit_middleware,
        ));

    let reset_complete_routes =
        Router::new().route("/auth/reset-password", post(api::reset_password));

    let protected_routes = Router::new()
        .route("/api/protected", get(protected_endpoint))
        .route_layer(middleware::from_fn_with_state(
            state.tokens.clone(),
            auth_gate,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(credential_routes)
        .merge(session_routes)
        .merge(reset_request_routes)
        .merge(reset_complete_routes)
        .merge(protected_routes)
        .layer(middleware::from_fn(request_logging))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Demonstration protected endpoint: echoes the verified identity that the
/// gate attached to the request.
async fn protected_endpoint(Extension(claims): Extension<Claims>) -> Json<serde_json::Value> {
    Json(json!({
        "message": "This is a protected endpoint",
        "user": {
            "id": claims.sub,
            "email": claims.email,
        },
    }))
}
