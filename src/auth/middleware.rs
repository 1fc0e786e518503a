//! Access-token gate for protected routes.
//!
//! The one credential carrier is the `Authorization: Bearer` header; this
//! deployment never reads tokens from cookies or query strings. The gate
//! verifies the access token, attaches the decoded claims to the request,
//! and otherwise has no side effects. A missing credential and an
//! invalid/expired one both come back 401; the caller is deliberately not
//! told which.

use crate::auth::tokens::TokenService;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;

pub async fn auth_gate(
    State(tokens): State<Arc<TokenService>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .ok_or(AuthError::MissingToken)?;

    let claims = tokens
        .verify_access_token(token)
        .ok_or(AuthError::InvalidToken)?;

    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match self {
            AuthError::MissingToken => "No access token provided",
            AuthError::InvalidToken => "Invalid or expired access token",
        };

        (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
    }
}
