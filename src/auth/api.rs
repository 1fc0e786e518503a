//! Authentication endpoints: register, login, refresh, logout, and the
//! password-reset pair.
//!
//! Every failure is mapped locally to one [`AuthApiError`] arm; nothing
//! auth-related escapes to a generic handler except genuine faults, which
//! become an opaque 500. Login failures and reset requests are shaped so
//! responses never reveal whether an email is registered; the register
//! conflict is the one deliberate exception.

use crate::auth::models::{
    email_is_well_formed, normalize_email, username_is_valid, AuthResponse, LoginRequest,
    LogoutRequest, LogoutResponse, MessageResponse, RefreshRequest, RefreshResponse,
    RegisterRequest, RequestResetRequest, ResetPasswordRequest, User, UserResponse,
    MIN_PASSWORD_LEN,
};
use crate::auth::reset::{ResetMailer, ResetTokenStore, DEFAULT_RESET_TOKEN_TTL_SECS};
use crate::auth::tokens::{
    PasswordHash, RefreshTokenMode, TokenService, DEFAULT_ACCESS_TTL_SECS,
    DEFAULT_REFRESH_TTL_SECS,
};
use crate::auth::user_store::UserStore;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use std::env;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

const RESET_ACK: &str = "If an account exists for that address, a reset link has been sent";

/// Shared auth state, injected into every handler.
#[derive(Clone)]
pub struct AuthState {
    pub users: Arc<dyn UserStore>,
    pub reset_tokens: Arc<dyn ResetTokenStore>,
    pub mailer: Arc<dyn ResetMailer>,
    pub tokens: Arc<TokenService>,
    pub reset_token_ttl_secs: i64,
}

/// Env-driven configuration with working defaults for development.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    pub bcrypt_cost: u32,
    pub refresh_mode: RefreshTokenMode,
    pub reset_token_ttl_secs: i64,
    pub login_rate_limit: u32,
    pub login_rate_window_secs: u64,
    pub reset_rate_limit: u32,
    pub reset_rate_window_secs: u64,
}

impl AuthConfig {
    pub fn from_env() -> Self {
        let access_secret = env::var("JWT_ACCESS_SECRET")
            .unwrap_or_else(|_| "dev-access-secret-change-in-production".to_string());
        let refresh_secret = env::var("JWT_REFRESH_SECRET")
            .unwrap_or_else(|_| "dev-refresh-secret-change-in-production".to_string());

        let access_ttl_secs = env_parse("ACCESS_TOKEN_TTL_SECS", DEFAULT_ACCESS_TTL_SECS);
        let refresh_ttl_secs = env_parse("REFRESH_TOKEN_TTL_SECS", DEFAULT_REFRESH_TTL_SECS);
        let bcrypt_cost = env_parse("BCRYPT_COST", bcrypt::DEFAULT_COST);

        let refresh_mode = env::var("REFRESH_TOKEN_MODE")
            .ok()
            .and_then(|v| RefreshTokenMode::from_str(&v))
            .unwrap_or(RefreshTokenMode::Stateful);

        Self {
            access_secret,
            refresh_secret,
            access_ttl_secs,
            refresh_ttl_secs,
            bcrypt_cost,
            refresh_mode,
            reset_token_ttl_secs: env_parse("RESET_TOKEN_TTL_SECS", DEFAULT_RESET_TOKEN_TTL_SECS),
            login_rate_limit: env_parse("LOGIN_RATE_LIMIT", 6),
            login_rate_window_secs: env_parse("LOGIN_RATE_WINDOW_SECS", 60),
            reset_rate_limit: env_parse("RESET_RATE_LIMIT", 3),
            reset_rate_window_secs: env_parse("RESET_RATE_WINDOW_SECS", 3600),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Register a new account - POST /auth/register
pub async fn register(
    State(state): State<AuthState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<AuthResponse>, AuthApiError> {
    let email = normalize_email(payload.email.as_deref().unwrap_or(""));
    if !email_is_well_formed(&email) {
        return Err(AuthApiError::Validation(
            "A well-formed email is required".to_string(),
        ));
    }

    let username = payload.username.unwrap_or_default().trim().to_string();
    if !username_is_valid(&username) {
        return Err(AuthApiError::Validation(
            "Username must be between 3 and 50 characters".to_string(),
        ));
    }

    let password = payload.password.unwrap_or_default();
    if password.len() < MIN_PASSWORD_LEN {
        return Err(AuthApiError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    if state
        .users
        .find_by_email(&email)
        .map_err(AuthApiError::internal)?
        .is_some()
    {
        return Err(AuthApiError::Conflict);
    }

    let hashed = hash_password_blocking(state.tokens.clone(), password).await?;

    let user = User {
        id: Uuid::new_v4(),
        email,
        username,
        password_hash: hashed.hash,
        password_salt: hashed.salt,
        created_at: Utc::now().to_rfc3339(),
    };

    state.users.insert(&user).map_err(|e| {
        // The unique email index is the realistic failure here (lost race).
        warn!("Failed to insert user: {e:#}");
        AuthApiError::Conflict
    })?;

    info!(user_id = %user.id, "User registered");

    issue_session(&state, &user).map(Json)
}

/// Log in - POST /auth/login
pub async fn login(
    State(state): State<AuthState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, AuthApiError> {
    let email = normalize_email(payload.email.as_deref().unwrap_or(""));
    let password = payload.password.unwrap_or_default();

    let user = state
        .users
        .find_by_email(&email)
        .map_err(AuthApiError::internal)?;

    // Unknown email and wrong password must be indistinguishable.
    let Some(user) = user else {
        warn!("Failed login attempt");
        return Err(AuthApiError::InvalidCredentials);
    };

    let hash = user.password_hash.clone();
    let valid = verify_password_blocking(state.tokens.clone(), password, hash).await?;
    if !valid {
        warn!(user_id = %user.id, "Failed login attempt");
        return Err(AuthApiError::InvalidCredentials);
    }

    info!(user_id = %user.id, "Login successful");

    // A fresh session per login; earlier sessions for the same user stay
    // valid (concurrent sessions are allowed).
    issue_session(&state, &user).map(Json)
}

/// Mint a new access token from a refresh token - POST /auth/refresh
///
/// The refresh token is not rotated; it stays valid for its own lifetime.
pub async fn refresh(
    State(state): State<AuthState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, AuthApiError> {
    let token = payload
        .refresh_token
        .filter(|t| !t.is_empty())
        .ok_or(AuthApiError::MissingRefreshToken)?;

    let identity = state
        .tokens
        .verify_refresh_token(&token)
        .map_err(AuthApiError::internal)?
        .ok_or(AuthApiError::InvalidRefreshToken)?;

    // Stateful records carry only the user id; resolve the email from the
    // user record, which also confirms the account still exists.
    let (user_id, email) = match identity.email {
        Some(email) => (identity.user_id, email),
        None => {
            let user = state
                .users
                .find_by_id(&identity.user_id)
                .map_err(AuthApiError::internal)?
                .ok_or(AuthApiError::InvalidRefreshToken)?;
            (user.id, user.email)
        }
    };

    let (access_token, expires_in) = state
        .tokens
        .issue_access_token(user_id, &email)
        .map_err(AuthApiError::internal)?;

    Ok(Json(RefreshResponse {
        access_token,
        expires_in,
    }))
}

/// Log out - POST /auth/logout
///
/// Idempotent: succeeds whether or not a matching session exists. In
/// stateless refresh mode there is nothing to revoke server-side; the
/// client discarding its tokens is the whole logout.
pub async fn logout(
    State(state): State<AuthState>,
    Json(payload): Json<LogoutRequest>,
) -> Result<Json<LogoutResponse>, AuthApiError> {
    if let Some(token) = payload.refresh_token.filter(|t| !t.is_empty()) {
        state
            .tokens
            .revoke_refresh_token(&token)
            .map_err(AuthApiError::internal)?;
    }

    Ok(Json(LogoutResponse { success: true }))
}

/// Request a password reset - POST /auth/request-reset
pub async fn request_reset(
    State(state): State<AuthState>,
    Json(payload): Json<RequestResetRequest>,
) -> Result<Json<MessageResponse>, AuthApiError> {
    let email = normalize_email(payload.email.as_deref().unwrap_or(""));
    if !email_is_well_formed(&email) {
        return Err(AuthApiError::Validation(
            "A well-formed email is required".to_string(),
        ));
    }

    // The ack must not vary with account existence, so lookup and store
    // faults on this path are logged instead of surfaced.
    match state.users.find_by_email(&email) {
        Ok(Some(user)) => match state.reset_tokens.issue(user.id, state.reset_token_ttl_secs) {
            Ok(token) => state.mailer.send_reset(&user.email, &token),
            Err(e) => error!("Failed to issue reset token: {e:#}"),
        },
        Ok(None) => {}
        Err(e) => error!("User lookup failed during reset request: {e:#}"),
    }

    Ok(Json(MessageResponse {
        message: RESET_ACK.to_string(),
    }))
}

/// Complete a password reset - POST /auth/reset-password
pub async fn reset_password(
    State(state): State<AuthState>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Json<MessageResponse>, AuthApiError> {
    let token = payload
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AuthApiError::Validation("Reset token is required".to_string()))?;

    let new_password = payload.new_password.unwrap_or_default();
    if new_password.len() < MIN_PASSWORD_LEN {
        return Err(AuthApiError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    let user_id = state
        .reset_tokens
        .consume(&token)
        .map_err(AuthApiError::internal)?
        .ok_or(AuthApiError::InvalidResetToken)?;

    let mut user = state
        .users
        .find_by_id(&user_id)
        .map_err(AuthApiError::internal)?
        .ok_or(AuthApiError::InvalidResetToken)?;

    let hashed = hash_password_blocking(state.tokens.clone(), new_password).await?;
    user.password_hash = hashed.hash;
    user.password_salt = hashed.salt;

    state.users.update(&user).map_err(AuthApiError::internal)?;

    info!(user_id = %user.id, "Password reset completed");

    Ok(Json(MessageResponse {
        message: "Password reset successful".to_string(),
    }))
}

fn issue_session(state: &AuthState, user: &User) -> Result<AuthResponse, AuthApiError> {
    let (access_token, expires_in) = state
        .tokens
        .issue_access_token(user.id, &user.email)
        .map_err(AuthApiError::internal)?;
    let refresh_token = state
        .tokens
        .issue_refresh_token(user.id, &user.email)
        .map_err(AuthApiError::internal)?;

    Ok(AuthResponse {
        user: UserResponse::from_user(user),
        access_token,
        refresh_token,
        expires_in,
    })
}

/// bcrypt is CPU-bound; keep it off the request-accepting path.
async fn hash_password_blocking(
    tokens: Arc<TokenService>,
    password: String,
) -> Result<PasswordHash, AuthApiError> {
    tokio::task::spawn_blocking(move || tokens.hash_password(&password, None))
        .await
        .map_err(|e| AuthApiError::internal(e.into()))?
        .map_err(AuthApiError::internal)
}

async fn verify_password_blocking(
    tokens: Arc<TokenService>,
    candidate: String,
    hash: String,
) -> Result<bool, AuthApiError> {
    tokio::task::spawn_blocking(move || tokens.verify_password(&candidate, &hash))
        .await
        .map_err(|e| AuthApiError::internal(e.into()))
}

/// Auth API error taxonomy.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthApiError {
    Validation(String),
    /// Duplicate registration. Register is the one place the API admits an
    /// email is taken; every other surface keeps account existence opaque.
    Conflict,
    InvalidCredentials,
    MissingRefreshToken,
    InvalidRefreshToken,
    InvalidResetToken,
    Internal,
}

impl AuthApiError {
    fn internal(err: anyhow::Error) -> Self {
        error!("Auth internal error: {err:#}");
        AuthApiError::Internal
    }
}

impl IntoResponse for AuthApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AuthApiError::Conflict => {
                (StatusCode::CONFLICT, "Email already registered".to_string())
            }
            AuthApiError::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                "Invalid email or password".to_string(),
            ),
            AuthApiError::MissingRefreshToken => (
                StatusCode::BAD_REQUEST,
                "No refresh token provided".to_string(),
            ),
            AuthApiError::InvalidRefreshToken => (
                StatusCode::UNAUTHORIZED,
                "Invalid or expired refresh token".to_string(),
            ),
            AuthApiError::InvalidResetToken => (
                StatusCode::BAD_REQUEST,
                "Invalid or expired token".to_string(),
            ),
            AuthApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
