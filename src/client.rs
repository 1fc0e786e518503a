//! Session-aware HTTP client.
//!
//! Wraps `reqwest` with token bookkeeping: login stores the issued pair,
//! authorized calls replay the access token as a bearer header, and a 401
//! triggers one refresh followed by one retry. Refreshes are single-flight:
//! when several concurrent calls hit 401 together, exactly one performs the
//! refresh and the rest reuse its result. If the refresh itself is rejected
//! the session is cleared once and every caller sees [`SessionError::SessionEnded`].

use crate::auth::models::{AuthResponse, RefreshResponse, UserResponse};
use reqwest::StatusCode;
use serde_json::json;
use std::fmt;

#[derive(Debug, Clone)]
struct Session {
    access_token: String,
    refresh_token: String,
    user: UserResponse,
}

pub struct SessionClient {
    http: reqwest::Client,
    base_url: String,
    session: parking_lot::Mutex<Option<Session>>,
    // Held for the duration of a refresh so concurrent 401s coalesce.
    refresh_flight: tokio::sync::Mutex<()>,
}

impl SessionClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session: parking_lot::Mutex::new(None),
            refresh_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn current_user(&self) -> Option<UserResponse> {
        self.session.lock().as_ref().map(|s| s.user.clone())
    }

    pub fn is_logged_in(&self) -> bool {
        self.session.lock().is_some()
    }

    pub async fn register(
        &self,
        email: &str,
        username: &str,
        password: &str,
    ) -> Result<UserResponse, SessionError> {
        let body = json!({
            "email": email,
            "username": username,
            "password": password,
        });
        self.start_session("/auth/register", body).await
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<UserResponse, SessionError> {
        let body = json!({ "email": email, "password": password });
        self.start_session("/auth/login", body).await
    }

    async fn start_session(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<UserResponse, SessionError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let auth: AuthResponse = response.json().await?;
        let user = auth.user.clone();
        *self.session.lock() = Some(Session {
            access_token: auth.access_token,
            refresh_token: auth.refresh_token,
            user: auth.user,
        });
        Ok(user)
    }

    /// Ends the session. The server call is best-effort; local state is
    /// cleared regardless so the client never retains dead credentials.
    pub async fn logout(&self) -> Result<(), SessionError> {
        let refresh_token = self.session.lock().take().map(|s| s.refresh_token);

        if let Some(token) = refresh_token {
            self.http
                .post(format!("{}/auth/logout", self.base_url))
                .json(&json!({ "refreshToken": token }))
                .send()
                .await?;
        }

        Ok(())
    }

    /// Authorized GET returning the parsed JSON body. Transparently
    /// refreshes and retries once when the access token has gone stale.
    pub async fn get_json(&self, path: &str) -> Result<serde_json::Value, SessionError> {
        let response = self.authorized_get(path).await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        Ok(response.json().await?)
    }

    async fn authorized_get(&self, path: &str) -> Result<reqwest::Response, SessionError> {
        let stale = self
            .session
            .lock()
            .as_ref()
            .map(|s| s.access_token.clone())
            .ok_or(SessionError::NotLoggedIn)?;

        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).bearer_auth(&stale).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        // One refresh, one retry. The token captured before the first send
        // identifies which credential actually failed.
        self.refresh_access_token(&stale).await?;

        let fresh = self
            .session
            .lock()
            .as_ref()
            .map(|s| s.access_token.clone())
            .ok_or(SessionError::SessionEnded)?;

        Ok(self.http.get(&url).bearer_auth(&fresh).send().await?)
    }

    /// Single-flight refresh. `stale` is the access token the caller just
    /// saw rejected; if the stored token has already moved past it, another
    /// flight finished the job and there is nothing to do.
    async fn refresh_access_token(&self, stale: &str) -> Result<(), SessionError> {
        let _flight = self.refresh_flight.lock().await;

        let refresh_token = {
            let session = self.session.lock();
            match session.as_ref() {
                None => return Err(SessionError::SessionEnded),
                Some(s) if s.access_token != stale => return Ok(()),
                Some(s) => s.refresh_token.clone(),
            }
        };

        let response = self
            .http
            .post(format!("{}/auth/refresh", self.base_url))
            .json(&json!({ "refreshToken": refresh_token }))
            .send()
            .await?;

        if !response.status().is_success() {
            // The refresh token itself is dead; the session is over. Clear
            // once so waiters observe None instead of re-attempting.
            *self.session.lock() = None;
            return Err(SessionError::SessionEnded);
        }

        let refreshed: RefreshResponse = response.json().await?;
        if let Some(session) = self.session.lock().as_mut() {
            session.access_token = refreshed.access_token;
        }
        Ok(())
    }

    async fn error_from_response(response: reqwest::Response) -> SessionError {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return SessionError::RateLimited { retry_after_secs };
        }

        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v["error"].as_str().map(String::from))
            .unwrap_or_else(|| status.to_string());

        match status {
            StatusCode::UNAUTHORIZED => SessionError::InvalidCredentials,
            StatusCode::CONFLICT => SessionError::Conflict,
            _ => SessionError::Server {
                status: status.as_u16(),
                message,
            },
        }
    }
}

#[derive(Debug)]
pub enum SessionError {
    /// No session is held; log in first.
    NotLoggedIn,
    /// The server rejected the credentials.
    InvalidCredentials,
    /// The email is already registered.
    Conflict,
    /// The refresh token was rejected; the session cannot continue.
    SessionEnded,
    /// The server throttled the request.
    RateLimited { retry_after_secs: Option<u64> },
    /// Any other unsuccessful response.
    Server { status: u16, message: String },
    /// Connection-level failure.
    Transport(reqwest::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotLoggedIn => write!(f, "Not logged in"),
            SessionError::InvalidCredentials => write!(f, "Invalid credentials"),
            SessionError::Conflict => write!(f, "Email already registered"),
            SessionError::SessionEnded => write!(f, "Session ended; log in again"),
            SessionError::RateLimited { retry_after_secs } => match retry_after_secs {
                Some(secs) => write!(f, "Rate limited; retry after {secs}s"),
                None => write!(f, "Rate limited"),
            },
            SessionError::Server { status, message } => {
                write!(f, "Server error {status}: {message}")
            }
            SessionError::Transport(e) => write!(f, "Transport error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        SessionError::Transport(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_stripped() {
        let client = SessionClient::new("http://127.0.0.1:3000/");
        assert_eq!(client.base_url, "http://127.0.0.1:3000");
    }

    #[test]
    fn test_no_session_means_not_logged_in() {
        let client = SessionClient::new("http://127.0.0.1:3000");
        assert!(!client.is_logged_in());
        assert!(client.current_user().is_none());
    }

    #[tokio::test]
    async fn test_get_without_session_fails_fast() {
        let client = SessionClient::new("http://127.0.0.1:1");
        match client.get_json("/api/protected").await {
            Err(SessionError::NotLoggedIn) => {}
            other => panic!("Expected NotLoggedIn, got {other:?}"),
        }
    }

    #[test]
    fn test_error_display() {
        let rate_limited = SessionError::RateLimited {
            retry_after_secs: Some(42),
        };
        assert_eq!(rate_limited.to_string(), "Rate limited; retry after 42s");

        let server = SessionError::Server {
            status: 500,
            message: "Internal server error".to_string(),
        };
        assert_eq!(server.to_string(), "Server error 500: Internal server error");
    }
}
