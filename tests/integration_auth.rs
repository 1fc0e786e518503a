//! End-to-end tests against a real listener.
//!
//! Each test boots the full router on an ephemeral port with in-memory
//! stores and drives it over HTTP, either with raw `reqwest` or through
//! [`SessionClient`]. Token lifetimes are shrunk to one second where a test
//! needs expiry to actually happen.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use tskd_api::auth::api::AuthState;
use tskd_api::auth::refresh_store::MemoryRefreshStore;
use tskd_api::auth::reset::{MemoryResetStore, ResetMailer};
use tskd_api::auth::tokens::TokenService;
use tskd_api::auth::user_store::MemoryUserStore;
use tskd_api::client::{SessionClient, SessionError};
use tskd_api::middleware::RateLimiter;
use tskd_api::routes::build_router;

/// Mailer that hands issued reset tokens back to the test.
#[derive(Default)]
struct CapturingMailer {
    last_token: Mutex<Option<String>>,
}

impl ResetMailer for CapturingMailer {
    fn send_reset(&self, _email: &str, token: &str) {
        *self.last_token.lock() = Some(token.to_string());
    }
}

struct TestServer {
    base_url: String,
    refresh_calls: Arc<AtomicUsize>,
    mailer: Arc<CapturingMailer>,
}

struct ServerOptions {
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
    login_limit: u32,
    login_window: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            access_ttl_secs: 3600,
            refresh_ttl_secs: 3600,
            login_limit: 1000,
            login_window: Duration::from_secs(60),
        }
    }
}

async fn spawn_server(options: ServerOptions) -> TestServer {
    let tokens = Arc::new(
        TokenService::new(
            "e2e-access-secret".to_string(),
            "e2e-refresh-secret".to_string(),
            Arc::new(MemoryRefreshStore::new()),
        )
        .with_bcrypt_cost(4)
        .with_access_ttl(options.access_ttl_secs)
        .with_refresh_ttl(options.refresh_ttl_secs),
    );

    let mailer = Arc::new(CapturingMailer::default());
    let state = AuthState {
        users: Arc::new(MemoryUserStore::new()),
        reset_tokens: Arc::new(MemoryResetStore::new()),
        mailer: mailer.clone(),
        tokens,
        reset_token_ttl_secs: 3600,
    };

    let app = build_router(
        state,
        RateLimiter::new(options.login_limit, options.login_window),
        RateLimiter::new(1000, Duration::from_secs(60)),
    );

    // Count refresh hits so single-flight behavior is observable.
    let refresh_calls = Arc::new(AtomicUsize::new(0));
    let counter = refresh_calls.clone();
    let app = app.layer(axum::middleware::from_fn(
        move |req: axum::extract::Request, next: axum::middleware::Next| {
            let counter = counter.clone();
            async move {
                if req.uri().path() == "/auth/refresh" {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                next.run(req).await
            }
        },
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        base_url: format!("http://{addr}"),
        refresh_calls,
        mailer,
    }
}

#[tokio::test]
async fn test_register_login_and_protected_access() {
    let server = spawn_server(ServerOptions::default()).await;

    let client = SessionClient::new(&server.base_url);
    let registered = client
        .register("e2e@test.co", "e2e-tester", "password123")
        .await
        .unwrap();

    // A second client logs in with the same credentials and sees the same
    // account.
    let other = SessionClient::new(&server.base_url);
    let logged_in = other.login("e2e@test.co", "password123").await.unwrap();
    assert_eq!(registered.id, logged_in.id);

    let body = other.get_json("/api/protected").await.unwrap();
    assert_eq!(body["user"]["email"], "e2e@test.co");
    assert_eq!(body["user"]["id"], registered.id);
}

#[tokio::test]
async fn test_duplicate_register_is_conflict() {
    let server = spawn_server(ServerOptions::default()).await;
    let client = SessionClient::new(&server.base_url);

    client
        .register("dup@test.co", "first", "password123")
        .await
        .unwrap();

    match client.register("dup@test.co", "second", "password123").await {
        Err(SessionError::Conflict) => {}
        other => panic!("Expected Conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn test_login_failures_identical_on_the_wire() {
    let server = spawn_server(ServerOptions::default()).await;
    let http = reqwest::Client::new();

    http.post(format!("{}/auth/register", server.base_url))
        .json(&json!({
            "email": "real@test.co",
            "username": "real-user",
            "password": "password123",
        }))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let wrong_password = http
        .post(format!("{}/auth/login", server.base_url))
        .json(&json!({ "email": "real@test.co", "password": "wrongpass1" }))
        .send()
        .await
        .unwrap();
    let unknown_email = http
        .post(format!("{}/auth/login", server.base_url))
        .json(&json!({ "email": "ghost@test.co", "password": "password123" }))
        .send()
        .await
        .unwrap();

    assert_eq!(wrong_password.status(), 401);
    assert_eq!(unknown_email.status(), 401);

    // Byte-identical bodies: nothing distinguishes the two failures.
    let body_a = wrong_password.bytes().await.unwrap();
    let body_b = unknown_email.bytes().await.unwrap();
    assert_eq!(body_a, body_b);
}

#[tokio::test]
async fn test_expired_token_refreshed_once_then_retried() {
    let server = spawn_server(ServerOptions {
        access_ttl_secs: 1,
        ..Default::default()
    })
    .await;

    let client = SessionClient::new(&server.base_url);
    client
        .register("expiry@test.co", "expiry-user", "password123")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;

    // The stale token 401s; the client refreshes and retries invisibly.
    let body = client.get_json("/api/protected").await.unwrap();
    assert_eq!(body["user"]["email"], "expiry@test.co");
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_stale_requests_share_one_refresh() {
    let server = spawn_server(ServerOptions {
        access_ttl_secs: 1,
        ..Default::default()
    })
    .await;

    let client = Arc::new(SessionClient::new(&server.base_url));
    client
        .register("fanin@test.co", "fanin-user", "password123")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let client = client.clone();
        handles.push(tokio::spawn(
            async move { client.get_json("/api/protected").await },
        ));
    }

    for handle in handles {
        let body = handle.await.unwrap().unwrap();
        assert_eq!(body["user"]["email"], "fanin@test.co");
    }

    // Five 401s collapsed into a single refresh round trip.
    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_refresh_ends_session_once() {
    let server = spawn_server(ServerOptions {
        access_ttl_secs: 1,
        refresh_ttl_secs: 1,
        ..Default::default()
    })
    .await;

    let client = Arc::new(SessionClient::new(&server.base_url));
    client
        .register("ended@test.co", "ended-user", "password123")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;

    // Both tokens are gone; every concurrent caller learns the session is
    // over, but only one refresh attempt actually goes out.
    let mut handles = Vec::new();
    for _ in 0..3 {
        let client = client.clone();
        handles.push(tokio::spawn(
            async move { client.get_json("/api/protected").await },
        ));
    }

    for handle in handles {
        match handle.await.unwrap() {
            Err(SessionError::SessionEnded) => {}
            other => panic!("Expected SessionEnded, got {other:?}"),
        }
    }

    assert_eq!(server.refresh_calls.load(Ordering::SeqCst), 1);
    assert!(!client.is_logged_in());

    match client.get_json("/api/protected").await {
        Err(SessionError::NotLoggedIn) => {}
        other => panic!("Expected NotLoggedIn, got {other:?}"),
    }
}

#[tokio::test]
async fn test_logout_revokes_refresh_token() {
    let server = spawn_server(ServerOptions::default()).await;
    let http = reqwest::Client::new();

    let session: serde_json::Value = http
        .post(format!("{}/auth/register", server.base_url))
        .json(&json!({
            "email": "out@test.co",
            "username": "out-user",
            "password": "password123",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let refresh_token = session["refreshToken"].as_str().unwrap();

    let logout = http
        .post(format!("{}/auth/logout", server.base_url))
        .json(&json!({ "refreshToken": refresh_token }))
        .send()
        .await
        .unwrap();
    assert_eq!(logout.status(), 200);

    // The revoked token can no longer mint access tokens.
    let refresh = http
        .post(format!("{}/auth/refresh", server.base_url))
        .json(&json!({ "refreshToken": refresh_token }))
        .send()
        .await
        .unwrap();
    assert_eq!(refresh.status(), 401);

    // Logout stays successful when repeated.
    let again = http
        .post(format!("{}/auth/logout", server.base_url))
        .json(&json!({ "refreshToken": refresh_token }))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 200);
}

#[tokio::test]
async fn test_password_reset_end_to_end() {
    let server = spawn_server(ServerOptions::default()).await;
    let http = reqwest::Client::new();

    http.post(format!("{}/auth/register", server.base_url))
        .json(&json!({
            "email": "reset@test.co",
            "username": "reset-user",
            "password": "password123",
        }))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let ack = http
        .post(format!("{}/auth/request-reset", server.base_url))
        .json(&json!({ "email": "reset@test.co" }))
        .send()
        .await
        .unwrap();
    assert_eq!(ack.status(), 200);

    let token = server.mailer.last_token.lock().clone().unwrap();

    let reset = http
        .post(format!("{}/auth/reset-password", server.base_url))
        .json(&json!({ "token": token, "newPassword": "fresh-password-1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(reset.status(), 200);

    // Old password is dead, new one works.
    let client = SessionClient::new(&server.base_url);
    match client.login("reset@test.co", "password123").await {
        Err(SessionError::InvalidCredentials) => {}
        other => panic!("Expected InvalidCredentials, got {other:?}"),
    }
    client
        .login("reset@test.co", "fresh-password-1")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_login_rate_limit_over_http() {
    let server = spawn_server(ServerOptions {
        login_limit: 3,
        login_window: Duration::from_secs(1),
        ..Default::default()
    })
    .await;
    let http = reqwest::Client::new();
    let body = json!({ "email": "nobody@test.co", "password": "wrongpass1" });

    for _ in 0..3 {
        let response = http
            .post(format!("{}/auth/login", server.base_url))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
    }

    let denied = http
        .post(format!("{}/auth/login", server.base_url))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 429);
    assert!(denied.headers().contains_key("Retry-After"));

    // A fresh window restores service.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let allowed = http
        .post(format!("{}/auth/login", server.base_url))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 401);
}
