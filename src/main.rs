use anyhow::{Context, Result};
use dotenv::dotenv;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tskd_api::auth::api::{AuthConfig, AuthState};
use tskd_api::auth::reset::LogMailer;
use tskd_api::auth::tokens::TokenService;
use tskd_api::auth::{SqliteRefreshStore, SqliteResetStore, SqliteUserStore};
use tskd_api::middleware::RateLimiter;
use tskd_api::routes::build_router;

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let config = AuthConfig::from_env();

    let db_path = resolve_data_path(std::env::var("AUTH_DB_PATH").ok(), "tskd_auth.db");
    let users = Arc::new(SqliteUserStore::new(&db_path)?);
    let refresh_tokens = Arc::new(SqliteRefreshStore::new(&db_path)?);
    let reset_tokens = Arc::new(SqliteResetStore::new(&db_path)?);

    info!(mode = ?config.refresh_mode, "Auth database initialized at: {}", db_path);

    let tokens = Arc::new(
        TokenService::new(
            config.access_secret.clone(),
            config.refresh_secret.clone(),
            refresh_tokens,
        )
        .with_access_ttl(config.access_ttl_secs)
        .with_refresh_ttl(config.refresh_ttl_secs)
        .with_bcrypt_cost(config.bcrypt_cost)
        .with_mode(config.refresh_mode),
    );

    let state = AuthState {
        users,
        reset_tokens,
        mailer: Arc::new(LogMailer),
        tokens,
        reset_token_ttl_secs: config.reset_token_ttl_secs,
    };

    let login_limiter = RateLimiter::new(
        config.login_rate_limit,
        Duration::from_secs(config.login_rate_window_secs),
    );
    let reset_limiter = RateLimiter::new(
        config.reset_rate_limit,
        Duration::from_secs(config.reset_rate_window_secs),
    );

    // Stale limiter entries accumulate one per client IP; sweep hourly.
    for limiter in [login_limiter.clone(), reset_limiter.clone()] {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                limiter.cleanup();
            }
        });
    }

    let app = build_router(state, login_limiter, reset_limiter);

    let port = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(3000);
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("Auth server listening on {}", addr);

    // connect_info feeds the per-IP rate limiter and request logs.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tskd_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // 1) Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // 2) Also try the crate-root .env (common when running with --manifest-path
    // from elsewhere)
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}

fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    // Anchor relative paths to the crate directory, not the caller's cwd, so
    // running from elsewhere never creates a second empty database.
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return base.join(default_filename).to_string_lossy().to_string();
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }
    base.join(p).to_string_lossy().to_string()
}
