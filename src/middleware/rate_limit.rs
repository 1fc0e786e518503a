//! Rate limiting middleware.
//!
//! In-memory fixed-window limiting per client IP. Each IP gets an
//! independent counter; when a request arrives after the window has
//! elapsed, the counter restarts rather than sliding. A denied request
//! does not consume budget, so a client hammering a saturated window
//! cannot push its own reset further away.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Per-IP fixed-window request limiter.
///
/// Cloning shares the underlying state, so one limiter can guard several
/// routes while a differently-configured one guards others.
#[derive(Clone)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    state: Arc<Mutex<HashMap<IpAddr, WindowEntry>>>,
}

struct WindowEntry {
    count: u32,
    window_start: Instant,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Records one request attempt from `ip` and returns the verdict.
    fn check(&self, ip: IpAddr) -> RateLimitResult {
        let mut state = self.state.lock();
        let now = Instant::now();

        let entry = state.entry(ip).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }

        if entry.count >= self.limit {
            // Denied attempts do not increment, so the window still resets
            // on schedule.
            let reset_at = entry.window_start + self.window;
            return RateLimitResult::Denied {
                retry_after: reset_at.saturating_duration_since(now),
            };
        }

        entry.count += 1;
        RateLimitResult::Allowed {
            remaining: self.limit - entry.count,
        }
    }

    /// Periodic cleanup of stale entries (call from a background task).
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let window = self.window;

        state.retain(|_, entry| now.duration_since(entry.window_start) < window * 2);
    }
}

enum RateLimitResult {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

/// Rate limiting middleware function.
pub async fn rate_limit_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    axum::extract::State(limiter): axum::extract::State<RateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = addr.ip();

    match limiter.check(ip) {
        RateLimitResult::Allowed { .. } => next.run(request).await,
        RateLimitResult::Denied { retry_after } => {
            // Round up so the client never retries inside the same window.
            let retry_secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);

            warn!(
                ip = %ip,
                path = %request.uri().path(),
                retry_after_secs = retry_secs,
                "Rate limit exceeded"
            );

            let body = serde_json::json!({
                "error": "Too many requests",
                "retryAfterSeconds": retry_secs,
            });

            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_secs.to_string())],
                axum::Json(body),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_limit_then_denies() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        for _ in 0..3 {
            match limiter.check(ip) {
                RateLimitResult::Allowed { .. } => {}
                _ => panic!("Should be allowed"),
            }
        }

        match limiter.check(ip) {
            RateLimitResult::Denied { retry_after } => {
                assert!(retry_after <= Duration::from_secs(60));
            }
            _ => panic!("Should be denied"),
        }
    }

    #[test]
    fn test_remaining_counts_down() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        let expected = [2, 1, 0];
        for want in expected {
            match limiter.check(ip) {
                RateLimitResult::Allowed { remaining } => assert_eq!(remaining, want),
                _ => panic!("Should be allowed"),
            }
        }
    }

    #[test]
    fn test_denied_requests_do_not_consume_budget() {
        let limiter = RateLimiter::new(1, Duration::from_millis(50));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        assert!(matches!(
            limiter.check(ip),
            RateLimitResult::Allowed { .. }
        ));

        // Hammer the saturated window; none of these may delay the reset.
        for _ in 0..10 {
            assert!(matches!(limiter.check(ip), RateLimitResult::Denied { .. }));
        }

        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(
            limiter.check(ip),
            RateLimitResult::Allowed { .. }
        ));
    }

    #[test]
    fn test_window_expiry_restores_full_budget() {
        let limiter = RateLimiter::new(3, Duration::from_millis(50));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        for _ in 0..3 {
            limiter.check(ip);
        }
        assert!(matches!(limiter.check(ip), RateLimitResult::Denied { .. }));

        std::thread::sleep(Duration::from_millis(60));

        // Fresh window: the full budget is back, not just one slot.
        for _ in 0..3 {
            match limiter.check(ip) {
                RateLimitResult::Allowed { .. } => {}
                _ => panic!("Should be allowed in a fresh window"),
            }
        }
    }

    #[test]
    fn test_ips_are_limited_independently() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let first: IpAddr = "127.0.0.1".parse().unwrap();
        let second: IpAddr = "192.168.1.9".parse().unwrap();

        assert!(matches!(
            limiter.check(first),
            RateLimitResult::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check(first),
            RateLimitResult::Denied { .. }
        ));

        // A different client is untouched by the first one's saturation.
        assert!(matches!(
            limiter.check(second),
            RateLimitResult::Allowed { .. }
        ));
    }

    #[test]
    fn test_cleanup_drops_stale_entries() {
        let limiter = RateLimiter::new(5, Duration::from_millis(10));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        limiter.check(ip);
        assert_eq!(limiter.state.lock().len(), 1);

        std::thread::sleep(Duration::from_millis(25));
        limiter.cleanup();
        assert!(limiter.state.lock().is_empty());
    }
}
