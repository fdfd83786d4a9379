//! Per-client fixed-window rate limiting

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::ip_filter::{normalize, ClientIp};

/// Verdict for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the client's window resets
    pub reset: Duration,
}

impl RateLimitDecision {
    /// `RateLimit-*` headers describing this decision
    fn apply(&self, headers: &mut HeaderMap) {
        let reset_secs = self.reset.as_secs() + u64::from(self.reset.subsec_nanos() > 0);
        headers.insert("ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert("ratelimit-reset", HeaderValue::from(reset_secs));
        if !self.allowed {
            headers.insert("retry-after", HeaderValue::from(reset_secs));
        }
    }
}

/// Rate limiter tracking requests per client address
pub struct RateLimiter {
    /// Map of client -> (request count, window start time)
    requests: RwLock<HashMap<String, (u32, Instant)>>,
    /// Maximum requests per window
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            max_requests,
            window,
        }
    }

    /// Count a request from `client` and decide whether it may proceed
    pub async fn check(&self, client: &str) -> RateLimitDecision {
        let now = Instant::now();
        let mut requests = self.requests.write().await;

        let entry = requests.entry(client.to_string()).or_insert((0, now));

        // Reset if window has passed
        if now.duration_since(entry.1) >= self.window {
            *entry = (0, now);
        }

        let reset = self.window.saturating_sub(now.duration_since(entry.1));
        if entry.0 >= self.max_requests {
            return RateLimitDecision {
                allowed: false,
                limit: self.max_requests,
                remaining: 0,
                reset,
            };
        }

        entry.0 += 1;
        RateLimitDecision {
            allowed: true,
            limit: self.max_requests,
            remaining: self.max_requests - entry.0,
            reset,
        }
    }

    /// Drop windows that have ended, returning how many clients remain
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut requests = self.requests.write().await;
        let before = requests.len();
        requests.retain(|_, (_, start)| now.duration_since(*start) < self.window);
        debug!(
            "Rate limiter cleanup removed {} clients, {} tracked",
            before - requests.len(),
            requests.len()
        );
        requests.len()
    }

    /// Run [`cleanup`](Self::cleanup) once per window until aborted
    pub fn spawn_cleanup(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + self.window, self.window);
            loop {
                ticker.tick().await;
                self.cleanup().await;
            }
        })
    }
}

/// Applies the limiter keyed by the resolved [`ClientIp`]
///
/// Falls back to the socket peer when no client address was resolved.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request,
    next: Next,
) -> Response {
    let client = req
        .extensions()
        .get::<ClientIp>()
        .map(|ClientIp(ip)| *ip)
        .or_else(|| connect_info.map(|ConnectInfo(peer)| normalize(peer.ip())))
        .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());

    let decision = limiter.check(&client).await;
    if !decision.allowed {
        warn!("Rate limit exceeded for {}", client);
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "Too Many Requests" })),
        )
            .into_response();
        decision.apply(response.headers_mut());
        return response;
    }

    let mut response = next.run(req).await;
    decision.apply(response.headers_mut());
    response
}
