//! Security middleware: CORS headers and per-client rate limiting.
//!
//! - [`CorsMiddleware`]: Cross-Origin Resource Sharing header injection on
//!   every response.
//! - [`RateLimitMiddleware`]: sliding-window request limiting keyed by client,
//!   backed by an explicitly owned [`SlidingWindowLimiter`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    error::{Error, HttpError},
    http::{Request, Response, StatusCode},
    middleware::Middleware,
};

const DEFAULT_ORIGINS: &[&str] = &["*"];
const DEFAULT_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "OPTIONS"];
const DEFAULT_HEADERS: &[&str] = &["*"];

/// CORS middleware: injects `Access-Control-*` headers into every response.
///
/// Headers are written with [`Headers::set`](crate::Headers::set), so any
/// other header already on the response is kept.
///
/// # Behavior
///
/// | Setting            | Default                                  |
/// |--------------------|------------------------------------------|
/// | Allowed origins    | `*` (all origins)                        |
/// | Allowed methods    | `GET`, `POST`, `PUT`, `DELETE`, `OPTIONS`|
/// | Allowed headers    | `*`                                      |
/// | Credentials        | not allowed                              |
/// | Max age            | `86400` seconds                          |
///
/// The first [`allow_origin`](Self::allow_origin) (or method, or header) call
/// replaces the corresponding default instead of adding to it.
///
/// `Access-Control-Allow-Origin` is resolved per request:
///
/// - wildcard list: `*`, or the request's `Origin` when credentials are allowed;
/// - the request's `Origin` is in the list: that origin, plus `Vary: Origin`;
/// - otherwise: the configured origins, comma-joined.
///
/// # Examples
///
/// ```rust
/// use blaze::security::CorsMiddleware;
///
/// let cors = CorsMiddleware::new()
///     .allow_origin("https://example.com")
///     .allow_method("PATCH")
///     .allow_header("X-Custom-Header")
///     .allow_credentials(true)
///     .max_age(600);
/// ```
#[derive(Debug, Clone)]
pub struct CorsMiddleware {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
    allow_credentials: bool,
    max_age: u64,
}

impl Default for CorsMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl CorsMiddleware {
    /// Creates a new `CorsMiddleware` with permissive defaults.
    pub fn new() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allowed_methods: Vec::new(),
            allowed_headers: Vec::new(),
            allow_credentials: false,
            max_age: 86_400,
        }
    }

    /// Adds an allowed origin. Pass `"*"` to permit all origins.
    ///
    /// # Arguments
    ///
    /// - `origin`: a URL origin string (e.g. `"https://example.com"`) or `"*"`.
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    /// Adds an allowed HTTP method, sent verbatim in `Access-Control-Allow-Methods`.
    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        self.allowed_methods.push(method.into());
        self
    }

    /// Adds an allowed request header, sent verbatim in `Access-Control-Allow-Headers`.
    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allowed_headers.push(header.into());
        self
    }

    /// Whether to send `Access-Control-Allow-Credentials: true`.
    #[must_use]
    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    /// Value of `Access-Control-Max-Age`, in seconds.
    #[must_use]
    pub fn max_age(mut self, seconds: u64) -> Self {
        self.max_age = seconds;
        self
    }

    fn origins(&self) -> Vec<&str> {
        effective(&self.allowed_origins, DEFAULT_ORIGINS)
    }

    // Returns the Allow-Origin value and whether it echoes the request's Origin.
    fn resolve_origin(&self, request_origin: Option<&str>) -> (String, bool) {
        let origins = self.origins();
        let wildcard = origins.contains(&"*");

        match request_origin {
            Some(origin) if wildcard && self.allow_credentials => (origin.to_owned(), true),
            _ if wildcard => ("*".to_owned(), false),
            Some(origin) if origins.contains(&origin) => (origin.to_owned(), true),
            _ => (origins.join(", "), false),
        }
    }
}

fn effective<'a>(configured: &'a [String], default: &'a [&'static str]) -> Vec<&'a str> {
    if configured.is_empty() {
        default.to_vec()
    } else {
        configured.iter().map(String::as_str).collect()
    }
}

impl Middleware for CorsMiddleware {
    fn after_request(&self, request: &Request, response: &mut Response) -> Result<(), Error> {
        let (allow_origin, echoed) = self.resolve_origin(request.headers().get("origin"));
        let headers = response.headers_mut();

        headers.set("access-control-allow-origin", allow_origin);
        headers.set(
            "access-control-allow-methods",
            effective(&self.allowed_methods, DEFAULT_METHODS).join(", "),
        );
        headers.set(
            "access-control-allow-headers",
            effective(&self.allowed_headers, DEFAULT_HEADERS).join(", "),
        );
        if self.allow_credentials {
            headers.set("access-control-allow-credentials", "true");
        }
        headers.set("access-control-max-age", self.max_age.to_string());

        if echoed {
            let vary = match headers.get("vary") {
                Some(existing) if existing.to_ascii_lowercase().contains("origin") => None,
                Some(existing) => Some(format!("{existing}, Origin")),
                None => Some("Origin".to_owned()),
            };
            if let Some(vary) = vary {
                headers.set("vary", vary);
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "cors"
    }
}

/// Per-client request timestamps inside a sliding time window.
///
/// Shared by every request the owning middleware sees; the whole
/// read-prune-check-append sequence runs under one lock.
///
/// Clients whose newest request has left the window are swept out at most once
/// per window, from inside [`check`](Self::check), so the map stays bounded by
/// the clients seen in roughly the last two windows.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    buckets: Mutex<Buckets>,
}

#[derive(Debug)]
struct Buckets {
    clients: HashMap<String, VecDeque<Instant>>,
    last_sweep: Instant,
}

impl Buckets {
    fn sweep(&mut self, now: Instant, window: Duration) -> usize {
        let before = self.clients.len();
        self.clients.retain(|_, bucket| {
            bucket
                .back()
                .is_some_and(|&seen| now.duration_since(seen) < window)
        });
        self.last_sweep = now;
        before - self.clients.len()
    }
}

impl SlidingWindowLimiter {
    /// Allows `max_requests` per client in any `window`.
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            buckets: Mutex::new(Buckets {
                clients: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Records a request from `client`, or rejects it with `429 Too Many Requests`.
    ///
    /// # Errors
    ///
    /// The rejection carries `Retry-After` set to the window length in whole
    /// seconds, rounded up.
    pub fn check(&self, client: &str) -> Result<(), HttpError> {
        let now = Instant::now();
        let mut buckets = self.lock();
        if now.duration_since(buckets.last_sweep) >= self.window {
            let dropped = buckets.sweep(now, self.window);
            if dropped > 0 {
                debug!(dropped, "idle rate limit buckets swept");
            }
        }
        let bucket = buckets.clients.entry(client.to_owned()).or_default();

        while bucket
            .front()
            .is_some_and(|&seen| now.duration_since(seen) >= self.window)
        {
            bucket.pop_front();
        }

        if bucket.len() >= self.max_requests {
            return Err(
                HttpError::new(StatusCode::TooManyRequests, "Too Many Requests")
                    .with_header("Retry-After", self.retry_after_secs().to_string()),
            );
        }

        bucket.push_back(now);
        Ok(())
    }

    /// Drops clients with no request inside the current window.
    pub fn purge_expired(&self) -> usize {
        self.lock().sweep(Instant::now(), self.window)
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.lock().clients.len()
    }

    fn retry_after_secs(&self) -> u64 {
        let secs = self.window.as_secs();
        if self.window.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buckets> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Rejects clients that exceed their [`SlidingWindowLimiter`] budget.
///
/// The client is identified by the first `X-Forwarded-For` entry, then
/// `X-Real-IP`, and otherwise falls into a shared `"unknown"` bucket.
///
/// # Examples
///
/// ```rust
/// use std::{sync::Arc, time::Duration};
/// use blaze::security::{RateLimitMiddleware, SlidingWindowLimiter};
///
/// let limiter = Arc::new(SlidingWindowLimiter::new(100, Duration::from_secs(60)));
/// let middleware = RateLimitMiddleware::new(limiter);
/// ```
#[derive(Debug, Clone)]
pub struct RateLimitMiddleware {
    limiter: Arc<SlidingWindowLimiter>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<SlidingWindowLimiter>) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &Arc<SlidingWindowLimiter> {
        &self.limiter
    }
}

/// The identifier a request is rate limited under.
pub fn client_key(request: &Request) -> String {
    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    forwarded
        .or_else(|| {
            request
                .headers()
                .get("x-real-ip")
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
        })
        .unwrap_or("unknown")
        .to_owned()
}

impl Middleware for RateLimitMiddleware {
    fn before_request(&self, request: &mut Request) -> Result<(), Error> {
        let client = client_key(request);
        match self.limiter.check(&client) {
            Ok(()) => {
                debug!(%client, "rate limit check passed");
                Ok(())
            }
            Err(rejection) => {
                warn!(%client, path = request.path(), "rate limit exceeded");
                Err(rejection.into())
            }
        }
    }

    fn name(&self) -> &'static str {
        "rate_limit"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    fn run_cors(cors: &CorsMiddleware, origin: Option<&str>) -> Response {
        let mut request = Request::new(Method::Get, "/");
        if let Some(origin) = origin {
            request.headers_mut().insert("Origin", origin);
        }
        let mut response = Response::new(StatusCode::Ok).header("X-Request-Id", "r1");
        cors.after_request(&request, &mut response).unwrap();
        response
    }

    #[test]
    fn cors_defaults() {
        let response = run_cors(&CorsMiddleware::new(), Some("https://a.example"));
        let headers = response.headers();
        assert_eq!(headers.get("access-control-allow-origin"), Some("*"));
        assert_eq!(
            headers.get("access-control-allow-methods"),
            Some("GET, POST, PUT, DELETE, OPTIONS")
        );
        assert_eq!(headers.get("access-control-allow-headers"), Some("*"));
        assert_eq!(headers.get("access-control-max-age"), Some("86400"));
        assert!(headers.get("access-control-allow-credentials").is_none());
        assert!(headers.get("vary").is_none());
        // Existing headers survive.
        assert_eq!(headers.get("x-request-id"), Some("r1"));
    }

    #[test]
    fn cors_echoes_listed_origin() {
        let cors = CorsMiddleware::new()
            .allow_origin("https://a.example")
            .allow_origin("https://b.example")
            .allow_credentials(true);

        let response = run_cors(&cors, Some("https://b.example"));
        assert_eq!(
            response.headers().get("access-control-allow-origin"),
            Some("https://b.example")
        );
        assert_eq!(response.headers().get("vary"), Some("Origin"));
        assert_eq!(
            response.headers().get("access-control-allow-credentials"),
            Some("true")
        );

        let response = run_cors(&cors, Some("https://evil.example"));
        assert_eq!(
            response.headers().get("access-control-allow-origin"),
            Some("https://a.example, https://b.example")
        );
    }

    #[test]
    fn cors_replaces_instead_of_duplicating() {
        let cors = CorsMiddleware::new();
        let mut request = Request::new(Method::Get, "/");
        let mut response = Response::new(StatusCode::Ok);
        cors.after_request(&request, &mut response).unwrap();
        request.headers_mut().insert("Origin", "https://x.example");
        cors.after_request(&request, &mut response).unwrap();
        assert_eq!(
            response.headers().get_all("access-control-allow-origin").count(),
            1
        );
    }

    #[test]
    fn client_key_precedence() {
        let request = Request::new(Method::Get, "/")
            .header("X-Forwarded-For", "10.0.0.1, 172.16.0.1")
            .header("X-Real-IP", "192.168.1.1");
        assert_eq!(client_key(&request), "10.0.0.1");

        let request = Request::new(Method::Get, "/").header("X-Real-IP", "192.168.1.1");
        assert_eq!(client_key(&request), "192.168.1.1");

        assert_eq!(client_key(&Request::new(Method::Get, "/")), "unknown");
    }

    #[tokio::test]
    async fn limiter_window_slides() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_millis(100));
        assert!(limiter.check("c").is_ok());
        assert!(limiter.check("c").is_ok());

        let rejection = limiter.check("c").unwrap_err();
        assert_eq!(rejection.status(), StatusCode::TooManyRequests);
        assert_eq!(rejection.headers().get("retry-after"), Some("1"));

        // Other clients have their own bucket.
        assert!(limiter.check("d").is_ok());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.check("c").is_ok());
        // "d" went idle for a whole window and was swept by that check.
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[tokio::test]
    async fn idle_clients_are_swept_without_explicit_purge() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_millis(20));
        for i in 0..5000 {
            limiter.check(&format!("10.0.{}.{}", i / 256, i % 256)).unwrap();
        }

        tokio::time::sleep(Duration::from_millis(60)).await;
        limiter.check("198.51.100.7").unwrap();
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_admit_exactly_the_budget() {
        let limiter = Arc::new(SlidingWindowLimiter::new(10, Duration::from_secs(60)));
        let checks: Vec<_> = (0..64)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.check("203.0.113.5").is_ok() })
            })
            .collect();

        let mut admitted = 0;
        for check in checks {
            if check.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[tokio::test]
    async fn purge_drops_idle_clients() {
        let limiter = SlidingWindowLimiter::new(5, Duration::from_millis(50));
        limiter.check("a").unwrap();
        limiter.check("b").unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(limiter.purge_expired(), 2);
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn retry_after_rounds_up() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));
        limiter.check("c").unwrap();
        let rejection = limiter.check("c").unwrap_err();
        assert_eq!(rejection.headers().get("retry-after"), Some("60"));
    }
}
