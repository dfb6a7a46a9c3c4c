//! Security: CORS, rate limiting, and credential dependencies.

mod credentials;
mod middleware;

pub use credentials::{
    BasicCredentials, api_key_header, bearer_token, http_basic, optional_api_key_header,
};
pub use middleware::{CorsMiddleware, RateLimitMiddleware, SlidingWindowLimiter, client_key};
