//! Access control middleware
//!
//! Applied to every route, outermost first: basic auth, IP allow-list,
//! then per-client rate limiting. Security headers wrap all responses.

pub mod basic_auth;
pub mod headers;
pub mod ip_filter;
pub mod rate_limit;

pub use basic_auth::{basic_auth_middleware, BasicAuth};
pub use headers::security_headers;
pub use ip_filter::{ip_filter_middleware, ClientIp, IpAllowList, IpFilter};
pub use rate_limit::{rate_limit_middleware, RateLimitDecision, RateLimiter};
