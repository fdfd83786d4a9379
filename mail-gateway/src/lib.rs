//! mail-gateway: HTTP to SMTP relay
//!
//! Accepts JSON send requests and relays them over SMTP to a server chosen
//! by the caller, returning a normalized result.
//!
//! # Features
//!
//! - Request validation that reports every violation at once
//! - Allow-list of SMTP connection modes (`465-tls`, `587-starttls`, ...)
//! - Idempotent coalescing of duplicate sends via `Idempotency-Key`
//! - Stable error taxonomy: 400, 422, 504 or 500
//! - Mode reachability probe
//! - Basic auth, IP allow-list, rate limiting, CORS and Prometheus metrics
//!
//! # Example Configuration
//!
//! ```toml
//! port = 8080
//! smtp_allowed_modes = "465-tls, 587-starttls"
//! idempotency_ttl_seconds = 600
//! mail_send_timeout_ms = 45000
//! ip_allowlist = ["10.0.0.0/8"]
//! ```
//!
//! Every key can also be set through its upper-case environment variable.

pub mod config;
pub mod dedup;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod mode;
pub mod request;
pub mod security;
pub mod server;
pub mod translate;
pub mod transport;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, SendResponse};
pub use server::GatewayServer;
