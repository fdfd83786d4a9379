//! Mail transport abstraction
//!
//! The gateway talks to mail servers only through [`MailTransport`]. The
//! production implementation relays over SMTP with lettre; the loopback
//! implementation accepts everything in-process.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::mode::ModeDescriptor;
use crate::request::{MailMessage, SmtpSettings};

pub mod loopback;
pub mod smtp;

pub use loopback::LoopbackTransport;
pub use smtp::SmtpTransport;

/// Opaque transport error codes
pub mod codes {
    /// Credentials rejected
    pub const AUTH: &str = "EAUTH";
    /// Sender or recipients unusable
    pub const ENVELOPE: &str = "EENVELOPE";
    /// Message could not be assembled
    pub const MESSAGE: &str = "EMESSAGE";
    pub const CONNECTION: &str = "ECONNECTION";
    pub const TIMED_OUT: &str = "ETIMEDOUT";
    pub const SOCKET: &str = "ESOCKET";
    /// Temporary DNS resolution failure
    pub const DNS_TEMPORARY: &str = "EAI_AGAIN";
    /// Permanent DNS resolution failure
    pub const DNS: &str = "EDNS";
    pub const TLS: &str = "ETLS";
    /// Unexpected SMTP reply
    pub const PROTOCOL: &str = "EPROTOCOL";
    pub const CLIENT: &str = "ECLIENT";
    /// Overall send deadline exceeded
    pub const SEND_TIMEOUT: &str = "SEND_TIMEOUT";
}

/// A failed transport call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct TransportError {
    pub code: String,
    /// SMTP reply code, when the server answered
    pub response_code: Option<u16>,
    pub message: String,
}

impl TransportError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            response_code: None,
            message: message.into(),
        }
    }

    pub fn with_response_code(mut self, response_code: u16) -> Self {
        self.response_code = Some(response_code);
        self
    }

    /// The send did not settle before the overall deadline
    pub fn send_timeout(deadline: Duration) -> Self {
        Self::new(
            codes::SEND_TIMEOUT,
            format!("Send did not complete within {} ms", deadline.as_millis()),
        )
    }
}

/// Envelope actually used for the SMTP transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvelopeInfo {
    pub from: Option<String>,
    pub to: Vec<String>,
}

/// A successful transport call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    /// Message-ID header value
    pub id: String,
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
    /// Final server reply, e.g. `250 2.0.0 Ok: queued`
    pub response: String,
    pub envelope: EnvelopeInfo,
}

/// Per-phase timeouts for a transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTimeouts {
    pub connect: Duration,
    pub greeting: Duration,
    pub socket: Duration,
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            greeting: Duration::from_secs(15),
            socket: Duration::from_secs(30),
        }
    }
}

/// Sends mail to a caller-chosen server
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Authenticate and transmit one message
    async fn send(
        &self,
        smtp: &SmtpSettings,
        message: &MailMessage,
    ) -> Result<SendReceipt, TransportError>;

    /// Check that `host` answers in `mode`, without authenticating
    async fn verify(&self, host: &str, mode: ModeDescriptor) -> Result<(), TransportError>;

    /// Short name for logs
    fn name(&self) -> &str;
}
