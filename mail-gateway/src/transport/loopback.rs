//! In-process transport that never touches the network
//!
//! Used for dry runs and tests. Every message is accepted unless a failure
//! has been queued with [`LoopbackTransport::fail_next`].

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{codes, EnvelopeInfo, MailTransport, SendReceipt, TransportError};
use crate::mode::ModeDescriptor;
use crate::request::{MailMessage, SmtpSettings};

/// Accepts mail without relaying it
#[derive(Default)]
pub struct LoopbackTransport {
    sends: AtomicUsize,
    delay: Duration,
    failures: Mutex<VecDeque<TransportError>>,
    refused_modes: Mutex<HashSet<ModeDescriptor>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a slow server
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make the next send fail with `err`
    pub fn fail_next(&self, err: TransportError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(err);
    }

    /// Make connection checks for `mode` fail
    pub fn refuse_mode(&self, mode: ModeDescriptor) {
        self.refused_modes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(mode);
    }

    /// Number of send attempts so far
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailTransport for LoopbackTransport {
    async fn send(
        &self,
        smtp: &SmtpSettings,
        message: &MailMessage,
    ) -> Result<SendReceipt, TransportError> {
        let attempt = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Loopback send #{} for {}:{}", attempt, smtp.host, smtp.port);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let queued = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(err) = queued {
            return Err(err);
        }

        let recipients: Vec<String> = message
            .to
            .iter()
            .chain(&message.cc)
            .chain(&message.bcc)
            .cloned()
            .collect();

        Ok(SendReceipt {
            id: format!("<{}@loopback>", Uuid::new_v4()),
            accepted: recipients.clone(),
            rejected: Vec::new(),
            response: "250 2.0.0 Accepted by loopback".to_string(),
            envelope: EnvelopeInfo {
                from: Some(message.from.clone()),
                to: recipients,
            },
        })
    }

    async fn verify(&self, host: &str, mode: ModeDescriptor) -> Result<(), TransportError> {
        let refused = self
            .refused_modes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&mode);

        if refused {
            Err(TransportError::new(
                codes::CONNECTION,
                format!("Connection refused by {}:{}", host, mode.port()),
            ))
        } else {
            Ok(())
        }
    }

    fn name(&self) -> &str {
        "loopback"
    }
}
