//! Request orchestration
//!
//! Every send walks the same path: validate, check the mode policy, then
//! either send directly or coalesce through the idempotency cache. Transport
//! failures are translated before they leave this module.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dedup::{Claim, DedupCache, DedupSettings, Outcome};
use crate::error::{GatewayError, Result};
use crate::mode::{AllowedModes, ModeDescriptor, DEFAULT_PROBE_MODES};
use crate::request::{SendMailPayload, SendRequest, SmtpDefaults};
use crate::transport::{MailTransport, TransportError};
use crate::translate::{translate, TranslatedError};

/// Body returned for a successful send
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendResponse {
    pub id: String,
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
}

/// Cache of completed sends keyed by idempotency key
pub type SendCache = DedupCache<SendResponse, TranslatedError>;

/// Result of checking one mode against a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub mode: String,
    pub port: u16,
    pub secure: bool,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProbeError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
}

impl From<TransportError> for ProbeError {
    fn from(err: TransportError) -> Self {
        Self {
            code: err.code,
            message: err.message,
            response_code: err.response_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub host: String,
    pub results: Vec<ProbeResult>,
}

/// The orchestrator
pub struct Gateway {
    modes: AllowedModes,
    defaults: SmtpDefaults,
    cache: SendCache,
    transport: Arc<dyn MailTransport>,
    send_timeout: Duration,
}

impl Gateway {
    pub fn new(
        transport: Arc<dyn MailTransport>,
        modes: AllowedModes,
        defaults: SmtpDefaults,
        dedup: DedupSettings,
        send_timeout: Duration,
    ) -> Self {
        Self {
            modes,
            defaults,
            cache: DedupCache::new(dedup),
            transport,
            send_timeout,
        }
    }

    pub fn modes(&self) -> &AllowedModes {
        &self.modes
    }

    pub fn cache(&self) -> &SendCache {
        &self.cache
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Handle one send request
    ///
    /// `header_key` is the raw `Idempotency-Key` header, if any. Validation
    /// and policy failures return before the cache or the network is touched.
    pub async fn submit(
        &self,
        payload: SendMailPayload,
        header_key: Option<&str>,
    ) -> Result<Arc<SendResponse>> {
        let request = payload
            .validate(&self.defaults)
            .map_err(GatewayError::Validation)?;

        self.modes.check(request.smtp.mode())?;

        let key = idempotency_key(header_key, request.message.custom_id.as_deref());
        let Some(key) = key else {
            debug!("No idempotency key, sending directly");
            return deliver(self.transport.as_ref(), &request, self.send_timeout)
                .await
                .map(Arc::new)
                .map_err(GatewayError::Transport);
        };

        match self.cache.claim(&key) {
            Claim::Replay(response) => {
                info!("Replaying cached result for idempotency key '{}'", key);
                Ok(response)
            }
            Claim::Join(waiter) => {
                info!("Joining in-flight send for idempotency key '{}'", key);
                settle(waiter.outcome().await)
            }
            Claim::Lead(lease) => {
                let waiter = lease.waiter();
                let transport = Arc::clone(&self.transport);
                let deadline = self.send_timeout;

                // Runs to completion even if the client goes away
                tokio::spawn(async move {
                    let outcome = deliver(transport.as_ref(), &request, deadline)
                        .await
                        .map(Arc::new);
                    lease.resolve(outcome);
                });

                settle(waiter.outcome().await)
            }
        }
    }

    /// Check reachability of `host` in each mode without authenticating
    ///
    /// Modes come from `requested` when it parses to at least one mode, else
    /// from the configured allow-list, else from [`DEFAULT_PROBE_MODES`].
    pub async fn probe(&self, host: Option<&str>, requested: Option<&str>) -> ProbeReport {
        let host = host
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .unwrap_or(self.defaults.host.as_str())
            .to_string();

        let requested = requested.map(AllowedModes::parse_list);
        let modes: Vec<ModeDescriptor> = requested
            .as_ref()
            .and_then(AllowedModes::modes)
            .or_else(|| self.modes.modes())
            .map(<[ModeDescriptor]>::to_vec)
            .unwrap_or_else(|| DEFAULT_PROBE_MODES.to_vec());

        let mut results = Vec::with_capacity(modes.len());
        for mode in modes {
            let outcome = self.transport.verify(&host, mode).await;
            if let Err(e) = &outcome {
                warn!("Probe of {} in mode {} failed: {}", host, mode, e);
            }
            results.push(ProbeResult {
                mode: mode.label(),
                port: mode.port(),
                secure: mode.secure(),
                ok: outcome.is_ok(),
                error: outcome.err().map(ProbeError::from),
            });
        }

        ProbeReport { host, results }
    }
}

/// Header key if non-blank, else the message correlation id, else none
fn idempotency_key(header: Option<&str>, custom_id: Option<&str>) -> Option<String> {
    header
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .or(custom_id.filter(|k| !k.is_empty()))
        .map(str::to_string)
}

/// One transport attempt bounded by the overall deadline
///
/// On timeout the send future is dropped, which closes its connection.
async fn deliver(
    transport: &dyn MailTransport,
    request: &SendRequest,
    deadline: Duration,
) -> std::result::Result<SendResponse, TranslatedError> {
    let smtp = &request.smtp;
    debug!(
        "Sending via {} to {}:{} ({})",
        transport.name(),
        smtp.host,
        smtp.port,
        smtp.mode()
    );

    let result = match tokio::time::timeout(deadline, transport.send(smtp, &request.message)).await
    {
        Ok(result) => result,
        Err(_) => Err(TransportError::send_timeout(deadline)),
    };

    match result {
        Ok(receipt) => {
            info!(
                "Sent message {} via {}:{} ({} accepted)",
                receipt.id,
                smtp.host,
                smtp.port,
                receipt.accepted.len()
            );
            Ok(SendResponse {
                id: receipt.id,
                accepted: receipt.accepted,
                rejected: receipt.rejected,
            })
        }
        Err(err) => {
            warn!("Send via {}:{} failed: {}", smtp.host, smtp.port, err);
            Err(translate(&err))
        }
    }
}

fn settle(outcome: Option<Outcome<SendResponse, TranslatedError>>) -> Result<Arc<SendResponse>> {
    match outcome {
        Some(Ok(response)) => Ok(response),
        Some(Err(translated)) => Err(GatewayError::Transport(translated)),
        None => Err(GatewayError::Internal(
            "send task ended without an outcome".to_string(),
        )),
    }
}
