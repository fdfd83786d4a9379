//! SMTP transport backed by lettre
//!
//! One connection per call: no pooling, so dropping an in-flight send tears
//! the connection down.

use async_trait::async_trait;
use lettre::message::header::{ContentType, HeaderName, HeaderValue};
use lettre::message::{Attachment as MimeAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::response::Response;
use lettre::transport::smtp::{AsyncSmtpTransportBuilder, Error as SmtpError};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::error::Error as StdError;
use std::io;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{codes, EnvelopeInfo, MailTransport, SendReceipt, TransportError, TransportTimeouts};
use crate::mode::ModeDescriptor;
use crate::request::{Attachment, MailMessage, SmtpSettings};

/// Replies lettre surfaces for rejected authentication
const AUTH_REPLY_CODES: &[u16] = &[530, 534, 535, 538];

/// Relays mail over SMTP
pub struct SmtpTransport {
    timeouts: TransportTimeouts,
}

impl SmtpTransport {
    pub fn new(timeouts: TransportTimeouts) -> Self {
        Self { timeouts }
    }

    /// Implicit TLS when `secure`, otherwise mandatory STARTTLS
    fn builder(&self, host: &str, mode: ModeDescriptor) -> Result<AsyncSmtpTransportBuilder, TransportError> {
        let builder = if mode.secure() {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
        }
        .map_err(|e| classify(&e))?;

        Ok(builder
            .port(mode.port())
            .timeout(Some(self.timeouts.socket)))
    }
}

impl Default for SmtpTransport {
    fn default() -> Self {
        Self::new(TransportTimeouts::default())
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send(
        &self,
        smtp: &SmtpSettings,
        message: &MailMessage,
    ) -> Result<SendReceipt, TransportError> {
        let (email, message_id) = build_message(message)?;
        let envelope = email.envelope().clone();

        let transport: AsyncSmtpTransport<Tokio1Executor> = self
            .builder(&smtp.host, smtp.mode())?
            .credentials(Credentials::new(smtp.username.clone(), smtp.password.clone()))
            .build();

        debug!(
            "Relaying {} via {} ({})",
            message_id,
            smtp.host,
            smtp.mode()
        );

        let response = transport.send(email).await.map_err(|e| {
            let err = classify(&e);
            warn!("SMTP send via {} failed: {}", smtp.host, err);
            err
        })?;

        let accepted: Vec<String> = envelope.to().iter().map(ToString::to_string).collect();
        info!(
            "Message {} accepted by {} for {} recipient(s)",
            message_id,
            smtp.host,
            accepted.len()
        );

        Ok(SendReceipt {
            id: message_id,
            accepted: accepted.clone(),
            rejected: Vec::new(),
            response: format_response(&response),
            envelope: EnvelopeInfo {
                from: envelope.from().map(ToString::to_string),
                to: accepted,
            },
        })
    }

    async fn verify(&self, host: &str, mode: ModeDescriptor) -> Result<(), TransportError> {
        let transport: AsyncSmtpTransport<Tokio1Executor> = self.builder(host, mode)?.build();
        let bound = self.timeouts.connect + self.timeouts.greeting;

        match tokio::time::timeout(bound, transport.test_connection()).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(TransportError::new(
                codes::CONNECTION,
                "Server did not accept the connection check",
            )),
            Ok(Err(e)) => Err(classify(&e)),
            Err(_) => Err(TransportError::new(
                codes::TIMED_OUT,
                format!("No greeting from {}:{} within {} ms", host, mode.port(), bound.as_millis()),
            )),
        }
    }

    fn name(&self) -> &str {
        "smtp"
    }
}

/// Assemble the MIME message, returning it with its Message-ID
pub(crate) fn build_message(message: &MailMessage) -> Result<(Message, String), TransportError> {
    let from = parse_mailbox("from", &message.from)?;
    let message_id = format!("<{}@{}>", Uuid::new_v4(), from.email.domain());

    let mut builder = Message::builder()
        .from(from)
        .subject(message.subject.clone())
        .message_id(Some(message_id.clone()));

    for to in &message.to {
        builder = builder.to(parse_mailbox("to", to)?);
    }
    for cc in &message.cc {
        builder = builder.cc(parse_mailbox("cc", cc)?);
    }
    for bcc in &message.bcc {
        builder = builder.bcc(parse_mailbox("bcc", bcc)?);
    }
    if let Some(reply_to) = &message.reply_to {
        builder = builder.reply_to(parse_mailbox("replyTo", reply_to)?);
    }

    for (name, value) in &message.headers {
        let header = HeaderName::new_from_ascii(name.clone()).map_err(|e| {
            TransportError::new(codes::MESSAGE, format!("Invalid header name '{}': {}", name, e))
        })?;
        builder = builder.raw_header(HeaderValue::new(header, value.clone()));
    }

    let body = match (&message.text, &message.html) {
        (Some(text), Some(html)) => Body::Multi(MultiPart::alternative_plain_html(
            text.clone(),
            html.clone(),
        )),
        (Some(text), None) => Body::Single(SinglePart::plain(text.clone())),
        (None, Some(html)) => Body::Single(SinglePart::html(html.clone())),
        (None, None) => {
            return Err(TransportError::new(codes::MESSAGE, "Message has no body"));
        }
    };

    let built = if message.attachments.is_empty() {
        match body {
            Body::Single(part) => builder.singlepart(part),
            Body::Multi(part) => builder.multipart(part),
        }
    } else {
        let mut mixed = match body {
            Body::Single(part) => MultiPart::mixed().singlepart(part),
            Body::Multi(part) => MultiPart::mixed().multipart(part),
        };
        for attachment in &message.attachments {
            mixed = mixed.singlepart(attachment_part(attachment)?);
        }
        builder.multipart(mixed)
    };

    let email = built.map_err(|e| TransportError::new(codes::ENVELOPE, e.to_string()))?;
    Ok((email, message_id))
}

enum Body {
    Single(SinglePart),
    Multi(MultiPart),
}

fn parse_mailbox(field: &str, address: &str) -> Result<Mailbox, TransportError> {
    address.trim().parse::<Mailbox>().map_err(|e| {
        TransportError::new(
            codes::ENVELOPE,
            format!("Invalid {} address '{}': {}", field, address, e),
        )
    })
}

fn attachment_part(attachment: &Attachment) -> Result<SinglePart, TransportError> {
    let content_type = attachment
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    let content_type = ContentType::parse(content_type).map_err(|e| {
        TransportError::new(
            codes::MESSAGE,
            format!("Invalid content type for '{}': {}", attachment.filename, e),
        )
    })?;

    Ok(MimeAttachment::new(attachment.filename.clone())
        .body(attachment.content.clone(), content_type))
}

fn format_response(response: &Response) -> String {
    let text = response.message().collect::<Vec<_>>().join(" ");
    format!("{} {}", response.code(), text).trim_end().to_string()
}

/// Map a lettre error onto a transport code
pub(crate) fn classify(err: &SmtpError) -> TransportError {
    let message = err.to_string();

    if let Some(code) = err.status() {
        let reply = u16::from(code);
        let name = if AUTH_REPLY_CODES.contains(&reply) {
            codes::AUTH
        } else {
            codes::PROTOCOL
        };
        return TransportError::new(name, message).with_response_code(reply);
    }

    let code = if err.is_timeout() {
        codes::TIMED_OUT
    } else if err.is_tls() {
        codes::TLS
    } else if err.is_response() {
        codes::PROTOCOL
    } else if err.is_client() {
        codes::CLIENT
    } else {
        match io_source(err) {
            Some(io_err) => classify_io(io_err),
            None => codes::CONNECTION,
        }
    };

    TransportError::new(code, message)
}

fn io_source<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a io::Error> {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            return Some(io_err);
        }
        source = inner.source();
    }
    None
}

pub(crate) fn classify_io(err: &io::Error) -> &'static str {
    let text = err.to_string();
    if text.contains("Temporary failure in name resolution") || text.contains("try again") {
        return codes::DNS_TEMPORARY;
    }
    if text.contains("failed to lookup address") {
        return codes::DNS;
    }

    match err.kind() {
        io::ErrorKind::TimedOut => codes::TIMED_OUT,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::AddrNotAvailable => codes::CONNECTION,
        _ => codes::SOCKET,
    }
}
