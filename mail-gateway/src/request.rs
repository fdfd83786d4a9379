//! Send request payloads and their validation
//!
//! Every wire field is a [`Field`], which records a missing value or a JSON
//! type mismatch instead of failing deserialization. A single pass can then
//! report every problem with its path at once.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::mode::ModeDescriptor;

/// Longest header name lettre will accept
const MAX_HEADER_NAME_LEN: usize = 76;

/// One validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Dotted path to the offending field, e.g. `message.to`
    pub path: String,
    pub message: String,
}

impl Violation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Defaults applied to omitted transport fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpDefaults {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl Default for SmtpDefaults {
    fn default() -> Self {
        Self {
            host: "smtp.timeweb.ru".to_string(),
            port: 465,
            secure: true,
        }
    }
}

/// A type that can appear in the request body, named by its JSON kind
pub trait WireType: DeserializeOwned {
    const EXPECTED: &'static str;
}

impl WireType for String {
    const EXPECTED: &'static str = "string";
}

impl WireType for bool {
    const EXPECTED: &'static str = "boolean";
}

impl WireType for serde_json::Number {
    const EXPECTED: &'static str = "number";
}

impl<T: WireType> WireType for Vec<Field<T>> {
    const EXPECTED: &'static str = "array";
}

impl<T: WireType> WireType for BTreeMap<String, Field<T>> {
    const EXPECTED: &'static str = "object";
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One body field as received
///
/// `null` counts as absent.
#[derive(Debug, Clone, PartialEq)]
pub enum Field<T> {
    Absent,
    Present(T),
    Mistyped {
        expected: &'static str,
        received: &'static str,
    },
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Absent
    }
}

impl<T: WireType> Field<T> {
    fn from_value(value: Value) -> Self {
        let received = json_kind(&value);
        if received == "null" {
            return Field::Absent;
        }

        let mistyped = Field::Mistyped {
            expected: T::EXPECTED,
            received,
        };
        if received != T::EXPECTED {
            return mistyped;
        }
        serde_json::from_value(value).map_or(mistyped, Field::Present)
    }
}

impl<'de, T: WireType> Deserialize<'de> for Field<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Field::from_value)
    }
}

impl<T> Field<T> {
    pub fn is_mistyped(&self) -> bool {
        matches!(self, Field::Mistyped { .. })
    }

    /// The value if present; a type mismatch is recorded at `path`
    pub fn check(self, path: &str, violations: &mut Vec<Violation>) -> Option<T> {
        match self {
            Field::Absent => None,
            Field::Present(value) => Some(value),
            Field::Mistyped { expected, received } => {
                violations.push(Violation::new(
                    path,
                    format!("Expected {}, received {}", expected, received),
                ));
                None
            }
        }
    }

    /// Like [`check`](Self::check), but absence is a violation too
    pub fn require(self, path: &str, violations: &mut Vec<Violation>) -> Option<T> {
        if matches!(self, Field::Absent) {
            violations.push(Violation::new(path, "Required"));
            return None;
        }
        self.check(path, violations)
    }
}

/// `POST /send-mail` body as received
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendMailPayload {
    pub smtp: Field<SmtpPayload>,
    pub message: Field<MessagePayload>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SmtpPayload {
    pub host: Field<String>,
    pub port: Field<serde_json::Number>,
    pub secure: Field<bool>,
    pub username: Field<String>,
    pub password: Field<String>,
}

impl WireType for SmtpPayload {
    const EXPECTED: &'static str = "object";
}

impl fmt::Debug for SmtpPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let password = matches!(self.password, Field::Present(_)).then_some("<redacted>");
        f.debug_struct("SmtpPayload")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("username", &self.username)
            .field("password", &password)
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagePayload {
    pub from: Field<String>,
    pub to: Field<Vec<Field<String>>>,
    pub cc: Field<Vec<Field<String>>>,
    pub bcc: Field<Vec<Field<String>>>,
    pub subject: Field<String>,
    pub text: Field<String>,
    pub html: Field<String>,
    pub reply_to: Field<String>,
    pub attachments: Field<Vec<Field<AttachmentPayload>>>,
    pub headers: Field<BTreeMap<String, Field<String>>>,
    pub custom_id: Field<String>,
}

impl WireType for MessagePayload {
    const EXPECTED: &'static str = "object";
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttachmentPayload {
    pub filename: Field<String>,
    #[serde(alias = "content")]
    pub content_base64: Field<String>,
    pub content_type: Field<String>,
}

impl WireType for AttachmentPayload {
    const EXPECTED: &'static str = "object";
}

/// A validated send request
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub smtp: SmtpSettings,
    pub message: MailMessage,
}

/// Where and how to connect
#[derive(Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub username: String,
    pub password: String,
}

impl SmtpSettings {
    pub fn mode(&self) -> ModeDescriptor {
        ModeDescriptor::new(self.port, self.secure)
    }
}

impl fmt::Debug for SmtpSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The message to relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    /// Never empty when present
    pub text: Option<String>,
    /// Never empty when present
    pub html: Option<String>,
    pub reply_to: Option<String>,
    pub attachments: Vec<Attachment>,
    pub headers: BTreeMap<String, String>,
    pub custom_id: Option<String>,
}

/// A decoded attachment
#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content: Vec<u8>,
    pub content_type: Option<String>,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("filename", &self.filename)
            .field("size", &self.content.len())
            .field("content_type", &self.content_type)
            .finish()
    }
}

impl SendMailPayload {
    /// Validate and apply defaults
    ///
    /// Returns every violation found, never just the first.
    pub fn validate(self, defaults: &SmtpDefaults) -> Result<SendRequest, Vec<Violation>> {
        let mut violations = Vec::new();

        let smtp = self
            .smtp
            .require("smtp", &mut violations)
            .and_then(|smtp| validate_smtp(smtp, defaults, &mut violations));

        let message = self
            .message
            .require("message", &mut violations)
            .and_then(|message| validate_message(message, &mut violations));

        match (smtp, message) {
            (Some(smtp), Some(message)) if violations.is_empty() => {
                Ok(SendRequest { smtp, message })
            }
            _ => Err(violations),
        }
    }
}

/// Validate a string list element by element, e.g. `message.to.1`
fn string_list(
    field: Field<Vec<Field<String>>>,
    path: &str,
    violations: &mut Vec<Violation>,
) -> Vec<String> {
    field
        .check(path, violations)
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| item.require(&format!("{path}.{index}"), violations))
        .collect()
}

fn validate_smtp(
    smtp: SmtpPayload,
    defaults: &SmtpDefaults,
    violations: &mut Vec<Violation>,
) -> Option<SmtpSettings> {
    let port_mistyped = smtp.port.is_mistyped();
    let port = match smtp.port.check("smtp.port", violations) {
        None if port_mistyped => None,
        None => Some(defaults.port),
        Some(port) => match port.as_u64().and_then(|p| u16::try_from(p).ok()) {
            Some(port) if port > 0 => Some(port),
            _ => {
                violations.push(Violation::new(
                    "smtp.port",
                    "Port must be an integer between 1 and 65535",
                ));
                None
            }
        },
    };

    let host = smtp
        .host
        .check("smtp.host", violations)
        .unwrap_or_else(|| defaults.host.clone());
    if host.trim().is_empty() {
        violations.push(Violation::new("smtp.host", "Host must not be empty"));
    }

    let secure = smtp.secure.check("smtp.secure", violations);
    let username = smtp.username.require("smtp.username", violations);
    let password = smtp.password.require("smtp.password", violations);

    Some(SmtpSettings {
        host,
        port: port?,
        secure: secure.unwrap_or(defaults.secure),
        username: username?,
        password: password?,
    })
}

fn validate_message(
    message: MessagePayload,
    violations: &mut Vec<Violation>,
) -> Option<MailMessage> {
    let from = message.from.require("message.from", violations);

    let no_recipients = match &message.to {
        Field::Absent => true,
        Field::Present(list) => list.is_empty(),
        Field::Mistyped { .. } => false,
    };
    let to = string_list(message.to, "message.to", violations);
    if no_recipients {
        violations.push(Violation::new(
            "message.to",
            "At least one recipient is required",
        ));
    }

    let cc = string_list(message.cc, "message.cc", violations);
    let bcc = string_list(message.bcc, "message.bcc", violations);
    let subject = message.subject.require("message.subject", violations);

    let body_mistyped = message.text.is_mistyped() || message.html.is_mistyped();
    let text = message.text.check("message.text", violations).filter(|v| !v.is_empty());
    let html = message.html.check("message.html", violations).filter(|v| !v.is_empty());
    if text.is_none() && html.is_none() && !body_mistyped {
        violations.push(Violation::new(
            "message.text",
            "Either text or html must be provided",
        ));
    }

    let reply_to = message.reply_to.check("message.replyTo", violations);
    let custom_id = message.custom_id.check("message.customId", violations);

    let mut headers = BTreeMap::new();
    let raw_headers = message
        .headers
        .check("message.headers", violations)
        .unwrap_or_default();
    for (name, value) in raw_headers {
        let path = format!("message.headers.{}", name);
        if !valid_header_name(&name) {
            violations.push(Violation::new(path.clone(), "Invalid header name"));
        }
        let Some(value) = value.require(&path, violations) else {
            continue;
        };
        if value.contains(['\r', '\n']) {
            violations.push(Violation::new(path, "Header value must not contain line breaks"));
        }
        headers.insert(name, value);
    }

    let raw_attachments = message
        .attachments
        .check("message.attachments", violations)
        .unwrap_or_default();
    let mut attachments = Vec::with_capacity(raw_attachments.len());
    for (index, attachment) in raw_attachments.into_iter().enumerate() {
        let prefix = format!("message.attachments.{}", index);
        let Some(attachment) = attachment.require(&prefix, violations) else {
            continue;
        };

        let filename = attachment
            .filename
            .require(&format!("{prefix}.filename"), violations);
        let content_path = format!("{prefix}.contentBase64");
        let content = attachment
            .content_base64
            .require(&content_path, violations)
            .and_then(|encoded| match BASE64.decode(encoded.trim()) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    violations.push(Violation::new(
                        content_path.as_str(),
                        format!("Invalid base64 content: {}", e),
                    ));
                    None
                }
            });
        let content_type = attachment
            .content_type
            .check(&format!("{prefix}.contentType"), violations);

        if let (Some(filename), Some(content)) = (filename, content) {
            attachments.push(Attachment {
                filename,
                content,
                content_type,
            });
        }
    }

    Some(MailMessage {
        from: from?,
        to,
        cc,
        bcc,
        subject: subject?,
        text,
        html,
        reply_to,
        attachments,
        headers,
        custom_id,
    })
}

fn valid_header_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_HEADER_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b':')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> SendMailPayload {
        serde_json::from_value(value).unwrap()
    }

    fn valid_payload() -> serde_json::Value {
        json!({
            "smtp": { "username": "user", "password": "secret" },
            "message": {
                "from": "sender@example.com",
                "to": ["a@b.com"],
                "subject": "hi",
                "text": "hello"
            }
        })
    }

    fn paths(violations: &[Violation]) -> Vec<&str> {
        violations.iter().map(|v| v.path.as_str()).collect()
    }

    #[test]
    fn test_defaults_applied() {
        let request = parse(valid_payload())
            .validate(&SmtpDefaults::default())
            .unwrap();
        assert_eq!(request.smtp.host, "smtp.timeweb.ru");
        assert_eq!(request.smtp.port, 465);
        assert!(request.smtp.secure);
        assert_eq!(request.smtp.mode().label(), "465-tls");
        assert_eq!(request.message.to, vec!["a@b.com".to_string()]);
        assert!(request.message.cc.is_empty());
    }

    #[test]
    fn test_missing_body_and_recipients_reported_together() {
        let mut payload = valid_payload();
        payload["message"]["to"] = json!([]);
        payload["message"]["text"] = json!("");

        let violations = parse(payload)
            .validate(&SmtpDefaults::default())
            .unwrap_err();
        let paths = paths(&violations);
        assert!(paths.contains(&"message.to"));
        assert!(paths.contains(&"message.text"));
    }

    #[test]
    fn test_html_alone_is_enough() {
        let mut payload = valid_payload();
        payload["message"].as_object_mut().unwrap().remove("text");
        payload["message"]["html"] = json!("<p>hello</p>");

        let request = parse(payload).validate(&SmtpDefaults::default()).unwrap();
        assert!(request.message.text.is_none());
        assert_eq!(request.message.html.as_deref(), Some("<p>hello</p>"));
    }

    #[test]
    fn test_missing_sections() {
        let violations = SendMailPayload::default()
            .validate(&SmtpDefaults::default())
            .unwrap_err();
        assert_eq!(paths(&violations), vec!["smtp", "message"]);
    }

    #[test]
    fn test_missing_credentials() {
        let mut payload = valid_payload();
        payload["smtp"] = json!({ "host": "mail.example.com" });

        let violations = parse(payload)
            .validate(&SmtpDefaults::default())
            .unwrap_err();
        assert_eq!(paths(&violations), vec!["smtp.username", "smtp.password"]);
    }

    #[test]
    fn test_port_out_of_range() {
        let mut payload = valid_payload();
        payload["smtp"]["port"] = json!(0);
        let violations = parse(payload)
            .validate(&SmtpDefaults::default())
            .unwrap_err();
        assert_eq!(paths(&violations), vec!["smtp.port"]);

        let mut payload = valid_payload();
        payload["smtp"]["port"] = json!(70000);
        assert!(parse(payload).validate(&SmtpDefaults::default()).is_err());
    }

    #[test]
    fn test_attachment_decoding() {
        let mut payload = valid_payload();
        payload["message"]["attachments"] = json!([
            { "filename": "a.txt", "contentBase64": "aGVsbG8=", "contentType": "text/plain" },
            { "filename": "b.bin", "content": "AAEC" }
        ]);

        let request = parse(payload).validate(&SmtpDefaults::default()).unwrap();
        let attachments = &request.message.attachments;
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].content, b"hello");
        assert_eq!(attachments[0].content_type.as_deref(), Some("text/plain"));
        assert_eq!(attachments[1].content, vec![0, 1, 2]);
    }

    #[test]
    fn test_invalid_base64_is_a_violation() {
        let mut payload = valid_payload();
        payload["message"]["attachments"] = json!([
            { "filename": "a.txt", "contentBase64": "not base64!!" }
        ]);

        let violations = parse(payload)
            .validate(&SmtpDefaults::default())
            .unwrap_err();
        assert_eq!(
            paths(&violations),
            vec!["message.attachments.0.contentBase64"]
        );
    }

    #[test]
    fn test_header_injection_rejected() {
        let mut payload = valid_payload();
        payload["message"]["headers"] = json!({
            "X-Ok": "fine",
            "Bad Name": "value",
            "X-Inject": "a\r\nBcc: victim@example.com"
        });

        let violations = parse(payload)
            .validate(&SmtpDefaults::default())
            .unwrap_err();
        let paths = paths(&violations);
        assert_eq!(paths.len(), 2);
        assert!(paths.contains(&"message.headers.Bad Name"));
        assert!(paths.contains(&"message.headers.X-Inject"));
    }

    #[test]
    fn test_mistyped_fields_reported_with_other_violations() {
        let mut payload = valid_payload();
        payload["smtp"]["port"] = json!("465");
        payload["smtp"]["secure"] = json!("yes");
        payload["message"]["to"] = json!([]);
        payload["message"]["text"] = json!(null);

        let violations = parse(payload)
            .validate(&SmtpDefaults::default())
            .unwrap_err();
        assert_eq!(
            paths(&violations),
            vec!["smtp.port", "smtp.secure", "message.to", "message.text"]
        );
        assert_eq!(violations[0].message, "Expected number, received string");
        assert_eq!(violations[1].message, "Expected boolean, received string");
    }

    #[test]
    fn test_mistyped_body_is_not_also_missing() {
        let mut payload = valid_payload();
        payload["message"]["text"] = json!(42);
        payload["message"]["to"] = json!("a@b.com");

        let violations = parse(payload)
            .validate(&SmtpDefaults::default())
            .unwrap_err();
        assert_eq!(
            violations,
            vec![
                Violation::new("message.to", "Expected array, received string"),
                Violation::new("message.text", "Expected string, received number"),
            ]
        );
    }

    #[test]
    fn test_list_elements_have_indexed_paths() {
        let mut payload = valid_payload();
        payload["message"]["to"] = json!(["a@b.com", 7]);
        payload["message"]["cc"] = json!([null]);
        payload["message"]["attachments"] = json!(["not an object"]);
        payload["message"]["headers"] = json!({ "X-Count": 3 });

        let violations = parse(payload)
            .validate(&SmtpDefaults::default())
            .unwrap_err();
        assert_eq!(
            paths(&violations),
            vec![
                "message.to.1",
                "message.cc.0",
                "message.headers.X-Count",
                "message.attachments.0",
            ]
        );
        assert_eq!(violations[1].message, "Required");
    }

    #[test]
    fn test_mistyped_section() {
        let payload = json!({ "smtp": "smtp.example.com", "message": [] });
        let violations = parse(payload)
            .validate(&SmtpDefaults::default())
            .unwrap_err();
        assert_eq!(
            violations,
            vec![
                Violation::new("smtp", "Expected object, received string"),
                Violation::new("message", "Expected object, received array"),
            ]
        );
    }

    #[test]
    fn test_password_not_in_debug_output() {
        let request = parse(valid_payload())
            .validate(&SmtpDefaults::default())
            .unwrap();
        let debug = format!("{:?}", request);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("<redacted>"));
    }
}
