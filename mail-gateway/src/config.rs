//! Configuration for mail-gateway
//!
//! Settings come from an optional TOML file overlaid by environment
//! variables. Every key is flat and named after its environment variable,
//! so `RATE_LIMIT_MAX=10` and `rate_limit_max = 10` are equivalent.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::dedup::DedupSettings;
use crate::error::{GatewayError, Result};
use crate::mode::AllowedModes;
use crate::request::SmtpDefaults;
use crate::security::{BasicAuth, IpAllowList};
use crate::transport::TransportTimeouts;

/// Main gateway configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP listen port
    pub port: u16,
    pub listen_host: String,
    /// Number of reverse-proxy hops trusted for `X-Forwarded-For`
    pub trust_proxy: usize,
    /// Maximum JSON body size, e.g. `"1mb"` or `"512kb"`
    pub request_body_limit: String,

    pub rate_limit_window_ms: u64,
    pub rate_limit_max: u32,

    /// Allowed CORS origins; empty allows any origin
    #[serde(deserialize_with = "string_or_list")]
    pub cors_origins: Vec<String>,
    /// Client addresses or CIDR ranges; empty allows everyone
    #[serde(deserialize_with = "string_or_list")]
    pub ip_allowlist: Vec<String>,

    pub basic_auth_user: Option<String>,
    #[serde(skip_serializing)]
    pub basic_auth_pass: Option<String>,

    pub enable_metrics: bool,

    pub idempotency_ttl_seconds: u64,
    pub idempotency_sweep_seconds: u64,
    pub idempotency_stale_pending_seconds: u64,

    pub smtp_connection_timeout_ms: u64,
    pub smtp_greeting_timeout_ms: u64,
    pub smtp_socket_timeout_ms: u64,
    /// Overall deadline for one send
    pub mail_send_timeout_ms: u64,

    /// `port-kind` tokens such as `465-tls`; empty allows every mode
    #[serde(deserialize_with = "string_or_list")]
    pub smtp_allowed_modes: Vec<String>,
    /// Host used when a request omits `smtp.host`
    pub smtp_default_host: String,

    /// Accept mail without contacting any SMTP server
    pub dry_run: bool,

    pub log_level: String,
    /// `pretty` or `json`
    pub log_format: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            listen_host: "0.0.0.0".to_string(),
            trust_proxy: 1,
            request_body_limit: "1mb".to_string(),
            rate_limit_window_ms: 60_000,
            rate_limit_max: 30,
            cors_origins: Vec::new(),
            ip_allowlist: Vec::new(),
            basic_auth_user: None,
            basic_auth_pass: None,
            enable_metrics: false,
            idempotency_ttl_seconds: 600,
            idempotency_sweep_seconds: 60,
            idempotency_stale_pending_seconds: 300,
            smtp_connection_timeout_ms: 15_000,
            smtp_greeting_timeout_ms: 15_000,
            smtp_socket_timeout_ms: 30_000,
            mail_send_timeout_ms: 45_000,
            smtp_allowed_modes: Vec::new(),
            smtp_default_host: "smtp.timeweb.ru".to_string(),
            dry_run: false,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Accept either a comma-separated string or a list, dropping blank items
fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ListVisitor;

    impl<'de> serde::de::Visitor<'de> for ListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a comma-separated string or a list of strings")
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
            Ok(split_list(v))
        }

        fn visit_unit<E: serde::de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: serde::de::SeqAccess<'de>,
        {
            let mut items = Vec::new();
            while let Some(item) = seq.next_element::<String>()? {
                let item = item.trim();
                if !item.is_empty() {
                    items.push(item.to_string());
                }
            }
            Ok(items)
        }
    }

    deserializer.deserialize_any(ListVisitor)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a size such as `1mb`, `512kb`, `1.5mb` or `2048` into bytes
pub fn parse_byte_size(value: &str) -> Option<usize> {
    let value = value.trim().to_ascii_lowercase();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);

    let number: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim() {
        "" | "b" => 1.0,
        "kb" => 1024.0,
        "mb" => 1024.0 * 1024.0,
        "gb" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };

    let bytes = (number * multiplier).floor();
    (bytes.is_finite() && bytes >= 0.0).then_some(bytes as usize)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl GatewayConfig {
    /// Load from an optional TOML file, then environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let settings = builder
            .add_source(config::Environment::default())
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to load config: {}", e)))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("RATE_LIMIT_WINDOW_MS", self.rate_limit_window_ms),
            ("RATE_LIMIT_MAX", u64::from(self.rate_limit_max)),
            ("IDEMPOTENCY_TTL_SECONDS", self.idempotency_ttl_seconds),
            ("IDEMPOTENCY_SWEEP_SECONDS", self.idempotency_sweep_seconds),
            (
                "IDEMPOTENCY_STALE_PENDING_SECONDS",
                self.idempotency_stale_pending_seconds,
            ),
            ("SMTP_CONNECTION_TIMEOUT_MS", self.smtp_connection_timeout_ms),
            ("SMTP_GREETING_TIMEOUT_MS", self.smtp_greeting_timeout_ms),
            ("SMTP_SOCKET_TIMEOUT_MS", self.smtp_socket_timeout_ms),
            ("MAIL_SEND_TIMEOUT_MS", self.mail_send_timeout_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(GatewayError::Config(format!("{} must be greater than zero", name)));
            }
        }

        self.body_limit_bytes()?;
        self.ip_allow_list()?;
        self.listen_addr()?;

        if non_empty(&self.basic_auth_user).is_some() != non_empty(&self.basic_auth_pass).is_some() {
            return Err(GatewayError::Config(
                "BASIC_AUTH_USER and BASIC_AUTH_PASS must be set together".to_string(),
            ));
        }

        match self.log_format.as_str() {
            "pretty" | "json" => Ok(()),
            other => Err(GatewayError::Config(format!(
                "LOG_FORMAT must be 'pretty' or 'json', got '{}'",
                other
            ))),
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.listen_host, self.port)
            .parse()
            .map_err(|e| {
                GatewayError::Config(format!(
                    "Invalid listen address '{}:{}': {}",
                    self.listen_host, self.port, e
                ))
            })
    }

    pub fn body_limit_bytes(&self) -> Result<usize> {
        parse_byte_size(&self.request_body_limit).ok_or_else(|| {
            GatewayError::Config(format!(
                "Invalid REQUEST_BODY_LIMIT '{}'",
                self.request_body_limit
            ))
        })
    }

    pub fn allowed_modes(&self) -> AllowedModes {
        AllowedModes::from_tokens(&self.smtp_allowed_modes)
    }

    pub fn ip_allow_list(&self) -> Result<IpAllowList> {
        IpAllowList::parse(&self.ip_allowlist)
    }

    /// Credentials, when both halves are configured
    pub fn basic_auth(&self) -> Option<BasicAuth> {
        match (non_empty(&self.basic_auth_user), non_empty(&self.basic_auth_pass)) {
            (Some(user), Some(pass)) => Some(BasicAuth::new(user, pass)),
            _ => None,
        }
    }

    pub fn smtp_defaults(&self) -> SmtpDefaults {
        SmtpDefaults {
            host: self.smtp_default_host.clone(),
            ..SmtpDefaults::default()
        }
    }

    pub fn dedup_settings(&self) -> DedupSettings {
        DedupSettings {
            ttl: Duration::from_secs(self.idempotency_ttl_seconds),
            stale_pending: Duration::from_secs(self.idempotency_stale_pending_seconds),
            sweep_interval: Duration::from_secs(self.idempotency_sweep_seconds),
        }
    }

    pub fn transport_timeouts(&self) -> TransportTimeouts {
        TransportTimeouts {
            connect: Duration::from_millis(self.smtp_connection_timeout_ms),
            greeting: Duration::from_millis(self.smtp_greeting_timeout_ms),
            socket: Duration::from_millis(self.smtp_socket_timeout_ms),
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.mail_send_timeout_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 8080);
        assert_eq!(config.body_limit_bytes().unwrap(), 1024 * 1024);
        assert_eq!(config.allowed_modes(), AllowedModes::All);
        assert!(config.basic_auth().is_none());
        assert_eq!(config.send_timeout(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
port = 9000
rate_limit_max = 5
cors_origins = "https://a.example, https://b.example"
smtp_allowed_modes = ["465-tls", "587-starttls"]
idempotency_ttl_seconds = 30
"#;
        let config: GatewayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.rate_limit_max, 5);
        assert_eq!(
            config.cors_origins,
            vec!["https://a.example", "https://b.example"]
        );
        assert_eq!(
            config.allowed_modes().labels().unwrap(),
            vec!["465-tls", "587-starttls"]
        );
        assert_eq!(config.dedup_settings().ttl, Duration::from_secs(30));
        assert_eq!(config.smtp_socket_timeout_ms, 30_000);
    }

    #[test]
    fn test_unparseable_modes_allow_all() {
        let config: GatewayConfig = toml::from_str(r#"smtp_allowed_modes = "nope, 0-tls""#).unwrap();
        assert_eq!(config.allowed_modes(), AllowedModes::All);
    }

    #[test]
    fn test_byte_sizes() {
        assert_eq!(parse_byte_size("1mb"), Some(1_048_576));
        assert_eq!(parse_byte_size("512KB"), Some(524_288));
        assert_eq!(parse_byte_size("1.5kb"), Some(1536));
        assert_eq!(parse_byte_size("2048"), Some(2048));
        assert_eq!(parse_byte_size("10 b"), Some(10));
        assert_eq!(parse_byte_size("lots"), None);
        assert_eq!(parse_byte_size("5tb"), None);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = GatewayConfig {
            mail_send_timeout_ms: 0,
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_err());

        config.mail_send_timeout_ms = 1000;
        config.basic_auth_user = Some("admin".to_string());
        assert!(config.validate().is_err());

        config.basic_auth_pass = Some("pw".to_string());
        assert!(config.validate().is_ok());
        assert!(config.basic_auth().is_some());

        config.request_body_limit = "huge".to_string();
        assert!(config.validate().is_err());

        config.request_body_limit = "1mb".to_string();
        config.ip_allowlist = vec!["10.0.0.0/99".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_credentials_disable_auth() {
        let config = GatewayConfig {
            basic_auth_user: Some(String::new()),
            basic_auth_pass: Some(String::new()),
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.basic_auth().is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "rate_limit_window_ms = 1000\nip_allowlist = [\"127.0.0.1\"]").unwrap();

        let config = GatewayConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.rate_limit_window(), Duration::from_secs(1));
        assert!(!config.ip_allow_list().unwrap().is_empty());
    }

    #[test]
    fn test_password_not_serialized() {
        let config = GatewayConfig {
            basic_auth_user: Some("admin".to_string()),
            basic_auth_pass: Some("s3cret".to_string()),
            ..GatewayConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("s3cret"));
    }
}
