//! SMTP connection mode policy
//!
//! A mode is a `(port, secure)` pair, where `secure` means implicit TLS and
//! its absence means STARTTLS. Operators restrict modes with tokens such as
//! `465-tls` or `587-starttls`.

use serde_json::{json, Value};
use std::fmt;
use tracing::warn;

use crate::error::{GatewayError, Result};

/// Policy applied when no usable mode is configured
pub const ALLOW_ALL: AllowedModes = AllowedModes::All;

/// Modes probed when neither the request nor the configuration names any
pub const DEFAULT_PROBE_MODES: [ModeDescriptor; 3] = [
    ModeDescriptor::new(465, true),
    ModeDescriptor::new(2525, false),
    ModeDescriptor::new(25, false),
];

/// A single SMTP connection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModeDescriptor {
    port: u16,
    secure: bool,
}

impl ModeDescriptor {
    pub const fn new(port: u16, secure: bool) -> Self {
        Self { port, secure }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `true` for implicit TLS, `false` for STARTTLS
    pub fn secure(&self) -> bool {
        self.secure
    }

    /// Label in `{port}-{tls|starttls}` form
    pub fn label(&self) -> String {
        self.to_string()
    }

    /// Parse a `port-kind` token
    ///
    /// Returns `None` for a zero or out-of-range port and for any kind other
    /// than `tls` or `starttls` (case-insensitive).
    pub fn parse(token: &str) -> Option<Self> {
        let (port, kind) = token.trim().split_once('-')?;
        let port = port.trim().parse::<u16>().ok().filter(|p| *p > 0)?;

        match kind.trim().to_ascii_lowercase().as_str() {
            "tls" => Some(Self::new(port, true)),
            "starttls" => Some(Self::new(port, false)),
            _ => None,
        }
    }
}

impl fmt::Display for ModeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.secure { "tls" } else { "starttls" };
        write!(f, "{}-{}", self.port, kind)
    }
}

/// The set of modes requests may use
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedModes {
    /// No restriction configured
    All,
    /// Only these modes, in configuration order
    Only(Vec<ModeDescriptor>),
}

impl AllowedModes {
    /// Build the policy from configuration tokens
    ///
    /// Unparseable tokens are dropped. If nothing usable remains the result
    /// is [`ALLOW_ALL`], never an empty allow-list.
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut modes: Vec<ModeDescriptor> = Vec::new();

        for token in tokens {
            let token = token.as_ref().trim();
            if token.is_empty() {
                continue;
            }
            match ModeDescriptor::parse(token) {
                Some(mode) if !modes.contains(&mode) => modes.push(mode),
                Some(_) => {}
                None => warn!("Ignoring unrecognised SMTP mode '{}'", token),
            }
        }

        if modes.is_empty() {
            ALLOW_ALL
        } else {
            AllowedModes::Only(modes)
        }
    }

    /// Parse a comma-separated token list
    pub fn parse_list(list: &str) -> Self {
        Self::from_tokens(list.split(','))
    }

    /// Exact `(port, secure)` membership test
    pub fn is_allowed(&self, port: u16, secure: bool) -> bool {
        match self {
            AllowedModes::All => true,
            AllowedModes::Only(modes) => modes
                .iter()
                .any(|m| m.port == port && m.secure == secure),
        }
    }

    /// Reject a mode that is not allowed, carrying diagnostics
    pub fn check(&self, mode: ModeDescriptor) -> Result<()> {
        if self.is_allowed(mode.port(), mode.secure()) {
            return Ok(());
        }

        Err(GatewayError::ModeNotAllowed {
            mode: mode.label(),
            allowed: self.labels().unwrap_or_default(),
        })
    }

    /// Configured modes, or `None` when everything is allowed
    pub fn modes(&self) -> Option<&[ModeDescriptor]> {
        match self {
            AllowedModes::All => None,
            AllowedModes::Only(modes) => Some(modes),
        }
    }

    /// Configured labels, or `None` when everything is allowed
    pub fn labels(&self) -> Option<Vec<String>> {
        self.modes()
            .map(|modes| modes.iter().map(ModeDescriptor::label).collect())
    }

    /// JSON view for introspection: a label list or the string `"all"`
    pub fn describe(&self) -> Value {
        match self.labels() {
            Some(labels) => json!(labels),
            None => json!("all"),
        }
    }
}

impl Default for AllowedModes {
    fn default() -> Self {
        ALLOW_ALL
    }
}
