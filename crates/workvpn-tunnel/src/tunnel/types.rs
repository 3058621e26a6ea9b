//! Tunnel configuration model and control-protocol event types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use workvpn_core::TrafficCounters;

/// Port used when a `remote` line omits it.
pub const DEFAULT_REMOTE_PORT: i64 = 1194;

/// State tag the engine reports once the tunnel carries traffic.
pub const ESTABLISHED_STATE_TAG: &str = "CONNECTED";

/// Stdout line the engine prints once initialisation has finished.
pub const ESTABLISHED_STDOUT_MARKER: &str = "Initialization Sequence Completed";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport & device
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProto {
    Udp,
    Tcp,
}

impl TransportProto {
    /// Accepts the engine's spellings (`udp4`, `tcp-client`, `tcp6-client`…).
    pub fn from_str_loose(s: &str) -> Option<Self> {
        let lower = s.to_ascii_lowercase();
        if lower.starts_with("udp") {
            Some(TransportProto::Udp)
        } else if lower.starts_with("tcp") {
            Some(TransportProto::Tcp)
        } else {
            None
        }
    }
}

impl fmt::Display for TransportProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProto::Udp => write!(f, "udp"),
            TransportProto::Tcp => write!(f, "tcp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Tun,
    Tap,
}

impl DeviceKind {
    /// `tun`, `tun0`, `tap-vpn` … → kind; anything else is rejected.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        let lower = s.to_ascii_lowercase();
        if lower.starts_with("tun") {
            Some(DeviceKind::Tun)
        } else if lower.starts_with("tap") {
            Some(DeviceKind::Tap)
        } else {
            None
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Tun => write!(f, "tun"),
            DeviceKind::Tap => write!(f, "tap"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tunnel config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A directive the model does not interpret, kept for re-emission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub keyword: String,
    pub args: Vec<String>,
}

impl Directive {
    pub fn new(keyword: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            keyword: keyword.into(),
            args,
        }
    }

    pub fn is(&self, keyword: &str) -> bool {
        self.keyword.eq_ignore_ascii_case(keyword)
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.keyword)?;
        for a in &self.args {
            write!(f, " {}", a)?;
        }
        Ok(())
    }
}

/// Structured tunnel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    pub remote_host: String,
    /// Signed and wider than `u16` so out-of-range values, negatives
    /// included, survive to validation.
    pub remote_port: i64,
    pub transport: Option<TransportProto>,
    pub device: Option<DeviceKind>,
    /// Explicit interface name when `dev` was more than the bare kind.
    pub device_name: Option<String>,
    pub cipher: Option<String>,
    pub auth: Option<String>,
    pub key_direction: Option<u8>,
    /// `<name>…</name>` sections: ca, cert, key, tls-auth, tls-crypt …
    pub inline_blocks: BTreeMap<String, String>,
    pub extra_directives: Vec<Directive>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            remote_host: String::new(),
            remote_port: DEFAULT_REMOTE_PORT,
            transport: None,
            device: None,
            device_name: None,
            cipher: None,
            auth: None,
            key_direction: None,
            inline_blocks: BTreeMap::new(),
            extra_directives: Vec::new(),
        }
    }
}

impl TunnelConfig {
    pub fn transport_or_default(&self) -> TransportProto {
        self.transport.unwrap_or(TransportProto::Udp)
    }

    pub fn device_or_default(&self) -> DeviceKind {
        self.device.unwrap_or(DeviceKind::Tun)
    }

    /// `<ca>` inline block or a `ca <file>` directive.
    pub fn has_certificate_authority(&self) -> bool {
        self.inline_blocks
            .get("ca")
            .map(|b| !b.trim().is_empty())
            .unwrap_or(false)
            || self
                .extra_directives
                .iter()
                .any(|d| d.is("ca") && !d.args.is_empty())
    }

    /// The server expects a username/password (`auth-user-pass`).
    pub fn requires_auth(&self) -> bool {
        self.extra_directives.iter().any(|d| d.is("auth-user-pass"))
    }

    pub fn directive(&self, keyword: &str) -> Option<&Directive> {
        self.extra_directives.iter().find(|d| d.is(keyword))
    }

    /// Summary for config lists.
    pub fn info(&self, name: impl Into<String>) -> ConfigInfo {
        ConfigInfo {
            name: name.into(),
            server: self.remote_host.clone(),
            port: self.remote_port,
            protocol: self.transport_or_default(),
        }
    }
}

/// What a UI shows for an imported config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigInfo {
    pub name: String,
    pub server: String,
    pub port: i64,
    pub protocol: TransportProto,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Control-protocol events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One `>STATE:` record (or a bare reply row of the `state` command).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineState {
    pub timestamp: u64,
    pub tag: String,
    pub description: String,
    pub local_ip: Option<String>,
    pub remote_ip: Option<String>,
}

impl EngineState {
    pub fn is_established(&self) -> bool {
        self.tag.eq_ignore_ascii_case(ESTABLISHED_STATE_TAG)
    }
}

/// A parsed inbound control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    ByteCount { bytes_in: u64, bytes_out: u64 },
    StateChange(EngineState),
    LogLine(String),
    Hold(String),
    /// Engine asks for credentials; payload is the prompt text.
    PasswordRequest(String),
    Fatal(String),
    /// Anything the client does not understand yet, forwarded verbatim.
    Unrecognized(String),
    /// Terminal: the socket closed. Broadcast exactly once.
    Disconnected,
}

impl ControlEvent {
    pub fn counters(&self) -> Option<TrafficCounters> {
        match self {
            ControlEvent::ByteCount {
                bytes_in,
                bytes_out,
            } => Some(TrafficCounters::new(*bytes_in, *bytes_out)),
            _ => None,
        }
    }
}
