//! Orchestrator-wide error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised VPN error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnError {
    pub kind: VpnErrorKind,
    pub message: String,
    /// Underlying cause (OS error text, engine stderr, searched paths…).
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum VpnErrorKind {
    /// Config failed validation or could not be parsed.
    InvalidConfig,
    /// No tunnel engine binary found in any searched location.
    EngineNotFound,
    /// The engine process could not be launched.
    ProcessSpawn,
    /// The engine process exited before or after establishment.
    ProcessExit,
    /// Control socket connect failure or mid-session loss.
    ControlChannel,
    /// Tunnel was not established within the connect deadline.
    ConnectTimeout,
    /// A control query got no matching reply in time.
    QueryTimeout,
    /// Operation needs a live connection / control channel.
    NotConnected,
    /// A connect attempt is already in flight (or established).
    AlreadyConnecting,
    /// The server rejected the supplied credentials.
    AuthRejected,
    /// Attempt abandoned by an explicit disconnect.
    Cancelled,
    /// Local I/O failure (temp files, sockets).
    Io,
}

pub type VpnResult<T> = Result<T, VpnError>;

// ── Construction helpers ─────────────────────────────────────────────

impl VpnError {
    pub fn new(kind: VpnErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(VpnErrorKind::InvalidConfig, msg)
    }

    /// Engine lookup failed; `searched` is reported verbatim in the detail.
    pub fn engine_not_found<P: fmt::Display>(searched: &[P]) -> Self {
        let list: Vec<String> = searched.iter().map(|p| p.to_string()).collect();
        Self::new(
            VpnErrorKind::EngineNotFound,
            "tunnel engine binary not found, install OpenVPN or set engine_path",
        )
        .with_detail(format!("searched: {}", list.join(", ")))
    }

    pub fn process_spawn(msg: impl Into<String>) -> Self {
        Self::new(VpnErrorKind::ProcessSpawn, msg)
    }

    pub fn process_exit(code: Option<i32>) -> Self {
        let msg = match code {
            Some(c) => format!("engine exited with code {c}"),
            None => "engine terminated by signal".to_string(),
        };
        Self::new(VpnErrorKind::ProcessExit, msg)
    }

    pub fn control_channel(msg: impl Into<String>) -> Self {
        Self::new(VpnErrorKind::ControlChannel, msg)
    }

    pub fn connect_timeout(secs: u64) -> Self {
        Self::new(
            VpnErrorKind::ConnectTimeout,
            format!("tunnel not established within {secs}s"),
        )
    }

    pub fn query_timeout(command: &str) -> Self {
        Self::new(
            VpnErrorKind::QueryTimeout,
            format!("no reply to '{command}' before timeout"),
        )
    }

    pub fn not_connected(msg: impl Into<String>) -> Self {
        Self::new(VpnErrorKind::NotConnected, msg)
    }

    pub fn already_connecting(msg: impl Into<String>) -> Self {
        Self::new(VpnErrorKind::AlreadyConnecting, msg)
    }

    pub fn auth_rejected(msg: impl Into<String>) -> Self {
        Self::new(VpnErrorKind::AuthRejected, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(VpnErrorKind::Cancelled, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(VpnErrorKind::Io, msg)
    }
}

impl VpnErrorKind {
    /// Whether a caller may reasonably retry the same operation unchanged.
    ///
    /// Only stats queries are retried automatically; a new `Connect` after a
    /// transient failure is the caller's decision.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            VpnErrorKind::QueryTimeout
                | VpnErrorKind::ControlChannel
                | VpnErrorKind::ConnectTimeout
                | VpnErrorKind::ProcessExit
        )
    }
}

impl fmt::Display for VpnErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for VpnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)?;
        if let Some(d) = &self.detail {
            write!(f, " ({})", d)?;
        }
        Ok(())
    }
}

impl std::error::Error for VpnError {}

impl From<std::io::Error> for VpnError {
    fn from(e: std::io::Error) -> Self {
        Self::io(format!("I/O error ({:?})", e.kind())).with_detail(e.to_string())
    }
}

impl From<VpnError> for String {
    fn from(e: VpnError) -> String {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_detail() {
        let e = VpnError::control_channel("socket closed").with_detail("EOF");
        assert_eq!(e.to_string(), "[ControlChannel] socket closed (EOF)");
    }

    #[test]
    fn engine_not_found_lists_paths() {
        let e = VpnError::engine_not_found(&["/usr/sbin/openvpn", "/usr/bin/openvpn"]);
        assert_eq!(e.kind, VpnErrorKind::EngineNotFound);
        let detail = e.detail.unwrap();
        assert!(detail.contains("/usr/sbin/openvpn"));
        assert!(detail.contains("/usr/bin/openvpn"));
        assert!(!e.kind.is_retryable());
    }

    #[test]
    fn process_exit_mentions_code() {
        let e = VpnError::process_exit(Some(1));
        assert!(e.message.contains("code 1"));
        let e = VpnError::process_exit(None);
        assert!(e.message.contains("signal"));
    }

    #[test]
    fn io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let e: VpnError = io.into();
        assert_eq!(e.kind, VpnErrorKind::Io);
        assert_eq!(e.detail.as_deref(), Some("nope"));
    }

    #[test]
    fn serde_roundtrip() {
        let e = VpnError::invalid_config("missing remote");
        let json = serde_json::to_string(&e).unwrap();
        let back: VpnError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, VpnErrorKind::InvalidConfig);
        assert_eq!(back.message, "missing remote");
    }

    #[test]
    fn into_string() {
        let s: String = VpnError::cancelled("disconnect requested").into();
        assert!(s.starts_with("[Cancelled]"));
    }
}
