//! Connection state, statistics and snapshot types shared by the
//! orchestrator and its observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Authoritative connection state of one orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    /// Terminal for the attempt. The reason is never empty.
    Failed(String),
}

impl ConnectionState {
    /// A connect or disconnect is currently being driven.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Disconnecting)
    }

    /// Idle or Failed: a fresh `Connect` may start here.
    pub fn is_settled(&self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Failed(_))
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            ConnectionState::Failed(r) => Some(r),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Why a state transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    /// `Connect` / `Disconnect` issued by the caller.
    UserRequest,
    /// Engine reported the tunnel as fully up.
    Established,
    /// The attempt failed before establishment.
    ConnectFailed,
    /// Established tunnel was lost without a disconnect request.
    ConnectionDropped,
    /// Backend finished tearing down.
    Stopped,
}

/// Payload of a `StatusChanged` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub state: ConnectionState,
    pub previous: ConnectionState,
    pub reason: Option<String>,
    pub cause: TransitionCause,
    pub timestamp: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Traffic statistics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Raw byte counters as reported by an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficCounters {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl TrafficCounters {
    pub fn new(bytes_in: u64, bytes_out: u64) -> Self {
        Self { bytes_in, bytes_out }
    }
}

/// Normalised statistics published to observers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub connected_since: Option<DateTime<Utc>>,
    pub duration_secs: u64,
}

impl Statistics {
    /// Fresh per-connection statistics starting at `since`.
    pub fn started(since: DateTime<Utc>) -> Self {
        Self {
            connected_since: Some(since),
            ..Self::default()
        }
    }

    /// Fold a counter sample in. Counters never go backwards within a
    /// connection, so a lower reading (engine restart) keeps the old value.
    pub fn absorb(&mut self, counters: TrafficCounters, now: DateTime<Utc>) {
        self.bytes_in = self.bytes_in.max(counters.bytes_in);
        self.bytes_out = self.bytes_out.max(counters.bytes_out);
        self.refresh_duration(now);
    }

    pub fn refresh_duration(&mut self, now: DateTime<Utc>) {
        if let Some(since) = self.connected_since {
            self.duration_secs = (now - since).num_seconds().max(0) as u64;
        }
    }

    pub fn is_zero(&self) -> bool {
        self.bytes_in == 0 && self.bytes_out == 0 && self.connected_since.is_none()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Immutable view of the orchestrator handed to UI code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    /// Tunnel-side address assigned by the server.
    pub local_ip: Option<String>,
    pub server_host: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
}

/// Human readable byte count (`1.5 MB`).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    // ── ConnectionState ──────────────────────────────────────────

    #[test]
    fn state_serde_roundtrip() {
        let states = vec![
            ConnectionState::Idle,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnecting,
            ConnectionState::Failed("engine exited with code 1".into()),
        ];
        for s in states {
            let json = serde_json::to_string(&s).unwrap();
            let back: ConnectionState = serde_json::from_str(&json).unwrap();
            assert_eq!(back, s);
        }
    }

    #[test]
    fn failed_serializes_reason() {
        let json = serde_json::to_string(&ConnectionState::Failed("boom".into())).unwrap();
        assert_eq!(json, r#"{"state":"failed","reason":"boom"}"#);
    }

    #[test]
    fn state_predicates() {
        assert!(ConnectionState::Idle.is_settled());
        assert!(ConnectionState::Failed("x".into()).is_settled());
        assert!(ConnectionState::Connecting.is_in_flight());
        assert!(!ConnectionState::Connected.is_in_flight());
        assert_eq!(
            ConnectionState::Failed("x".into()).failure_reason(),
            Some("x")
        );
    }

    // ── Statistics ───────────────────────────────────────────────

    #[test]
    fn absorb_is_monotonic() {
        let t0 = Utc::now();
        let mut stats = Statistics::started(t0);
        stats.absorb(TrafficCounters::new(1000, 500), t0 + Duration::seconds(3));
        assert_eq!(stats.bytes_in, 1000);
        assert_eq!(stats.bytes_out, 500);
        assert_eq!(stats.duration_secs, 3);

        stats.absorb(TrafficCounters::new(10, 20), t0 + Duration::seconds(4));
        assert_eq!(stats.bytes_in, 1000);
        assert_eq!(stats.bytes_out, 500);
        assert_eq!(stats.duration_secs, 4);
    }

    #[test]
    fn default_is_zero() {
        assert!(Statistics::default().is_zero());
        assert!(!Statistics::started(Utc::now()).is_zero());
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
