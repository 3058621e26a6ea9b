//! Management-interface control channel.
//!
//! Speaks the line protocol an OpenVPN engine exposes when started with
//! `--management <addr> <port>`: one command per line out, one line per
//! reply or asynchronous `>TAG:` notification in. Every inbound line is
//! parsed into a [`ControlEvent`] and broadcast to all subscribers.

use crate::tunnel::engine::parse_version_string;
use crate::tunnel::types::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use workvpn_core::{CredentialField, Credentials, TrafficCounters, VpnError, VpnResult};
use zeroize::Zeroizing;

/// Buffered events per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 512;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Commands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Well-known management commands.
pub struct ControlCommands;

impl ControlCommands {
    pub const HOLD_RELEASE: &'static str = "hold release";
    pub const STATE: &'static str = "state";
    pub const STATE_ON: &'static str = "state on";
    pub const BYTECOUNT: &'static str = "bytecount";
    pub const VERSION: &'static str = "version";

    pub fn bytecount(interval_secs: u32) -> String {
        format!("bytecount {}", interval_secs)
    }

    pub fn signal(name: &str) -> String {
        format!("signal {}", name)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Query reply
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of [`ControlChannel::query`]. A timeout is not an error: it
/// hands back the caller's fallback so stats can stay "unknown" without
/// tearing anything down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryReply<T> {
    Answered(T),
    TimedOut { fallback: T },
}

impl<T> QueryReply<T> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, QueryReply::TimedOut { .. })
    }

    /// The answer, or the fallback on timeout.
    pub fn value(self) -> T {
        match self {
            QueryReply::Answered(v) => v,
            QueryReply::TimedOut { fallback } => fallback,
        }
    }

    pub fn answered(self) -> Option<T> {
        match self {
            QueryReply::Answered(v) => Some(v),
            QueryReply::TimedOut { .. } => None,
        }
    }

    /// Treat a timeout as a `QueryTimeout` error.
    pub fn into_result(self, command: &str) -> VpnResult<T> {
        match self {
            QueryReply::Answered(v) => Ok(v),
            QueryReply::TimedOut { .. } => Err(VpnError::query_timeout(command)),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Control channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct LinkState {
    connected: AtomicBool,
    events: broadcast::Sender<ControlEvent>,
    peer: String,
}

impl LinkState {
    /// First caller wins; everybody else is a no-op.
    fn mark_disconnected(&self, why: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            log::info!("control channel {} closed: {}", self.peer, why);
            let _ = self.events.send(ControlEvent::Disconnected);
        }
    }
}

/// Handle to a live management connection.
pub struct ControlChannel {
    writer: Mutex<OwnedWriteHalf>,
    link: Arc<LinkState>,
    /// Receiver created before the reader task started, so the first
    /// subscriber sees the engine's greeting and prompts.
    early: StdMutex<Option<broadcast::Receiver<ControlEvent>>>,
    reader: JoinHandle<()>,
}

impl ControlChannel {
    /// Connect to the management socket and release the engine's hold.
    pub async fn connect(host: &str, port: u16) -> VpnResult<Self> {
        let stream = TcpStream::connect((host, port)).await.map_err(|e| {
            VpnError::control_channel(format!(
                "cannot connect to control socket at {}:{}",
                host, port
            ))
            .with_detail(e.to_string())
        })?;
        Self::from_stream(stream, format!("{}:{}", host, port)).await
    }

    /// [`connect`](Self::connect) bounded by `timeout`.
    pub async fn connect_timeout(host: &str, port: u16, timeout: Duration) -> VpnResult<Self> {
        match tokio::time::timeout(timeout, Self::connect(host, port)).await {
            Ok(res) => res,
            Err(_) => Err(VpnError::control_channel(format!(
                "timed out connecting to control socket at {}:{}",
                host, port
            ))),
        }
    }

    async fn from_stream(stream: TcpStream, peer: String) -> VpnResult<Self> {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (tx, early_rx) = broadcast::channel(EVENT_CAPACITY);
        let link = Arc::new(LinkState {
            connected: AtomicBool::new(true),
            events: tx,
            peer: peer.clone(),
        });

        let reader = tokio::spawn(read_loop(read_half, link.clone()));

        let channel = Self {
            writer: Mutex::new(write_half),
            link,
            early: StdMutex::new(Some(early_rx)),
            reader,
        };
        log::debug!("control channel connected to {}", peer);
        channel.send(ControlCommands::HOLD_RELEASE).await?;
        Ok(channel)
    }

    pub fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }

    pub fn peer(&self) -> &str {
        &self.link.peer
    }

    /// Receive every parsed inbound line from now on. The very first call
    /// also gets everything received since the socket opened.
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        if let Ok(mut early) = self.early.lock() {
            if let Some(rx) = early.take() {
                return rx;
            }
        }
        self.link.events.subscribe()
    }

    /// Write one command line. No reply is awaited.
    pub async fn send(&self, command: &str) -> VpnResult<()> {
        if !self.is_connected() {
            return Err(VpnError::not_connected(format!(
                "control channel {} is closed",
                self.link.peer
            )));
        }
        log::trace!(">>> {}", redact(command));

        let mut line = Zeroizing::new(String::with_capacity(command.len() + 1));
        line.push_str(command);
        line.push('\n');

        let mut writer = self.writer.lock().await;
        let res = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = res {
            self.link.mark_disconnected(&e.to_string());
            return Err(VpnError::control_channel(format!(
                "failed to send '{}'",
                redact(command)
            ))
            .with_detail(e.to_string()));
        }
        Ok(())
    }

    /// Send `command` and wait for the first inbound event `matcher`
    /// accepts. On timeout the reply carries `fallback`.
    pub async fn query<T, F>(
        &self,
        command: &str,
        timeout: Duration,
        fallback: T,
        mut matcher: F,
    ) -> VpnResult<QueryReply<T>>
    where
        F: FnMut(&ControlEvent) -> Option<T>,
    {
        // Subscribe before checking the link so a close in between still
        // reaches this receiver.
        let mut rx = self.link.events.subscribe();
        self.send(command).await?;

        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(ControlEvent::Disconnected) => {
                        return Err(VpnError::not_connected(format!(
                            "control channel closed while waiting for '{}'",
                            command
                        )))
                    }
                    Ok(ev) => {
                        if let Some(v) = matcher(&ev) {
                            return Ok(v);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("query '{}' skipped {} events", command, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(VpnError::not_connected("control channel dropped"))
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(v)) => Ok(QueryReply::Answered(v)),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                log::debug!("query '{}' timed out after {:?}", command, timeout);
                Ok(QueryReply::TimedOut { fallback })
            }
        }
    }

    // ── Typed queries ────────────────────────────────────────────

    /// Current traffic counters; zeros on timeout.
    pub async fn byte_count(&self, timeout: Duration) -> VpnResult<QueryReply<TrafficCounters>> {
        self.query(
            ControlCommands::BYTECOUNT,
            timeout,
            TrafficCounters::default(),
            ControlEvent::counters,
        )
        .await
    }

    /// Current engine state tag; `UNKNOWN` on timeout.
    pub async fn engine_state(&self, timeout: Duration) -> VpnResult<QueryReply<String>> {
        self.query(ControlCommands::STATE, timeout, "UNKNOWN".to_string(), |ev| {
            match ev {
                ControlEvent::StateChange(s) => Some(s.tag.clone()),
                ControlEvent::Unrecognized(raw) => parse_state_record(raw).map(|s| s.tag),
                _ => None,
            }
        })
        .await
    }

    /// Engine version (`2.6.8`); `unknown` on timeout.
    pub async fn version(&self, timeout: Duration) -> VpnResult<QueryReply<String>> {
        self.query(ControlCommands::VERSION, timeout, "unknown".to_string(), |ev| {
            match ev {
                ControlEvent::Unrecognized(raw) => parse_version_string(raw),
                _ => None,
            }
        })
        .await
    }

    // ── Commands ─────────────────────────────────────────────────

    pub async fn hold_release(&self) -> VpnResult<()> {
        self.send(ControlCommands::HOLD_RELEASE).await
    }

    pub async fn state_on(&self) -> VpnResult<()> {
        self.send(ControlCommands::STATE_ON).await
    }

    /// Ask for `>BYTECOUNT:` pushes every `interval_secs` (0 disables).
    pub async fn bytecount(&self, interval_secs: u32) -> VpnResult<()> {
        self.send(&ControlCommands::bytecount(interval_secs)).await
    }

    pub async fn signal(&self, name: &str) -> VpnResult<()> {
        self.send(&ControlCommands::signal(name)).await
    }

    /// Answer a `>PASSWORD:Need '<realm>' username/password` prompt.
    pub async fn supply_credentials(&self, realm: &str, creds: &Credentials) -> VpnResult<()> {
        let user = creds.reply_line(CredentialField::Username, realm);
        self.send(&user).await?;
        let pass = creds.reply_line(CredentialField::Password, realm);
        self.send(&pass).await
    }

    /// Close the socket. Subscribers get `Disconnected` if they have not
    /// already.
    pub async fn close(&self) {
        self.link.mark_disconnected("closed locally");
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        self.reader.abort();
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(read_half: OwnedReadHalf, link: Arc<LinkState>) {
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                link.mark_disconnected("EOF");
                break;
            }
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\r', '\n']);
                log::trace!("<<< {}", line);
                if let Some(ev) = parse_control_line(line) {
                    let _ = link.events.send(ev);
                }
            }
            Err(e) => {
                link.mark_disconnected(&e.to_string());
                break;
            }
        }
    }
}

/// Hide secrets in credential replies before logging.
fn redact(command: &str) -> String {
    let lower = command.to_ascii_lowercase();
    if lower.starts_with("password ") || lower.starts_with("username ") {
        let mut parts = command.splitn(3, ' ');
        let verb = parts.next().unwrap_or_default();
        let realm = parts.next().unwrap_or_default();
        format!("{} {} ***", verb, realm)
    } else {
        command.to_string()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Line parser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse one inbound line. Only blank lines yield `None`; anything not
/// understood comes back as `Unrecognized`.
pub fn parse_control_line(line: &str) -> Option<ControlEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let unrecognized = || Some(ControlEvent::Unrecognized(line.to_string()));

    let Some(rest) = line.strip_prefix('>') else {
        return unrecognized();
    };
    let Some((tag, payload)) = rest.split_once(':') else {
        return unrecognized();
    };

    match tag {
        "BYTECOUNT" => {
            let mut parts = payload.split(',');
            let bytes_in = parts.next().and_then(|s| s.trim().parse::<u64>().ok());
            let bytes_out = parts.next().and_then(|s| s.trim().parse::<u64>().ok());
            match (bytes_in, bytes_out) {
                (Some(bytes_in), Some(bytes_out)) => Some(ControlEvent::ByteCount {
                    bytes_in,
                    bytes_out,
                }),
                _ => unrecognized(),
            }
        }
        "STATE" => match parse_state_fields(payload) {
            Some(state) => Some(ControlEvent::StateChange(state)),
            None => unrecognized(),
        },
        "LOG" => {
            // ts,flags,message – the message may itself contain commas.
            let parts: Vec<&str> = payload.splitn(3, ',').collect();
            let text = if parts.len() == 3 { parts[2] } else { payload };
            Some(ControlEvent::LogLine(text.to_string()))
        }
        "HOLD" => Some(ControlEvent::Hold(payload.to_string())),
        "PASSWORD" => Some(ControlEvent::PasswordRequest(payload.to_string())),
        "FATAL" => Some(ControlEvent::Fatal(payload.to_string())),
        _ => unrecognized(),
    }
}

fn parse_state_fields(payload: &str) -> Option<EngineState> {
    let fields: Vec<&str> = payload.split(',').collect();
    if fields.len() < 2 || fields[1].trim().is_empty() {
        return None;
    }
    let non_empty = |i: usize| {
        fields
            .get(i)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };
    Some(EngineState {
        timestamp: fields[0].trim().parse().unwrap_or(0),
        tag: fields[1].trim().to_string(),
        description: fields.get(2).map(|s| s.trim().to_string()).unwrap_or_default(),
        local_ip: non_empty(3),
        remote_ip: non_empty(4),
    })
}

/// Parse a bare `state` reply row (`1700000000,CONNECTED,SUCCESS,…`).
pub fn parse_state_record(raw: &str) -> Option<EngineState> {
    let first = raw.split(',').next()?;
    if first.is_empty() || !first.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let state = parse_state_fields(raw)?;
    if state.tag.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
        Some(state)
    } else {
        None
    }
}

/// What a `>PASSWORD:` notification asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordPrompt {
    /// `Need 'Auth' username/password` – or a password-only realm.
    Need { realm: String, username: bool },
    /// `Verification Failed: 'Auth'`
    VerificationFailed { realm: String },
    Other(String),
}

pub fn parse_password_prompt(payload: &str) -> PasswordPrompt {
    let realm = payload
        .split('\'')
        .nth(1)
        .map(|s| s.to_string())
        .unwrap_or_default();
    if payload.starts_with("Verification Failed") {
        PasswordPrompt::VerificationFailed { realm }
    } else if payload.starts_with("Need ") && !realm.is_empty() {
        PasswordPrompt::Need {
            username: payload.contains("username"),
            realm,
        }
    } else {
        PasswordPrompt::Other(payload.to_string())
    }
}
