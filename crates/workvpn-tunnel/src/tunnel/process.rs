//! External engine backend: process lifecycle, launch file, control link.
//!
//! One attempt owns one engine process. The process is started with a
//! generated launch file and a management socket on loopback; stdout and
//! stderr are read by their own tasks, a third task reaps the process,
//! and a forwarder turns control-channel notifications into
//! [`BackendEvent`]s. Credentials are only ever written to the control
//! socket in answer to a `>PASSWORD:` prompt.

use crate::tunnel::backend::*;
use crate::tunnel::config::generate;
use crate::tunnel::control::{parse_password_prompt, ControlChannel, PasswordPrompt};
use crate::tunnel::engine::EngineLocator;
use crate::tunnel::settings::ProcessSettings;
use crate::tunnel::types::*;
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use workvpn_core::{Credentials, TrafficCounters, VpnError, VpnResult};

/// Retry spacing while waiting for the engine to open its control socket.
const CONTROL_RETRY_DELAY: Duration = Duration::from_millis(200);

/// How long to wait for a process after a hard kill.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Directives the backend controls itself and never passes through.
const RESERVED_DIRECTIVES: &[&str] = &["daemon", "log", "log-append"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Launch file
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Temporary config handed to the engine. Removed on drop.
pub struct LaunchFile {
    path: PathBuf,
    removed: bool,
}

impl LaunchFile {
    pub async fn create(dir: &Path, contents: &str) -> VpnResult<Self> {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            VpnError::io(format!("failed to create work dir {}", dir.display()))
                .with_detail(e.to_string())
        })?;

        let path = dir.join(format!("launch_{}.conf", uuid::Uuid::new_v4()));
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let write = async {
            use tokio::io::AsyncWriteExt;
            let mut file = options.open(&path).await?;
            file.write_all(contents.as_bytes()).await?;
            file.flush().await
        };
        write.await.map_err(|e| {
            VpnError::io(format!("failed to write launch file {}", path.display()))
                .with_detail(e.to_string())
        })?;
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Idempotent.
    pub fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("could not remove {}: {}", self.path.display(), e);
            }
        }
    }
}

impl Drop for LaunchFile {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Render the file the engine is launched with. Management directives are
/// supplied on the command line instead, and `auth-user-pass` loses any
/// file argument so the engine has to ask over the control socket.
pub fn launch_config(cfg: &TunnelConfig) -> String {
    let mut launch = cfg.clone();
    launch.extra_directives.retain(|d| {
        !d.keyword.to_ascii_lowercase().starts_with("management")
            && !RESERVED_DIRECTIVES.iter().any(|r| d.is(r))
    });
    for d in launch.extra_directives.iter_mut() {
        if d.is("auth-user-pass") {
            d.args.clear();
        }
    }

    let is_client = launch
        .extra_directives
        .iter()
        .any(|d| d.is("client") || d.is("tls-client"));
    let body = generate(&launch);
    if is_client {
        body
    } else {
        format!("client\n{}", body)
    }
}

/// Command line for one attempt.
pub fn build_args(launch_file: &Path, verbosity: u8, control_host: &str, port: u16) -> Vec<String> {
    vec![
        "--config".into(),
        launch_file.display().to_string(),
        "--verb".into(),
        verbosity.to_string(),
        "--management".into(),
        control_host.to_string(),
        port.to_string(),
        "--management-query-passwords".into(),
        "--management-hold".into(),
    ]
}

/// Ask the OS for an unused loopback port.
pub fn find_free_control_port() -> VpnResult<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").map_err(|e| {
        VpnError::io("cannot bind an ephemeral control port").with_detail(e.to_string())
    })?;
    let addr = listener.local_addr().map_err(|e| {
        VpnError::io("cannot read ephemeral control port").with_detail(e.to_string())
    })?;
    Ok(addr.port())
}

fn ifconfig_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ifconfig\s+(\d+\.\d+\.\d+\.\d+)").ok())
        .as_ref()
}

/// Tunnel address from engine output such as
/// `/sbin/ip addr add dev tun0 ... ifconfig 10.8.0.6 255.255.255.0`.
pub fn parse_ifconfig_address(line: &str) -> Option<String> {
    ifconfig_regex()?
        .captures(line)
        .map(|c| c[1].to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Process backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ProcessSession {
    pid: Option<u32>,
    launch: LaunchFile,
    control: Option<Arc<ControlChannel>>,
    forwarder: Option<JoinHandle<()>>,
    kill_tx: Option<oneshot::Sender<()>>,
    /// `Some(code)` once the process has been reaped.
    exit: watch::Receiver<Option<Option<i32>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProcessSession {
    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    async fn wait_exit(&mut self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.exit.wait_for(|s| s.is_some()))
            .await
            .is_ok()
    }

    fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        if let Some(f) = self.forwarder.take() {
            f.abort();
        }
        // Dropping `kill_tx` makes the reaper kill the process.
    }
}

/// Drives an OpenVPN-compatible engine executable.
pub struct ProcessBackend {
    settings: ProcessSettings,
    locator: EngineLocator,
    session: Option<ProcessSession>,
}

impl ProcessBackend {
    pub fn new(settings: ProcessSettings) -> Self {
        let locator = EngineLocator::platform_default().with_override(settings.engine_path.clone());
        Self::with_locator(settings, locator)
    }

    pub fn with_locator(settings: ProcessSettings, locator: EngineLocator) -> Self {
        Self {
            settings,
            locator,
            session: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.session.as_ref().and_then(|s| s.pid)
    }

    pub fn is_running(&self) -> bool {
        self.session.as_ref().map(|s| !s.has_exited()).unwrap_or(false)
    }

    async fn attach_control(&self, port: u16) -> VpnResult<ControlChannel> {
        let host = &self.settings.control_host;
        let deadline = tokio::time::Instant::now() + self.settings.control_connect_timeout();
        loop {
            match ControlChannel::connect(host, port).await {
                Ok(c) => return Ok(c),
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(VpnError::control_channel(format!(
                            "engine did not open its control socket on {}:{} within {}s",
                            host,
                            port,
                            self.settings.control_connect_timeout_secs
                        ))
                        .with_detail(e.detail.unwrap_or(e.message)));
                    }
                }
            }
            match self.session.as_ref().map(|s| *s.exit.borrow()) {
                Some(None) => {}
                Some(Some(code)) => return Err(VpnError::process_exit(code)),
                None => {
                    return Err(VpnError::control_channel(
                        "engine session vanished before its control socket opened",
                    ))
                }
            }
            tokio::time::sleep(CONTROL_RETRY_DELAY).await;
        }
    }
}

#[async_trait]
impl TunnelBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn start(
        &mut self,
        request: StartRequest,
        events: mpsc::Sender<BackendEvent>,
    ) -> VpnResult<()> {
        if self.session.is_some() {
            log::warn!("start called with a live session, stopping it first");
            self.stop(Duration::from_secs(1)).await?;
        }

        let binary = self.locator.locate()?;
        let port = match self.settings.control_port {
            Some(p) => p,
            None => find_free_control_port()?,
        };
        let launch = LaunchFile::create(
            &self.settings.resolved_work_dir(),
            &launch_config(&request.config),
        )
        .await?;
        let args = build_args(
            launch.path(),
            self.settings.verbosity,
            &self.settings.control_host,
            port,
        );

        log::info!(
            "starting engine {} (control {}:{})",
            binary.display(),
            self.settings.control_host,
            port
        );
        let mut child = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                VpnError::process_spawn(format!("failed to spawn {}", binary.display()))
                    .with_detail(e.to_string())
            })?;
        let pid = child.id();

        let mut tasks = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            tasks.push(tokio::spawn(watch_stdout(stdout, events.clone())));
        }
        let stderr_tail = Arc::new(StdMutex::new(None));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(watch_stderr(stderr, stderr_tail.clone(), events.clone())));

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tasks.push(tokio::spawn(reap(
            child,
            kill_rx,
            stderr_task,
            stderr_tail,
            exit_tx,
            events.clone(),
        )));

        self.session = Some(ProcessSession {
            pid,
            launch,
            control: None,
            forwarder: None,
            kill_tx: Some(kill_tx),
            exit: exit_rx,
            tasks,
        });

        let control = Arc::new(self.attach_control(port).await?);
        let rx = control.subscribe();
        control.state_on().await?;
        control.bytecount(1).await?;
        let forwarder = tokio::spawn(forward_control(
            control.clone(),
            rx,
            request.credentials,
            events,
        ));

        if let Some(session) = self.session.as_mut() {
            session.control = Some(control);
            session.forwarder = Some(forwarder);
        }
        Ok(())
    }

    async fn stop(&mut self, grace: Duration) -> VpnResult<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        if let Some(f) = session.forwarder.take() {
            f.abort();
        }

        if !session.has_exited() {
            match session.control.clone() {
                Some(control) if control.is_connected() => {
                    log::debug!("asking engine to exit");
                    let _ = control.signal("SIGTERM").await;
                    if !session.wait_exit(grace).await {
                        log::warn!("engine ignored SIGTERM for {:?}, killing", grace);
                        session.kill();
                    }
                }
                _ => session.kill(),
            }
            if !session.wait_exit(KILL_WAIT).await {
                log::warn!("engine pid {:?} did not exit after kill", session.pid);
            }
        }

        if let Some(control) = session.control.take() {
            control.close().await;
        }
        for t in session.tasks.drain(..) {
            t.abort();
        }
        session.launch.remove();
        log::info!("engine stopped");
        Ok(())
    }

    fn statistics(&self) -> Option<Arc<dyn StatisticsSource>> {
        let control = self.session.as_ref()?.control.clone()?;
        Some(Arc::new(ControlStatistics {
            control,
            query_timeout: self.settings.query_timeout(),
        }))
    }
}

/// Counters read over the control channel.
struct ControlStatistics {
    control: Arc<ControlChannel>,
    query_timeout: Duration,
}

#[async_trait]
impl StatisticsSource for ControlStatistics {
    async fn sample(&self) -> VpnResult<EngineSample> {
        let counters = self.control.byte_count(self.query_timeout).await?.answered();
        let state_tag = self.control.engine_state(self.query_timeout).await?.answered();
        Ok(EngineSample {
            counters,
            state_tag,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Background tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn next_line<R: AsyncRead + Unpin>(reader: &mut BufReader<R>, buf: &mut Vec<u8>) -> Option<String> {
    buf.clear();
    match reader.read_until(b'\n', buf).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(
            String::from_utf8_lossy(buf)
                .trim_end_matches(['\r', '\n'])
                .to_string(),
        ),
    }
}

async fn watch_stdout<R: AsyncRead + Unpin>(stdout: R, events: mpsc::Sender<BackendEvent>) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    while let Some(line) = next_line(&mut reader, &mut buf).await {
        log::debug!("engine: {}", line);
        if line.contains(ESTABLISHED_STDOUT_MARKER) {
            let _ = events
                .send(BackendEvent::Established {
                    local_ip: None,
                    remote_ip: None,
                })
                .await;
        }
        if let Some(ip) = parse_ifconfig_address(&line) {
            let _ = events.send(BackendEvent::LocalAddress(ip)).await;
        }
        let _ = events.try_send(BackendEvent::Log(line));
    }
}

async fn watch_stderr<R: AsyncRead + Unpin>(
    stderr: R,
    tail: Arc<StdMutex<Option<String>>>,
    events: mpsc::Sender<BackendEvent>,
) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    while let Some(line) = next_line(&mut reader, &mut buf).await {
        if line.trim().is_empty() {
            continue;
        }
        log::warn!("engine stderr: {}", line);
        if let Ok(mut t) = tail.lock() {
            *t = Some(line.clone());
        }
        let _ = events.try_send(BackendEvent::Log(line));
    }
}

async fn reap(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    stderr_task: Option<JoinHandle<()>>,
    stderr_tail: Arc<StdMutex<Option<String>>>,
    exit_tx: watch::Sender<Option<Option<i32>>>,
    events: mpsc::Sender<BackendEvent>,
) {
    let status = tokio::select! {
        res = child.wait() => res,
        _ = kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let code = match status {
        Ok(s) => s.code(),
        Err(e) => {
            log::warn!("failed to wait for engine: {}", e);
            None
        }
    };
    log::info!("engine exited with {:?}", code);

    // Let stderr drain so the last line can explain the exit.
    if let Some(task) = stderr_task {
        let _ = tokio::time::timeout(Duration::from_millis(250), task).await;
    }
    let detail = stderr_tail.lock().ok().and_then(|mut t| t.take());

    let _ = exit_tx.send(Some(code));
    let _ = events.send(BackendEvent::Exited { code, detail }).await;
}

async fn forward_control(
    control: Arc<ControlChannel>,
    mut rx: broadcast::Receiver<ControlEvent>,
    mut credentials: Option<Credentials>,
    events: mpsc::Sender<BackendEvent>,
) {
    loop {
        let ev = match rx.recv().await {
            Ok(ev) => ev,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::debug!("control forwarder skipped {} events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let out = match ev {
            ControlEvent::ByteCount {
                bytes_in,
                bytes_out,
            } => Some(BackendEvent::Counters(TrafficCounters::new(
                bytes_in, bytes_out,
            ))),
            ControlEvent::StateChange(state) => {
                log::info!("engine state {} {}", state.tag, state.description);
                if state.is_established() {
                    Some(BackendEvent::Established {
                        local_ip: state.local_ip,
                        remote_ip: state.remote_ip,
                    })
                } else {
                    None
                }
            }
            ControlEvent::LogLine(line) => Some(BackendEvent::Log(line)),
            ControlEvent::Hold(_) => {
                let _ = control.hold_release().await;
                None
            }
            ControlEvent::PasswordRequest(prompt) => {
                answer_prompt(&control, &prompt, &mut credentials).await
            }
            ControlEvent::Fatal(msg) => {
                log::error!("engine fatal: {}", msg);
                Some(BackendEvent::Log(format!("FATAL: {}", msg)))
            }
            ControlEvent::Unrecognized(raw) => {
                log::trace!("unhandled control line: {}", raw);
                None
            }
            ControlEvent::Disconnected => {
                let _ = events
                    .send(BackendEvent::ChannelLost("control channel closed".into()))
                    .await;
                break;
            }
        };
        if let Some(out) = out {
            if events.send(out).await.is_err() {
                break;
            }
        }
    }
}

/// Answers one `>PASSWORD:` prompt. Credentials are handed over once and
/// dropped right after; a repeated prompt is treated as a rejection.
async fn answer_prompt(
    control: &ControlChannel,
    prompt: &str,
    credentials: &mut Option<Credentials>,
) -> Option<BackendEvent> {
    match parse_password_prompt(prompt) {
        PasswordPrompt::Need { realm, username } if realm == "Auth" => {
            let Some(creds) = credentials.take() else {
                return Some(BackendEvent::AuthRejected(
                    "server requires a username and password but none are available".into(),
                ));
            };
            log::info!("supplying credentials for {} ({})", realm, creds.username());
            let sent = if username {
                control.supply_credentials(&realm, &creds).await
            } else {
                let line = creds.reply_line(workvpn_core::CredentialField::Password, &realm);
                control.send(&line).await
            };
            drop(creds);
            sent.err()
                .map(|e| BackendEvent::ChannelLost(format!("could not send credentials: {}", e)))
        }
        PasswordPrompt::Need { realm, .. } => Some(BackendEvent::AuthRejected(format!(
            "engine asked for a '{}' secret, which is not supported",
            realm
        ))),
        PasswordPrompt::VerificationFailed { realm } => Some(BackendEvent::AuthRejected(
            format!("server rejected the '{}' credentials", realm),
        )),
        PasswordPrompt::Other(text) => {
            log::debug!("ignoring password notification: {}", text);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> TunnelConfig {
        crate::tunnel::config::parse(
            "remote vpn.example.com 1194\nproto udp\nauth-user-pass /etc/openvpn/creds.txt\nmanagement 0.0.0.0 7505\ndaemon\n<ca>\nX\n</ca>\n",
        )
        .unwrap()
    }

    // ── Launch config ────────────────────────────────────────────

    #[test]
    fn launch_config_strips_management_and_auth_file() {
        let text = launch_config(&sample_config());
        assert!(text.starts_with("client\n"));
        assert!(text.contains("\nauth-user-pass\n"));
        assert!(!text.contains("creds.txt"));
        assert!(!text.contains("management"));
        assert!(!text.contains("daemon"));
        assert!(text.contains("remote vpn.example.com 1194"));
    }

    #[test]
    fn launch_config_uses_last_proto_line() {
        let cfg =
            crate::tunnel::config::parse("proto udp\nremote h 1194\nproto tcp\n<ca>\nX\n</ca>\n")
                .unwrap();
        let text = launch_config(&cfg);
        assert!(text.contains("proto tcp"));
        assert!(!text.contains("proto udp"));
    }

    #[test]
    fn launch_config_keeps_existing_client() {
        let cfg = crate::tunnel::config::parse("client\nremote a.example 443\n").unwrap();
        let text = launch_config(&cfg);
        assert_eq!(text.matches("client").count(), 1);
    }

    #[test]
    fn args_shape() {
        let args = build_args(Path::new("/tmp/x.conf"), 3, "127.0.0.1", 7505);
        assert_eq!(
            args,
            vec![
                "--config",
                "/tmp/x.conf",
                "--verb",
                "3",
                "--management",
                "127.0.0.1",
                "7505",
                "--management-query-passwords",
                "--management-hold"
            ]
        );
    }

    #[test]
    fn free_port_is_nonzero() {
        assert!(find_free_control_port().unwrap() > 0);
    }

    #[test]
    fn ifconfig_address() {
        assert_eq!(
            parse_ifconfig_address("net_addr_v4_add: ifconfig 10.8.0.6 255.255.255.0"),
            Some("10.8.0.6".into())
        );
        assert_eq!(parse_ifconfig_address("no address here"), None);
    }

    // ── Credential hand-off ──────────────────────────────────────

    #[tokio::test]
    async fn credentials_are_handed_over_once() {
        use tokio::io::AsyncWriteExt;

        const PROMPT: &[u8] = b">PASSWORD:Need 'Auth' username/password\n";
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (r, mut w) = sock.into_split();
            let mut lines = BufReader::new(r).lines();
            w.write_all(PROMPT).await.unwrap();
            while let Ok(Some(line)) = lines.next_line().await {
                let answered = line.starts_with("password ");
                let _ = seen_tx.send(line);
                if answered {
                    // ask again, as a server would after a soft restart
                    w.write_all(PROMPT).await.unwrap();
                }
            }
        });

        let control = Arc::new(ControlChannel::connect("127.0.0.1", port).await.unwrap());
        let rx = control.subscribe();
        let (tx, mut events) = mpsc::channel(8);
        let forwarder = tokio::spawn(forward_control(
            control.clone(),
            rx,
            Some(Credentials::new("alice", "s3cret")),
            tx,
        ));

        let ev = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match ev {
            BackendEvent::AuthRejected(reason) => assert!(reason.contains("none are available")),
            other => panic!("expected AuthRejected, got {other:?}"),
        }

        let mut seen = Vec::new();
        while let Ok(line) = seen_rx.try_recv() {
            seen.push(line);
        }
        assert!(seen.contains(&"username \"Auth\" alice".to_string()));
        assert_eq!(seen.iter().filter(|l| l.starts_with("password ")).count(), 1);
        forwarder.abort();
    }

    // ── Launch file ──────────────────────────────────────────────

    #[tokio::test]
    async fn launch_file_removed_on_drop_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = LaunchFile::create(dir.path(), "remote a 1\n").await.unwrap();
        let path = file.path().to_path_buf();
        assert!(path.exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        file.remove();
        file.remove();
        assert!(!path.exists());

        let other = LaunchFile::create(dir.path(), "remote b 2\n").await.unwrap();
        let other_path = other.path().to_path_buf();
        drop(other);
        assert!(!other_path.exists());
    }

    #[tokio::test]
    async fn stop_without_session_is_noop() {
        let mut backend = ProcessBackend::new(ProcessSettings::default());
        backend.stop(Duration::from_millis(10)).await.unwrap();
        assert!(backend.statistics().is_none());
        assert!(!backend.is_running());
    }

    #[tokio::test]
    async fn start_without_engine_is_engine_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ProcessSettings {
            work_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let mut backend =
            ProcessBackend::with_locator(settings, EngineLocator::exact("/nonexistent/openvpn"));
        let (tx, _rx) = mpsc::channel(8);
        let err = backend
            .start(
                StartRequest {
                    config: sample_config(),
                    credentials: None,
                },
                tx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, workvpn_core::VpnErrorKind::EngineNotFound);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
