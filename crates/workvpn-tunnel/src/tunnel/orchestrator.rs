//! Connection orchestrator.
//!
//! A single actor task owns the backend, the connection state, the
//! statistics and the caller waiting on a pending connect. The
//! [`Orchestrator`] handle only sends commands and reads `watch`
//! snapshots, so every observer sees the same state at the same instant.
//!
//! ```text
//!   Idle/Failed ──connect──▶ Connecting ──established──▶ Connected
//!        ▲                     │   │                        │   │
//!        │        exit/timeout │   │ disconnect  disconnect │   │ drop
//!        │                     ▼   ▼                        ▼   ▼
//!        └──────────── Failed / Idle ◀──── Disconnecting   Failed
//! ```

use crate::tunnel::backend::*;
use crate::tunnel::config::{describe, validate, warnings};
use crate::tunnel::settings::OrchestratorSettings;
use crate::tunnel::stats::StatsPoller;
use crate::tunnel::types::TunnelConfig;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use workvpn_core::*;

type Reply<T> = oneshot::Sender<VpnResult<T>>;

enum Command {
    Connect {
        config: TunnelConfig,
        credentials: Option<Credentials>,
        reply: Reply<()>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cheap front door to the orchestrator actor. Dropping it shuts the
/// actor down and stops any running tunnel.
pub struct Orchestrator {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<StatusSnapshot>,
    stats: watch::Receiver<Statistics>,
    bus: EventBus,
    actor: JoinHandle<()>,
}

impl Orchestrator {
    /// Spawn the actor on the current tokio runtime.
    pub fn spawn(backend: Box<dyn TunnelBackend>, settings: OrchestratorSettings) -> Self {
        let bus = EventBus::new(settings.event_capacity);
        Self::spawn_with_bus(backend, settings, bus)
    }

    pub fn spawn_with_bus(
        backend: Box<dyn TunnelBackend>,
        settings: OrchestratorSettings,
        bus: EventBus,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot::default());
        let (stats_tx, stats_rx) = watch::channel(Statistics::default());

        log::debug!("orchestrator starting with {} backend", backend.name());
        let actor = Actor {
            backend,
            settings,
            bus: bus.clone(),
            snapshot_tx,
            stats_tx,
            state: ConnectionState::Idle,
            stats: Statistics::default(),
            local_ip: None,
            server_host: None,
            pending: None,
            events: None,
            samples: None,
            poller: None,
        };
        let task = tokio::spawn(actor.run(cmd_rx));

        Self {
            commands: cmd_tx,
            snapshot: snapshot_rx,
            stats: stats_rx,
            bus,
            actor: task,
        }
    }

    /// Bring the tunnel up. Resolves once it is established or the attempt
    /// has failed; `Failed` states carry the same reason as the error.
    pub async fn connect(
        &self,
        config: TunnelConfig,
        credentials: Option<Credentials>,
    ) -> VpnResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect {
            config,
            credentials,
            reply,
        })
        .await?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Tear the tunnel down. Resolves once the state is back to `Idle`.
    /// A no-op when nothing is connected.
    pub async fn disconnect(&self) -> VpnResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Disconnect { reply }).await?;
        rx.await.map_err(|_| actor_gone())?
    }

    pub fn status(&self) -> ConnectionState {
        self.snapshot.borrow().state.clone()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn stats(&self) -> Statistics {
        self.stats.borrow().clone()
    }

    /// Change notifications for the snapshot.
    pub fn watch_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VpnEvent> {
        self.bus.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// Stop any tunnel and end the actor.
    pub async fn shutdown(self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
        let _ = self.actor.await;
    }

    async fn send(&self, cmd: Command) -> VpnResult<()> {
        self.commands.send(cmd).await.map_err(|_| actor_gone())
    }
}

fn actor_gone() -> VpnError {
    VpnError::not_connected("orchestrator has shut down")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Actor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PendingConnect {
    reply: Reply<()>,
    deadline: Instant,
}

struct Actor {
    backend: Box<dyn TunnelBackend>,
    settings: OrchestratorSettings,
    bus: EventBus,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    stats_tx: watch::Sender<Statistics>,
    state: ConnectionState,
    stats: Statistics,
    local_ip: Option<String>,
    server_host: Option<String>,
    pending: Option<PendingConnect>,
    /// Backend events for the current attempt only.
    events: Option<mpsc::Receiver<BackendEvent>>,
    samples: Option<mpsc::Receiver<EngineSample>>,
    poller: Option<StatsPoller>,
}

/// How the launch phase of an attempt ended.
enum StartOutcome {
    Started,
    Failed(VpnError),
    Cancelled(Reply<()>),
    Shutdown(Option<oneshot::Sender<()>>),
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let deadline = self.pending.as_ref().map(|p| p.deadline);
            tokio::select! {
                cmd = commands.recv() => {
                    let keep_running = match cmd {
                        Some(Command::Connect { config, credentials, reply }) => {
                            self.handle_connect(config, credentials, reply, &mut commands).await
                        }
                        Some(Command::Disconnect { reply }) => {
                            let res = self.handle_disconnect().await;
                            let _ = reply.send(res);
                            true
                        }
                        Some(Command::Shutdown { reply }) => {
                            self.finish(Some(reply)).await;
                            false
                        }
                        None => {
                            self.finish(None).await;
                            false
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
                ev = next_item(&mut self.events) => match ev {
                    Some(ev) => self.on_backend_event(ev).await,
                    None => self.events = None,
                },
                sample = next_item(&mut self.samples) => match sample {
                    Some(sample) => self.on_sample(sample),
                    None => self.samples = None,
                },
                _ = sleep_until_opt(deadline) => {
                    let secs = self.settings.connect_timeout().as_secs();
                    self.fail_attempt(VpnError::connect_timeout(secs)).await;
                }
            }
        }
        log::debug!("orchestrator stopped");
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Returns `false` when the actor should exit.
    async fn handle_connect(
        &mut self,
        config: TunnelConfig,
        credentials: Option<Credentials>,
        reply: Reply<()>,
        commands: &mut mpsc::Receiver<Command>,
    ) -> bool {
        if !self.state.is_settled() {
            let _ = reply.send(Err(VpnError::already_connecting(format!(
                "cannot connect while {}",
                self.state
            ))));
            return true;
        }

        let errors = validate(&config);
        if !errors.is_empty() {
            let err = VpnError::invalid_config(format!(
                "invalid configuration: {}",
                describe(&errors)
            ));
            let reason = err.message.clone();
            self.transition(
                ConnectionState::Failed(reason.clone()),
                Some(reason),
                TransitionCause::ConnectFailed,
            );
            let _ = reply.send(Err(err));
            return true;
        }
        for w in warnings(&config) {
            log::warn!("config: {}", w);
        }

        self.server_host = Some(config.remote_host.clone());
        self.local_ip = None;
        self.transition(ConnectionState::Connecting, None, TransitionCause::UserRequest);

        let now = Instant::now();
        let deadline = now
            .checked_add(self.settings.connect_timeout())
            .unwrap_or(now);
        let (tx, mut rx) = mpsc::channel(BACKEND_EVENT_CAPACITY);
        let mut buffered = Vec::new();
        let outcome = drive_start(
            self.backend.as_mut(),
            StartRequest {
                config,
                credentials,
            },
            tx,
            &mut rx,
            commands,
            deadline,
            self.settings.connect_timeout().as_secs(),
            &mut buffered,
        )
        .await;

        match outcome {
            StartOutcome::Started => {
                log::debug!("backend started, waiting for establishment");
                self.events = Some(rx);
                self.pending = Some(PendingConnect { reply, deadline });
                for ev in buffered {
                    self.on_backend_event(ev).await;
                }
                true
            }
            StartOutcome::Failed(err) => {
                self.pending = Some(PendingConnect { reply, deadline });
                self.fail_attempt(err).await;
                true
            }
            StartOutcome::Cancelled(disconnect_reply) => {
                self.pending = Some(PendingConnect { reply, deadline });
                self.cancel_attempt().await;
                let _ = disconnect_reply.send(Ok(()));
                true
            }
            StartOutcome::Shutdown(ack) => {
                self.pending = Some(PendingConnect { reply, deadline });
                self.finish(ack).await;
                false
            }
        }
    }

    async fn handle_disconnect(&mut self) -> VpnResult<()> {
        match self.state {
            ConnectionState::Connecting => {
                self.cancel_attempt().await;
                Ok(())
            }
            ConnectionState::Connected => {
                self.transition(
                    ConnectionState::Disconnecting,
                    None,
                    TransitionCause::UserRequest,
                );
                self.stop_backend().await;
                self.reset_stats();
                self.transition(ConnectionState::Idle, None, TransitionCause::Stopped);
                Ok(())
            }
            _ => {
                log::debug!("disconnect while {} is a no-op", self.state);
                Ok(())
            }
        }
    }

    async fn finish(&mut self, ack: Option<oneshot::Sender<()>>) {
        match self.state {
            ConnectionState::Connecting => self.cancel_attempt().await,
            ConnectionState::Connected => {
                let _ = self.handle_disconnect().await;
            }
            _ => self.stop_backend().await,
        }
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    // ── Backend events ───────────────────────────────────────────

    async fn on_backend_event(&mut self, ev: BackendEvent) {
        match ev {
            BackendEvent::Established {
                local_ip,
                remote_ip,
            } => self.on_established(local_ip, remote_ip),
            BackendEvent::LocalAddress(ip) => self.set_local_ip(ip),
            BackendEvent::Counters(c) => self.absorb_counters(c),
            BackendEvent::Log(line) => {
                self.bus.publish(VpnEvent::EngineLog(line));
            }
            BackendEvent::Exited { code, detail } => {
                self.on_lost(exit_error(code, detail)).await;
            }
            BackendEvent::ChannelLost(reason) => {
                self.on_lost(VpnError::control_channel(reason)).await;
            }
            BackendEvent::AuthRejected(reason) => {
                self.on_lost(VpnError::auth_rejected(reason)).await;
            }
        }
    }

    fn on_established(&mut self, local_ip: Option<String>, remote_ip: Option<String>) {
        if self.state != ConnectionState::Connecting {
            log::debug!("establishment signal while {} ignored", self.state);
            return;
        }
        if let Some(remote) = remote_ip {
            log::debug!("engine reports remote {}", remote);
        }

        self.stats = Statistics::started(Utc::now());
        self.stats_tx.send_replace(self.stats.clone());
        if let Some(ip) = local_ip {
            self.set_local_ip(ip);
        }
        self.transition(
            ConnectionState::Connected,
            None,
            TransitionCause::Established,
        );

        if let Some(source) = self.backend.statistics() {
            let (tx, rx) = mpsc::channel(16);
            self.poller = Some(StatsPoller::spawn(
                source,
                self.settings.stats_interval(),
                tx,
            ));
            self.samples = Some(rx);
        }

        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Ok(()));
        }
    }

    /// Exit, control loss or auth rejection: fails a pending attempt,
    /// drops an established one, and is stale otherwise.
    async fn on_lost(&mut self, err: VpnError) {
        match self.state {
            ConnectionState::Connecting => self.fail_attempt(err).await,
            ConnectionState::Connected => {
                let reason = failure_reason(&err);
                log::warn!("connection dropped: {}", reason);
                self.local_ip = None;
                self.reset_stats();
                self.transition(
                    ConnectionState::Failed(reason.clone()),
                    Some(reason),
                    TransitionCause::ConnectionDropped,
                );
                self.stop_backend().await;
            }
            _ => log::debug!("stale backend event ignored: {}", err),
        }
    }

    fn on_sample(&mut self, sample: EngineSample) {
        if let Some(tag) = &sample.state_tag {
            log::trace!("engine state {}", tag);
        }
        if let Some(c) = sample.counters {
            self.absorb_counters(c);
        }
    }

    fn absorb_counters(&mut self, counters: TrafficCounters) {
        if self.state != ConnectionState::Connected {
            return;
        }
        self.stats.absorb(counters, Utc::now());
        self.stats_tx.send_replace(self.stats.clone());
        self.bus.publish(VpnEvent::StatsUpdate(self.stats.clone()));
    }

    fn set_local_ip(&mut self, ip: String) {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) || self.local_ip.as_deref() == Some(ip.as_str())
        {
            return;
        }
        log::info!("tunnel address {}", ip);
        self.local_ip = Some(ip.clone());
        self.publish_snapshot();
        self.bus.publish(VpnEvent::AddressAssigned(ip));
    }

    // ── Teardown helpers ─────────────────────────────────────────

    async fn fail_attempt(&mut self, err: VpnError) {
        let reason = failure_reason(&err);
        log::warn!("connect failed: {}", reason);
        self.stop_backend().await;
        self.reset_stats();
        self.transition(
            ConnectionState::Failed(reason.clone()),
            Some(reason),
            TransitionCause::ConnectFailed,
        );
        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Err(err));
        }
    }

    async fn cancel_attempt(&mut self) {
        log::info!("connect cancelled by disconnect");
        self.stop_backend().await;
        self.reset_stats();
        self.transition(
            ConnectionState::Idle,
            Some("cancelled".into()),
            TransitionCause::UserRequest,
        );
        if let Some(pending) = self.pending.take() {
            let _ = pending
                .reply
                .send(Err(VpnError::cancelled("connect cancelled by disconnect")));
        }
    }

    /// Stop the backend, giving up after the grace period.
    async fn stop_backend(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
        self.samples = None;
        self.events = None;

        let grace = self.settings.disconnect_grace();
        match tokio::time::timeout(grace, self.backend.stop(grace)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("backend stop failed: {}", e),
            Err(_) => log::warn!("backend did not stop within {:?}", grace),
        }
        self.local_ip = None;
    }

    fn reset_stats(&mut self) {
        let was_live = !self.stats.is_zero();
        self.stats = Statistics::default();
        self.stats_tx.send_replace(self.stats.clone());
        if was_live {
            self.bus.publish(VpnEvent::StatsUpdate(self.stats.clone()));
        }
    }

    // ── State ────────────────────────────────────────────────────

    fn transition(
        &mut self,
        next: ConnectionState,
        reason: Option<String>,
        cause: TransitionCause,
    ) {
        if self.state == next {
            return;
        }
        let previous = std::mem::replace(&mut self.state, next.clone());
        log::info!("{} -> {} ({:?})", previous, next, cause);

        self.publish_snapshot();
        self.bus.publish(VpnEvent::StatusChanged(StatusChange {
            state: next,
            previous,
            reason,
            cause,
            timestamp: Utc::now(),
        }));
    }

    fn publish_snapshot(&self) {
        let snapshot = StatusSnapshot {
            state: self.state.clone(),
            local_ip: self.local_ip.clone(),
            server_host: self.server_host.clone(),
            connected_since: self.stats.connected_since,
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}

/// Launch phase: run `backend.start` while still honouring the deadline,
/// disconnect requests and early exits. Events that arrive before start
/// returns are buffered for replay.
#[allow(clippy::too_many_arguments)]
async fn drive_start(
    backend: &mut dyn TunnelBackend,
    request: StartRequest,
    events_tx: mpsc::Sender<BackendEvent>,
    events: &mut mpsc::Receiver<BackendEvent>,
    commands: &mut mpsc::Receiver<Command>,
    deadline: Instant,
    timeout_secs: u64,
    buffered: &mut Vec<BackendEvent>,
) -> StartOutcome {
    let start = backend.start(request, events_tx);
    tokio::pin!(start);
    let mut events_open = true;

    loop {
        tokio::select! {
            res = &mut start => {
                return match res {
                    Ok(()) => StartOutcome::Started,
                    Err(e) => StartOutcome::Failed(e),
                };
            }
            _ = tokio::time::sleep_until(deadline) => {
                return StartOutcome::Failed(VpnError::connect_timeout(timeout_secs));
            }
            cmd = commands.recv() => match cmd {
                Some(Command::Connect { reply, .. }) => {
                    let _ = reply.send(Err(VpnError::already_connecting(
                        "a connect attempt is already in flight",
                    )));
                }
                Some(Command::Disconnect { reply }) => return StartOutcome::Cancelled(reply),
                Some(Command::Shutdown { reply }) => return StartOutcome::Shutdown(Some(reply)),
                None => return StartOutcome::Shutdown(None),
            },
            ev = events.recv(), if events_open => match ev {
                Some(BackendEvent::Exited { code, detail }) => {
                    return StartOutcome::Failed(exit_error(code, detail));
                }
                Some(BackendEvent::ChannelLost(reason)) => {
                    return StartOutcome::Failed(VpnError::control_channel(reason));
                }
                Some(BackendEvent::AuthRejected(reason)) => {
                    return StartOutcome::Failed(VpnError::auth_rejected(reason));
                }
                Some(other) => buffered.push(other),
                None => events_open = false,
            },
        }
    }
}

fn exit_error(code: Option<i32>, detail: Option<String>) -> VpnError {
    let err = VpnError::process_exit(code);
    match detail {
        Some(d) => err.with_detail(d),
        None => err,
    }
}

/// The text stored in `Failed(..)`: message plus detail, never empty.
fn failure_reason(err: &VpnError) -> String {
    let reason = match &err.detail {
        Some(d) => format!("{} ({})", err.message, d),
        None => err.message.clone(),
    };
    if reason.trim().is_empty() {
        format!("{:?}", err.kind)
    } else {
        reason
    }
}

async fn next_item<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
