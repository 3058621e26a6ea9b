//! In-process backend: drives an engine linked into this process instead
//! of a child executable.

use crate::tunnel::backend::*;
use crate::tunnel::types::TunnelConfig;
use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use workvpn_core::{Credentials, TrafficCounters, VpnError, VpnResult};

/// Addresses reported once a library link is up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkInfo {
    pub local_ip: Option<String>,
    pub remote_ip: Option<String>,
}

/// An embeddable tunnel engine.
#[async_trait]
pub trait TunnelLibrary: Send + Sync + 'static {
    /// Bring the link up. After success the library may report an
    /// unsolicited loss on `drops`.
    async fn bring_up(
        &self,
        config: &TunnelConfig,
        credentials: Option<&Credentials>,
        drops: mpsc::Sender<String>,
    ) -> VpnResult<LinkInfo>;

    async fn tear_down(&self) -> VpnResult<()>;

    async fn counters(&self) -> VpnResult<TrafficCounters>;
}

/// [`TunnelBackend`] over any [`TunnelLibrary`].
pub struct LibraryBackend<L: TunnelLibrary> {
    library: Arc<L>,
    watcher: Option<JoinHandle<()>>,
    up: bool,
}

impl<L: TunnelLibrary> LibraryBackend<L> {
    pub fn new(library: Arc<L>) -> Self {
        Self {
            library,
            watcher: None,
            up: false,
        }
    }

    pub fn library(&self) -> &Arc<L> {
        &self.library
    }
}

#[async_trait]
impl<L: TunnelLibrary> TunnelBackend for LibraryBackend<L> {
    fn name(&self) -> &'static str {
        "library"
    }

    async fn start(
        &mut self,
        request: StartRequest,
        events: mpsc::Sender<BackendEvent>,
    ) -> VpnResult<()> {
        let (drop_tx, mut drop_rx) = mpsc::channel::<String>(4);
        let info = self
            .library
            .bring_up(&request.config, request.credentials.as_ref(), drop_tx)
            .await?;
        self.up = true;

        let lost = events.clone();
        self.watcher = Some(tokio::spawn(async move {
            if let Some(reason) = drop_rx.recv().await {
                let _ = lost.send(BackendEvent::ChannelLost(reason)).await;
            }
        }));

        let _ = events
            .send(BackendEvent::Established {
                local_ip: info.local_ip,
                remote_ip: info.remote_ip,
            })
            .await;
        Ok(())
    }

    async fn stop(&mut self, grace: Duration) -> VpnResult<()> {
        if let Some(w) = self.watcher.take() {
            w.abort();
        }
        if !self.up {
            return Ok(());
        }
        self.up = false;
        match tokio::time::timeout(grace, self.library.tear_down()).await {
            Ok(res) => res,
            Err(_) => {
                log::warn!("library tear-down exceeded {:?}", grace);
                Ok(())
            }
        }
    }

    fn statistics(&self) -> Option<Arc<dyn StatisticsSource>> {
        if !self.up {
            return None;
        }
        Some(Arc::new(LibraryStatistics {
            library: self.library.clone(),
        }))
    }
}

impl<L: TunnelLibrary> Drop for LibraryBackend<L> {
    fn drop(&mut self) {
        if let Some(w) = self.watcher.take() {
            w.abort();
        }
    }
}

struct LibraryStatistics<L: TunnelLibrary> {
    library: Arc<L>,
}

#[async_trait]
impl<L: TunnelLibrary> StatisticsSource for LibraryStatistics<L> {
    async fn sample(&self) -> VpnResult<EngineSample> {
        let counters = self.library.counters().await?;
        Ok(EngineSample {
            counters: Some(counters),
            state_tag: Some("CONNECTED".into()),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Loopback library
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct LoopbackState {
    up: bool,
    counters: TrafficCounters,
    drops: Option<mpsc::Sender<String>>,
    bring_ups: u32,
    tear_downs: u32,
}

/// Simulated engine. Comes up after `link_delay`, hands out a fixed
/// address and advances its counters by `step` on every read. Used by
/// the CLI `--simulate` mode and tests.
pub struct LoopbackLibrary {
    state: StdMutex<LoopbackState>,
    link_delay: Duration,
    step: TrafficCounters,
    failure: Option<String>,
    local_ip: String,
}

impl LoopbackLibrary {
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(LoopbackState::default()),
            link_delay: Duration::from_millis(50),
            step: TrafficCounters::new(1500, 800),
            failure: None,
            local_ip: "10.8.0.2".into(),
        }
    }

    pub fn with_link_delay(mut self, delay: Duration) -> Self {
        self.link_delay = delay;
        self
    }

    pub fn with_step(mut self, bytes_in: u64, bytes_out: u64) -> Self {
        self.step = TrafficCounters::new(bytes_in, bytes_out);
        self
    }

    /// Every bring-up fails with `reason`.
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    pub fn is_up(&self) -> bool {
        self.state.lock().map(|s| s.up).unwrap_or(false)
    }

    pub fn bring_up_count(&self) -> u32 {
        self.state.lock().map(|s| s.bring_ups).unwrap_or(0)
    }

    pub fn tear_down_count(&self) -> u32 {
        self.state.lock().map(|s| s.tear_downs).unwrap_or(0)
    }

    /// Pretend the link died underneath us.
    pub fn simulate_drop(&self, reason: impl Into<String>) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if !state.up {
            return false;
        }
        state.up = false;
        match state.drops.take() {
            Some(tx) => tx.try_send(reason.into()).is_ok(),
            None => false,
        }
    }
}

impl Default for LoopbackLibrary {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelLibrary for LoopbackLibrary {
    async fn bring_up(
        &self,
        config: &TunnelConfig,
        credentials: Option<&Credentials>,
        drops: mpsc::Sender<String>,
    ) -> VpnResult<LinkInfo> {
        if let Ok(mut state) = self.state.lock() {
            state.bring_ups += 1;
        }
        tokio::time::sleep(self.link_delay).await;

        if let Some(reason) = &self.failure {
            return Err(VpnError::control_channel(reason.clone()));
        }
        if config.requires_auth() && credentials.map(|c| c.is_empty()).unwrap_or(true) {
            return Err(VpnError::auth_rejected(
                "server requires a username and password but none were supplied",
            ));
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| VpnError::io("loopback state poisoned"))?;
        state.up = true;
        state.counters = TrafficCounters::default();
        state.drops = Some(drops);
        log::info!("loopback link up to {}", config.remote_host);
        Ok(LinkInfo {
            local_ip: Some(self.local_ip.clone()),
            remote_ip: Some(config.remote_host.clone()),
        })
    }

    async fn tear_down(&self) -> VpnResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| VpnError::io("loopback state poisoned"))?;
        state.up = false;
        state.drops = None;
        state.tear_downs += 1;
        Ok(())
    }

    async fn counters(&self) -> VpnResult<TrafficCounters> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| VpnError::io("loopback state poisoned"))?;
        if !state.up {
            return Err(VpnError::not_connected("loopback link is down"));
        }
        state.counters.bytes_in += self.step.bytes_in;
        state.counters.bytes_out += self.step.bytes_out;
        Ok(state.counters)
    }
}
