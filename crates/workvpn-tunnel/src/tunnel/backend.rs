//! The seam between the orchestrator and whatever actually carries the
//! tunnel: an external engine process or an in-process library.

use crate::tunnel::types::TunnelConfig;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use workvpn_core::{Credentials, TrafficCounters, VpnResult};

/// Capacity of the per-attempt backend event channel.
pub const BACKEND_EVENT_CAPACITY: usize = 256;

/// Everything a backend needs to bring a tunnel up.
pub struct StartRequest {
    pub config: TunnelConfig,
    /// Handed over only when the engine asks for them.
    pub credentials: Option<Credentials>,
}

/// What a backend reports while an attempt or session is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// The tunnel carries traffic.
    Established {
        local_ip: Option<String>,
        remote_ip: Option<String>,
    },
    /// Tunnel address seen in engine output.
    LocalAddress(String),
    Counters(TrafficCounters),
    Log(String),
    /// The engine process went away. `detail` carries its last stderr line.
    Exited {
        code: Option<i32>,
        detail: Option<String>,
    },
    /// Control link lost or the in-process link dropped.
    ChannelLost(String),
    AuthRejected(String),
}

/// One poll of the engine's live counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineSample {
    /// `None` when the engine did not answer in time.
    pub counters: Option<TrafficCounters>,
    pub state_tag: Option<String>,
}

#[async_trait]
pub trait StatisticsSource: Send + Sync {
    async fn sample(&self) -> VpnResult<EngineSample>;
}

#[async_trait]
pub trait TunnelBackend: Send {
    fn name(&self) -> &'static str;

    /// Launch the tunnel. Returns once the engine is running and reachable;
    /// establishment itself is reported through `events`.
    async fn start(
        &mut self,
        request: StartRequest,
        events: mpsc::Sender<BackendEvent>,
    ) -> VpnResult<()>;

    /// Tear everything down, giving the engine `grace` to exit on its own.
    /// Safe to call when nothing is running.
    async fn stop(&mut self, grace: Duration) -> VpnResult<()>;

    /// Live counter source while a session is up.
    fn statistics(&self) -> Option<Arc<dyn StatisticsSource>>;
}
