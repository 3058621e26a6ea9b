//! Tunable timeouts and paths, loadable from a JSON file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use workvpn_core::{VpnError, VpnResult};

/// Longest connect deadline honoured; larger settings are clamped.
pub const MAX_CONNECT_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Orchestrator timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorSettings {
    pub connect_timeout_secs: u64,
    pub disconnect_grace_secs: u64,
    pub stats_interval_ms: u64,
    pub event_capacity: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            disconnect_grace_secs: 5,
            stats_interval_ms: 1000,
            event_capacity: 256,
        }
    }
}

impl OrchestratorSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.min(MAX_CONNECT_TIMEOUT_SECS))
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(1))
    }
}

/// How the external engine process is launched and talked to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessSettings {
    /// Use this binary instead of searching for one.
    pub engine_path: Option<PathBuf>,
    /// Where launch files go; `<tmp>/workvpn` when unset.
    pub work_dir: Option<PathBuf>,
    pub verbosity: u8,
    pub control_host: String,
    /// Fixed control port; an ephemeral one is picked per attempt when unset.
    pub control_port: Option<u16>,
    pub control_connect_timeout_secs: u64,
    pub query_timeout_ms: u64,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            engine_path: None,
            work_dir: None,
            verbosity: 3,
            control_host: "127.0.0.1".to_string(),
            control_port: None,
            control_connect_timeout_secs: 10,
            query_timeout_ms: 5000,
        }
    }
}

impl ProcessSettings {
    pub fn control_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.control_connect_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn resolved_work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("workvpn"))
    }
}

/// Everything a settings file may contain. Missing sections and fields
/// take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub orchestrator: OrchestratorSettings,
    pub engine: ProcessSettings,
}

impl Settings {
    pub fn load(path: &Path) -> VpnResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            VpnError::io(format!("cannot read settings {}", path.display()))
                .with_detail(e.to_string())
        })?;
        Self::from_json(&text).map_err(|e| {
            VpnError::invalid_config(format!("invalid settings file {}", path.display()))
                .with_detail(e.detail.unwrap_or(e.message))
        })
    }

    pub fn from_json(text: &str) -> VpnResult<Self> {
        serde_json::from_str(text).map_err(|e| {
            VpnError::invalid_config("settings are not valid JSON").with_detail(e.to_string())
        })
    }

    /// Load `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> VpnResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            log::debug!("no settings at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }
}
