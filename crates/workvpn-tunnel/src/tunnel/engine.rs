//! Locating the tunnel engine executable and probing its version.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use workvpn_core::{VpnError, VpnErrorKind, VpnResult};

#[cfg(target_os = "windows")]
const ENGINE_FILE_NAME: &str = "openvpn.exe";
#[cfg(not(target_os = "windows"))]
const ENGINE_FILE_NAME: &str = "openvpn";

/// Well-known install locations, most specific first.
pub fn default_engine_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    #[cfg(target_os = "windows")]
    {
        paths.push(PathBuf::from(r"C:\Program Files\OpenVPN\bin\openvpn.exe"));
        paths.push(PathBuf::from(
            r"C:\Program Files (x86)\OpenVPN\bin\openvpn.exe",
        ));
        paths.push(PathBuf::from(
            r"C:\Program Files\OpenVPN Connect\core\openvpn.exe",
        ));
    }
    #[cfg(target_os = "linux")]
    {
        paths.push(PathBuf::from("/usr/sbin/openvpn"));
        paths.push(PathBuf::from("/usr/bin/openvpn"));
        paths.push(PathBuf::from("/usr/local/sbin/openvpn"));
    }
    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("/opt/homebrew/sbin/openvpn"));
        paths.push(PathBuf::from("/usr/local/sbin/openvpn"));
        paths.push(PathBuf::from("/usr/local/bin/openvpn"));
        paths.push(PathBuf::from("/opt/homebrew/bin/openvpn"));
        paths.push(PathBuf::from("/usr/local/opt/openvpn/sbin/openvpn"));
    }
    paths
}

/// Ordered search for the engine binary: explicit override, then the
/// candidate list, then `$PATH`.
#[derive(Debug, Clone)]
pub struct EngineLocator {
    override_path: Option<PathBuf>,
    candidates: Vec<PathBuf>,
    search_path: bool,
}

impl EngineLocator {
    pub fn platform_default() -> Self {
        Self {
            override_path: None,
            candidates: default_engine_paths(),
            search_path: true,
        }
    }

    /// Only ever try `path`.
    pub fn exact(path: impl Into<PathBuf>) -> Self {
        Self {
            override_path: Some(path.into()),
            candidates: Vec::new(),
            search_path: false,
        }
    }

    pub fn with_override(mut self, path: Option<PathBuf>) -> Self {
        self.override_path = path;
        self
    }

    pub fn with_candidates(mut self, candidates: Vec<PathBuf>) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn with_path_search(mut self, enabled: bool) -> Self {
        self.search_path = enabled;
        self
    }

    /// Every location `locate` would look at, in order.
    pub fn searched(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .override_path
            .iter()
            .chain(self.candidates.iter())
            .map(|p| p.display().to_string())
            .collect();
        if self.search_path {
            out.push(format!("$PATH ({})", ENGINE_FILE_NAME));
        }
        out
    }

    pub fn locate(&self) -> VpnResult<PathBuf> {
        if let Some(p) = &self.override_path {
            if p.is_file() {
                return Ok(p.clone());
            }
            log::debug!("engine override {} does not exist", p.display());
        }
        if let Some(p) = self.candidates.iter().find(|p| p.is_file()) {
            return Ok(p.clone());
        }
        if self.search_path {
            if let Ok(p) = which::which(ENGINE_FILE_NAME) {
                return Ok(p);
            }
        }
        Err(VpnError::engine_not_found(&self.searched()))
    }
}

impl Default for EngineLocator {
    fn default() -> Self {
        Self::platform_default()
    }
}

fn version_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"OpenVPN\s+(\d+\.\d+(?:\.\d+)?)").ok())
        .as_ref()
}

/// Pull `x.y.z` out of a `--version` banner or `version` reply.
pub fn parse_version_string(output: &str) -> Option<String> {
    version_regex()?
        .captures(output)
        .map(|c| c[1].to_string())
}

/// Run `<binary> --version` and parse the banner.
pub async fn engine_version(binary: &Path) -> VpnResult<String> {
    let output = tokio::process::Command::new(binary)
        .arg("--version")
        .output()
        .await
        .map_err(|e| {
            VpnError::process_spawn(format!("failed to run {} --version", binary.display()))
                .with_detail(e.to_string())
        })?;

    // The engine exits non-zero after printing its banner; only the text matters.
    let combined = format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    parse_version_string(&combined).ok_or_else(|| {
        VpnError::new(
            VpnErrorKind::ProcessSpawn,
            format!("{} did not report a version", binary.display()),
        )
    })
}
