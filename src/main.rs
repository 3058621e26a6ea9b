//! WorkVPN CLI - bring a VPN tunnel up from a config file and watch it.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Password;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use workvpn_core::{format_bytes, ConnectionState, Credentials, VpnEvent};
use workvpn_tunnel::tunnel::config::{describe, generate, load_file, validate, warnings};
use workvpn_tunnel::tunnel::engine::engine_version;
use workvpn_tunnel::tunnel::*;

const PASSWORD_ENV: &str = "WORKVPN_PASSWORD";

/// WorkVPN - connect to an OpenVPN server and report live status
#[derive(Parser, Debug)]
#[command(name = "workvpn")]
#[command(about = "WorkVPN - connect to an OpenVPN server and report live status")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file (defaults to <config dir>/workvpn/settings.json)
    #[arg(long, global = true, env = "WORKVPN_SETTINGS")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect using a config file and stay up until interrupted
    #[command(long_about = r#"
Connect using a config file. The tunnel stays up until Ctrl-C, a dropped
link, or --duration elapses. Credentials are only handed to the engine when
it asks for them over its management socket.

EXAMPLES:
  # Connect with the system OpenVPN
  workvpn connect office.ovpn --username alice

  # Exercise the state machine without an engine
  workvpn connect office.ovpn --simulate --duration 10

The password is never taken from the command line. It is read from
WORKVPN_PASSWORD, or prompted for with hidden input when a username is given.

ENVIRONMENT VARIABLES:
  WORKVPN_USERNAME  Username for auth-user-pass servers
  WORKVPN_PASSWORD  Password for auth-user-pass servers
  RUST_LOG          Log filter override
    "#)]
    Connect {
        /// Config file
        config: PathBuf,

        #[arg(long, env = "WORKVPN_USERNAME")]
        username: Option<String>,

        /// Never prompt; the password must come from WORKVPN_PASSWORD
        #[arg(long)]
        non_interactive: bool,

        /// Use the in-process loopback engine instead of OpenVPN
        #[arg(long)]
        simulate: bool,

        /// With --simulate, drop the link after this many seconds
        #[arg(long, requires = "simulate")]
        simulate_drop_after: Option<u64>,

        /// Disconnect after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Check a config file and list problems
    Validate {
        config: PathBuf,
    },

    /// Print a config summary as JSON
    Inspect {
        config: PathBuf,

        /// Also print the normalised config text
        #[arg(long)]
        generate: bool,
    },

    /// Locate the OpenVPN binary and print its version
    Engine,
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    #[cfg(feature = "logs-json")]
    registry.with(fmt::layer().json().with_target(true)).init();

    #[cfg(not(feature = "logs-json"))]
    registry
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .init();
}

fn settings_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| dirs::config_dir().map(|d| d.join("workvpn").join("settings.json")))
}

fn load_settings(explicit: Option<PathBuf>) -> Result<Settings> {
    match settings_path(explicit) {
        Some(path) => Settings::load_or_default(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        None => Ok(Settings::default()),
    }
}

fn load_config(path: &Path) -> Result<(String, TunnelConfig)> {
    load_file(path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Password for `username`, from the environment or a hidden prompt.
fn prompt_password(username: &str, non_interactive: bool) -> Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(password);
    }
    if non_interactive {
        bail!("{} env var is required in non-interactive mode", PASSWORD_ENV);
    }
    let password: String = Password::new()
        .with_prompt(format!("Password for {}", username))
        .interact()
        .context("Failed to read password")?;
    Ok(password)
}

fn log_event(event: &VpnEvent) {
    match event {
        VpnEvent::StatusChanged(change) => match &change.reason {
            Some(reason) => info!(
                "status {} -> {} ({:?}): {}",
                change.previous, change.state, change.cause, reason
            ),
            None => info!(
                "status {} -> {} ({:?})",
                change.previous, change.state, change.cause
            ),
        },
        VpnEvent::StatsUpdate(stats) => info!(
            "traffic in {} / out {} over {}s",
            format_bytes(stats.bytes_in),
            format_bytes(stats.bytes_out),
            stats.duration_secs
        ),
        VpnEvent::AddressAssigned(ip) => info!("tunnel address {}", ip),
        VpnEvent::EngineLog(line) => tracing::debug!(target: "engine", "{}", line),
    }
}

async fn run_connect(
    settings: Settings,
    config_path: &Path,
    credentials: Option<Credentials>,
    simulate: bool,
    simulate_drop_after: Option<u64>,
    duration: Option<u64>,
) -> Result<()> {
    let (name, config) = load_config(config_path)?;
    info!("Connecting '{}' to {}:{}", name, config.remote_host, config.remote_port);

    let loopback = simulate.then(|| Arc::new(LoopbackLibrary::new()));
    let backend: Box<dyn TunnelBackend> = match &loopback {
        Some(lib) => Box::new(LibraryBackend::new(lib.clone())),
        None => Box::new(ProcessBackend::new(settings.engine.clone())),
    };

    let orch = Orchestrator::spawn(backend, settings.orchestrator.clone());
    let mut events = orch.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ev) => log_event(&ev),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("skipped {} events", n),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    if let Err(e) = orch.connect(config, credentials).await {
        orch.shutdown().await;
        printer.abort();
        return Err(e).context("Failed to connect");
    }
    info!("Connected, press Ctrl-C to disconnect");

    if let (Some(lib), Some(secs)) = (&loopback, simulate_drop_after) {
        let lib = lib.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            lib.simulate_drop("simulated link loss");
        });
    }

    let mut status = orch.watch_status();
    let limit = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted, disconnecting"),
        _ = limit => info!("Duration elapsed, disconnecting"),
        _ = status.wait_for(|s| matches!(s.state, ConnectionState::Failed(_))) => {}
    }

    let final_state = orch.status();
    orch.disconnect().await.context("Failed to disconnect")?;
    orch.shutdown().await;
    printer.abort();

    if let ConnectionState::Failed(reason) = final_state {
        bail!("Connection lost: {}", reason);
    }
    info!("Disconnected");
    Ok(())
}

fn run_validate(path: &Path) -> Result<()> {
    let (name, config) = load_config(path)?;
    for w in warnings(&config) {
        warn!("{}: {}", name, w);
    }
    let errors = validate(&config);
    if !errors.is_empty() {
        bail!("{} is not usable: {}", name, describe(&errors));
    }
    println!("{} is valid", name);
    Ok(())
}

fn run_inspect(path: &Path, with_text: bool) -> Result<()> {
    let (name, config) = load_config(path)?;
    let info = config.info(name);
    println!(
        "{}",
        serde_json::to_string_pretty(&info).context("Failed to serialise config info")?
    );
    if with_text {
        print!("{}", generate(&config));
    }
    Ok(())
}

async fn run_engine(settings: Settings) -> Result<()> {
    let locator = EngineLocator::platform_default().with_override(settings.engine.engine_path);
    let binary = locator.locate().context("OpenVPN not found")?;
    let version = engine_version(&binary)
        .await
        .with_context(|| format!("Failed to query {}", binary.display()))?;
    println!("{} ({})", binary.display(), version);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let result = match cli.command {
        Commands::Connect {
            config,
            username,
            non_interactive,
            simulate,
            simulate_drop_after,
            duration,
        } => {
            let settings = load_settings(cli.settings)?;
            let credentials = match username {
                Some(u) => {
                    let password = prompt_password(&u, non_interactive)?;
                    Some(Credentials::new(u, password))
                }
                None => None,
            };
            run_connect(
                settings,
                &config,
                credentials,
                simulate,
                simulate_drop_after,
                duration,
            )
            .await
        }
        Commands::Validate { config } => run_validate(&config),
        Commands::Inspect { config, generate } => run_inspect(&config, generate),
        Commands::Engine => {
            let settings = load_settings(cli.settings)?;
            run_engine(settings).await
        }
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_not_a_command_line_flag() {
        let res = Cli::try_parse_from([
            "workvpn",
            "connect",
            "office.ovpn",
            "--username",
            "alice",
            "--password",
            "s3cret",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn connect_accepts_username_and_non_interactive() {
        let cli = Cli::try_parse_from([
            "workvpn",
            "connect",
            "office.ovpn",
            "--username",
            "alice",
            "--non-interactive",
        ])
        .unwrap();
        match cli.command {
            Commands::Connect {
                username,
                non_interactive,
                ..
            } => {
                assert_eq!(username.as_deref(), Some("alice"));
                assert!(non_interactive);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
