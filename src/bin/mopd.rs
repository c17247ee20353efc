//! MOP Daemon - frame dispatch and TCP session relay
//!
//! Runs either the TCP session broker or the MOP frame capture loop, in the
//! foreground or as a background daemon.
//!
//! # Usage
//!
//! ```bash
//! # Start the session broker (background)
//! mopd serve
//!
//! # Start the session broker in the foreground with debug logging
//! mopd -d serve --port 4343
//!
//! # Capture MOP frames on every interface, ignoring MOP V4 traffic
//! mopd capture -a -4
//!
//! # Stop the daemon / check its status
//! mopd stop
//! mopd status
//!
//! # Show or initialise the config file
//! mopd config show
//! mopd config init
//! ```

use std::env;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mopd::config::{default_config_path, ConfigOverrides, DaemonConfig};
use mopd::server::SessionBroker;

/// Environment variable naming an alternative config file
const CONFIG_ENV: &str = "MOPD_CONFIG";

/// mopd - MOP frame dispatcher and TCP session relay
#[derive(Parser, Debug)]
#[command(name = "mopd", about, disable_version_flag = true)]
struct Args {
    /// Print version and exit
    #[arg(short = 'v', long, global = true)]
    version: bool,

    /// Debug logging; implies --foreground
    #[arg(short = 'd', long, global = true)]
    debug: bool,

    /// Do not fork to the background
    #[arg(short = 'f', long, global = true)]
    foreground: bool,

    /// Config file [default: $MOPD_CONFIG or $XDG_CONFIG_HOME/mopd/config.toml]
    #[arg(short = 'c', long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the TCP session broker (default)
    Serve(ServeArgs),
    /// Capture MOP frames and dispatch them to the protocol handlers
    Capture(CaptureArgs),
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
    /// Inspect or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(ClapArgs, Debug, Default)]
struct ServeArgs {
    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Maximum concurrent sessions
    #[arg(short = 'm', long)]
    max_sessions: Option<usize>,

    /// Welcome line sent to new sessions
    #[arg(long)]
    welcome: Option<String>,
}

#[derive(ClapArgs, Debug)]
struct CaptureArgs {
    /// Ignore MOP V3 (dump/load) messages
    #[arg(short = '3', conflicts_with = "suppress_v4")]
    suppress_v3: bool,

    /// Ignore MOP V4 (remote console) messages
    #[arg(short = '4')]
    suppress_v4: bool,

    /// Capture on every non-loopback interface
    #[arg(short = 'a', long = "all", conflicts_with = "interfaces")]
    all_interfaces: bool,

    /// Directory holding MOP load images
    #[arg(short = 's', long = "mop-dir", value_name = "DIR")]
    mop_dir: Option<PathBuf>,

    /// Interfaces to capture on
    interfaces: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Write the default configuration to the config path
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

impl From<ServeArgs> for ConfigOverrides {
    fn from(args: ServeArgs) -> Self {
        Self {
            host: args.host,
            port: args.port,
            max_sessions: args.max_sessions,
            welcome_message: args.welcome,
            ..Self::default()
        }
    }
}

impl From<CaptureArgs> for ConfigOverrides {
    fn from(args: CaptureArgs) -> Self {
        Self {
            suppress_v3: args.suppress_v3,
            suppress_v4: args.suppress_v4,
            all_interfaces: args.all_interfaces,
            interfaces: args.interfaces,
            mop_dir: args.mop_dir,
            ..Self::default()
        }
    }
}

// ============================================================================
// Process Files
// ============================================================================

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("mopd")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("mopd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("mopd.log")
}

fn config_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(default_config_path)
}

fn read_pid() -> Option<u32> {
    let path = pid_file_path();
    let mut file = File::open(&path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let pid = libc::pid_t::try_from(pid).context("PID out of range")?;
        // SAFETY: kill(2) with a plain signal number has no memory effects.
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

// ============================================================================
// Entry Point
// ============================================================================

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        println!("mopd {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config_path = config_path(args.config);
    let debug = args.debug;
    let foreground = args.foreground || debug;
    let command = args
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(serve) => {
            let pinned_welcome = serve.welcome.is_some();
            let config = load_config(&config_path, serve.into())?;
            config.server.validate().context("Invalid server configuration")?;

            start_daemon(foreground, || {
                run_serve(config, config_path, pinned_welcome, debug)
            })
        }
        Command::Capture(capture) => {
            let config = load_config(&config_path, capture.into())?;
            config
                .capture
                .validate()
                .context("Invalid capture configuration")?;

            if !cfg!(target_os = "linux") {
                bail!("Frame capture requires Linux (AF_PACKET sockets)");
            }

            start_daemon(foreground, || run_capture(config, debug))
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");
                println!("Config: {}", config_path.display());
                if let Ok(config) = DaemonConfig::load(&config_path) {
                    println!("Listen: {}:{}", config.server.host, config.server.port);
                }
                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
        Command::Config { action } => match action {
            ConfigAction::Show => {
                let config = DaemonConfig::load(&config_path)?;
                println!("# {}", config_path.display());
                print!("{}", config.to_toml()?);
                Ok(())
            }
            ConfigAction::Init { force } => {
                if config_path.exists() && !force {
                    bail!(
                        "Config file {} already exists (use --force to overwrite)",
                        config_path.display()
                    );
                }
                DaemonConfig::default().save(&config_path)?;
                println!("Wrote {}", config_path.display());
                Ok(())
            }
        },
    }
}

fn load_config(path: &Path, overrides: ConfigOverrides) -> Result<DaemonConfig> {
    let mut config = DaemonConfig::load(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config.apply_overrides(overrides);
    Ok(config)
}

/// Refuses to start twice, optionally forks, and keeps the PID file for the
/// lifetime of `run`.
fn start_daemon(foreground: bool, run: impl FnOnce() -> Result<()>) -> Result<()> {
    if let Some(pid) = is_daemon_running() {
        eprintln!("Daemon is already running (PID {pid})");
        eprintln!("Use 'mopd stop' to stop it first.");
        process::exit(1);
    }

    if !foreground {
        daemonize()?;
    }

    write_pid()?;
    let result = run();
    remove_pid_file();
    result
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

fn init_tracing(debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("mopd={level}").parse()?)
                .add_directive("mop_core=info".parse()?)
                .add_directive("mop_protocol=info".parse()?),
        )
        .init();
    Ok(())
}

// ============================================================================
// Session Broker
// ============================================================================

#[tokio::main]
async fn run_serve(
    config: DaemonConfig,
    config_path: PathBuf,
    pinned_welcome: bool,
    debug: bool,
) -> Result<()> {
    init_tracing(debug)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "mopd session broker starting"
    );

    let cancel_token = CancellationToken::new();
    spawn_shutdown_listener(cancel_token.clone());

    let broker = SessionBroker::new(config.server, cancel_token.clone());
    if !pinned_welcome {
        spawn_reload_listener(broker.clone(), config_path, cancel_token);
    }

    if let Err(e) = broker.serve().await {
        error!(error = %e, "Broker error");
        return Err(e.into());
    }

    info!("mopd stopped");
    Ok(())
}

/// Reloads the welcome line from the config file on SIGHUP.
fn spawn_reload_listener(broker: SessionBroker, config_path: PathBuf, cancel_token: CancellationToken) {
    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(sighup) => sighup,
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGHUP, config reload disabled");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                received = sighup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    match DaemonConfig::load(&config_path) {
                        Ok(config) => {
                            broker.set_welcome_message(config.server.welcome_message).await;
                            info!(config = %config_path.display(), "Reloaded welcome message");
                        }
                        Err(e) => warn!(error = %e, "Config reload failed, keeping current values"),
                    }
                }
            }
        }
    });

    #[cfg(not(unix))]
    {
        let _ = (broker, config_path, cancel_token);
    }
}

// ============================================================================
// Frame Capture
// ============================================================================

#[cfg(target_os = "linux")]
#[tokio::main]
async fn run_capture(config: DaemonConfig, debug: bool) -> Result<()> {
    use mopd::capture::interfaces::SysfsNet;
    use mopd::capture::packet_socket::PacketSocket;
    use mopd::capture::{open_sources, run_dispatch_loop, CaptureEngine, FRAME_BUFFER};
    use mopd::classifier::FrameDispatcher;
    use tokio::sync::mpsc;

    init_tracing(debug)?;

    let (suppression, selection) = config.capture.validate()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        suppression = ?suppression,
        "mopd frame capture starting"
    );

    let mop_dir = config.capture.mop_dir;
    if !mop_dir.is_dir() {
        warn!(mop_dir = %mop_dir.display(), "MOP directory does not exist");
    }

    let cancel_token = CancellationToken::new();
    spawn_shutdown_listener(cancel_token.clone());

    let interfaces = SysfsNet::default()
        .resolve(&selection, suppression)
        .context("Failed to enumerate interfaces")?;
    let sources = open_sources(interfaces, |iface| PacketSocket::open(iface.name()))?;

    let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
    let engine = CaptureEngine::start(sources, frames_tx, cancel_token.clone())?;
    info!(interfaces = engine.thread_count(), "Capture started");

    let dispatcher = FrameDispatcher::with_default_handlers(mop_dir);
    run_dispatch_loop(frames_rx, dispatcher, cancel_token).await;

    tokio::task::spawn_blocking(move || engine.stop())
        .await
        .context("Capture threads did not shut down cleanly")?;

    info!("mopd stopped");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run_capture(_config: DaemonConfig, _debug: bool) -> Result<()> {
    bail!("Frame capture requires Linux (AF_PACKET sockets)")
}

// ============================================================================
// Signals
// ============================================================================

fn spawn_shutdown_listener(cancel_token: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        cancel_token.cancel();
    });
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_default_command_is_serve() {
        let args = Args::try_parse_from(["mopd"]).unwrap();
        assert!(args.command.is_none());
        assert!(!args.foreground);
    }

    #[test]
    fn test_capture_flags() {
        let args = Args::try_parse_from(["mopd", "-d", "capture", "-4", "-s", "/srv/mop", "eth0", "eth1"]).unwrap();
        assert!(args.debug);
        let Some(Command::Capture(capture)) = args.command else {
            panic!("expected capture command");
        };
        assert!(capture.suppress_v4);
        assert!(!capture.suppress_v3);
        assert_eq!(capture.interfaces, vec!["eth0", "eth1"]);
        assert_eq!(capture.mop_dir, Some(PathBuf::from("/srv/mop")));
    }

    #[test]
    fn test_capture_rejects_both_suppressions() {
        assert!(Args::try_parse_from(["mopd", "capture", "-3", "-4", "-a"]).is_err());
    }

    #[test]
    fn test_capture_rejects_all_with_names() {
        assert!(Args::try_parse_from(["mopd", "capture", "-a", "eth0"]).is_err());
    }

    #[test]
    fn test_version_flag() {
        let args = Args::try_parse_from(["mopd", "-v"]).unwrap();
        assert!(args.version);
    }

    #[test]
    fn test_serve_overrides() {
        let args = Args::try_parse_from(["mopd", "serve", "-p", "5000", "-m", "3"]).unwrap();
        let Some(Command::Serve(serve)) = args.command else {
            panic!("expected serve command");
        };
        let overrides = ConfigOverrides::from(serve);
        assert_eq!(overrides.port, Some(5000));
        assert_eq!(overrides.max_sessions, Some(3));
        assert!(overrides.host.is_none());
    }

    #[test]
    fn test_config_flag_wins_over_env() {
        let path = config_path(Some(PathBuf::from("/tmp/mopd.toml")));
        assert_eq!(path, PathBuf::from("/tmp/mopd.toml"));
    }
}
