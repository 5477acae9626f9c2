//! udev Device Plugin
//!
//! Node agent advertising hot-pluggable host devices (serial adapters, USB
//! accelerators, radios, ...) to the kubelet as extended resources.
//!
//! Runs as a privileged DaemonSet with the kubelet device plugin directory,
//! the pod-resources socket and `/sys` mounted from the host.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use udev_device_plugin::plugin::api::{DEFAULT_PLUGIN_DIR, DEFAULT_POD_RESOURCES_SOCKET};
use udev_device_plugin::status::DEFAULT_STATUS_ADDR;
use udev_device_plugin::{Agent, AgentConfig, AgentMetrics, AgentOptions, ConfigFormat, Error};

// =============================================================================
// CLI Arguments
// =============================================================================

/// udev Device Plugin - advertise hot-pluggable devices to the kubelet
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Pool configuration file
    #[arg(long, env = "CONFIG_FILE", default_value = "/etc/udev-device-plugin/config.yaml")]
    config: PathBuf,

    /// Configuration file format
    #[arg(long, env = "CONFIG_FORMAT", value_enum, default_value_t = ConfigFormat::Auto)]
    config_format: ConfigFormat,

    /// Kubelet device plugin directory
    #[arg(long, env = "PLUGIN_DIR", default_value = DEFAULT_PLUGIN_DIR)]
    plugin_dir: PathBuf,

    /// Kubelet pod-resources socket
    #[arg(long, env = "POD_RESOURCES_SOCKET", default_value = DEFAULT_POD_RESOURCES_SOCKET)]
    pod_resources_socket: PathBuf,

    /// Status API bind address
    #[arg(long, env = "STATUS_ADDR", default_value = DEFAULT_STATUS_ADDR)]
    status_addr: SocketAddr,

    /// Root of the sysfs mount
    #[arg(long, env = "SYSFS_ROOT", default_value = "/sys")]
    sysfs_root: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting udev device plugin");
    info!("  Version: {}", udev_device_plugin::VERSION);
    info!("  Config: {}", args.config.display());
    info!("  Plugin dir: {}", args.plugin_dir.display());
    info!("  Status API: {}", args.status_addr);

    match run(args).await {
        Ok(()) => {
            info!("Device plugin shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(subsystem = %e.subsystem(), "Fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> udev_device_plugin::Result<()> {
    let config = AgentConfig::load(&args.config, args.config_format)?;
    info!(
        "Loaded {} pools: {}",
        config.pools.len(),
        config
            .pools
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let metrics = AgentMetrics::new(prometheus::default_registry())?;
    let options = AgentOptions {
        plugin_dir: args.plugin_dir,
        pod_resources_socket: args.pod_resources_socket,
        status_addr: Some(args.status_addr),
        sysfs_root: args.sysfs_root,
        ..Default::default()
    };
    let agent = Agent::new(config, options, metrics)?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => info!("Received {}, shutting down", name),
            Err(e) => warn!("Signal handling failed, shutting down: {}", e),
        }
        signal_token.cancel();
    });

    let monitor = agent.monitor();
    agent.run(monitor, shutdown).await
}

async fn wait_for_signal() -> Result<&'static str, Error> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "h2=warn", "tower=warn", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
