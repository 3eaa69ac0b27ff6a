//! Node Network Daemon
//!
//! Runs the network controller engine against the host kernel over netlink,
//! or against a simulated kernel described by a host inventory file, serving
//! health and metrics endpoints.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use node_netd::resources::{PlatformConfig, PLATFORM_CONFIG_ACTIVE_ID};
use node_netd::{
    register_all, Cmdline, ControllerDeps, Engine, HostInventory, KernelHandle, MachineConfig,
    MemoryKernel, Namespace, NetworkStatus, RuntimeConfig, State, MACHINE_CONFIG_ID,
    NETWORK_STATUS_ID,
};

/// Owner of resources published from files given on the command line
const FILE_SOURCE: &str = "node-netd";

// =============================================================================
// CLI Arguments
// =============================================================================

/// Kernel the controllers reconcile against
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum KernelBackend {
    /// In-process kernel seeded from the host inventory
    Memory,
    /// Host kernel over netlink
    Linux,
}

/// Node network daemon: declarative host network reconciliation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Machine configuration document (YAML)
    #[arg(long, env = "MACHINE_CONFIG")]
    machine_config: Option<PathBuf>,

    /// Kernel backend
    #[arg(long, env = "KERNEL_BACKEND", value_enum, default_value = "memory")]
    kernel: KernelBackend,

    /// Host inventory for the simulated kernel (YAML)
    #[arg(long, env = "HOST_INVENTORY")]
    inventory: Option<PathBuf>,

    /// Kernel command line
    #[arg(long, env = "KERNEL_CMDLINE", conflicts_with = "cmdline_file")]
    cmdline: Option<String>,

    /// File holding the kernel command line
    #[arg(long, env = "KERNEL_CMDLINE_FILE")]
    cmdline_file: Option<PathBuf>,

    /// Platform network snapshot published as the active platform config (YAML)
    #[arg(long, env = "PLATFORM_CONFIG")]
    platform_config: Option<PathBuf>,

    /// State volume: platform cache and wireguard key
    #[arg(long, env = "STATE_DIR", default_value = "/state")]
    state_dir: PathBuf,

    /// Directory receiving rendered hosts and resolv.conf
    #[arg(long, env = "ETC_DIR", default_value = "/system/etc")]
    etc_dir: PathBuf,

    /// Running inside a container
    #[arg(long, env = "CONTAINER_MODE")]
    container_mode: bool,

    /// Name of the inet nftables table
    #[arg(long, env = "NFT_TABLE", default_value = "node-netd")]
    nft_table: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

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
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!(version = node_netd::VERSION, "starting node network daemon");

    let kernel = build_kernel(&args)?;
    let cmdline = load_cmdline(&args)?;

    let state = Arc::new(State::new());

    if let Some(path) = &args.machine_config {
        let config = MachineConfig::from_yaml(&read(path)?)
            .with_context(|| format!("parsing machine config {}", path.display()))?;

        state.modify::<MachineConfig, _>(FILE_SOURCE, Namespace::Machine, MACHINE_CONFIG_ID, |c| {
            *c = config;
            Ok(())
        })?;

        info!(path = %path.display(), "machine config loaded");
    }

    if let Some(path) = &args.platform_config {
        let config: PlatformConfig = serde_yaml::from_str(&read(path)?)
            .with_context(|| format!("parsing platform config {}", path.display()))?;

        state.modify::<PlatformConfig, _>(
            FILE_SOURCE,
            Namespace::Network,
            PLATFORM_CONFIG_ACTIVE_ID,
            |c| {
                *c = config;
                Ok(())
            },
        )?;
    }

    let mut deps = ControllerDeps::new(kernel);
    deps.cmdline = Arc::new(cmdline);
    deps.state_dir = args.state_dir.clone();
    deps.etc_dir = args.etc_dir.clone();
    deps.container_mode = args.container_mode;
    deps.nft_table = args.nft_table.clone();

    let mut engine = Engine::new(state.clone(), RuntimeConfig::default());
    register_all(&mut engine, &deps)?;

    let health_addr: SocketAddr = args
        .health_addr
        .parse()
        .with_context(|| format!("invalid health address {}", args.health_addr))?;
    let metrics_addr: SocketAddr = args
        .metrics_addr
        .parse()
        .with_context(|| format!("invalid metrics address {}", args.metrics_addr))?;

    let health_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_state).await {
            error!(error = %e, "health server failed");
        }
    });

    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr).await {
            error!(error = %e, "metrics server failed");
        }
    });

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        shutdown.cancel();
    });

    engine.run(cancel).await?;

    info!("node network daemon stopped");
    Ok(())
}

fn build_kernel(args: &Args) -> anyhow::Result<KernelHandle> {
    match args.kernel {
        KernelBackend::Memory => {
            let kernel = match &args.inventory {
                Some(path) => MemoryKernel::from_inventory(&HostInventory::load(path)?),
                None => {
                    warn!("no host inventory given, simulated kernel has loopback only");
                    MemoryKernel::new()
                }
            };

            Ok(Arc::new(kernel))
        }
        KernelBackend::Linux => linux_kernel(args),
    }
}

#[cfg(target_os = "linux")]
fn linux_kernel(args: &Args) -> anyhow::Result<KernelHandle> {
    if let Some(path) = &args.inventory {
        warn!(path = %path.display(), "host inventory ignored by the linux kernel backend");
    }

    let kernel = node_netd::LinuxKernel::new().context("connecting to the kernel")?;
    Ok(Arc::new(kernel))
}

#[cfg(not(target_os = "linux"))]
fn linux_kernel(_args: &Args) -> anyhow::Result<KernelHandle> {
    anyhow::bail!("the linux kernel backend is only available on linux")
}

fn read(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn load_cmdline(args: &Args) -> anyhow::Result<Cmdline> {
    let line = match (&args.cmdline, &args.cmdline_file) {
        (Some(line), _) => line.clone(),
        (None, Some(path)) => read(path)?,
        (None, None) => String::new(),
    };

    Ok(Cmdline::parse(line.trim()))
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

    if let Ok(directive) = "hyper=warn".parse() {
        filter = filter.add_directive(directive);
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

// =============================================================================
// Health Server
// =============================================================================

fn network_ready(state: &State) -> bool {
    state
        .get::<NetworkStatus>(Namespace::Network, NETWORK_STATUS_ID)
        .map_or(false, |s| s.spec.ready())
}

async fn run_health_server(addr: SocketAddr, state: Arc<State>) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();

        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let state = state.clone();

                async move {
                    let (status, body) = match req.uri().path() {
                        "/healthz" | "/livez" => (StatusCode::OK, "ok"),
                        "/readyz" if network_ready(&state) => (StatusCode::OK, "ok"),
                        "/readyz" => (StatusCode::SERVICE_UNAVAILABLE, "network not ready"),
                        _ => (StatusCode::NOT_FOUND, "not found"),
                    };

                    let mut response = Response::new(Body::from(body));
                    *response.status_mut() = status;

                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!(%addr, "health server listening");
    Server::bind(&addr).serve(make_svc).await?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    // register the engine families before the first scrape
    node_netd::metrics::metrics();

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let mut response = Response::new(Body::empty());

            if req.uri().path() != "/metrics" {
                *response.status_mut() = StatusCode::NOT_FOUND;
                *response.body_mut() = Body::from("not found");
                return Ok::<_, std::convert::Infallible>(response);
            }

            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();

            match encoder.encode(&prometheus::gather(), &mut buffer) {
                Ok(()) => {
                    if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                        response.headers_mut().insert(CONTENT_TYPE, value);
                    }
                    *response.body_mut() = Body::from(buffer);
                }
                Err(e) => {
                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    *response.body_mut() = Body::from(e.to_string());
                }
            }

            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!(%addr, "metrics server listening");
    Server::bind(&addr).serve(make_svc).await?;

    Ok(())
}
