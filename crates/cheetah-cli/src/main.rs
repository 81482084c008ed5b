use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cheetah_core::{
    ControlPlaneConfig, ControlSession, DrainOutcome, DrainSettings, EdgeServer, ServerSettings,
    SessionConfig, DEFAULT_CONTROL_PLANE_URL, DEFAULT_UPSTREAM_URL,
};
use cheetah_edge::{
    CacheHandler, OriginHandle, ProxyHandler, RequestValidator, ServeHandler, UpstreamTuning,
};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const GIB: u64 = 1 << 30;

#[derive(Parser, Debug)]
#[command(
    name = "cheetah",
    author,
    version,
    about = "cheetah: an edge cache node for image delivery",
    propagate_version = true,
    args_conflicts_with_subcommands = true
)]
struct Cli {
    /// Increase output verbosity (-v, -vv).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Output log format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(flatten)]
    runtime: RuntimeArgs,

    #[command(subcommand)]
    command: Option<Command>,

    /// Flags of the default `standalone` mode when no subcommand is given.
    #[command(flatten)]
    standalone: StandaloneArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register with the control plane and cache images on local disk (default).
    Standalone(StandaloneArgs),
    /// Register with the control plane and stream images from fixed origins without caching.
    Proxy(ProxyArgs),
    /// Serve a disk cache over plain HTTP in front of a static upstream, without a control plane.
    Cache(CacheArgs),
}

#[derive(Args, Debug, Clone)]
struct RuntimeArgs {
    /// Worker threads serving requests (defaults to the number of CPUs).
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Longest time to wait for open connections on shutdown.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s", global = true)]
    shutdown_timeout: Duration,

    /// How often to report progress while draining connections.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5s", global = true)]
    shutdown_interval: Duration,
}

impl RuntimeArgs {
    fn worker_threads(&self) -> usize {
        self.workers
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }

    fn drain(&self) -> DrainSettings {
        DrainSettings {
            timeout: self.shutdown_timeout,
            interval: self.shutdown_interval,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct SessionArgs {
    /// Client secret used to register with the control plane.
    #[arg(long, env = "CHEETAH_KEY", default_value = "", hide_env_values = true)]
    key: String,

    /// Public IP reported to the control plane (defaults to the address it sees).
    #[arg(long, default_value = "")]
    ip: String,

    /// Port to serve images on.
    #[arg(long, default_value_t = 443)]
    port: u16,

    /// Serve without verifying request tokens.
    #[arg(long, action = ArgAction::SetTrue)]
    no_token_check: bool,

    /// Base URL of the control plane.
    #[arg(long, env = "CHEETAH_CONTROL_PLANE", default_value = DEFAULT_CONTROL_PLANE_URL)]
    control_plane: String,
}

#[derive(Args, Debug, Clone)]
struct StandaloneArgs {
    #[command(flatten)]
    session: SessionArgs,

    /// Directory images are cached in.
    #[arg(long, default_value = "./cache")]
    cache: PathBuf,

    /// Cache size in GiB reported to the control plane.
    #[arg(long, default_value_t = 256)]
    size: u64,
}

#[derive(Args, Debug, Clone)]
struct ProxyArgs {
    #[command(flatten)]
    session: SessionArgs,

    /// Comma-separated origins; the first one is used.
    #[arg(long, value_delimiter = ',', default_values_t = vec![DEFAULT_UPSTREAM_URL.to_string()])]
    origins: Vec<String>,
}

#[derive(Args, Debug, Clone)]
struct CacheArgs {
    /// Port to serve images on.
    #[arg(long, default_value_t = 80)]
    port: u16,

    /// Origin images are fetched from on a cache miss.
    #[arg(long, default_value = DEFAULT_UPSTREAM_URL)]
    upstream: String,

    /// Directory images are cached in.
    #[arg(long, default_value = "./cache")]
    cache: PathBuf,

    /// Cache size in GiB (informational).
    #[arg(long, default_value_t = 256)]
    size: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cli.runtime.worker_threads())
        .thread_name("cheetah-worker")
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;

    let command = cli
        .command
        .unwrap_or(Command::Standalone(cli.standalone));
    let settings = cli.runtime;

    runtime.block_on(async move {
        match command {
            Command::Standalone(args) => run_standalone(args, &settings).await,
            Command::Proxy(args) => run_proxy(args, &settings).await,
            Command::Cache(args) => run_cache(args, &settings).await,
        }
    })
}

fn init_tracing(verbosity: u8, format: LogFormat) {
    let level = match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    let _ = match format {
        LogFormat::Text => subscriber.try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    };
}

async fn run_standalone(args: StandaloneArgs, runtime: &RuntimeArgs) -> Result<()> {
    let session = open_session(&args.session, args.size.saturating_mul(GIB))?;
    let handles = session
        .connect()
        .await
        .context("failed to connect to the control plane")?;

    let validator = serving_validator(&args.session, Arc::clone(&handles.validator));
    let handler = CacheHandler::new(
        args.cache.clone(),
        handles.origin.clone(),
        validator,
        &UpstreamTuning::default(),
    )?;
    info!(cache = %args.cache.display(), size_gib = args.size, "disk cache enabled");

    let settings = ServerSettings::on_port(args.session.port, false);
    let server = start_server(&settings, Arc::new(handler), Some(&handles)).await?;

    wait_for_shutdown_signal().await?;
    shutdown(Some(&session), server, runtime.drain()).await
}

async fn run_proxy(args: ProxyArgs, runtime: &RuntimeArgs) -> Result<()> {
    let session = open_session(&args.session, 0)?;
    let handles = session
        .connect()
        .await
        .context("failed to connect to the control plane")?;

    let validator = serving_validator(&args.session, Arc::clone(&handles.validator));
    let handler = ProxyHandler::new(&args.origins, validator, &UpstreamTuning::default())?;
    info!(origins = ?args.origins, "proxy mode enabled");

    let settings = ServerSettings::on_port(args.session.port, false);
    let server = start_server(&settings, Arc::new(handler), Some(&handles)).await?;

    wait_for_shutdown_signal().await?;
    shutdown(Some(&session), server, runtime.drain()).await
}

async fn run_cache(args: CacheArgs, runtime: &RuntimeArgs) -> Result<()> {
    let handler = CacheHandler::new(
        args.cache.clone(),
        OriginHandle::fixed(args.upstream.as_str()),
        Arc::new(RequestValidator::disabled()),
        &UpstreamTuning::default(),
    )?;
    info!(
        cache = %args.cache.display(),
        size_gib = args.size,
        upstream = %args.upstream,
        "disk cache enabled"
    );

    let settings = ServerSettings::on_port(args.port, true);
    let server = EdgeServer::start(&settings, Arc::new(handler), None)
        .await
        .context("failed to start the image server")?;

    wait_for_shutdown_signal().await?;
    shutdown(None, server, runtime.drain()).await
}

fn open_session(args: &SessionArgs, cache_size: u64) -> Result<ControlSession> {
    if args.key.is_empty() {
        bail!("a client secret is required to register with the control plane (--key)");
    }
    let config = SessionConfig::new(args.key.clone(), args.ip.clone(), args.port, cache_size, 0);
    let control = ControlPlaneConfig {
        base_url: args.control_plane.clone(),
        ..ControlPlaneConfig::default()
    };
    ControlSession::new(config, control).context("failed to set up the control-plane session")
}

/// With `--no-token-check` the serving path gets its own validator that heartbeats
/// never touch, so checks stay off for the life of the process.
fn serving_validator(args: &SessionArgs, session: Arc<RequestValidator>) -> Arc<RequestValidator> {
    if args.no_token_check {
        warn!("token verification disabled");
        Arc::new(RequestValidator::disabled())
    } else {
        session
    }
}

async fn start_server(
    settings: &ServerSettings,
    handler: Arc<dyn ServeHandler>,
    handles: Option<&cheetah_core::SessionHandles>,
) -> Result<EdgeServer> {
    let tls = handles.map(|handles| Arc::clone(&handles.tls));
    EdgeServer::start(settings, handler, tls)
        .await
        .context("failed to start the image server")
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            res = signal::ctrl_c() => res.context("failed to listen for ctrl-c")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("shutdown signal received; stopping");
    Ok(())
}

async fn shutdown(
    session: Option<&ControlSession>,
    server: EdgeServer,
    drain: DrainSettings,
) -> Result<()> {
    if let Some(session) = session {
        session
            .disconnect()
            .await
            .context("failed to disconnect from the control plane")?;
    }

    let outcome = server
        .stop(drain)
        .await
        .context("failed to stop the image server")?;
    match outcome {
        DrainOutcome::Drained => info!("image server stopped"),
        DrainOutcome::TimedOut { remaining } => {
            warn!(remaining, "image server stopped with connections still open")
        }
    }

    if let Some(session) = session {
        session.shutdown().await;
    }
    Ok(())
}
