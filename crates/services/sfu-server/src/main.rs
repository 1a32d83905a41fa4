//! SFU signaling server binary entry point
//!
//! Starts the engine worker, creates its router, and serves the JSON-RPC
//! signaling protocol over WebSocket.
//!
//! Media is forwarded by a mediasoup worker, which requires building with the
//! `mediasoup` feature. The `loopback` engine answers signaling without
//! binding any RTC port, so browsers can negotiate but never exchange media;
//! it exists for local development of clients and must be asked for.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: ws://0.0.0.0:3001, RTC ports 10000-10100
//! cargo run -p relaycast-sfu-server --features mediasoup
//!
//! # Load a TOML file, then override single values
//! cargo run -p relaycast-sfu-server --features mediasoup -- \
//!   --config ./sfu.toml \
//!   --listen-address 0.0.0.0:4443 \
//!   --announced-ip 203.0.113.7
//!
//! # Signaling only, no media
//! cargo run -p relaycast-sfu-server -- --engine loopback
//! ```

use clap::{Parser, ValueEnum};
use relaycast_sfu::engine::{self, MediaRouter, MediaWorker};
use relaycast_sfu::{
    LoopbackWorker, SfuConfig, SfuEvent, SharedState, WebSocketServerHandle,
    WebSocketSignalingServer,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Forwarding engine behind the signaling core
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EngineKind {
    /// mediasoup worker (requires the `mediasoup` feature)
    Mediasoup,
    /// In-process bookkeeping only; no media is forwarded
    Loopback,
}

/// Relaycast SFU signaling server
///
/// Command-line values override the TOML file, which overrides defaults.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "SFU_CONFIG")]
    config: Option<PathBuf>,

    /// Media engine
    #[arg(long, env = "SFU_ENGINE", value_enum, default_value_t = EngineKind::Mediasoup)]
    engine: EngineKind,

    /// Signaling listen address
    #[arg(long, env = "SFU_LISTEN_ADDRESS")]
    listen_address: Option<String>,

    /// IP the media transports listen on
    #[arg(long, env = "SFU_RTC_LISTEN_IP")]
    rtc_listen_ip: Option<String>,

    /// Public IP announced in ICE candidates
    #[arg(long, env = "SFU_ANNOUNCED_IP")]
    announced_ip: Option<String>,

    /// Lowest RTC port
    #[arg(long, env = "SFU_RTC_MIN_PORT")]
    rtc_min_port: Option<u16>,

    /// Highest RTC port
    #[arg(long, env = "SFU_RTC_MAX_PORT")]
    rtc_max_port: Option<u16>,

    /// Timeout applied to each signaling request
    #[arg(long, env = "SFU_REQUEST_TIMEOUT_MS")]
    request_timeout_ms: Option<u64>,

    /// Delay between engine death and process exit
    #[arg(long, env = "SFU_ENGINE_DEATH_GRACE_MS")]
    engine_death_grace_ms: Option<u64>,

    /// Maximum concurrent signaling connections (0 = unlimited)
    #[arg(long, env = "SFU_MAX_CONNECTIONS")]
    max_connections: Option<u32>,
}

impl Args {
    /// Layer the arguments over the file (or default) configuration
    fn load_config(&self) -> relaycast_sfu::Result<SfuConfig> {
        let mut config = match &self.config {
            Some(path) => SfuConfig::from_toml_file(path)?,
            None => SfuConfig::default(),
        };

        if let Some(address) = &self.listen_address {
            config = config.with_listen_address(address);
        }
        if let Some(ip) = &self.rtc_listen_ip {
            config.rtc_listen_ip = ip.clone();
        }
        if let Some(ip) = &self.announced_ip {
            config = config.with_announced_ip(ip);
        }
        if let Some(port) = self.rtc_min_port {
            config.rtc_min_port = port;
        }
        if let Some(port) = self.rtc_max_port {
            config.rtc_max_port = port;
        }
        if let Some(timeout_ms) = self.request_timeout_ms {
            config = config.with_request_timeout_ms(timeout_ms);
        }
        if let Some(grace_ms) = self.engine_death_grace_ms {
            config.engine_death_grace_ms = grace_ms;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Set up Ctrl+C handler at the very start
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        eprintln!("\n[{}] Ctrl+C received, initiating shutdown", timestamp);

        let was_already_set = shutdown_flag_handler.swap(true, Ordering::SeqCst);
        if was_already_set {
            eprintln!("   [SIGNAL] Shutdown already in progress, forcing immediate exit");
            std::process::exit(0);
        }

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(3));
            eprintln!("[WATCHDOG] Graceful shutdown timeout (3s), forcing exit");
            std::process::exit(0);
        });
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("sfu-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(
    args: Args,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;

    let config = Arc::new(args.load_config()?);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_address = %config.listen_address,
        rtc_ports = %format!("{}-{}", config.rtc_min_port, config.rtc_max_port),
        announced_ip = ?config.rtc_announced_ip,
        codecs = config.media_codecs.len(),
        request_timeout_ms = config.request_timeout_ms,
        "SFU server starting"
    );

    let worker = start_engine(args.engine, &config).await?;
    let router = worker.create_router(&config.media_codecs).await?;
    info!(
        engine = ?args.engine,
        pid = worker.pid(),
        router_id = router.id(),
        "Engine worker ready"
    );

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let state = Arc::new(SharedState::new_with_events(
        Arc::clone(&config),
        Some(event_tx),
    ));
    state.attach_router(router);
    tokio::spawn(log_events(event_rx));

    let server = WebSocketSignalingServer::new(Arc::clone(&state))?;
    let handle = server.start().await?;
    info!("Server running on {}. Press Ctrl+C to shutdown.", handle.url());

    tokio::select! {
        reason = engine::wait_for_death(worker.as_ref()) => {
            on_engine_death(&state, worker.pid(), &reason, config.engine_death_grace()).await;
        }
        _ = wait_for_shutdown(&shutdown_flag) => {
            info!("Shutdown signal received, cleaning up...");
        }
    }

    shutdown(handle).await;
    Ok(())
}

async fn start_engine(
    kind: EngineKind,
    config: &SfuConfig,
) -> Result<Arc<dyn MediaWorker>, Box<dyn std::error::Error>> {
    match kind {
        EngineKind::Mediasoup => mediasoup_worker(config).await,
        EngineKind::Loopback => {
            warn!("Loopback engine selected: signaling only, no media will be forwarded");
            Ok(Arc::new(LoopbackWorker::with_port_range(
                config.rtc_min_port,
                config.rtc_max_port,
            )))
        }
    }
}

#[cfg(feature = "mediasoup")]
async fn mediasoup_worker(
    config: &SfuConfig,
) -> Result<Arc<dyn MediaWorker>, Box<dyn std::error::Error>> {
    let worker =
        engine::MediasoupWorker::spawn(config.rtc_min_port, config.rtc_max_port).await?;
    Ok(Arc::new(worker))
}

#[cfg(not(feature = "mediasoup"))]
async fn mediasoup_worker(
    _config: &SfuConfig,
) -> Result<Arc<dyn MediaWorker>, Box<dyn std::error::Error>> {
    Err("built without mediasoup support: rebuild with `--features mediasoup`, \
         or pass `--engine loopback` for signaling without media"
        .into())
}

/// Engine death is unrecoverable: report, wait the grace period, exit non-zero
async fn on_engine_death(state: &SharedState, pid: u32, reason: &str, grace: Duration) {
    state.emit_event(SfuEvent::engine_died(pid, reason));
    error!(
        pid,
        reason,
        grace_ms = grace.as_millis() as u64,
        "Media engine worker died, exiting"
    );
    tokio::time::sleep(grace).await;
    std::process::exit(1);
}

async fn wait_for_shutdown(flag: &AtomicBool) {
    while !flag.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn shutdown(handle: WebSocketServerHandle) {
    handle.shutdown().await;
    info!("SFU server shut down gracefully");
}

async fn log_events(mut events: mpsc::Receiver<SfuEvent>) {
    while let Some(event) = events.recv().await {
        debug!(?event, "SFU event");
    }
}

fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing with EnvFilter for RUST_LOG support
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arguments_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sfu.toml");
        std::fs::write(&path, "listen_address = \"127.0.0.1:4000\"\nrtc_min_port = 20000\nrtc_max_port = 20010\n").unwrap();

        let args = Args::parse_from([
            "sfu-server",
            "--config",
            path.to_str().unwrap(),
            "--rtc-max-port",
            "20020",
        ]);
        let config = args.load_config().unwrap();
        assert_eq!(config.listen_address, "127.0.0.1:4000");
        assert_eq!(config.rtc_min_port, 20000);
        assert_eq!(config.rtc_max_port, 20020);
    }

    #[test]
    fn test_engine_defaults_to_mediasoup() {
        let args = Args::parse_from(["sfu-server"]);
        assert_eq!(args.engine, EngineKind::Mediasoup);
        let args = Args::parse_from(["sfu-server", "--engine", "loopback"]);
        assert_eq!(args.engine, EngineKind::Loopback);
    }

    #[tokio::test]
    async fn test_loopback_engine_starts() {
        let config = SfuConfig::local_preset();
        let worker = start_engine(EngineKind::Loopback, &config).await.unwrap();
        assert!(worker.create_router(&config.media_codecs).await.is_ok());
    }

    #[cfg(not(feature = "mediasoup"))]
    #[tokio::test]
    async fn test_mediasoup_engine_requires_feature() {
        let config = SfuConfig::local_preset();
        let err = start_engine(EngineKind::Mediasoup, &config).await.err().unwrap();
        assert!(err.to_string().contains("--features mediasoup"));
    }

    #[test]
    fn test_invalid_override_rejected() {
        let args = Args::parse_from(["sfu-server", "--rtc-min-port", "30000", "--rtc-max-port", "20000"]);
        assert!(args.load_config().is_err());
    }
}
