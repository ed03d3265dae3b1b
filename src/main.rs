use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtp_gst_bridge::config::AppConfig;
use rtp_gst_bridge::events::EventBus;
use rtp_gst_bridge::janus::run_subscriber;
use rtp_gst_bridge::state::AppState;
use rtp_gst_bridge::web;
use rtp_gst_bridge::webrtc::{CodecSet, MediaApi, SessionManager};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// rtp-gst-bridge command line arguments
#[derive(Parser, Debug)]
#[command(name = "rtp-gst-bridge")]
#[command(version, about = "Forward inbound WebRTC tracks into GStreamer pipelines", long_about = None)]
struct CliArgs {
    /// Configuration file (TOML)
    #[arg(short = 'c', long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the demo page and answer browser offers on /doSignaling
    Serve {
        /// Listen address (overrides config)
        #[arg(short = 'a', long, value_name = "ADDRESS")]
        address: Option<String>,

        /// HTTP port (overrides config)
        #[arg(short = 'p', long, value_name = "PORT")]
        http_port: Option<u16>,
    },
    /// Subscribe to a Janus VideoRoom feed
    Janus {
        /// Janus WebSocket URL (overrides config)
        #[arg(long, value_name = "URL")]
        url: Option<String>,

        /// VideoRoom room id
        #[arg(long, value_name = "ROOM")]
        room: Option<u64>,

        /// Publisher feed id to subscribe to
        #[arg(long, value_name = "FEED")]
        feed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting rtp-gst-bridge v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load(args.config.as_deref()).await?;
    apply_overrides(&mut config, &args.command);
    config.validate()?;
    if let Command::Janus { .. } = args.command {
        config.janus.validate()?;
    }

    gst::init()?;
    tracing::info!("GStreamer {}", gst::version_string());

    let codecs = match args.command {
        Command::Serve { .. } => CodecSet::Browser,
        Command::Janus { .. } => CodecSet::Default,
    };
    let api = Arc::new(MediaApi::new(&config.webrtc, codecs)?);
    let events = Arc::new(EventBus::new());
    let sessions = SessionManager::new(api, &config, events.clone());

    match args.command {
        Command::Serve { .. } => serve(config, sessions, events).await,
        Command::Janus { .. } => subscribe(config, sessions).await,
    }
}

fn apply_overrides(config: &mut AppConfig, command: &Command) {
    match command {
        Command::Serve { address, http_port } => {
            if let Some(address) = address {
                config.web.bind_address = address.clone();
            }
            if let Some(port) = http_port {
                config.web.http_port = *port;
            }
        }
        Command::Janus { url, room, feed } => {
            if let Some(url) = url {
                config.janus.url = url.clone();
            }
            if let Some(room) = room {
                config.janus.room = *room;
            }
            if let Some(feed) = feed {
                config.janus.feed = *feed;
            }
        }
    }
}

async fn serve(
    config: AppConfig,
    sessions: Arc<SessionManager>,
    events: Arc<EventBus>,
) -> anyhow::Result<()> {
    let ip: IpAddr = config
        .web
        .bind_address
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid bind address: {}", config.web.bind_address))?;
    let addr = SocketAddr::new(ip, config.web.http_port);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let state = AppState::new(config, sessions, events, shutdown_tx.clone());
    let app = web::create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    let mut shutdown_rx = state.shutdown_signal();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;

    state.sessions.close_all("server shutdown").await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn subscribe(config: AppConfig, sessions: Arc<SessionManager>) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        });
    }

    let result = run_subscriber(&config.janus, sessions.clone(), shutdown).await;
    sessions.close_all("subscriber stopped").await;
    result?;

    tracing::info!("Subscriber finished");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "rtp_gst_bridge=error,tower_http=error",
        LogLevel::Warn => "rtp_gst_bridge=warn,tower_http=warn",
        LogLevel::Info => "rtp_gst_bridge=info,tower_http=info",
        LogLevel::Verbose => "rtp_gst_bridge=debug,tower_http=info",
        LogLevel::Debug => "rtp_gst_bridge=debug,tower_http=debug,webrtc=info",
        LogLevel::Trace => "rtp_gst_bridge=trace,tower_http=debug,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
