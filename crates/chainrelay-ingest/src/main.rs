//! Chainrelay ingestion daemon.
//!
//! This is the main entry point for the chain change-data-capture service.
//! It accepts one upstream feed connection over websocket, decodes the
//! events into canonical records, and relays them through durable on-disk
//! queues to the message bus.
//!
//! # Usage
//!
//! ```bash
//! # Run with default settings (local broker, no fallback lookup)
//! chainrelay-ingest
//!
//! # Run with a config file and a chain API for block-id fallback
//! chainrelay-ingest \
//!     --config /etc/chainrelay/config.toml \
//!     --fallback-url http://chain-api:8888
//! ```
//!
//! # Graceful Shutdown
//!
//! On SIGINT or a fatal pipeline error the daemon:
//! 1. Refuses new feed connections and stops the running session
//! 2. Waits for in-flight decodes, then persists the session counters
//! 3. On a fatal error, sleeps through a cool-off before exiting so the
//!    supervisor restart does not hammer a rate-limited upstream

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chainrelay_core::metrics::{init_metrics, start_metrics_server};
use chainrelay_ingest::fallback::BlockIdSource;
use chainrelay_ingest::{
    AbiStore, Decoder, Error, Feed, FileConfig, Frame, HttpBlockIdSource, IngestConfig, KafkaSink,
    NoFallback, QueueSet, Relay, Session, SessionManager, SessionState,
};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

/// Chainrelay ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "chainrelay-ingest")]
#[command(about = "Chain change-data-capture ingestion daemon")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Session counter state file
    #[arg(long, default_value = "./chainrelay.json")]
    state_file: PathBuf,

    /// RocksDB path for the durable queues
    #[arg(long, default_value = "./data/queue")]
    queue_path: PathBuf,

    /// Feed endpoint listen address
    #[arg(long, default_value = "0.0.0.0:8844")]
    listen: SocketAddr,

    /// Chain API base URL for block-id fallback lookups (disabled when unset)
    #[arg(long)]
    fallback_url: Option<String>,

    /// Bus broker list, overriding the config file
    #[arg(long)]
    brokers: Option<String>,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9090")]
    metrics_port: u16,
}

/// Shared handles for the feed endpoint.
#[derive(Clone)]
struct AppState {
    manager: SessionManager,
    state: Arc<SessionState>,
    decoder: Arc<Decoder>,
    relay: Relay,
    cfg: IngestConfig,
    shutdown: watch::Receiver<bool>,
    fatal: mpsc::Sender<Error>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap())
                .add_directive("chainrelay_ingest=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    tracing::info!("chainrelay ingestion daemon starting...");

    let mut file_cfg = match &args.config {
        Some(path) => FileConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => FileConfig::default(),
    };
    if let Some(brokers) = args.brokers.clone() {
        file_cfg.bus.brokers = brokers;
    }

    // Initialize metrics
    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
    }

    tracing::info!("Configuration:");
    tracing::info!("  State file: {}", args.state_file.display());
    tracing::info!("  Queue path: {}", args.queue_path.display());
    tracing::info!("  Brokers:    {}", file_cfg.bus.brokers);
    tracing::info!(
        "  Fallback:   {}",
        args.fallback_url.as_deref().unwrap_or("disabled")
    );

    let (errs_tx, mut errs_rx) = mpsc::channel::<Error>(8);
    let (stop_tx, stop_rx) = watch::channel(false);

    // Relay: durable queues draining into the bus
    let queues = Arc::new(
        QueueSet::open(&args.queue_path)
            .with_context(|| format!("failed to open queues at {}", args.queue_path.display()))?,
    );
    let sink = Arc::new(KafkaSink::connect(&file_cfg.bus).context("failed to create bus producer")?);
    let relay = Relay::start(
        queues,
        sink,
        &file_cfg.bus,
        file_cfg.ingest.publisher_pool,
        errs_tx.clone(),
        stop_rx.clone(),
    );

    // Decode engine
    let abis = Arc::new(AbiStore::with_defaults().context("failed to load built-in schemas")?);
    let lookup: Arc<dyn BlockIdSource> = match &args.fallback_url {
        Some(url) => Arc::new(HttpBlockIdSource::new(
            url,
            file_cfg.ingest.fallback_timeout(),
        )?),
        None => Arc::new(NoFallback),
    };
    let decoder = Arc::new(Decoder::new(abis, lookup));

    // Feed endpoint
    let app_state = AppState {
        manager: SessionManager::new(),
        state: Arc::new(SessionState::load(&args.state_file)),
        decoder,
        relay,
        cfg: file_cfg.ingest.clone(),
        shutdown: stop_rx.clone(),
        fatal: errs_tx,
    };
    let app = Router::new()
        .route("/chronicle", get(chronicle))
        .with_state(app_state);
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    tracing::info!("feed endpoint listening on ws://{}/chronicle", args.listen);

    let mut serve_stop = stop_rx.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = serve_stop.changed().await;
    });

    let fatal = tokio::select! {
        res = serve => {
            res.context("feed endpoint server failed")?;
            None
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received, stopping gracefully...");
            None
        }
        Some(e) = errs_rx.recv() => Some(e),
    };
    let _ = stop_tx.send(true);

    match fatal {
        None => {
            tracing::info!("shutdown complete");
            Ok(())
        }
        Some(e) => {
            tracing::error!(error = %e, "fatal pipeline error, exiting after cool-off");
            tokio::time::sleep(file_cfg.ingest.exit_delay()).await;
            Err(e.into())
        }
    }
}

/// The upstream feed connects here. One session at a time; a second
/// connection while the slot is held is refused with 503.
async fn chronicle(
    State(app): State<AppState>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    let guard = match app.manager.try_acquire() {
        Ok(guard) => guard,
        Err(e) => {
            tracing::warn!(error = %e, "refusing second feed connection");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };
    ws.on_upgrade(move |socket| async move {
        let session = Session::new(
            WsFeed(socket),
            guard,
            Arc::clone(&app.state),
            Arc::clone(&app.decoder),
            app.relay.clone(),
            app.cfg.clone(),
            app.shutdown.clone(),
        );
        match session.run().await {
            Ok(()) => tracing::info!("session ended"),
            Err(e) => {
                tracing::error!(error = %e, "session failed");
                let _ = app.fatal.try_send(e);
            }
        }
    })
    .into_response()
}

/// Websocket-backed transport for the session.
struct WsFeed(WebSocket);

#[async_trait::async_trait]
impl Feed for WsFeed {
    async fn recv(&mut self) -> chainrelay_ingest::Result<Option<Frame>> {
        match self.0.recv().await {
            Some(Ok(Message::Binary(bytes))) => Ok(Some(Frame::Binary(bytes))),
            Some(Ok(Message::Close(_))) | None => Ok(None),
            Some(Ok(_)) => Ok(Some(Frame::Ignored)),
            Some(Err(e)) => Err(Error::Connection(e.to_string())),
        }
    }

    async fn send_text(&mut self, text: String) -> chainrelay_ingest::Result<()> {
        self.0
            .send(Message::Text(text))
            .await
            .map_err(|e| Error::Connection(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.send(Message::Close(None)).await;
    }
}
