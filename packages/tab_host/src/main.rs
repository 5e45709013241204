use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tab_host::echo::{ECHO_APP_NAME, EchoApp};
use tab_host::{AppsStateOptions, FileConfig, HostConfig, HostState, build_router, load_config};
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::info;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "tab-host")]
#[command(about = "Long-poll event host for browser tabs")]
struct Args {
    /// Config file (defaults to ./tab-host.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind to (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    let default_directive = if args.debug {
        "tab_host=debug,strand_kit=debug,tower_http=debug,info"
    } else {
        "tab_host=info,strand_kit=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let file_config: FileConfig = load_config(args.config.as_deref())
        .extract()
        .context("Failed to load configuration")?;
    let mut config = HostConfig::from_file(&file_config);
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    info!(
        max_age_without_listener = ?config.policy.max_age_without_listener,
        max_poll_duration = ?config.policy.max_poll_duration,
        queue_budget = config.queue_budget,
        "Starting tab host"
    );

    let addr = format!("{}:{}", config.host, config.port)
        .parse::<SocketAddr>()
        .context("Invalid listen address")?;

    let state = HostState::new(config, AppsStateOptions::default());
    state
        .apps
        .add_app(ECHO_APP_NAME, Arc::new(EchoApp))
        .await
        .context("Failed to register echo app")?;

    let app = build_router(state).layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let actual_addr = listener.local_addr()?;

    info!("Tab host listening on http://{}", actual_addr);
    info!("  POST   /poll/{{session}}?appname=NAME - Open a tab");
    info!("  GET    /poll/{{session}}/{{tab}}      - Long-poll for events");
    info!("  DELETE /poll/{{session}}/{{tab}}      - Close a tab");
    info!("  POST   /send/{{session}}/{{tab}}      - Send a message to the app");
    info!("  ANY    /{{app}}/...                - Forwarded to the app");

    // Create shutdown signal handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")
}
