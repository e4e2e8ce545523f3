//! exposr CLI - expose a local service through a tunnel broker
//!
//! Reads the tunnel from the broker, keeps transport connections up and
//! relays incoming connections to the target until interrupted.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use exposr_client::{
    HttpTunnelService, RewriteHeader, TransformRules, Tunnel, TunnelConfig, TunnelService,
};
use exposr_proto::{StatusUpdate, TransportStatus, TunnelDescriptor};
use exposr_transport_websocket::{WebSocketConfig, WebSocketConnector};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

/// exposr - Expose local services through a tunnel broker
#[derive(Parser, Debug)]
#[command(name = "exposr")]
#[command(about = "exposr - Expose local services through a tunnel broker")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, global = true, default_value = "info", env = "EXPOSR_LOG_LEVEL")]
    log_level: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Basic)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Basic,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect a tunnel and forward its traffic to a target
    #[command(long_about = r#"
Connect an existing tunnel and forward every connection arriving at its
ingress to TARGET_URL. Transport connections are re-established
automatically when they drop.

EXAMPLES:
  # Expose a local web server, rewriting Host/Origin/Referer
  exposr connect http://localhost:3000 --http-mode \
    --server https://broker.example.com --tunnel-id quiet-river

  # Expose a local PostgreSQL over two transport connections
  exposr connect postgres://localhost --max-transports 2

ENVIRONMENT VARIABLES:
  EXPOSR_SERVER     Broker API URL
  EXPOSR_TOKEN      Access token
  EXPOSR_TUNNEL_ID  Tunnel identifier
    "#)]
    Connect(ConnectArgs),
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Target URL to forward connections to (e.g. http://localhost:3000)
    target_url: String,

    /// Broker API URL
    #[arg(long, env = "EXPOSR_SERVER")]
    server: Url,

    /// Tunnel to connect
    #[arg(long, env = "EXPOSR_TUNNEL_ID")]
    tunnel_id: String,

    /// Access token
    #[arg(long, env = "EXPOSR_TOKEN", hide_env_values = true)]
    token: String,

    /// Skip target TLS certificate verification
    #[arg(short = 'k', long)]
    insecure: bool,

    /// Parse HTTP requests and apply header rewrites and replacements
    #[arg(long)]
    http_mode: bool,

    /// Set a request header, NAME:VALUE (an empty value removes the header)
    #[arg(short = 'H', long = "http-header-replace", value_name = "NAME:VALUE", value_parser = parse_replace_header)]
    replace_headers: Vec<(String, String)>,

    /// Header to rewrite ingress URLs in (host, referer, origin). Repeat
    /// for several; defaults to all three.
    #[arg(short = 'R', long = "http-header-rewrite", value_name = "HEADER")]
    rewrite_headers: Vec<RewriteHeader>,

    /// Number of transport connections to keep open (capped by the broker)
    #[arg(long, default_value_t = 1)]
    max_transports: usize,
}

fn parse_replace_header(spec: &str) -> Result<(String, String), exposr_client::ConfigError> {
    TransformRules::parse_replace_spec(spec)
}

/// Setup logging with the specified level and format
fn init_logging(log_level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Basic => registry.with(fmt::layer().with_target(false)).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format)?;

    match cli.command {
        Commands::Connect(args) => connect(args).await,
    }
}

async fn connect(args: ConnectArgs) -> Result<()> {
    let service = Arc::new(
        HttpTunnelService::new(&args.server, &args.tunnel_id, args.token.clone())
            .context("Invalid server URL")?,
    );

    let descriptor = service
        .read(true)
        .await
        .with_context(|| format!("Failed to read tunnel {}", args.tunnel_id))?;

    if descriptor.connection.connected {
        info!("Tunnel {} is connected elsewhere, disconnecting it", descriptor.id);
        service
            .disconnect()
            .await
            .context("Failed to disconnect tunnel")?;
    }

    let max_transports = match descriptor.max_connections() {
        Some(max) => args.max_transports.min(max as usize).max(1),
        None => args.max_transports,
    };

    let mut builder = TunnelConfig::builder()
        .target_url(args.target_url.clone())
        .allow_insecure(args.insecure)
        .max_transports(max_transports)
        .http_mode(args.http_mode);
    if !args.rewrite_headers.is_empty() {
        builder = builder.rewrite_headers(args.rewrite_headers.iter().map(RewriteHeader::as_str));
    }
    for (name, value) in &args.replace_headers {
        builder = builder.replace_header(name.clone(), value.clone());
    }
    let config = builder.build().context("Invalid tunnel configuration")?;

    log_tunnel(&descriptor, &config);
    if args.insecure {
        warn!("Target certificate verification disabled (insecure mode)");
    }

    let connector = Arc::new(
        WebSocketConnector::new(Arc::new(WebSocketConfig::default()))
            .context("Failed to create transport")?,
    );
    let tunnel = Tunnel::new(config, service.clone(), connector)
        .context("Invalid tunnel configuration")?;

    let reporter = tokio::spawn(report_status(tunnel.subscribe()));

    let cancel = CancellationToken::new();
    let signals = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Received shutdown signal, disconnecting...");
            cancel.cancel();
        })
    };

    info!("Establishing tunnel...");
    let result = tunnel.connect(cancel.clone()).await;
    signals.abort();

    tunnel.disconnect().await;
    if cancel.is_cancelled() {
        match service.disconnect().await {
            Ok(true) => info!("Tunnel {} disconnected", args.tunnel_id),
            Ok(false) => warn!("Broker did not confirm disconnect of {}", args.tunnel_id),
            Err(e) => warn!("Failed to disconnect tunnel: {}", e),
        }
    }
    reporter.abort();

    if let Err(e) = &result {
        error!("Tunnel failed: {}", e);
    }
    result.context("Tunnel failed")
}

fn log_tunnel(descriptor: &TunnelDescriptor, config: &TunnelConfig) {
    info!("Tunnel {} target: {}", descriptor.id, config.target_url);
    for (name, urls) in descriptor.enabled_ingress() {
        for url in urls {
            info!("Ingress {}: {}", name.to_uppercase(), url);
        }
    }
    info!("Transport connections: {}", config.max_transports);

    let transform = &config.transform;
    if transform.enabled {
        info!("Local HTTP parsing: enabled");
        let rewrite: Vec<&str> = transform.rewrite_headers.iter().map(|h| h.as_str()).collect();
        info!("HTTP header rewrite: {}", rewrite.join(", "));
        let replace: Vec<String> = transform
            .replace_headers()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        info!("HTTP header replace: {}", replace.join(", "));
    }
}

/// Log per-connection transitions from the status stream.
async fn report_status(mut updates: broadcast::Receiver<StatusUpdate>) {
    let mut last: HashMap<u64, TransportStatus> = HashMap::new();

    loop {
        let update = match updates.recv().await {
            Ok(update) => update,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let Some(current) = update.source_transport() else {
            continue;
        };
        let previous = last.get(&current.id);
        let was_connected = previous.is_some_and(|p| p.connected);
        let status = &update.status;

        if current.connected && !was_connected {
            info!("Tunnel connection {} established", current.id);
            info!(
                "Tunnel connected {}/{}",
                status.current_connections, status.max_connections
            );
        } else if !current.connected && was_connected {
            let reason = current.closed.as_deref().unwrap_or("unknown reason");
            warn!("Tunnel connection {} lost: {}", current.id, reason);
            info!(
                "Tunnel connected {}/{}",
                status.current_connections, status.max_connections
            );
        } else if current.error.is_some() && previous.map(|p| &p.error) != Some(&current.error) {
            if let Some(error) = &current.error {
                warn!("Tunnel connection {} failed: {}", current.id, error);
            }
        }

        last.insert(current.id, current.clone());
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_args() {
        let cli = Cli::try_parse_from([
            "exposr",
            "connect",
            "http://localhost:3000",
            "--server",
            "https://broker.example.com",
            "--tunnel-id",
            "quiet-river",
            "--token",
            "secret",
            "-k",
            "--http-mode",
            "-H",
            "X-Forwarded-Proto: https",
            "-H",
            "Cookie:",
            "-R",
            "Host",
            "--max-transports",
            "3",
        ])
        .unwrap();

        assert_eq!(cli.log_format, LogFormat::Basic);
        let Commands::Connect(args) = cli.command;
        assert!(args.insecure);
        assert!(args.http_mode);
        assert_eq!(args.max_transports, 3);
        assert_eq!(args.rewrite_headers, vec![RewriteHeader::Host]);
        assert_eq!(
            args.replace_headers,
            vec![
                ("x-forwarded-proto".to_string(), "https".to_string()),
                ("cookie".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_invalid_rewrite_header_rejected() {
        let result = Cli::try_parse_from([
            "exposr",
            "connect",
            "http://localhost:3000",
            "--server",
            "https://broker.example.com",
            "--tunnel-id",
            "t",
            "--token",
            "t",
            "-R",
            "cookie",
        ]);
        assert!(result.is_err());
    }
}
