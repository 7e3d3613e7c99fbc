//! Webfront - Main entry point
//!
//! Serves files or reverse-proxies each request according to a JSON rule file

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use webfront::config::{parse_interval, parse_listen_addr};
use webfront::metrics::{self, PrometheusHits};
use webfront::{
    CertificateManager, Dispatcher, FrontServer, HitRecorder, HostPolicy, NoopHits, Reloader,
    RuleSource, RuleTable, ServerConfig, Shutdown,
};

/// Webfront - an HTTP server and reverse proxy routed by host
#[derive(Parser, Debug)]
#[command(name = "webfront")]
#[command(version)]
#[command(about = "Serve files or reverse-proxy requests according to a host rule file")]
struct Args {
    /// HTTP listen address
    #[arg(long = "http", env = "HTTP_ADDR", default_value = ":80", value_parser = listen_addr)]
    http_addr: std::net::SocketAddr,

    /// HTTPS listen address (used only with a certificate cache)
    #[arg(long = "https", env = "HTTPS_ADDR", default_value = ":443", value_parser = listen_addr)]
    https_addr: std::net::SocketAddr,

    /// Rule definition file
    #[arg(long, env = "RULES_FILE")]
    rules: PathBuf,

    /// Rule file poll interval
    #[arg(long, env = "POLL_INTERVAL", default_value = "10s", value_parser = interval)]
    poll: Duration,

    /// Directory for self-signed certificates (HTTPS is disabled without it)
    #[arg(long, env = "CERT_CACHE")]
    cert_cache: Option<PathBuf>,

    /// Metrics HTTP listen address
    #[arg(long = "metrics", env = "METRICS_ADDR", value_parser = listen_addr)]
    metrics_addr: Option<std::net::SocketAddr>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn listen_addr(text: &str) -> Result<std::net::SocketAddr, String> {
    parse_listen_addr(text).map_err(|e| e.to_string())
}

fn interval(text: &str) -> Result<Duration, String> {
    parse_interval(text).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting webfront v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig {
        http_addr: args.http_addr,
        https_addr: args.https_addr,
        rules_file: args.rules,
        poll_interval: args.poll,
        cert_cache: args.cert_cache,
        metrics_addr: args.metrics_addr,
    };
    config.validate()?;

    // The first load is fatal: never serve with an unknown rule set.
    let source = RuleSource::new(&config.rules_file);
    let table = Arc::new(RuleTable::open(&source).context("Failed to load rules")?);
    info!(
        "Loaded {} rules from {}",
        table.snapshot().len(),
        config.rules_file.display()
    );

    let shutdown = Shutdown::new();

    let hits: Arc<dyn HitRecorder> = match config.metrics_addr {
        Some(addr) => {
            let handle = metrics::install_recorder()?;
            metrics::record_reload(table.snapshot().len());
            let rx = shutdown.subscribe();
            tokio::spawn(async move {
                if let Err(e) = metrics::serve_metrics(addr, handle, rx).await {
                    error!("Metrics server failed: {:#}", e);
                }
            });
            Arc::new(PrometheusHits)
        }
        None => Arc::new(NoopHits),
    };

    let reloader = Reloader::new(source, table.clone(), config.poll_interval)?;
    info!("Polling rules every {:?}", reloader.interval());
    let reloader_task = reloader.spawn(shutdown.subscribe());

    let certs = match &config.cert_cache {
        Some(dir) => {
            let manager = CertificateManager::new(dir, HostPolicy::new(table.clone()))?;
            info!("Certificate cache at: {}", manager.cache_dir().display());
            Some(Arc::new(manager))
        }
        None => None,
    };

    let dispatcher = Dispatcher::new(table, hits);
    let server = Arc::new(FrontServer::new(config, dispatcher, certs));

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal.trigger();
        }
    });

    server.run(shutdown).await?;
    let _ = reloader_task.await;

    info!("webfront stopped");
    Ok(())
}
