//! Dynproxy - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use dynproxy::{CertificateStore, PoolConfig, ProxyServer, RedirectRuleTable, RouteStore, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Dynproxy - A dynamic HTTP/HTTPS reverse proxy
#[derive(Parser, Debug)]
#[command(name = "dynproxy")]
#[command(author = "Dynproxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "A dynamic HTTP/HTTPS reverse proxy")]
struct Args {
    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// HTTPS port to listen on
    #[arg(long, env = "HTTPS_PORT", default_value = "8443")]
    https_port: u16,

    /// Enable HTTPS server
    #[arg(long, env = "ENABLE_HTTPS", default_value = "false")]
    enable_https: bool,

    /// Force HTTPS redirect
    #[arg(long, env = "FORCE_HTTPS", default_value = "false")]
    force_https: bool,

    /// Route database path
    #[arg(long, env = "DB_PATH", default_value = "./data/routes.db")]
    db_path: PathBuf,

    /// Directory holding one JSON file per redirect rule
    #[arg(long, env = "REDIRECT_DIR", default_value = "./conf/redirect")]
    redirect_dir: PathBuf,

    /// Certificates directory
    #[arg(long, env = "CERTS_DIR", default_value = "./certs")]
    certs_dir: PathBuf,

    /// Periodic response flush in milliseconds (0 flushes every chunk)
    #[arg(long, env = "FLUSH_INTERVAL_MS", default_value = "0")]
    flush_interval_ms: u64,

    /// Maximum lifetime of a CONNECT tunnel in seconds
    #[arg(long, env = "TUNNEL_TIMEOUT_SECS", default_value = "300")]
    tunnel_timeout_secs: u64,

    /// Seconds between certificate renewal scans
    #[arg(long, env = "AUTORENEW_INTERVAL", default_value = "86400")]
    autorenew: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Run in production mode (ports 80/443)
    #[arg(long)]
    production: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();

    // Production mode overrides
    if args.production {
        args.http_port = 80;
        args.https_port = 443;
        args.enable_https = true;
    }

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

    info!("Starting Dynproxy v1.0.0");
    info!("HTTP port: {}", args.http_port);

    if args.enable_https {
        info!("HTTPS port: {}", args.https_port);
    }

    let routes = RouteStore::new(&args.db_path)?;
    info!("Route store initialized at: {}", args.db_path.display());

    let redirects = Arc::new(
        RedirectRuleTable::load(&args.redirect_dir)
            .with_context(|| format!("Failed to load redirect rules from {}", args.redirect_dir.display()))?,
    );
    info!("Loaded {} redirect rule(s)", redirects.list_all().len());

    let certs = Arc::new(CertificateStore::new(&args.certs_dir)?);
    info!("Certificate store initialized at: {}", args.certs_dir.display());

    let config = ServerConfig {
        http_port: args.http_port,
        https_port: args.https_port,
        enable_https: args.enable_https,
        force_https: args.force_https,
        flush_interval: Duration::from_millis(args.flush_interval_ms),
        tunnel_timeout: Duration::from_secs(args.tunnel_timeout_secs),
        autorenew_interval: Duration::from_secs(args.autorenew.max(1)),
        pool: PoolConfig::default(),
    };

    let server = Arc::new(ProxyServer::new(config, routes, redirects, certs)?);

    info!("Dynproxy started successfully");

    server.run().await?;

    Ok(())
}
