//! Epok Forwarder - Main entry point
//!
//! Declarative TCP/UDP/HTTP/HTTPS forwarder with layered firewall and hot reload

use anyhow::{Context, Result};
use clap::Parser;
use epok_forwarder::geo::{self, CountryResolver, NoCountries};
use epok_forwarder::{cli, AdminServer, Config, Forwarder, Reloader};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Epok Forwarder - forward ports and hostnames to backend hosts
#[derive(Parser, Debug)]
#[command(name = "epok-forwarder")]
#[command(version)]
#[command(about = "Forward TCP/UDP ports, HTTP hosts and HTTPS SNI names to backend hosts")]
struct Args {
    /// Config file
    #[arg(short = 'c', long, env = "EPOK_CONFIG", default_value = "config.yml")]
    config: PathBuf,

    /// Ask a running instance to hot reload its config, then exit
    #[arg(short = 'r', long)]
    reload: bool,

    /// Write the reload client credentials file from the config, then exit
    #[arg(short = 'g', long)]
    generate: bool,

    /// GeoIP country database, downloaded when missing
    #[arg(long, env = "EPOK_GEO_DB")]
    geo_db: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
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

    if args.reload {
        let client = cli::ReloadClient::from_env()?;
        let body = client.reload().await?;
        info!("Success hot reload: {}", body);
        return Ok(());
    }

    let config = Config::load(&args.config)
        .await
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    if args.generate {
        cli::generate(&config.base, &cli::env_file()?)?;
        return Ok(());
    }

    let geo_path = args.geo_db.unwrap_or_else(geo::default_db_path);
    let needs_geo = config.uses_countries()?;
    let geo: Arc<dyn CountryResolver> = match geo::setup(&geo_path).await {
        Ok(db) => {
            info!("GeoIP database loaded from {}", geo_path.display());
            Arc::new(db)
        }
        Err(e) if needs_geo => {
            return Err(e).context("country firewall rules need the GeoIP database");
        }
        Err(e) => {
            warn!("GeoIP unavailable, no country rules configured: {}", e);
            Arc::new(NoCountries)
        }
    };

    info!("Starting forwarder...");
    let api = config.base.api_listen_addr();
    let forwarder = Forwarder::start(config, geo.clone())
        .await
        .context("failed to start forwarder")?;
    info!("All listeners are on.");

    let reloader = Arc::new(Reloader::new(&args.config, geo, forwarder));
    let server = AdminServer::bind(&api, reloader.clone())
        .await
        .with_context(|| format!("failed to bind admin API on {}", api))?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("A fatal error has occurred: {}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            if let Err(e) = reloader.shutdown().await {
                warn!("Shutdown: {}", e);
            }
        }
    }

    Ok(())
}
