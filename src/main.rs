//! veiltls - TLS-camouflage relay daemon

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use veiltls::config::{LogLevel, RelayConfig};
use veiltls::proxy::ForwardHandler;
use veiltls::stats::Stats;
use veiltls::transport::TcpDialer;
use veiltls::Service;

/// Parse command-line arguments.
///
/// Usage: veiltls [config_path] [--silent] [--log-level <level>]
///
/// Returns (config_path, silent_flag, log_level_override)
fn parse_cli() -> (String, bool, Option<String>) {
    let mut config_path = "config.toml".to_string();
    let mut silent = false;
    let mut log_level: Option<String> = None;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--silent" | "-s" => {
                silent = true;
            }
            "--log-level" => {
                i += 1;
                if i < args.len() {
                    log_level = Some(args[i].clone());
                }
            }
            s if s.starts_with("--log-level=") => {
                log_level = Some(s.trim_start_matches("--log-level=").to_string());
            }
            "--help" | "-h" => {
                eprintln!("Usage: veiltls [config.toml] [OPTIONS]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --silent, -s            Suppress info logs (only warn/error)");
                eprintln!("  --log-level <LEVEL>     Set log level: debug|verbose|normal|silent");
                eprintln!("  --help, -h              Show this help");
                std::process::exit(0);
            }
            s if !s.starts_with('-') => {
                config_path = s.to_string();
            }
            other => {
                eprintln!("Unknown option: {}", other);
            }
        }
        i += 1;
    }

    (config_path, silent, log_level)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Parse CLI arguments
    let (config_path, cli_silent, cli_log_level) = parse_cli();

    // 2. Load config (tracing not yet initialized, errors go to stderr)
    let config = match RelayConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            if std::path::Path::new(&config_path).exists() {
                eprintln!("[veiltls] Error: Failed to load config '{}': {}", config_path, e);
                std::process::exit(1);
            } else {
                let default = RelayConfig::default();
                let toml_str = toml::to_string_pretty(&default).unwrap();
                std::fs::write(&config_path, toml_str).unwrap();
                eprintln!("[veiltls] Created default config at {}", config_path);
                default
            }
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("[veiltls] Error: Invalid configuration: {}", e);
        std::process::exit(1);
    }

    // 3. Determine effective log level
    //    Priority: RUST_LOG env > CLI flags > config file > default (normal)
    let effective_log_level = if cli_silent {
        LogLevel::Silent
    } else if let Some(ref level_str) = cli_log_level {
        LogLevel::from_str_loose(level_str)
    } else {
        config.log_level.clone()
    };

    // 4. Initialize tracing
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(effective_log_level.to_filter_str())
    };

    fmt().with_env_filter(filter).init();

    // 5. Log startup info
    info!("veiltls v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", effective_log_level);
    info!("Protocol version: {}", config.version);
    info!("Cover host: {}", config.cover_addr);
    info!("Forwarding tunnels to: {}", config.forward_addr);
    info!("Users: {}", config.users.len());

    if config.users.values().any(|p| p == "change-this-password") {
        warn!("Default password still configured. Set a real one before exposing this relay.");
    }
    if config.cover_addr == "www.google.com:443" {
        warn!("Using default cover host (www.google.com). Consider a domain that fits your traffic.");
    }

    let stats = Arc::new(Stats::new());
    let dialer = TcpDialer::new(Duration::from_secs(config.cover_connect_timeout));
    let handler = Arc::new(ForwardHandler::new(
        config.forward_addr.clone(),
        Duration::from_secs(config.forward_connect_timeout),
        stats.clone(),
    ));

    let service = Arc::new(Service::new(
        config.version,
        config.users_vec(),
        config.cover_addr.clone(),
        dialer,
        handler,
        stats.clone(),
    )?);

    // 6. Bind listener
    let listener = TcpListener::bind(&config.listen).await?;
    info!("Listening on {}", config.listen);

    // 7. Accept loop
    let accept_service = service.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer_addr, error = %e, "Failed to set nodelay");
                    }
                    let service = accept_service.clone();
                    tokio::spawn(async move {
                        if let Err(e) = service.accept(stream, peer_addr).await {
                            debug!(peer = %peer_addr, error = %e, "Session error");
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    });

    // 8. Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => info!(
            "Shutting down after {:.0}s, {} sessions ({} tunnels, {} fallbacks)",
            stats.uptime_secs(),
            stats.sessions(),
            stats.tunnels(),
            stats.fallbacks()
        ),
        Err(e) => error!("Signal error: {}", e),
    }

    Ok(())
}
