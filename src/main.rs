//! Prifma CLI - a configurable HTTP/HTTPS forward proxy

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use prifma::config::{ListenSchema, DEFAULT_CONFIG_PATH};
use prifma::{Config, ProxyServer};

#[derive(Parser)]
#[command(name = "prifma")]
#[command(about = "A configurable HTTP/HTTPS forward proxy")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;

    if cli.check {
        print_summary(&cli.config, &config);
        return Ok(());
    }

    init_logging(&cli.log_level, config.server.error_log.as_deref())?;
    tracing::info!(path = %cli.config.display(), "Configuration loaded");

    let server = ProxyServer::new(config)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutting down...");
        let _ = shutdown_tx.send(());
    });

    server.run_until_shutdown(shutdown_rx).await?;
    Ok(())
}

fn init_logging(level: &str, error_log: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match error_log {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("Failed to open error log '{}': {}", path.display(), e))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn print_summary(path: &Path, config: &Config) {
    let server = &config.server;
    let schema = match server.listen_schema {
        ListenSchema::Http => "http",
        ListenSchema::Https => "https",
    };
    let timeout = |t: Option<std::time::Duration>| {
        t.map_or_else(|| "disabled".to_string(), |d| format!("{:?}", d))
    };

    println!("Configuration is valid: {}", path.display());
    println!();
    println!("  Listen: {}://{}", schema, server.listen_addr());
    if let (Some(cert), Some(key)) = (&server.cert_file, &server.key_file) {
        println!("  Certificate: {}", cert.display());
        println!("  Private key: {}", key.display());
    }
    println!(
        "  Error log: {}",
        server
            .error_log
            .as_ref()
            .map_or_else(|| "stderr".to_string(), |p| p.display().to_string())
    );
    println!("  Read timeout: {}", timeout(server.read_timeout));
    println!("  Read header timeout: {}", timeout(server.read_header_timeout));
    println!("  Write timeout: {}", timeout(server.write_timeout));
    println!("  Idle timeout: {}", timeout(server.idle_timeout));
    println!("  Connect timeout: {}", timeout(server.connect_timeout));

    let modules: Vec<&str> = config
        .manager
        .root()
        .modules()
        .iter()
        .map(|m| m.directive())
        .collect();
    println!("  Modules: {}", modules.join(", "));
}
