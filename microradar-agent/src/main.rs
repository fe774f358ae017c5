//! microradar - lightweight container observability agent
//!
//! Interactive mode renders the terminal dashboard; daemon mode serves the
//! HTTP health/status/metrics surface instead.

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use microradar_agent::config::{self, Config};
use microradar_agent::dashboard::Dashboard;
use microradar_agent::http;
use microradar_agent::loader::{discover_interfaces, Monitor};
use tokio::signal;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "microradar")]
#[command(version = microradar_agent::VERSION)]
#[command(about = "eBPF-based container observability agent", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.yaml", help = "Configuration file path")]
    config: PathBuf,

    #[arg(short, long, help = "Run headless and serve HTTP metrics")]
    daemon: bool,

    #[arg(long, help = "HTTP listen address in daemon mode", default_value = http::DEFAULT_ADDR)]
    http_addr: String,

    #[arg(long, help = "Write a default config.yaml and exit")]
    init: bool,

    #[arg(
        short,
        long,
        help = "Network interface for tc attachment (repeatable; auto-discovered when omitted)"
    )]
    interface: Vec<String>,

    #[arg(short, long, help = "Enable verbose logging")]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    if cli.init {
        if cli.config.exists() {
            eprintln!("{} already exists, not overwriting", cli.config.display());
            process::exit(1);
        }
        if let Err(e) = std::fs::write(&cli.config, config::default_yaml()) {
            eprintln!("cannot write {}: {}", cli.config.display(), e);
            process::exit(1);
        }
        println!("default configuration written to {}", cli.config.display());
        return;
    }

    // Configuration validation failures are fatal before anything attaches.
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(2);
        }
    };

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.system.log_level.clone()
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    if let Err(e) = run(cli, config) {
        error!("{:#}", e);
        process::exit(1);
    }
}

#[tokio::main]
async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    info!("microradar v{} starting", microradar_agent::VERSION);

    let interfaces = if cli.interface.is_empty() {
        let discovered = discover_interfaces();
        if discovered.is_empty() {
            warn!("no interfaces discovered; network telemetry will be idle");
        }
        discovered
    } else {
        cli.interface.clone()
    };

    let monitor = Monitor::new(config.clone(), interfaces);
    monitor
        .start()
        .await
        .context("probe attachment failed")?;

    if cli.daemon {
        let state = http::AppState {
            monitor: monitor.clone(),
        };
        let addr = cli.http_addr.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = http::serve(&addr, state).await {
                error!("HTTP server terminated: {}", e);
            }
        });

        signal::ctrl_c().await?;
        info!("shutdown signal received");
        server.abort();
    } else {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let store = monitor.store();
        let refresh = config.display.refresh_rate;
        let thresholds = config.monitoring.alert_thresholds.clone();
        let mut ui = tokio::task::spawn_blocking(move || {
            let mut dashboard = Dashboard::new(store, refresh, thresholds);
            dashboard.run(shutdown_rx)
        });

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
                let _ = (&mut ui).await;
            }
            result = &mut ui => {
                if let Ok(Err(e)) = result {
                    error!("dashboard terminated: {}", e);
                }
            }
        }
    }

    monitor.stop().await?;
    info!("microradar stopped");
    Ok(())
}
