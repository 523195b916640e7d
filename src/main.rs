use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod monitor;
mod network;
mod scheduler;
mod status;

use config::AppConfig;
use monitor::{ConnectivityMonitor, ConnectivityState};
use network::HttpHealthProbe;
use status::StatusBoard;

#[derive(Debug, Parser)]
#[command(name = "crm-connectivity", version, about = "Watches CRM backend reachability")]
struct Cli {
    /// TOML config file; the embedded defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the backend base URL from the config
    #[arg(long)]
    backend_url: Option<String>,

    /// Run one probe cycle, print the result and exit
    #[arg(long)]
    once: bool,

    /// Log filter directive, e.g. `debug` or `crm_connectivity=trace`
    #[arg(long)]
    log_filter: Option<String>,
}

fn init_tracing(cli_filter: Option<&str>, config_filter: &str) {
    let filter = match cli_filter {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config_filter)),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load_default()?,
    };
    init_tracing(cli.log_filter.as_deref(), &config.logging.filter);

    let base_url = cli.backend_url.clone().unwrap_or_else(|| config.resolved_base_url());
    let probe = HttpHealthProbe::new(&base_url).context("building HTTP client")?;
    info!("Starting crm-connectivity against {}", probe.url());

    let (tx, rx) = watch::channel(ConnectivityState::Unknown);
    let monitor = ConnectivityMonitor::new(config.monitor.clone(), Arc::new(probe), Arc::new(tx));

    if cli.once {
        let mut monitor = monitor;
        let state = monitor.check_now().await;
        println!("{}", status::indicator(state));
        return Ok(match state {
            ConnectivityState::Connected => ExitCode::SUCCESS,
            _ => ExitCode::from(2),
        });
    }

    let board = StatusBoard::new(config.logging.history);
    let follower = {
        let board = board.clone();
        tokio::spawn(async move { board.follow(rx).await })
    };

    let handle = monitor.mount();

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutting down");

    // the sender lives in the monitor task, so teardown also ends the follower
    handle.teardown();
    if let Err(e) = follower.await {
        tracing::error!("status board task failed: {:#?}", e);
    }

    let transitions = board.history().await.len();
    match board.latest().await {
        Some(last) => info!(
            "{} connectivity transitions, last: {:?} -> {:?}",
            transitions, last.from, last.to
        ),
        None => info!("no connectivity transitions observed"),
    }

    Ok(ExitCode::SUCCESS)
}
