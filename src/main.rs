use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use web_proxy::config::loader::{load_config, ConfigError};
use web_proxy::config::validation::validate_config;
use web_proxy::lifecycle::{signals, Shutdown};
use web_proxy::net::Listener;
use web_proxy::observability::{logging, metrics};
use web_proxy::{ProxyConfig, ProxyServer};

#[derive(Parser)]
#[command(name = "web-proxy")]
#[command(about = "Multithreaded HTTP/1.1 forward proxy with CONNECT tunneling and response caching", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides listener.bind_address
    #[arg(short, long)]
    bind: Option<String>,

    /// Worker count, overrides pool.max_workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Queue length, overrides pool.queue_capacity
    #[arg(short, long)]
    queue: Option<usize>,

    /// Disable the response cache
    #[arg(long)]
    no_cache: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    fn resolve_config(&self) -> Result<ProxyConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ProxyConfig::default(),
        };
        if let Some(bind) = &self.bind {
            config.listener.bind_address = bind.clone();
        }
        if let Some(workers) = self.workers {
            config.pool.max_workers = workers;
        }
        if let Some(queue) = self.queue {
            config.pool.queue_capacity = queue;
        }
        if self.no_cache {
            config.cache.enabled = false;
        }
        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("web-proxy: invalid configuration: {e}");
            return ExitCode::from(2);
        }
    };

    if cli.print_config {
        return match toml::to_string_pretty(&config) {
            Ok(text) => {
                print!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("web-proxy: cannot render configuration: {e}");
                ExitCode::FAILURE
            }
        };
    }

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "web-proxy starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = match Listener::bind(&config.listener) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "Cannot start listener");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(shutdown.clone());

    let report = ProxyServer::new(config).run(listener, shutdown).await;
    tracing::info!(
        drained = report.drained,
        cancelled = report.cancelled,
        "Shutdown complete"
    );
    ExitCode::SUCCESS
}
