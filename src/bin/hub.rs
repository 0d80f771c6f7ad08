use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use clap::Parser;
use metrics_hub::config::{Config, RemoteConfig, StorageConfig, read_config_file};
use metrics_hub::lifecycle::spawn_signal_listener;
use metrics_hub::server::Server;
use tracing::{info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(version, about = "Scrapes metrics targets, stores samples and evaluates rules")]
struct Args {
    /// Configuration file
    #[arg(short = 'f', long, default_value = "metrics-hub.json")]
    config_file: String,

    /// Only log messages with the given severity or above
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path of the SQLite database, overrides the configured storage
    #[arg(long)]
    storage_path: Option<PathBuf>,

    /// Remote storage endpoint accepting OpenTSDB put JSON
    #[arg(long)]
    remote_url: Option<String>,

    /// Seconds to wait for in-flight work during shutdown
    #[arg(long)]
    shutdown_grace_period: Option<u64>,

    /// Number of sample batches buffered between producers and storage
    #[arg(long)]
    samples_queue_capacity: Option<usize>,

    /// Alertmanager to send notifications to
    #[arg(long)]
    alertmanager_url: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(path) = &self.storage_path {
            config.storage = StorageConfig::Sqlite { path: path.clone() };
        }
        if let Some(url) = &self.remote_url {
            match &mut config.remote {
                Some(remote) => remote.url = url.clone(),
                None => config.remote = Some(RemoteConfig::new(url.clone())),
            }
        }
        if let Some(secs) = self.shutdown_grace_period {
            config.shutdown_grace_period_secs = secs;
        }
        if let Some(capacity) = self.samples_queue_capacity {
            config.samples_queue_capacity = capacity;
        }
        if let Some(url) = &self.alertmanager_url {
            config.alertmanager_url = Some(url.clone());
        }
    }

    /// Flags as given on the command line, for the status API
    fn flags(&self) -> BTreeMap<String, String> {
        let mut flags = BTreeMap::from([
            ("config-file".to_string(), self.config_file.clone()),
            ("log-level".to_string(), self.log_level.clone()),
        ]);

        let optional = [
            ("storage-path", self.storage_path.as_ref().map(|p| p.display().to_string())),
            ("remote-url", self.remote_url.clone()),
            ("shutdown-grace-period", self.shutdown_grace_period.map(|s| s.to_string())),
            ("samples-queue-capacity", self.samples_queue_capacity.map(|c| c.to_string())),
            ("alertmanager-url", self.alertmanager_url.clone()),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                flags.insert(name.to_string(), value);
            }
        }

        flags
    }
}

fn init(level: LevelFilter) {
    let filter = filter::Targets::new().with_targets(vec![
        ("metrics_hub", level),
        ("tower_http", level),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = LevelFilter::from_str(&args.log_level)
        .with_context(|| format!("invalid log level {:?}", args.log_level))?;
    init(level);
    trace!("started with args: {args:?}");

    info!("starting {} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let mut config = read_config_file(&args.config_file)?;
    args.apply(&mut config);
    config
        .validate()
        .context("invalid configuration after applying command line flags")?;

    let server = Server::start(config, args.flags()).await?;
    spawn_signal_listener(server.shutdown_handle());

    let report = server.serve().await?;

    if !report.shutdown.failed_steps.is_empty() {
        warn!(
            "shutdown after {} finished with failed steps: {}",
            report.shutdown.trigger,
            report.shutdown.failed_steps.join(", ")
        );
    }
    match report.fan_out {
        Some(fan_out) => info!(
            "stopped after {:?}: {} batches received, {} samples stored",
            report.shutdown.elapsed, fan_out.batches_received, fan_out.samples_appended
        ),
        None => warn!(
            "stopped after {:?} with the fan-out loop abandoned",
            report.shutdown.elapsed
        ),
    }

    Ok(())
}
