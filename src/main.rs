use std::process::ExitCode;
use std::sync::Arc;

use config::LogshipConfig;
use metrics::Metrics;
use moby::MobyClient;
use sampler::Sampler;
use system::{Settings, System};
use writer::LogstashWriter;
use writer::resolve::DnsResolver;

mod checkpoint;
mod cli;
mod config;
mod container;
mod metrics;
mod moby;
mod sampler;
mod signals;
mod system;
mod watcher;
mod worker;
mod writer;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize the logger
    env_logger::init();

    let config = match LogshipConfig::try_init() {
        Ok(config) => config,
        Err(err) => {
            log::error!("Unable to read config file: {err}");
            return ExitCode::FAILURE;
        }
    };

    let metrics = match Metrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(err) => {
            log::error!("Unable to register metrics: {err}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match MobyClient::connect() {
        Ok(client) => Arc::new(client),
        Err(err) => {
            log::error!("Unable to connect to the container runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    let resolver = match DnsResolver::from_system_conf() {
        Ok(resolver) => Arc::new(resolver),
        Err(err) => {
            log::error!("Unable to set up DNS resolution: {err}");
            return ExitCode::FAILURE;
        }
    };

    if config.enable_metrics {
        let metrics = metrics.clone();
        let port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(err) = metrics::server::start_metrics_server(metrics, port).await {
                log::error!("Metrics server failed: {err}");
            }
        });
    }

    let writer = LogstashWriter::new(
        config.logstash_server,
        config.backlog_size,
        config.shutdown_drain_timeout,
        resolver,
        metrics.clone(),
    );
    for key in &config.sample_keys {
        log::info!("Sampling lines matching {:?} as {:?}", key.pattern(), key.label());
    }
    let sampler = Arc::new(Sampler::new(
        config.sample_keys,
        config.sample_ratio,
        metrics.clone(),
    ));
    let system = System::new(
        runtime,
        sampler,
        writer,
        metrics,
        Settings {
            state_file: config.state_file,
            checkpoint_interval: config.checkpoint_interval,
        },
    );

    if let Err(err) = signals::handle_signals(system.handle(), tokio::runtime::Handle::current()) {
        log::error!("Unable to install signal handlers: {err}");
        return ExitCode::FAILURE;
    }

    match system.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("System failed: {err}");
            ExitCode::FAILURE
        }
    }
}
