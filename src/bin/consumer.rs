//! Demo worker service
//!
//! Consumes a routing-slip queue and runs a demonstration operator: it
//! sleeps for the step's `duration` argument (milliseconds) and emits an
//! output document carrying the trace id. Useful for exercising a pipeline
//! end to end without real business logic.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use waybill::component::{Component, Operator, OperatorError, OperatorOutput};
use waybill::config::ComponentConfig;
use waybill::observability::init_default_logging;
use waybill::payload::{Arguments, Document, Documents, Encoding, MetaData};
use waybill::MqttBroker;

/// Routing-slip demo worker
#[derive(Parser)]
#[command(name = "waybill-consumer")]
#[command(about = "Consume a routing-slip queue with a demo operator")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!("failed to load configuration: {err}");
            process::exit(1);
        }
    };

    if let Err(err) = run(config).await {
        error!("consumer failed: {err}");
        process::exit(1);
    }

    info!("consumer shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ComponentConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("loading configuration from: {}", path.display());
            Ok(ComponentConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["waybill.toml", "config/waybill.toml"];

            for path_str in default_paths {
                let path = Path::new(path_str);
                if path.exists() {
                    info!("loading configuration from: {}", path.display());
                    return Ok(ComponentConfig::load_from_file(path)?);
                }
            }

            Err("no configuration file found; provide one with -c/--config or create waybill.toml"
                .into())
        }
    }
}

async fn run(config: ComponentConfig) -> Result<(), Box<dyn std::error::Error>> {
    let prefetch = config.broker.prefetch;
    let workers = config.component.workers;
    let broker = MqttBroker::new(config.broker);

    let mut component = Component::consumer(broker, workers, DemoOperator).with_prefetch(prefetch);
    component.run().await?;

    info!(workers, "consumer running, waiting for deliveries");

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = signal::ctrl_c() => info!("received SIGINT, shutting down gracefully"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down gracefully"),
    }

    component.shutdown().await;
    Ok(())
}

/// Sleeps per the step's `duration` argument and emits a document (named by
/// the `docid` argument, default `output`) containing the trace id.
struct DemoOperator;

#[async_trait::async_trait]
impl Operator for DemoOperator {
    async fn process(
        &self,
        trace_id: &str,
        _metadata: &MetaData,
        arguments: &Arguments,
        documents: &Documents,
    ) -> Result<OperatorOutput, OperatorError> {
        info!(trace_id = %trace_id, documents = documents.len(), "received message");

        if let Some(value) = arguments.get("duration") {
            let millis = value
                .as_u64()
                .ok_or("duration argument must be a number of milliseconds")?;
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }

        let name = arguments
            .get("docid")
            .and_then(|value| value.as_str())
            .unwrap_or("output")
            .to_string();

        let mut output = Documents::new();
        output.insert(name, Document::new(trace_id, "text/plain", Encoding::None));

        Ok(OperatorOutput::with_documents(output))
    }
}
