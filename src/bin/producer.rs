//! Demo producer
//!
//! Injects demonstration messages into a two-step `foo` -> `bar` route, the
//! counterpart to the demo worker service.

use clap::Parser;
use serde_json::json;
use tracing::{error, info};
use waybill::component::Component;
use waybill::config::BrokerSection;
use waybill::observability::init_default_logging;
use waybill::payload::{
    Arguments, Document, Documents, Encoding, Message, MetaData, Routing, Step,
};
use waybill::MqttBroker;

/// Routing-slip demo producer
#[derive(Parser)]
#[command(name = "waybill-producer")]
#[command(about = "Send demo routing-slip messages to a broker")]
#[command(version)]
struct Cli {
    /// MQTT broker URL
    #[arg(long, env = "WAYBILL_BROKER_URL", default_value = "mqtt://127.0.0.1:1883")]
    broker_url: String,

    /// Number of demo messages to send
    #[arg(long, default_value_t = 1)]
    total: usize,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    if let Err(err) = run(cli).await {
        error!("producer failed: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let section = BrokerSection {
        broker_url: cli.broker_url,
        queue: None,
        username_env: None,
        password_env: None,
        prefetch: 1,
    };

    let component = Component::producer(MqttBroker::new(section));
    component.connect().await?;

    for index in 0..cli.total {
        let message = demo_message(index);
        component.send_message(&message).await?;
        info!(trace_id = %message.trace_id, index, "sent demo message");
    }

    component.close().await;
    info!(total = cli.total, "all demo messages published");
    Ok(())
}

fn demo_message(index: usize) -> Message {
    Message::new(
        Routing {
            name: "demo".to_string(),
            position: 0,
            slip: vec![
                Step {
                    queue: "foo".to_string(),
                    arguments: Arguments::from([("duration".to_string(), json!(1000))]),
                    ..Step::default()
                },
                Step {
                    queue: "bar".to_string(),
                    arguments: Arguments::from([("duration".to_string(), json!(2000))]),
                    ..Step::default()
                },
            ],
        },
        MetaData::from([("origin".to_string(), json!("waybill-producer"))]),
        Documents::from([(
            "input".to_string(),
            Document::new(
                format!("Hello world message {index}!"),
                "text/plain",
                Encoding::None,
            ),
        )]),
    )
}
