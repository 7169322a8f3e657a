use std::time::Duration;

use amqp_runtime::{BrokerOptions, EventKind, EventsPublisher};
use serde::Serialize;
use serde_json::json;

#[derive(Serialize)]
struct Greeting {
    message: Msg,
    context: Context,
}

#[derive(Serialize)]
struct Msg {
    text: String,
}

#[derive(Serialize)]
struct Context {
    execution_id: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let options = BrokerOptions::from_env().unwrap_or_else(|_| {
        BrokerOptions::new(["localhost"], "guest", "guest").expect("static host list is never empty")
    });

    let publisher = EventsPublisher::start(options, Some(Duration::from_secs(10)), None).await?;

    publisher
        .publish_message(
            &Greeting {
                message: Msg { text: "events publisher connected".into() },
                context: Context { execution_id: "demo-run".into() },
            },
            EventKind::Log,
        )
        .await?;

    publisher
        .publish_message(&json!({"type": "workflow_started", "workflow_id": "demo-run"}), EventKind::Event)
        .await?;

    publisher
        .publish_message(&json!({"hook": "pre_install", "workflow_id": "demo-run"}), EventKind::Hook)
        .await?;

    println!("published log/event/hook messages");
    publisher.close().await;
    Ok(())
}
