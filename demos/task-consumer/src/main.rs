use std::time::Duration;

use amqp_runtime::{ActorHandle, BrokerOptions, TaskConsumer, TaskHandler};
use async_trait::async_trait;
use lapin::ExchangeKind;
use serde_json::{json, Value};
use std::sync::Arc;

struct Echo;

#[async_trait]
impl TaskHandler for Echo {
    async fn handle_task(&self, payload: Value) -> Result<Value, String> {
        log::info!("task-consumer: handling payload={payload}");
        Ok(json!({"ok": true, "echo": payload}))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let options = BrokerOptions::from_env().unwrap_or_else(|_| {
        BrokerOptions::new(["localhost"], "guest", "guest").expect("static host list is never empty")
    });

    let consumer: Arc<dyn amqp_runtime::Handler> =
        Arc::new(TaskConsumer::new("demo-tasks", ExchangeKind::Direct, "echo", Echo).with_pool_size(5));

    let handle = ActorHandle::start(options, vec![consumer], Some(Duration::from_secs(10)), None).await?;

    println!("task consumer running; Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    handle.close(true).await;
    Ok(())
}
