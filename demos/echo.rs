//! Connect to a WebSocket echo server and watch the event surface.
//!
//! ```sh
//! cargo run --example echo -- ws://127.0.0.1:9001
//! ```

use durawire::{events, ClientConfig, SendOptions, WireClient};
use serde_json::json;
use std::time::Duration;

#[tokio::main]
async fn main() -> durawire::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "durawire=debug".into()),
        )
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:9001".to_string());

    let client = WireClient::builder(ClientConfig::new(url)).build()?;

    client.on(events::OPEN, |_| println!("open"));
    client.on(events::MESSAGE, |data| println!("message: {}", data["data"]));
    client.on(events::CLOSE, |data| println!("close: {data}"));
    client.on(events::STATE_CHANGE, |data| {
        println!("state: {} -> {}", data["oldState"], data["newState"]);
    });

    client.connect().await?;
    client
        .send(json!({"type": "greeting", "text": "hello"}), SendOptions::default())
        .await?;

    tokio::time::sleep(Duration::from_secs(2)).await;
    println!("{}", client.generate_report());
    client.destroy().await;
    Ok(())
}
