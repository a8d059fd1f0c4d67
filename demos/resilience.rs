//! Resilience walkthrough against the in-process pair transport.
//!
//! An in-process "server" echoes frames and answers pings; the demo
//! queues traffic while offline, drops the link uncleanly, and lets the
//! reconnect loop bring the session back.
//!
//! ```sh
//! cargo run --example resilience
//! ```

use durawire::adapter::{pair, PairFrame};
use durawire::{events, AdapterKind, ClientConfig, Priority, SendOptions, WireClient};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> durawire::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("durawire=debug")
        .init();

    let (transport, peer) = pair();
    let peer = Arc::new(peer);

    // Toy server: echo everything, answer pings.
    let server_peer = peer.clone();
    tokio::spawn(async move {
        loop {
            if let PairFrame::Text(text) = server_peer.recv().await {
                if text.contains(r#""type":"ping""#) {
                    server_peer.send_text(r#"{"type":"pong"}"#);
                } else {
                    server_peer.send_text(text);
                }
            }
        }
    });

    let mut config = ClientConfig::new("pair://demo");
    config.adapter = AdapterKind::Pair;
    config.heartbeat.interval = Duration::from_millis(500);
    config.reconnect.delay = Duration::from_millis(200);
    let client = WireClient::builder(config)
        .transport(Box::new(transport))
        .build()?;

    client.on(events::MESSAGE, |data| println!("echoed: {}", data["data"]));
    client.on(events::RECONNECTING, |data| {
        println!("reconnecting, attempt {} in {}ms", data["attempt"], data["delay"]);
    });
    client.on(events::RECONNECTED, |data| {
        println!("reconnected after {} attempts", data["attempts"]);
    });

    // Queued while offline, flushed on open in priority order.
    client
        .send(json!({"note": "urgent"}), SendOptions::priority(Priority::High))
        .await?;
    client
        .send(json!({"note": "whenever"}), SendOptions::priority(Priority::Low))
        .await?;
    println!("queued {} messages before connecting", client.queue_size());

    client.connect().await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Unclean drop: the reconnect loop takes over.
    println!("dropping the link uncleanly...");
    peer.close(Some(1006), "simulated outage", false);
    tokio::time::sleep(Duration::from_secs(1)).await;

    println!("state: {}", client.state());
    println!("{}", client.generate_report());
    client.destroy().await;
    Ok(())
}
