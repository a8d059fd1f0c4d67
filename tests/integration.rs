//! End-to-end scenarios for durawire.
//!
//! Every test drives a full client against the in-process pair
//! transport: the peer side plays the remote server, reading what hit
//! the wire and injecting inbound frames.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use durawire::adapter::{pair, PairFrame, PairPeer};
use durawire::{
    events, AckOptions, AdapterKind, ClientConfig, ConnectionState, Priority, SendOptions,
    WireClient, WireError, HEARTBEAT_CLOSE_CODE,
};

fn base_config() -> ClientConfig {
    let mut config = ClientConfig::new("pair://test");
    config.adapter = AdapterKind::Pair;
    config.connection_timeout = Duration::from_millis(500);
    config.heartbeat.enabled = false;
    config.reconnect.enabled = false;
    config
}

fn client_with(config: ClientConfig) -> (WireClient, PairPeer) {
    let (transport, peer) = pair();
    let client = WireClient::builder(config)
        .transport(Box::new(transport))
        .build()
        .expect("client builds");
    (client, peer)
}

/// Poll until `cond` holds or the deadline passes.
async fn wait_for(cond: impl Fn() -> bool, deadline: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Scenario: basic round trip. One outbound frame hits the wire as
/// plain JSON text; one inbound frame surfaces as a `message` event.
#[tokio::test]
async fn test_basic_round_trip() {
    let (client, peer) = client_with(base_config());
    let messages = Arc::new(Mutex::new(Vec::<Value>::new()));
    let messages_clone = messages.clone();
    client.on(events::MESSAGE, move |data| {
        messages_clone.lock().unwrap().push(data["data"].clone());
    });

    client.connect().await.unwrap();
    client.send(json!({"type": "hi"}), SendOptions::default()).await.unwrap();

    assert_eq!(
        peer.recv().await,
        PairFrame::Text(r#"{"type":"hi"}"#.to_string())
    );

    peer.send_text(r#"{"type":"echo","v":1}"#);
    assert!(
        wait_for(|| !messages.lock().unwrap().is_empty(), Duration::from_secs(1)).await,
        "message event did not arrive"
    );
    let messages = messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0], json!({"type": "echo", "v": 1}));
}

/// Scenario: offline queueing. Sends before connect are buffered and
/// flushed after `open`, in priority-then-FIFO order.
#[tokio::test]
async fn test_offline_queueing_flushes_in_priority_order() {
    let (client, peer) = client_with(base_config());
    let opened = Arc::new(AtomicUsize::new(0));
    let opened_clone = opened.clone();
    client.on(events::OPEN, move |_| {
        opened_clone.fetch_add(1, Ordering::SeqCst);
    });

    client
        .send(json!({"a": 1}), SendOptions::priority(Priority::High))
        .await
        .unwrap();
    client
        .send(json!({"a": 2}), SendOptions::priority(Priority::Low))
        .await
        .unwrap();
    client
        .send(json!({"a": 3}), SendOptions::priority(Priority::Normal))
        .await
        .unwrap();
    assert_eq!(client.queue_size(), 3);

    client.connect().await.unwrap();
    assert_eq!(opened.load(Ordering::SeqCst), 1);

    let mut order = Vec::new();
    for _ in 0..3 {
        match peer.recv().await {
            PairFrame::Text(text) => order.push(text),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    assert_eq!(
        order,
        vec![
            r#"{"a":1}"#.to_string(),
            r#"{"a":3}"#.to_string(),
            r#"{"a":2}"#.to_string(),
        ]
    );
    assert_eq!(client.queue_size(), 0);
}

/// Scenario: exponential backoff. Five failing attempts at delays
/// 100/200/400/800/1000, then exactly one `reconnect-failed`.
#[tokio::test]
async fn test_exponential_backoff_ladder_and_exhaustion() {
    let mut config = base_config();
    config.reconnect.enabled = true;
    config.reconnect.delay = Duration::from_millis(100);
    config.reconnect.max_delay = Duration::from_millis(1_000);
    config.reconnect.factor = 2.0;
    config.reconnect.jitter = 0.0;
    config.reconnect.max_attempts = 5;
    let (client, peer) = client_with(config);
    peer.refuse_next(100);

    let delays = Arc::new(Mutex::new(Vec::<u64>::new()));
    let delays_clone = delays.clone();
    client.on(events::RECONNECTING, move |data| {
        delays_clone.lock().unwrap().push(data["delay"].as_u64().unwrap());
    });
    let failed = Arc::new(Mutex::new(Vec::<Value>::new()));
    let failed_clone = failed.clone();
    client.on(events::RECONNECT_FAILED, move |data| {
        failed_clone.lock().unwrap().push(data.clone());
    });

    // Absorbed into the reconnect loop, not surfaced.
    client.connect().await.unwrap();

    assert!(
        wait_for(|| !failed.lock().unwrap().is_empty(), Duration::from_secs(5)).await,
        "reconnect-failed never fired"
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(*delays.lock().unwrap(), vec![100, 200, 400, 800, 1_000]);
    let failed = failed.lock().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["attempts"], json!(5));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

/// Reconnect with `max_attempts = 0` keeps retrying and succeeds once
/// the peer accepts again; `reconnected` reports the attempt count.
#[tokio::test]
async fn test_unbounded_reconnect_eventually_succeeds() {
    let mut config = base_config();
    config.reconnect.enabled = true;
    config.reconnect.delay = Duration::from_millis(20);
    config.reconnect.max_delay = Duration::from_millis(40);
    config.reconnect.factor = 2.0;
    config.reconnect.jitter = 0.0;
    config.reconnect.max_attempts = 0;
    let (client, peer) = client_with(config);

    let reconnected = Arc::new(Mutex::new(Vec::<Value>::new()));
    let reconnected_clone = reconnected.clone();
    client.on(events::RECONNECTED, move |data| {
        reconnected_clone.lock().unwrap().push(data.clone());
    });
    let failed = Arc::new(AtomicUsize::new(0));
    let failed_clone = failed.clone();
    client.on(events::RECONNECT_FAILED, move |_| {
        failed_clone.fetch_add(1, Ordering::SeqCst);
    });

    peer.refuse_next(3);
    client.connect().await.unwrap();

    assert!(
        wait_for(|| !reconnected.lock().unwrap().is_empty(), Duration::from_secs(2)).await,
        "client never reconnected"
    );
    assert!(client.is_connected());
    assert_eq!(failed.load(Ordering::SeqCst), 0);
    // Three refusals scheduled three attempts; the third retry landed.
    assert_eq!(reconnected.lock().unwrap()[0]["attempts"], json!(3));
}

/// Scenario: heartbeat death. A silent peer costs one interval plus one
/// pong timeout, then the client closes with 4001 and starts
/// reconnecting.
#[tokio::test]
async fn test_heartbeat_timeout_drops_connection() {
    let mut config = base_config();
    config.heartbeat.enabled = true;
    config.heartbeat.interval = Duration::from_millis(50);
    config.heartbeat.timeout = Duration::from_millis(30);
    config.heartbeat.message = json!({"type": "p"});
    config.heartbeat.pong_type = "P".to_string();
    config.reconnect.enabled = true;
    config.reconnect.delay = Duration::from_millis(5_000);
    let (client, peer) = client_with(config);

    let closes = Arc::new(Mutex::new(Vec::<Value>::new()));
    let closes_clone = closes.clone();
    client.on(events::CLOSE, move |data| {
        closes_clone.lock().unwrap().push(data.clone());
    });
    let pings = Arc::new(AtomicUsize::new(0));
    let pings_clone = pings.clone();
    client.on(events::PING, move |_| {
        pings_clone.fetch_add(1, Ordering::SeqCst);
    });

    client.connect().await.unwrap();

    // Probe at ~50ms, pong timeout at ~80ms.
    assert!(
        wait_for(|| !closes.lock().unwrap().is_empty(), Duration::from_millis(500)).await,
        "heartbeat never dropped the connection"
    );
    assert_eq!(pings.load(Ordering::SeqCst), 1);
    {
        let closes = closes.lock().unwrap();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0]["code"], json!(HEARTBEAT_CLOSE_CODE));
        assert_eq!(closes[0]["wasClean"], json!(false));
    }
    assert_eq!(client.state(), ConnectionState::Reconnecting);

    // The probe itself reached the wire.
    assert_eq!(peer.recv().await, PairFrame::Text(r#"{"type":"p"}"#.to_string()));
    client.destroy().await;
}

/// A responsive peer keeps the session alive and records latency.
#[tokio::test]
async fn test_heartbeat_pong_keeps_session_alive() {
    let mut config = base_config();
    config.heartbeat.enabled = true;
    config.heartbeat.interval = Duration::from_millis(30);
    config.heartbeat.timeout = Duration::from_millis(200);
    let (client, peer) = client_with(config);

    let pongs = Arc::new(AtomicUsize::new(0));
    let pongs_clone = pongs.clone();
    client.on(events::PONG, move |_| {
        pongs_clone.fetch_add(1, Ordering::SeqCst);
    });

    client.connect().await.unwrap();

    // Answer two probes.
    for _ in 0..2 {
        loop {
            match peer.recv().await {
                PairFrame::Text(text) if text.contains("ping") => {
                    peer.send_text(r#"{"type":"pong"}"#);
                    break;
                }
                _ => {}
            }
        }
    }

    assert!(
        wait_for(|| pongs.load(Ordering::SeqCst) >= 2, Duration::from_secs(1)).await,
        "pongs were not observed"
    );
    assert!(client.is_connected());
    client.destroy().await;
}

/// Scenario: ACK with retry. A never-acknowledging peer sees the
/// payload three times (original + 2 retries) at least 50ms apart, then
/// the timeout callback fires exactly once.
#[tokio::test]
async fn test_ack_retries_then_times_out() {
    let (client, peer) = client_with(base_config());
    client.connect().await.unwrap();

    let timeouts = Arc::new(AtomicUsize::new(0));
    let timeouts_clone = timeouts.clone();
    client
        .send_reliable(
            json!({"x": 1}),
            AckOptions {
                timeout: Some(Duration::from_millis(50)),
                retries: 2,
            },
            Box::new(|_| panic!("ack must not fire")),
            Box::new(move |err| {
                assert!(matches!(err, WireError::Timeout { .. }));
                timeouts_clone.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

    let mut arrivals = Vec::new();
    for _ in 0..3 {
        match tokio::time::timeout(Duration::from_millis(400), peer.recv()).await {
            Ok(PairFrame::Text(text)) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["x"], json!(1));
                arrivals.push(Instant::now());
            }
            other => panic!("expected a retry frame, got {other:?}"),
        }
    }
    for gap in arrivals.windows(2) {
        assert!(gap[1] - gap[0] >= Duration::from_millis(45));
    }

    assert!(
        wait_for(|| timeouts.load(Ordering::SeqCst) == 1, Duration::from_millis(500)).await,
        "timeout callback did not fire"
    );
    assert_eq!(client.ack_stats().pending, 0);
}

/// An acknowledging peer settles the entry without retries.
#[tokio::test]
async fn test_ack_settles_on_peer_acknowledgement() {
    let (client, peer) = client_with(base_config());
    client.connect().await.unwrap();

    let acked = Arc::new(AtomicUsize::new(0));
    let acked_clone = acked.clone();
    client
        .send_reliable(
            json!({"x": 1}),
            AckOptions {
                timeout: Some(Duration::from_millis(200)),
                retries: 2,
            },
            Box::new(move |_| {
                acked_clone.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(|_| panic!("timeout must not fire")),
        )
        .await
        .unwrap();

    let id = match peer.recv().await {
        PairFrame::Text(text) => {
            let value: Value = serde_json::from_str(&text).unwrap();
            value["id"].as_str().unwrap().to_string()
        }
        other => panic!("unexpected frame: {other:?}"),
    };
    peer.send_json(&json!({"type": "ack", "id": id}));

    assert!(
        wait_for(|| acked.load(Ordering::SeqCst) == 1, Duration::from_secs(1)).await,
        "ack callback did not fire"
    );
    assert_eq!(client.ack_stats().pending, 0);
    assert_eq!(client.ack_stats().total_retries, 0);
}

/// Scenario: RPC round trip. The request envelope carries an id; the
/// correlated response resolves the completion.
#[tokio::test]
async fn test_rpc_round_trip() {
    let (client, peer) = client_with(base_config());
    client.connect().await.unwrap();

    let peer = Arc::new(peer);
    let responder = peer.clone();
    let server = tokio::spawn(async move {
        loop {
            if let PairFrame::Text(text) = responder.recv().await {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["type"] == json!("rpc_request") {
                    assert_eq!(value["data"], json!({"op": "sum", "args": [1, 2]}));
                    responder.send_json(&json!({
                        "type": "rpc_response",
                        "requestId": value["id"],
                        "data": {"result": 3},
                    }));
                    break;
                }
            }
        }
    });

    let answer = client
        .request(
            json!({"op": "sum", "args": [1, 2]}),
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    assert_eq!(answer, json!({"result": 3}));
    server.await.unwrap();
}

/// RPC requests pending at connection loss reject instead of lingering.
#[tokio::test]
async fn test_rpc_rejected_on_connection_loss() {
    let (client, peer) = client_with(base_config());
    client.connect().await.unwrap();

    let request = {
        let client = &client;
        let fut = client.request(json!({"op": "slow"}), Some(Duration::from_secs(5)));
        tokio::pin!(fut);

        // Drop the link while the request is pending.
        peer.close(Some(1006), "gone", false);
        fut.await
    };

    let err = request.unwrap_err();
    assert!(matches!(err, WireError::Connection(_)));
}

/// Unclean close triggers the reconnect loop; traffic sent while down
/// is queued and flushed on the new link.
#[tokio::test]
async fn test_unclean_close_reconnects_and_resumes() {
    let mut config = base_config();
    config.reconnect.enabled = true;
    config.reconnect.delay = Duration::from_millis(20);
    config.reconnect.jitter = 0.0;
    let (client, peer) = client_with(config);

    client.connect().await.unwrap();
    assert_eq!(peer.accepted_connects(), 1);

    peer.close(Some(1006), "abnormal", false);
    assert!(
        wait_for(|| peer.accepted_connects() == 2, Duration::from_secs(1)).await,
        "client did not reconnect"
    );

    // Sends queued during the outage would have flushed; live sends
    // flow over the new link.
    client.send(json!({"after": "reconnect"}), SendOptions::default()).await.unwrap();
    assert_eq!(
        peer.recv().await,
        PairFrame::Text(r#"{"after":"reconnect"}"#.to_string())
    );
    client.destroy().await;
}

/// Clean close settles at `disconnected`; no reconnect loop starts.
#[tokio::test]
async fn test_clean_close_does_not_reconnect() {
    let mut config = base_config();
    config.reconnect.enabled = true;
    config.reconnect.delay = Duration::from_millis(10);
    let (client, peer) = client_with(config);

    client.connect().await.unwrap();
    peer.close(Some(1000), "bye", true);

    assert!(
        wait_for(
            || client.state() == ConnectionState::Disconnected,
            Duration::from_secs(1)
        )
        .await
    );
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(peer.accepted_connects(), 1);
}

/// Compression + encryption survive the echo path: the peer reflects
/// the opaque frame and the client decodes its own envelope.
#[tokio::test]
async fn test_codec_echo_round_trip() {
    let mut config = base_config();
    config.compression.enabled = true;
    config.compression.threshold = 32;
    config.encryption.enabled = true;
    config.encryption.key = Some(vec![9u8; 32]);
    let (client, peer) = client_with(config);

    let messages = Arc::new(Mutex::new(Vec::<Value>::new()));
    let messages_clone = messages.clone();
    client.on(events::MESSAGE, move |data| {
        messages_clone.lock().unwrap().push(data["data"].clone());
    });

    client.connect().await.unwrap();
    let payload = json!({"type": "bulk", "body": "payload ".repeat(32)});
    client.send(payload.clone(), SendOptions::default()).await.unwrap();

    match peer.recv().await {
        PairFrame::Text(text) => {
            // Nothing readable on the wire.
            assert!(text.contains("__encrypted"));
            assert!(!text.contains("bulk"));
            peer.send_text(text);
        }
        other => panic!("unexpected frame: {other:?}"),
    }

    assert!(
        wait_for(|| !messages.lock().unwrap().is_empty(), Duration::from_secs(1)).await,
        "echoed message never decoded"
    );
    assert_eq!(messages.lock().unwrap()[0], payload);
}

/// Duplicate inbound messages are suppressed inside the dedup window.
#[tokio::test]
async fn test_inbound_deduplication() {
    let (client, peer) = client_with(base_config());
    let messages = Arc::new(AtomicUsize::new(0));
    let messages_clone = messages.clone();
    client.on(events::MESSAGE, move |_| {
        messages_clone.fetch_add(1, Ordering::SeqCst);
    });

    client.connect().await.unwrap();
    for _ in 0..3 {
        peer.send_text(r#"{"type":"evt","id":"dup-1"}"#);
    }
    peer.send_text(r#"{"type":"evt","id":"dup-2"}"#);

    assert!(
        wait_for(|| messages.load(Ordering::SeqCst) >= 2, Duration::from_secs(1)).await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(messages.load(Ordering::SeqCst), 2);
}

/// Router fan-out: routed handlers fire by pattern and the generic
/// `message` event still fires for unrouted channel traffic.
#[tokio::test]
async fn test_routing_and_channel_gating() {
    let (client, peer) = client_with(base_config());
    let routed = Arc::new(AtomicUsize::new(0));
    let routed_clone = routed.clone();
    client.route(
        "prices.*",
        move |_| {
            routed_clone.fetch_add(1, Ordering::SeqCst);
        },
        0,
    );
    let generic = Arc::new(AtomicUsize::new(0));
    let generic_clone = generic.clone();
    client.on(events::MESSAGE, move |_| {
        generic_clone.fetch_add(1, Ordering::SeqCst);
    });

    client.connect().await.unwrap();

    // Channel not subscribed: dropped from routing, still a message event.
    peer.send_text(r#"{"type":"prices.btc","channel":"market","v":1}"#);
    assert!(wait_for(|| generic.load(Ordering::SeqCst) == 1, Duration::from_secs(1)).await);
    assert_eq!(routed.load(Ordering::SeqCst), 0);

    client.subscribe("market");
    peer.send_text(r#"{"type":"prices.btc","channel":"market","v":2}"#);
    assert!(wait_for(|| routed.load(Ordering::SeqCst) == 1, Duration::from_secs(1)).await);
    assert_eq!(generic.load(Ordering::SeqCst), 2);
}

/// Batch sender wired to the client coalesces into one array frame.
#[tokio::test]
async fn test_batch_sender_over_client() {
    let (client, peer) = client_with(base_config());
    client.connect().await.unwrap();

    let batcher = client.batch_sender(durawire::BatchConfig {
        max_size: 3,
        max_bytes: 1 << 20,
        max_wait: Duration::from_secs(10),
    });
    for i in 0..3 {
        batcher.add(json!(i)).await.unwrap();
    }

    assert_eq!(peer.recv().await, PairFrame::Text("[0,1,2]".to_string()));
}
