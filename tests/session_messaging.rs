//! Sending, heartbeats and fan-out of inbound messages.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agrolink::{ConnectionState, HEARTBEAT_ACK_TYPE, WILDCARD};
use common::{settle, test_config, wait_for_state, Harness, Outcome};
use serde_json::{json, Value};

const HEARTBEAT: &str = r#"{"type":"heartbeat"}"#;

fn collector() -> (Arc<Mutex<Vec<Value>>>, impl Fn(&Value) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |value: &Value| sink.lock().unwrap().push(value.clone()))
}

#[tokio::test(start_paused = true)]
async fn test_sends_are_written_once_in_order() {
    let mut harness = Harness::accepting_once();
    let mut peer = harness.open().await;

    harness
        .session
        .send_message("gavage", json!({"lot": "A7", "grams": 420}))
        .unwrap();
    harness.session.send(&json!({"type": "lot_query"})).unwrap();
    harness.session.send_raw("plain text".to_string()).unwrap();
    settle().await;

    let frames = peer.drain();
    assert_eq!(frames.len(), 3);

    let first: Value = serde_json::from_str(&frames[0]).unwrap();
    assert_eq!(first, json!({"type": "gavage", "data": {"lot": "A7", "grams": 420}}));
    assert_eq!(frames[1], r#"{"type":"lot_query"}"#);
    assert_eq!(frames[2], "plain text");

    assert_eq!(harness.session.stats().frames_sent, 3);
    harness.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_send_while_not_open_is_dropped() {
    let mut harness = Harness::new(
        test_config(),
        vec![Outcome::Accept, Outcome::Accept],
        Outcome::Refuse,
    );

    // Idle
    harness.session.send_message("gavage", json!({"x": 1})).unwrap();
    settle().await;
    assert_eq!(harness.session.stats().sends_dropped, 1);

    // Reconnect wait
    let mut first = harness.open().await;
    first.hang_up();
    wait_for_state(&harness.session, |s| {
        *s == ConnectionState::ReconnectWait { attempt: 1 }
    })
    .await;
    harness.session.send_message("gavage", json!({"x": 2})).unwrap();
    settle().await;
    assert_eq!(harness.session.stats().sends_dropped, 2);

    // Dropped messages are not replayed on the next connection
    let mut second = harness.next_peer().await;
    wait_for_state(&harness.session, |s| s.is_open()).await;
    settle().await;
    assert!(second.drain().is_empty());

    harness.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_sent_every_period_while_open() {
    let mut harness = Harness::accepting_once();
    let mut peer = harness.open().await;

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(peer.drain().is_empty());

    tokio::time::sleep(Duration::from_secs(66)).await;
    let frames = peer.drain();
    assert_eq!(frames, vec![HEARTBEAT; 3]);
    assert_eq!(harness.session.stats().heartbeats_sent, 3);

    harness.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_uses_configured_interval() {
    let config = agrolink::SessionConfig {
        heartbeat_interval_ms: 5000,
        ..test_config()
    };
    let mut harness = Harness::new(config, vec![Outcome::Accept], Outcome::Refuse);
    let mut peer = harness.open().await;

    tokio::time::sleep(Duration::from_millis(10_500)).await;
    assert_eq!(peer.drain().len(), 2);

    harness.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_close_stops_heartbeat() {
    let mut harness = Harness::accepting_once();
    let mut peer = harness.open().await;

    assert_eq!(peer.next_frame().await.as_deref(), Some(HEARTBEAT));

    harness.session.close().await;
    tokio::time::sleep(Duration::from_secs(300)).await;

    assert!(peer.drain().is_empty());
    assert_eq!(harness.session.stats().heartbeats_sent, 1);

    harness.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_stops_while_reconnecting() {
    let mut harness = Harness::new(test_config(), vec![Outcome::Accept], Outcome::Hang);
    let mut peer = harness.open().await;

    peer.hang_up();
    wait_for_state(&harness.session, |s| s.is_connecting()).await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(harness.session.state(), ConnectionState::Connecting);
    assert_eq!(harness.session.stats().heartbeats_sent, 0);

    harness.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_exact_subscriber_receives_data() {
    let mut harness = Harness::accepting_once();
    let (seen, callback) = collector();
    let _sub = harness.session.subscribe("gavage", callback);
    let peer = harness.open().await;

    peer.push(r#"{"type":"gavage","data":{"lot":"A7","grams":420}}"#);
    peer.push(r#"{"type":"weighing","data":{"lot":"A7"}}"#);
    settle().await;

    let seen = seen.lock().unwrap();
    assert_eq!(*seen, vec![json!({"lot": "A7", "grams": 420})]);

    harness.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_wildcard_subscriber_receives_envelope() {
    let mut harness = Harness::accepting_once();
    let (seen, callback) = collector();
    let _sub = harness.session.subscribe(WILDCARD, callback);
    let peer = harness.open().await;

    peer.push(r#"{"type":"gavage","data":{"lot":"A7"}}"#);
    peer.push(r#"{"type":"alert"}"#);
    settle().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0]["type"], "gavage");
    assert_eq!(seen[0]["data"], json!({"lot": "A7"}));
    assert!(seen[0]["receivedAt"].is_string());
    assert_eq!(seen[1]["type"], "alert");
    assert_eq!(seen[1]["data"], Value::Null);

    harness.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_all_receives_typed_envelope() {
    let mut harness = Harness::accepting_once();
    let types = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&types);
    let _sub = harness
        .session
        .subscribe_all(move |envelope| sink.lock().unwrap().push(envelope.msg_type.clone()));
    let peer = harness.open().await;

    peer.push(r#"{"type":"gavage","data":1}"#);
    peer.push(r#"{"type":"weighing","data":2}"#);
    settle().await;

    assert_eq!(*types.lock().unwrap(), vec!["gavage", "weighing"]);
    harness.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_frame_does_not_block_next() {
    let mut harness = Harness::accepting_once();
    let (seen, callback) = collector();
    let _sub = harness.session.subscribe("gavage", callback);
    let peer = harness.open().await;

    peer.push("not json");
    peer.push(r#"{"data":{"missing":"type"}}"#);
    peer.push(r#"{"type":"gavage","data":{"ok":true}}"#);
    settle().await;

    assert_eq!(*seen.lock().unwrap(), vec![json!({"ok": true})]);
    assert!(harness.session.is_connected());

    let stats = harness.session.stats();
    assert_eq!(stats.frames_received, 3);
    assert_eq!(stats.decode_errors, 2);

    harness.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_stops_delivery() {
    let mut harness = Harness::accepting_once();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let sub = harness.session.subscribe("gavage", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let peer = harness.open().await;

    peer.push(r#"{"type":"gavage","data":1}"#);
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    sub.unsubscribe();
    sub.unsubscribe();
    assert_eq!(harness.session.subscriber_count("gavage"), 0);

    peer.push(r#"{"type":"gavage","data":2}"#);
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    harness.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_panicking_callback_is_isolated() {
    let mut harness = Harness::accepting_once();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let _bad = harness
        .session
        .subscribe("gavage", |_| panic!("subscriber bug"));
    let _good = harness.session.subscribe("gavage", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let peer = harness.open().await;

    peer.push(r#"{"type":"gavage","data":1}"#);
    peer.push(r#"{"type":"gavage","data":2}"#);
    settle().await;

    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert!(harness.session.is_connected());
    assert_eq!(harness.session.stats().callback_panics, 2);

    harness.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_ack_is_dispatched_like_any_message() {
    let mut harness = Harness::accepting_once();
    let (seen, callback) = collector();
    let _sub = harness.session.subscribe(HEARTBEAT_ACK_TYPE, callback);
    let peer = harness.open().await;

    peer.push(r#"{"type":"heartbeat_ack"}"#);
    settle().await;

    assert_eq!(*seen.lock().unwrap(), vec![Value::Null]);
    harness.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_last_message_tracks_latest_envelope() {
    let mut harness = Harness::accepting_once();
    let peer = harness.open().await;
    assert!(harness.session.last_message().is_none());

    peer.push(r#"{"type":"gavage","data":1}"#);
    peer.push("garbage");
    peer.push(r#"{"type":"weighing","data":{"kg":4.2}}"#);
    settle().await;

    let last = harness.session.last_message().unwrap();
    assert_eq!(last.msg_type, "weighing");
    assert_eq!(last.data, json!({"kg": 4.2}));

    harness.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_survive_reconnect() {
    let mut harness = Harness::new(
        test_config(),
        vec![Outcome::Accept, Outcome::Accept],
        Outcome::Refuse,
    );
    let (seen, callback) = collector();
    let _sub = harness.session.subscribe("gavage", callback);

    let mut first = harness.open().await;
    first.push(r#"{"type":"gavage","data":1}"#);
    settle().await;
    first.hang_up();

    let second = harness.next_peer().await;
    wait_for_state(&harness.session, |s| s.is_open()).await;
    second.push(r#"{"type":"gavage","data":2}"#);
    settle().await;

    assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2)]);
    harness.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drops_subscriptions() {
    let harness = Harness::accepting_once();
    let sub = harness.session.subscribe("gavage", |_| {});
    assert!(sub.is_active());

    harness.session.shutdown().await;

    assert!(!sub.is_active());
    assert_eq!(harness.session.subscriber_count("gavage"), 0);
    assert!(harness.session.send_message("gavage", 1).is_err());
}
