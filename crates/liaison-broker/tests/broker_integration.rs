#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Integration tests for the broker pipeline.
//!
//! Exercises the full flow over channel-backed connections: identify →
//! route/queue → popup create/wait/resolve → health, without real sockets.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use liaison_broker::connection::OutboundCommand;
use liaison_broker::{Broker, Connection, TransportMetadata};
use liaison_core::Config;
use liaison_wire::{BrokerEvent, PopupStatus, WireMessage};

fn test_broker() -> Arc<Broker> {
    Broker::new(&Config::default())
}

/// Identify one client and swallow its `connected` ack.
async fn connect(
    broker: &Arc<Broker>,
    client_type: &str,
) -> (String, mpsc::Receiver<OutboundCommand>) {
    let (conn, mut rx) = Connection::channel(64);
    let pending_id = broker.accept(conn, TransportMetadata::default()).await;
    let identify =
        WireMessage::notification("identify", json!({ "clientType": client_type }));
    let session = broker
        .handle_identify(&pending_id, &identify)
        .await
        .unwrap()
        .unwrap();
    rx.recv().await;
    (session.id().to_string(), rx)
}

async fn next_message(rx: &mut mpsc::Receiver<OutboundCommand>) -> WireMessage {
    loop {
        match rx.recv().await {
            Some(OutboundCommand::Message(msg)) => return msg,
            Some(_) => {}
            None => panic!("connection closed while waiting for a message"),
        }
    }
}

async fn create_popup(
    broker: &Arc<Broker>,
    requester: &str,
    req_rx: &mut mpsc::Receiver<OutboundCommand>,
    options: serde_json::Value,
) -> String {
    broker
        .handle_message(
            requester,
            WireMessage::request("c", "popup.create", json!({ "options": options })),
        )
        .await;
    next_message(req_rx).await.result().unwrap()["popupId"]
        .as_str()
        .unwrap()
        .to_string()
}

// =========================================================================
// Identity and roles
// =========================================================================

#[tokio::test]
async fn each_identify_creates_one_session_with_the_declared_role() {
    let broker = test_broker();
    let (req, _a) = connect(&broker, "requester").await;
    let (resp, _b) = connect(&broker, "responder").await;
    let (dflt, _c) = connect(&broker, "widget").await;

    assert_eq!(broker.registry().session_count().await, 3);
    let ids = [req.as_str(), resp.as_str(), dflt.as_str()];
    assert_eq!(
        ids.iter().collect::<std::collections::HashSet<_>>().len(),
        3
    );

    use liaison_wire::Role;
    assert_eq!(broker.registry().get(&req).await.unwrap().role(), Role::Requester);
    assert_eq!(broker.registry().get(&resp).await.unwrap().role(), Role::Responder);
    // Unrecognized clientType identifies as requester.
    assert_eq!(broker.registry().get(&dflt).await.unwrap().role(), Role::Requester);
}

#[tokio::test]
async fn lifecycle_events_are_observable() {
    let broker = test_broker();
    let mut events = broker.events().subscribe();

    let (session_id, _rx) = connect(&broker, "responder").await;
    broker.handle_disconnect(&session_id, "test over").await;

    let Ok(BrokerEvent::ClientConnected { session_id: connected, .. }) = events.recv().await
    else {
        panic!("expected client_connected first");
    };
    assert_eq!(connected, session_id);
    let Ok(BrokerEvent::ClientDisconnected { reason, .. }) = events.recv().await else {
        panic!("expected client_disconnected second");
    };
    assert_eq!(reason, "test over");
}

// =========================================================================
// Store-and-forward
// =========================================================================

#[tokio::test]
async fn offline_delivery_queues_then_drains_in_order() {
    let broker = test_broker();

    for n in 1..=3u64 {
        let outcome = broker
            .router()
            .deliver_to("c-offline", WireMessage::notification("note", json!({ "n": n })))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            liaison_broker::RouteOutcome::ClientQueued("c-offline".into())
        );
    }
    assert_eq!(broker.router().queued_count("c-offline").await, 3);

    // The identity cannot come back through identify (ids are fresh per
    // connection), so the queue sits until the broker stops. Draining for a
    // different id must not touch it.
    let (other, _rx) = connect(&broker, "requester").await;
    broker.router().on_client_connected(&other).await;
    assert_eq!(broker.router().queued_count("c-offline").await, 3);
}

#[tokio::test]
async fn popup_ask_for_offline_responder_is_queued_not_dropped() {
    let broker = test_broker();
    let popup_id = broker
        .popups()
        .create("s-req", "s-resp-offline", json!({ "q": "?" }), None)
        .await;

    assert_eq!(broker.router().queued_count("s-resp-offline").await, 1);
    assert_eq!(
        broker.popups().get(&popup_id).await.unwrap().status,
        PopupStatus::Pending
    );
}

// =========================================================================
// Popup workflow end-to-end
// =========================================================================

#[tokio::test]
async fn full_popup_round_trip_with_concurrent_waiters() {
    let broker = test_broker();
    let (requester, mut req_rx) = connect(&broker, "requester").await;
    let (responder, mut resp_rx) = connect(&broker, "responder").await;

    let popup_id = create_popup(&broker, &requester, &mut req_rx, json!({ "q": "deploy?" })).await;

    // The ask reached the responder with the popup id as correlation id.
    let ask = next_message(&mut resp_rx).await;
    assert_eq!(ask.method(), Some("popup.request"));
    assert_eq!(ask.id().as_deref(), Some(popup_id.as_str()));

    // Two waiters on the same popup plus one "any" waiter.
    let w1 = {
        let popups = Arc::clone(broker.popups());
        let id = popup_id.clone();
        tokio::spawn(async move { popups.await_result(&id, None).await })
    };
    let w2 = {
        let popups = Arc::clone(broker.popups());
        let id = popup_id.clone();
        tokio::spawn(async move { popups.await_result(&id, None).await })
    };
    let any = {
        let popups = Arc::clone(broker.popups());
        tokio::spawn(async move { popups.await_any(None).await })
    };
    tokio::task::yield_now().await;

    broker
        .handle_message(
            &responder,
            WireMessage::request(
                "r-1",
                "popup.resolve",
                json!({ "popupId": popup_id, "result": { "approved": true } }),
            ),
        )
        .await;
    assert_eq!(next_message(&mut resp_rx).await.result().unwrap()["ok"], true);

    let (s1, v1) = w1.await.unwrap().unwrap();
    let (s2, v2) = w2.await.unwrap().unwrap();
    let (sa, va) = any.await.unwrap().unwrap();
    assert_eq!(s1, PopupStatus::Resolved);
    assert_eq!(s2, PopupStatus::Resolved);
    assert_eq!(sa, PopupStatus::Resolved);
    assert_eq!(v1, json!({ "approved": true }));
    assert_eq!(v1, v2);
    assert_eq!(v1, va);

    // A second "any" waiter registered afterwards sees nothing from that
    // same resolution.
    let late = broker
        .popups()
        .await_any(Some(Duration::from_millis(50)))
        .await;
    assert!(late.is_err());
}

#[tokio::test]
async fn popup_timeout_produces_the_timed_out_outcome() {
    let broker = test_broker();
    let (requester, mut req_rx) = connect(&broker, "requester").await;
    let (_responder, _resp_rx) = connect(&broker, "responder").await;

    let popup_id = create_popup(
        &broker,
        &requester,
        &mut req_rx,
        json!({ "timeout": 50 }),
    )
    .await;

    let any = {
        let popups = Arc::clone(broker.popups());
        tokio::spawn(async move { popups.await_any(None).await })
    };

    let (status, result) = broker.popups().await_result(&popup_id, None).await.unwrap();
    assert_eq!(status, PopupStatus::TimedOut);
    assert_eq!(result, json!({ "timedOut": true }));
    // Exactly one "any" waiter resolves on the timeout.
    let (any_status, _) = any.await.unwrap().unwrap();
    assert_eq!(any_status, PopupStatus::TimedOut);
}

#[tokio::test]
async fn close_all_for_one_responder_leaves_the_rest_pending() {
    let broker = test_broker();
    let popups = broker.popups();
    let for_x1 = popups.create("s-req", "s-x", json!({}), None).await;
    let for_x2 = popups.create("s-req", "s-x", json!({}), None).await;
    let for_y = popups.create("s-req", "s-y", json!({}), None).await;

    let mut cancelled = popups.close_all(Some("s-x")).await;
    cancelled.sort();
    let mut expected = vec![for_x1, for_x2];
    expected.sort();
    assert_eq!(cancelled, expected);
    assert_eq!(popups.get(&for_y).await.unwrap().status, PopupStatus::Pending);
}

// =========================================================================
// Role routing
// =========================================================================

#[tokio::test]
async fn requester_traffic_reaches_responders_and_back() {
    let broker = test_broker();
    let (requester, mut req_rx) = connect(&broker, "requester").await;
    let (responder, mut resp_rx) = connect(&broker, "responder").await;

    broker
        .handle_message(
            &requester,
            WireMessage::request("t-1", "tool.confirm", json!({ "tool": "rm" })),
        )
        .await;
    let routed = next_message(&mut resp_rx).await;
    assert_eq!(routed.method(), Some("tool.confirm"));

    broker
        .handle_message(
            &responder,
            WireMessage::response("t-1", json!({ "confirmed": false })),
        )
        .await;
    let reply = next_message(&mut req_rx).await;
    assert_eq!(reply.id().as_deref(), Some("t-1"));
    assert_eq!(reply.result().unwrap()["confirmed"], false);
}

// =========================================================================
// Health and shutdown
// =========================================================================

#[tokio::test]
async fn repeated_routing_failures_degrade_health() {
    let broker = test_broker();
    let (requester, mut req_rx) = connect(&broker, "requester").await;

    // No responders connected: every request fails and is recorded.
    for n in 0..6 {
        broker
            .handle_message(
                &requester,
                WireMessage::request(&format!("t-{n}"), "tool.invoke", json!({})),
            )
            .await;
        next_message(&mut req_rx).await;
    }

    assert_eq!(broker.health().status().await, liaison_wire::HealthStatus::Degraded);
    assert_eq!(broker.health().recent_errors().await.len(), 6);
}

#[tokio::test]
async fn graceful_shutdown_leaves_no_sessions_or_pending_popups() {
    let broker = test_broker();
    let (requester, mut req_rx) = connect(&broker, "requester").await;
    let (_responder, mut resp_rx) = connect(&broker, "responder").await;
    let popup_id = create_popup(&broker, &requester, &mut req_rx, json!({})).await;
    next_message(&mut resp_rx).await;

    broker.shutdown().await;

    assert_eq!(broker.registry().session_count().await, 0);
    assert_eq!(broker.popups().pending_count().await, 0);
    assert_eq!(
        broker.popups().get(&popup_id).await.unwrap().status,
        PopupStatus::Cancelled
    );
}
