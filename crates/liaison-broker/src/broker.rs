//! Broker facade wiring registry, router, correlator and health observer.
//!
//! The transport adapter hands every inbound frame to [`Broker`]; messages
//! addressed to the broker itself (the `popup.*` vocabulary and `status`)
//! are answered here, everything else is routed role-to-role.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};

use liaison_core::Config;
use liaison_wire::methods::{
    METHOD_IDENTIFY, METHOD_POPUP_CANCEL, METHOD_POPUP_CLOSE_ALL, METHOD_POPUP_CREATE,
    METHOD_POPUP_RESOLVE, METHOD_POPUP_WAIT, METHOD_POPUP_WAIT_ANY, METHOD_STATUS,
};
use liaison_wire::{MessageKind, Role, WireMessage};

use crate::connection::Connection;
use crate::events::EventSink;
use crate::health::HealthObserver;
use crate::popup::{PopupCorrelator, PopupError};
use crate::registry::{RegistryError, Session, SessionRegistry, TransportMetadata};
use crate::router::{MessageRouter, RouterError};

pub struct Broker {
    registry: Arc<SessionRegistry>,
    router: Arc<MessageRouter>,
    popups: Arc<PopupCorrelator>,
    health: Arc<HealthObserver>,
    events: EventSink,
    default_popup_timeout: Option<Duration>,
}

impl Broker {
    pub fn new(config: &Config) -> Arc<Self> {
        let events = EventSink::new(config.broker.event_capacity);
        let health = Arc::new(HealthObserver::new(events.clone()));
        let registry = Arc::new(SessionRegistry::new(
            config.broker.max_clients,
            events.clone(),
            Arc::clone(&health),
        ));
        let router = Arc::new(MessageRouter::new(Arc::clone(&registry)));
        registry.attach_router(&router);
        let popups = Arc::new(PopupCorrelator::new(Arc::clone(&router), events.clone()));
        Arc::new(Self {
            registry,
            router,
            popups,
            health,
            events,
            default_popup_timeout: config.popups.default_timeout(),
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn popups(&self) -> &Arc<PopupCorrelator> {
        &self.popups
    }

    pub fn health(&self) -> &Arc<HealthObserver> {
        &self.health
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Track a freshly accepted physical connection.
    pub async fn accept(&self, connection: Connection, transport: TransportMetadata) -> String {
        self.registry.register_pending(connection, transport).await
    }

    /// Forget a connection whose transport closed before identifying.
    pub async fn abandon_pending(&self, pending_id: &str) {
        self.registry.drop_pending(pending_id).await;
    }

    /// Run the identify handshake for a pending connection.
    pub async fn handle_identify(
        &self,
        pending_id: &str,
        message: &WireMessage,
    ) -> Result<Option<Arc<Session>>, RegistryError> {
        if message.method() != Some(METHOD_IDENTIFY) {
            warn!(
                pending_id = %pending_id,
                method = message.method().unwrap_or("<none>"),
                "Dropping pre-identify message"
            );
            return Ok(None);
        }
        let params = message.params().cloned().unwrap_or_else(|| json!({}));
        match self.registry.identify(pending_id, &params).await {
            Ok(Some(session)) => {
                // Fresh identities have empty queues; the drain hook still
                // runs so any same-identity parked traffic replays.
                self.router.on_client_connected(session.id()).await;
                Ok(Some(session))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.health
                    .record("identify_failure", &e.to_string(), None, None)
                    .await;
                Err(e)
            }
        }
    }

    /// Dispatch one inbound frame from an identified session.
    pub async fn handle_message(self: &Arc<Self>, session_id: &str, message: WireMessage) {
        self.registry.touch(session_id).await;
        let Some(session) = self.registry.get(session_id).await else {
            warn!(session_id = %session_id, "Message from unknown session dropped");
            return;
        };

        if message.kind() == MessageKind::Request {
            if let Some(method) = message.method() {
                if Self::is_broker_method(method) {
                    self.handle_broker_request(session_id, message).await;
                    return;
                }
            }
        }

        self.route(session_id, session.role(), message).await;
    }

    /// Tear a session down. The registry notifies the router, so the
    /// correlation bookkeeping goes with the session; its message queue
    /// stays for a same-identity reconnect.
    pub async fn handle_disconnect(&self, session_id: &str, reason: &str) {
        self.registry.disconnect(session_id, reason).await;
    }

    /// Graceful teardown: withdraw every pending popup, then disconnect all
    /// sessions, tolerating individual failures.
    pub async fn shutdown(&self) {
        let cancelled = self.popups.close_all(None).await;
        if !cancelled.is_empty() {
            debug!(count = cancelled.len(), "Cancelled pending popups for shutdown");
        }
        for session_id in self.registry.session_ids().await {
            self.handle_disconnect(&session_id, "server shutdown").await;
        }
    }

    fn is_broker_method(method: &str) -> bool {
        matches!(
            method,
            METHOD_POPUP_CREATE
                | METHOD_POPUP_RESOLVE
                | METHOD_POPUP_CANCEL
                | METHOD_POPUP_CLOSE_ALL
                | METHOD_POPUP_WAIT
                | METHOD_POPUP_WAIT_ANY
                | METHOD_STATUS
        )
    }

    async fn route(&self, session_id: &str, role: Role, message: WireMessage) {
        let kind = message.kind();
        let correlation_id = message.id();
        match self.router.route(session_id, role, message).await {
            Ok(outcome) => {
                debug!(session_id = %session_id, ?outcome, "Message routed");
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Routing failed");
                // Transport-level failures are recorded where the registry
                // detects them; count only routing-level ones here.
                if matches!(e, RouterError::NoTargetAvailable(_)) {
                    self.health
                        .record("routing_failure", &e.to_string(), Some(session_id), None)
                        .await;
                }
                if kind == MessageKind::Request {
                    if let Some(id) = correlation_id {
                        let code = match &e {
                            RouterError::NoTargetAvailable(_) => "no_target_available",
                            RouterError::Registry(_) => "send_failure",
                        };
                        self.reply(session_id, WireMessage::error_response(&id, code, &e.to_string()))
                            .await;
                    }
                }
            }
        }
    }

    async fn handle_broker_request(self: &Arc<Self>, session_id: &str, message: WireMessage) {
        let Some(request_id) = message.id() else {
            return; // unreachable for a classified request, but stay safe
        };
        let Some(method) = message.method().map(ToOwned::to_owned) else {
            return;
        };
        let params = message.params().cloned().unwrap_or_else(|| json!({}));

        match method.as_str() {
            METHOD_POPUP_CREATE => self.popup_create(session_id, &request_id, &params).await,
            METHOD_POPUP_RESOLVE => {
                let reply = match param_str(&params, "popupId") {
                    Some(popup_id) => {
                        let result = params.get("result").cloned().unwrap_or(Value::Null);
                        match self.popups.resolve(&popup_id, result).await {
                            Ok(()) => WireMessage::response(&request_id, json!({ "ok": true })),
                            Err(e) => popup_error_response(&request_id, &e),
                        }
                    }
                    None => missing_param(&request_id, "popupId"),
                };
                self.reply(session_id, reply).await;
            }
            METHOD_POPUP_CANCEL => {
                let reply = match param_str(&params, "popupId") {
                    Some(popup_id) => match self.popups.cancel(&popup_id).await {
                        Ok(()) => WireMessage::response(&request_id, json!({ "ok": true })),
                        Err(e) => popup_error_response(&request_id, &e),
                    },
                    None => missing_param(&request_id, "popupId"),
                };
                self.reply(session_id, reply).await;
            }
            METHOD_POPUP_CLOSE_ALL => {
                let responder_id = param_str(&params, "responderId");
                let cancelled = self.popups.close_all(responder_id.as_deref()).await;
                self.reply(
                    session_id,
                    WireMessage::response(&request_id, json!({ "cancelled": cancelled })),
                )
                .await;
            }
            METHOD_POPUP_WAIT => {
                // Waiting must not block this session's read loop.
                let broker = Arc::clone(self);
                let session_id = session_id.to_string();
                tokio::spawn(async move {
                    let reply = match param_str(&params, "popupId") {
                        Some(popup_id) => {
                            let timeout = param_timeout(&params);
                            match broker.popups.await_result(&popup_id, timeout).await {
                                Ok((status, result)) => WireMessage::response(
                                    &request_id,
                                    json!({ "status": status, "result": result }),
                                ),
                                Err(e) => popup_error_response(&request_id, &e),
                            }
                        }
                        None => missing_param(&request_id, "popupId"),
                    };
                    broker.reply(&session_id, reply).await;
                });
            }
            METHOD_POPUP_WAIT_ANY => {
                let broker = Arc::clone(self);
                let session_id = session_id.to_string();
                tokio::spawn(async move {
                    let timeout = param_timeout(&params);
                    let reply = match broker.popups.await_any(timeout).await {
                        Ok((status, result)) => WireMessage::response(
                            &request_id,
                            json!({ "status": status, "result": result }),
                        ),
                        Err(e) => popup_error_response(&request_id, &e),
                    };
                    broker.reply(&session_id, reply).await;
                });
            }
            METHOD_STATUS => {
                let status = self.health.status().await;
                let recent = self.health.recent_errors().await;
                self.reply(
                    session_id,
                    WireMessage::response(
                        &request_id,
                        json!({ "status": status, "recentErrors": recent }),
                    ),
                )
                .await;
            }
            _ => {}
        }
    }

    async fn popup_create(self: &Arc<Self>, session_id: &str, request_id: &str, params: &Value) {
        // An explicit responder wins; otherwise the first registered
        // responder takes the ask.
        let responder_id = match param_str(params, "responderId") {
            Some(id) => id,
            None => {
                let responders = self.registry.sessions_with_role(Role::Responder).await;
                match responders.first() {
                    Some(session) => session.id().to_string(),
                    None => {
                        self.reply(
                            session_id,
                            WireMessage::error_response(
                                request_id,
                                "no_target_available",
                                "no responder connected",
                            ),
                        )
                        .await;
                        return;
                    }
                }
            }
        };

        let options = params.get("options").cloned().unwrap_or_else(|| json!({}));
        let timeout = options
            .get("timeout")
            .and_then(Value::as_u64)
            .map_or(self.default_popup_timeout, |ms| {
                (ms > 0).then(|| Duration::from_millis(ms))
            });

        let popup_id = self
            .popups
            .create(session_id, &responder_id, options, timeout)
            .await;
        self.reply(
            session_id,
            WireMessage::response(request_id, json!({ "popupId": popup_id })),
        )
        .await;
    }

    async fn reply(&self, session_id: &str, message: WireMessage) {
        if let Err(e) = self.registry.send(session_id, message).await {
            warn!(session_id = %session_id, error = %e, "Failed to deliver reply");
        }
    }
}

fn param_str(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(ToOwned::to_owned)
}

fn param_timeout(params: &Value) -> Option<Duration> {
    params
        .get("timeoutMs")
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
}

fn popup_error_response(request_id: &str, error: &PopupError) -> WireMessage {
    let code = match error {
        PopupError::NotFound(_) => "not_found",
        PopupError::InvalidState { .. } => "invalid_state",
        PopupError::Timeout => "timeout",
    };
    WireMessage::error_response(request_id, code, &error.to_string())
}

fn missing_param(request_id: &str, key: &str) -> WireMessage {
    WireMessage::error_response(request_id, "bad_request", &format!("missing param: {key}"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::connection::OutboundCommand;
    use tokio::sync::mpsc;

    fn broker() -> Arc<Broker> {
        Broker::new(&Config::default())
    }

    async fn connect(
        broker: &Arc<Broker>,
        client_type: &str,
    ) -> (String, mpsc::Receiver<OutboundCommand>) {
        let (conn, mut rx) = Connection::channel(32);
        let pending_id = broker.accept(conn, TransportMetadata::default()).await;
        let identify = WireMessage::parse(&format!(
            r#"{{"method":"identify","params":{{"clientType":"{client_type}"}}}}"#
        ))
        .unwrap();
        let session = broker
            .handle_identify(&pending_id, &identify)
            .await
            .unwrap()
            .unwrap();
        rx.recv().await; // connected ack
        (session.id().to_string(), rx)
    }

    async fn next_message(rx: &mut mpsc::Receiver<OutboundCommand>) -> WireMessage {
        match rx.recv().await {
            Some(OutboundCommand::Message(msg)) => msg,
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn popup_create_dispatches_ask_and_returns_id() {
        let broker = broker();
        let (requester, mut req_rx) = connect(&broker, "requester").await;
        let (_responder, mut resp_rx) = connect(&broker, "responder").await;

        broker
            .handle_message(
                &requester,
                WireMessage::request("c-1", METHOD_POPUP_CREATE, json!({ "options": { "q": "?" } })),
            )
            .await;

        let reply = next_message(&mut req_rx).await;
        let popup_id = reply.result().unwrap()["popupId"].as_str().unwrap().to_string();
        assert!(popup_id.starts_with("popup-"));

        let ask = next_message(&mut resp_rx).await;
        assert_eq!(ask.method(), Some(liaison_wire::methods::METHOD_POPUP_REQUEST));
        assert_eq!(ask.id().as_deref(), Some(popup_id.as_str()));
        assert_eq!(ask.params().unwrap()["q"], "?");
    }

    #[tokio::test]
    async fn popup_create_without_responder_errors() {
        let broker = broker();
        let (requester, mut req_rx) = connect(&broker, "requester").await;

        broker
            .handle_message(
                &requester,
                WireMessage::request("c-1", METHOD_POPUP_CREATE, json!({})),
            )
            .await;

        let reply = next_message(&mut req_rx).await;
        assert_eq!(reply.error().unwrap()["code"], "no_target_available");
    }

    #[tokio::test]
    async fn wait_then_resolve_round_trip() {
        let broker = broker();
        let (requester, mut req_rx) = connect(&broker, "requester").await;
        let (responder, mut resp_rx) = connect(&broker, "responder").await;

        broker
            .handle_message(
                &requester,
                WireMessage::request("c-1", METHOD_POPUP_CREATE, json!({ "options": {} })),
            )
            .await;
        let popup_id = next_message(&mut req_rx).await.result().unwrap()["popupId"]
            .as_str()
            .unwrap()
            .to_string();
        next_message(&mut resp_rx).await; // the ask

        broker
            .handle_message(
                &requester,
                WireMessage::request("w-1", METHOD_POPUP_WAIT, json!({ "popupId": popup_id })),
            )
            .await;

        broker
            .handle_message(
                &responder,
                WireMessage::request(
                    "r-1",
                    METHOD_POPUP_RESOLVE,
                    json!({ "popupId": popup_id, "result": { "choice": "yes" } }),
                ),
            )
            .await;

        let resolve_ack = next_message(&mut resp_rx).await;
        assert_eq!(resolve_ack.result().unwrap()["ok"], true);

        let wait_reply = next_message(&mut req_rx).await;
        assert_eq!(wait_reply.id().as_deref(), Some("w-1"));
        let result = wait_reply.result().unwrap();
        assert_eq!(result["status"], "resolved");
        assert_eq!(result["result"]["choice"], "yes");
    }

    #[tokio::test]
    async fn resolving_twice_reports_invalid_state() {
        let broker = broker();
        let (requester, mut req_rx) = connect(&broker, "requester").await;
        let (responder, mut resp_rx) = connect(&broker, "responder").await;

        broker
            .handle_message(
                &requester,
                WireMessage::request("c-1", METHOD_POPUP_CREATE, json!({ "options": {} })),
            )
            .await;
        let popup_id = next_message(&mut req_rx).await.result().unwrap()["popupId"]
            .as_str()
            .unwrap()
            .to_string();
        next_message(&mut resp_rx).await;

        for _ in 0..2 {
            broker
                .handle_message(
                    &responder,
                    WireMessage::request(
                        "r",
                        METHOD_POPUP_RESOLVE,
                        json!({ "popupId": popup_id, "result": {} }),
                    ),
                )
                .await;
        }
        let first = next_message(&mut resp_rx).await;
        assert!(first.result().is_some());
        let second = next_message(&mut resp_rx).await;
        assert_eq!(second.error().unwrap()["code"], "invalid_state");
    }

    #[tokio::test]
    async fn status_request_reports_health() {
        let broker = broker();
        let (requester, mut req_rx) = connect(&broker, "requester").await;

        broker
            .handle_message(&requester, WireMessage::request("s-1", METHOD_STATUS, json!({})))
            .await;

        let reply = next_message(&mut req_rx).await;
        let result = reply.result().unwrap();
        assert_eq!(result["status"], "healthy");
        assert!(result["recentErrors"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_broker_request_routes_to_counterpart() {
        let broker = broker();
        let (requester, _req_rx) = connect(&broker, "requester").await;
        let (_responder, mut resp_rx) = connect(&broker, "responder").await;

        broker
            .handle_message(
                &requester,
                WireMessage::request("t-1", "tool.invoke", json!({ "name": "build" })),
            )
            .await;

        let routed = next_message(&mut resp_rx).await;
        assert_eq!(routed.method(), Some("tool.invoke"));
    }

    #[tokio::test]
    async fn unroutable_request_gets_an_error_response() {
        let broker = broker();
        let (requester, mut req_rx) = connect(&broker, "requester").await;

        broker
            .handle_message(
                &requester,
                WireMessage::request("t-1", "tool.invoke", json!({})),
            )
            .await;

        let reply = next_message(&mut req_rx).await;
        assert_eq!(reply.error().unwrap()["code"], "no_target_available");
        // The failure is visible to the health observer.
        assert_eq!(broker.health().recent_errors().await.len(), 1);
    }

    #[tokio::test]
    async fn sweep_eviction_discards_correlations_for_late_responses() {
        let broker = broker();
        let (requester, req_rx) = connect(&broker, "requester").await;
        let (responder, mut resp_rx) = connect(&broker, "responder").await;

        broker
            .handle_message(
                &requester,
                WireMessage::request("r-5", "tool.confirm", json!({})),
            )
            .await;
        next_message(&mut resp_rx).await;

        // Requester transport dies and the sweep evicts it.
        drop(req_rx);
        tokio::time::sleep(Duration::from_millis(40)).await;
        broker.registry().sweep(Duration::from_millis(10)).await;
        assert!(!broker.registry().is_connected(&requester).await);

        // The late response finds no correlation left behind: nothing is
        // parked in the evicted identity's queue.
        broker
            .handle_message(
                &responder,
                WireMessage::response("r-5", json!({ "late": true })),
            )
            .await;
        assert_eq!(broker.router().queued_count(&requester).await, 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_popups_and_disconnects_everyone() {
        let broker = broker();
        let (requester, mut req_rx) = connect(&broker, "requester").await;
        let (_responder, mut resp_rx) = connect(&broker, "responder").await;

        broker
            .handle_message(
                &requester,
                WireMessage::request("c-1", METHOD_POPUP_CREATE, json!({ "options": {} })),
            )
            .await;
        let popup_id = next_message(&mut req_rx).await.result().unwrap()["popupId"]
            .as_str()
            .unwrap()
            .to_string();
        next_message(&mut resp_rx).await;

        broker.shutdown().await;

        assert_eq!(broker.registry().session_count().await, 0);
        assert_eq!(
            broker.popups().get(&popup_id).await.unwrap().status,
            liaison_wire::PopupStatus::Cancelled
        );
    }
}
