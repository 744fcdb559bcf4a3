// WebSocket event stream
//
// One bus subscription per socket. Clients pick runs with subscribe and
// unsubscribe messages; events are forwarded as their JSON form. When the bus
// evicts the subscription, or a write misses its deadline, the socket is
// closed with code 4008.
//
// Client → server:
//   {"type":"subscribe","run_id":"<uuid>"|"*","since":N?}
//   {"type":"unsubscribe","run_id":"<uuid>"|"*"}
//   {"type":"ping"}
// Server → client: every RunEvent, plus subscribed/unsubscribed/pong/error.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use runloop_core::{ErrorCode, RecvError, Subscription};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::state::AppState;

pub const CLOSE_SLOW_CONSUMER: u16 = 4008;
const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        run_id: String,
        /// Replay only events after this sequence number
        #[serde(default)]
        since: Option<u64>,
    },
    Unsubscribe {
        run_id: String,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Subscribed { run_id: String, replayed: usize },
    Unsubscribed { run_id: String },
    Pong,
    Error { message: String },
}

enum Target {
    All,
    Run(Uuid),
}

fn parse_target(run_id: &str) -> Result<Target, ControlMessage> {
    if run_id == WILDCARD {
        return Ok(Target::All);
    }
    run_id.parse().map(Target::Run).map_err(|_| ControlMessage::Error {
        message: format!("Invalid run_id: {run_id}"),
    })
}

/// Create WebSocket routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/ws", get(ws_handler))
        .with_state(state)
}

/// GET /v1/ws - Upgrade to the event stream
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Apply one client message to `subscription` and build the reply
pub async fn handle_client_message(
    state: &AppState,
    subscription: &mut Subscription,
    text: &str,
) -> ControlMessage {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            return ControlMessage::Error {
                message: format!("Invalid message: {e}"),
            }
        }
    };

    match message {
        ClientMessage::Ping => ControlMessage::Pong,
        ClientMessage::Subscribe { run_id, since } => match parse_target(&run_id) {
            Ok(Target::All) => {
                subscription.watch_all();
                ControlMessage::Subscribed {
                    run_id,
                    replayed: 0,
                }
            }
            Ok(Target::Run(id)) => match state.runs.get_run(id).await {
                Ok(Some(_)) => match subscription.watch_run_after(id, since).await {
                    Ok(replayed) => ControlMessage::Subscribed { run_id, replayed },
                    Err(e) => ControlMessage::Error {
                        message: format!("Replay failed: {e}"),
                    },
                },
                Ok(None) => ControlMessage::Error {
                    message: format!("Run not found: {id}"),
                },
                Err(e) => ControlMessage::Error {
                    message: e.to_string(),
                },
            },
            Err(reply) => reply,
        },
        ClientMessage::Unsubscribe { run_id } => match parse_target(&run_id) {
            Ok(Target::All) => {
                subscription.unwatch_all();
                ControlMessage::Unsubscribed { run_id }
            }
            Ok(Target::Run(id)) => {
                subscription.unwatch_run(id);
                ControlMessage::Unsubscribed { run_id }
            }
            Err(reply) => reply,
        },
    }
}

/// Why the event stream of a socket ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// The client closed the socket or the transport failed
    Client,
    /// The bus evicted the subscription
    SlowConsumer,
    /// A write did not complete within the deadline
    WriteTimeout,
    /// The event bus shut down
    BusClosed,
}

/// Close frame sent when the client cannot keep up
pub fn slow_consumer_close() -> Message {
    Message::Close(Some(CloseFrame {
        code: CLOSE_SLOW_CONSUMER,
        reason: ErrorCode::SlowConsumer.as_str().into(),
    }))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let subscription = state.bus().subscribe();
    let subscriber = subscription.id();
    let (sender, receiver) = socket.split();
    tracing::debug!(subscriber, "WebSocket connected");

    let reason = serve_subscription(&state, subscription, sender, receiver).await;
    tracing::debug!(subscriber, ?reason, "WebSocket disconnected");
}

/// Pump client messages in and bus events out until either side ends
///
/// Every write is bounded by the state's write deadline. A client that stops
/// reading is treated like an evicted one: it gets the 4008 close (if the
/// close itself can still be written) and the socket is released.
pub async fn serve_subscription<S, R, E>(
    state: &AppState,
    mut subscription: Subscription,
    mut sender: S,
    mut receiver: R,
) -> Disconnect
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let subscriber = subscription.id();
    let deadline = state.ws_write_timeout;

    let reason = loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = handle_client_message(state, &mut subscription, &text).await;
                    if let Err(reason) = send_json(&mut sender, &reply, deadline).await {
                        break reason;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break Disconnect::Client,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(subscriber, error = %e, "WebSocket receive failed");
                    break Disconnect::Client;
                }
            },
            event = subscription.recv() => match event {
                Ok(event) => {
                    if let Err(reason) = send_json(&mut sender, &*event, deadline).await {
                        break reason;
                    }
                }
                Err(RecvError::SlowConsumer) => break Disconnect::SlowConsumer,
                Err(RecvError::Closed) => break Disconnect::BusClosed,
            },
        }
    };

    if matches!(reason, Disconnect::SlowConsumer | Disconnect::WriteTimeout) {
        tracing::warn!(subscriber, ?reason, "Closing slow WebSocket consumer");
        drop(subscription);
        if tokio::time::timeout(deadline, sender.send(slow_consumer_close()))
            .await
            .is_err()
        {
            tracing::debug!(subscriber, "Close frame could not be written");
        }
    }
    reason
}

async fn send_json<S, T>(sender: &mut S, value: &T, deadline: Duration) -> Result<(), Disconnect>
where
    S: Sink<Message> + Unpin,
    T: Serialize,
{
    let text = serde_json::to_string(value).map_err(|e| {
        tracing::error!(error = %e, "Failed to serialize WebSocket message");
        Disconnect::Client
    })?;
    match tokio::time::timeout(deadline, sender.send(Message::Text(text))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(Disconnect::Client),
        Err(_) => Err(Disconnect::WriteTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev_driver::EchoDriver;
    use runloop_core::{
        Agent, AgentConfig, EventData, PriceTable, RunCancelledData, RunEvent, RunUsage,
        ToolRegistry, Trigger, RUN_CANCELLED, RUN_CREATED,
    };
    use runloop_storage::StorageBackend;
    use runloop_worker::RuntimeConfig;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};

    fn test_state() -> AppState {
        state_with(RuntimeConfig::default())
    }

    fn state_with(config: RuntimeConfig) -> AppState {
        AppState::build(
            &StorageBackend::in_memory(),
            Arc::new(EchoDriver),
            PriceTable::with_defaults(),
            ToolRegistry::with_defaults().unwrap(),
            &config,
        )
    }

    fn cancelled(run_id: Uuid, sequence: u64) -> RunEvent {
        RunEvent::new(
            run_id,
            sequence,
            EventData::Cancelled(RunCancelledData {
                usage: RunUsage::default(),
                duration_ms: 0,
            }),
        )
    }

    /// Client that never sends anything
    fn silent_client() -> futures::stream::Pending<Result<Message, axum::Error>> {
        futures::stream::pending()
    }

    /// Transport whose write buffer never drains
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = axum::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    #[test]
    fn test_slow_consumer_close_frame() {
        match slow_consumer_close() {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, 4008);
                assert_eq!(frame.reason, "SlowConsumer");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_evicted_subscriber_is_closed_with_4008() {
        let state = state_with(RuntimeConfig::default().with_subscriber_queue_capacity(1));
        let mut sub = state.bus().subscribe();
        sub.watch_all();

        // Second event overflows the one-slot queue
        let run_id = Uuid::now_v7();
        state.bus().publish(cancelled(run_id, 0));
        state.bus().publish(cancelled(run_id, 1));
        assert_eq!(state.bus().subscriber_count(), 0);

        let (tx, rx) = futures::channel::mpsc::unbounded::<Message>();
        let reason = serve_subscription(&state, sub, tx, silent_client()).await;
        assert_eq!(reason, Disconnect::SlowConsumer);

        let sent: Vec<Message> = rx.collect().await;
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CLOSE_SLOW_CONSUMER);
                assert_eq!(frame.reason, ErrorCode::SlowConsumer.as_str());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_events_and_replies_are_forwarded() {
        let state = test_state();
        let mut sub = state.bus().subscribe();
        sub.watch_all();
        let run_id = Uuid::now_v7();
        state.bus().publish(cancelled(run_id, 0));

        let (tx, rx) = futures::channel::mpsc::unbounded::<Message>();
        let client = futures::stream::iter(vec![
            Ok::<_, axum::Error>(Message::Text(r#"{"type":"ping"}"#.to_string())),
        ])
        .chain(futures::stream::pending());
        let server = {
            let state = state.clone();
            tokio::spawn(async move { serve_subscription(&state, sub, tx, client).await })
        };

        let mut rx = rx;
        let mut texts = Vec::new();
        for _ in 0..2 {
            match rx.next().await {
                Some(Message::Text(text)) => {
                    texts.push(serde_json::from_str::<serde_json::Value>(&text).unwrap())
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
        let types: Vec<&str> = texts.iter().map(|v| v["type"].as_str().unwrap()).collect();
        assert!(types.contains(&"pong"));
        assert!(types.contains(&RUN_CANCELLED));

        server.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_client_is_released_after_write_deadline() {
        let state = state_with(
            RuntimeConfig::default().with_subscriber_write_timeout(Duration::from_secs(2)),
        );
        let mut sub = state.bus().subscribe();
        sub.watch_all();
        state.bus().publish(cancelled(Uuid::now_v7(), 0));

        let started = tokio::time::Instant::now();
        let reason = serve_subscription(&state, sub, StalledSink, silent_client()).await;
        assert_eq!(reason, Disconnect::WriteTimeout);

        // One deadline for the event, one for the close frame
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert_eq!(state.bus().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_ping_and_invalid_messages() {
        let state = test_state();
        let mut sub = state.bus().subscribe();

        let reply = handle_client_message(&state, &mut sub, r#"{"type":"ping"}"#).await;
        assert_eq!(reply, ControlMessage::Pong);
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            serde_json::json!({"type": "pong"})
        );

        let reply = handle_client_message(&state, &mut sub, "not json").await;
        assert!(matches!(reply, ControlMessage::Error { .. }));

        let reply = handle_client_message(
            &state,
            &mut sub,
            r#"{"type":"subscribe","run_id":"nope"}"#,
        )
        .await;
        assert_eq!(
            reply,
            ControlMessage::Error {
                message: "Invalid run_id: nope".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_subscribe_replays_history() {
        let state = test_state();
        let agent = Agent::new("ws", AgentConfig::default());
        state.agents.create_agent(agent.clone()).await.unwrap();
        let run = state
            .machine()
            .create(agent.id, Trigger::manual(None))
            .await
            .unwrap();

        let mut sub = state.bus().subscribe();
        let text = format!(r#"{{"type":"subscribe","run_id":"{}"}}"#, run.id);
        let reply = handle_client_message(&state, &mut sub, &text).await;
        assert_eq!(
            reply,
            ControlMessage::Subscribed {
                run_id: run.id.to_string(),
                replayed: 1
            }
        );

        let event = sub.try_recv().unwrap().unwrap();
        assert_eq!(event.event_type, RUN_CREATED);
        let wire = serde_json::to_value(&*event).unwrap();
        assert_eq!(wire["type"], RUN_CREATED);
        assert_eq!(wire["sequence"], 0);

        let text = format!(r#"{{"type":"unsubscribe","run_id":"{}"}}"#, run.id);
        let reply = handle_client_message(&state, &mut sub, &text).await;
        assert!(matches!(reply, ControlMessage::Unsubscribed { .. }));
        assert!(!sub.is_watching(run.id));
    }

    #[tokio::test]
    async fn test_subscribe_unknown_run_and_wildcard() {
        let state = test_state();
        let mut sub = state.bus().subscribe();

        let missing = Uuid::now_v7();
        let text = format!(r#"{{"type":"subscribe","run_id":"{missing}"}}"#);
        let reply = handle_client_message(&state, &mut sub, &text).await;
        assert_eq!(
            reply,
            ControlMessage::Error {
                message: format!("Run not found: {missing}")
            }
        );

        let reply =
            handle_client_message(&state, &mut sub, r#"{"type":"subscribe","run_id":"*"}"#).await;
        assert_eq!(
            reply,
            ControlMessage::Subscribed {
                run_id: "*".to_string(),
                replayed: 0
            }
        );
        assert!(sub.is_watching(Uuid::now_v7()));
    }
}
