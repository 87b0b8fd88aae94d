//! WebSocket adapter
//!
//! hyper HTTP/1.1 upgrade into a tokio-tungstenite server socket. Each
//! connection runs a writer loop (frame queue → socket, heartbeat pings,
//! stale detection, per-write timeout) and a reader task (control messages:
//! ping, subscribe/unsubscribe, filter_update, replay). Fatal conditions send
//! an error frame and close with a 4xxx code; backpressure and staleness go
//! through the subscriber's close reason.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{Message, Role, WebSocketConfig};
use tracing::{debug, warn};

use flowcast_broker::{
    CloseReason, EventBroker, EventFilter, Frame, ReplayOptions, StreamSession, Subscriber,
    TransportKind,
};
use flowcast_protocol::{
    AckMetadata, BrokerError, ClientFrame, ReplaySummary, ServerFrame, wrap_event_frame,
};

use crate::handler::{ConnectionQuery, FlowcastHandler, server_capabilities};
use crate::response::{BoxedBody, error_response, full_body};

type WsSink = SplitSink<WebSocketStream<TokioIo<Upgraded>>, Message>;
type WsSource = SplitStream<WebSocketStream<TokioIo<Upgraded>>>;

/// `GET /api/stream/ws/{streamId}`: upgrade and serve
pub async fn handle_upgrade(
    handler: &FlowcastHandler,
    req: Request<Incoming>,
    stream_id: &str,
    options: ConnectionQuery,
    request_id: &str,
) -> Response<BoxedBody> {
    let wants_websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let key = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let (Some(key), true) = (key, wants_websocket) else {
        return error_response(
            &BrokerError::Validation {
                reasons: vec!["not a WebSocket upgrade request".to_string()],
            },
            request_id,
        );
    };

    let broker = Arc::clone(&handler.broker);
    let Some(session) = broker.session_by_stream_id(stream_id).await else {
        return error_response(
            &BrokerError::NotFound(format!("stream {stream_id}")),
            request_id,
        );
    };

    // Capacity and terminal-status failures surface as plain HTTP errors
    // before the protocol switch
    let (subscriber, rx) = match broker
        .attach_subscriber(&session, TransportKind::WebSocket, options.filters.clone())
        .await
    {
        Ok(attached) => attached,
        Err(err) => return error_response(&err, request_id),
    };

    let accept = derive_accept_key(key.as_bytes());
    let upgrade = hyper::upgrade::on(req);

    let connection = WsConnection {
        broker,
        session,
        subscriber,
        rx,
        include_history: options.include_history,
        history_limit: options.history_limit,
    };
    tokio::spawn(async move {
        match upgrade.await {
            Ok(upgraded) => connection.serve(upgraded).await,
            Err(err) => {
                warn!(error = %err, "WebSocket upgrade failed after handshake");
                connection
                    .broker
                    .detach_subscriber(&connection.session, &connection.subscriber.subscriber_id);
            }
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept)
        .body(full_body(Bytes::new()))
        .unwrap()
}

struct WsConnection {
    broker: Arc<EventBroker>,
    session: Arc<StreamSession>,
    subscriber: Arc<Subscriber>,
    rx: mpsc::Receiver<Frame>,
    include_history: bool,
    history_limit: usize,
}

impl WsConnection {
    async fn serve(self, upgraded: Upgraded) {
        let WsConnection {
            broker,
            session,
            subscriber,
            rx,
            include_history,
            history_limit,
        } = self;

        let max_message_size = broker.config().max_message_size_bytes;
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(max_message_size))
            .max_frame_size(Some(max_message_size));
        let socket = WebSocketStream::from_raw_socket(
            TokioIo::new(upgraded),
            Role::Server,
            Some(ws_config),
        )
        .await;
        let (mut sink, source) = socket.split();

        subscriber.mark_live();
        debug!(
            subscriber_id = %subscriber.subscriber_id,
            stream_id = session.stream_id(),
            "WebSocket subscriber connected"
        );

        // The ack goes out before anything else on this connection
        let ack = ServerFrame::connection_ack(AckMetadata {
            subscriber_id: subscriber.subscriber_id.clone(),
            stream_id: session.stream_id().to_string(),
            server_capabilities: server_capabilities(),
        });
        let ack_json = serde_json::to_string(&ack).unwrap_or_else(|_| "{}".to_string());
        let write_timeout = broker.config().write_timeout;
        if timeout(write_timeout, sink.send(Message::text(ack_json)))
            .await
            .map(|r| r.is_err())
            .unwrap_or(true)
        {
            broker.detach_subscriber(&session, &subscriber.subscriber_id);
            return;
        }

        if include_history {
            spawn_replay(
                Arc::clone(&broker),
                Arc::clone(&session),
                Arc::clone(&subscriber),
                ReplayOptions {
                    max_events: Some(history_limit),
                    ..ReplayOptions::default()
                },
            );
        }

        let reader = tokio::spawn(read_loop(
            source,
            Arc::clone(&broker),
            Arc::clone(&session),
            Arc::clone(&subscriber),
        ));

        write_loop(
            &mut sink,
            rx,
            Arc::clone(&subscriber),
            session.config().heartbeat_interval,
            write_timeout,
            max_message_size,
        )
        .await;

        // Writer done: tear the whole connection down
        subscriber.cancel.cancel();
        reader.abort();
        broker.detach_subscriber(&session, &subscriber.subscriber_id);
        debug!(
            subscriber_id = %subscriber.subscriber_id,
            "WebSocket subscriber disconnected"
        );
    }
}

/// Outbound pump: subscriber queue → socket, heartbeats, stale detection
async fn write_loop(
    sink: &mut WsSink,
    mut rx: mpsc::Receiver<Frame>,
    subscriber: Arc<Subscriber>,
    heartbeat: Duration,
    write_timeout: Duration,
    max_message_size: usize,
) {
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await; // the first tick fires immediately
    let stale_after_ms = 2 * heartbeat.as_millis() as i64;

    loop {
        tokio::select! {
            maybe_frame = rx.recv() => {
                let Some(frame) = maybe_frame else { break };
                let text = frame_to_json(frame);

                if text.len() > max_message_size {
                    warn!(
                        subscriber_id = %subscriber.subscriber_id,
                        size = text.len(),
                        "outbound message over size cap; closing"
                    );
                    let oversize = ServerFrame::error(
                        "MESSAGE_TOO_LARGE",
                        format!("outbound message exceeds {max_message_size} bytes"),
                    );
                    if let Ok(json) = serde_json::to_string(&oversize) {
                        let _ = timeout(write_timeout, sink.send(Message::text(json))).await;
                    }
                    subscriber.close(CloseReason::Fatal {
                        code: 1009,
                        message: "message_too_large".to_string(),
                    });
                    continue;
                }

                match timeout(write_timeout, sink.send(Message::text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(error = %err, "WebSocket write failed; client gone");
                        break;
                    }
                    Err(_) => {
                        subscriber.close(CloseReason::WriteTimeout);
                    }
                }
            }
            _ = ticker.tick() => {
                let silent = Utc::now().timestamp_millis() - subscriber.last_seen_ms();
                if silent > stale_after_ms {
                    warn!(
                        subscriber_id = %subscriber.subscriber_id,
                        silent_ms = silent,
                        "no pong within twice the heartbeat interval"
                    );
                    subscriber.close(CloseReason::StaleSubscriber);
                } else if timeout(write_timeout, sink.send(Message::Ping(Bytes::new())))
                    .await
                    .map(|r| r.is_err())
                    .unwrap_or(true)
                {
                    break;
                }
            }
            _ = subscriber.cancel.cancelled() => {
                let reason = subscriber
                    .close_reason()
                    .unwrap_or(CloseReason::Shutdown);
                let close = Message::Close(Some(CloseFrame {
                    code: CloseCode::from(reason.ws_code()),
                    reason: reason.as_str().to_string().into(),
                }));
                let _ = timeout(write_timeout, sink.send(close)).await;
                break;
            }
        }
    }
}

/// Inbound pump: control messages from the client
async fn read_loop(
    mut source: WsSource,
    broker: Arc<EventBroker>,
    session: Arc<StreamSession>,
    subscriber: Arc<Subscriber>,
) {
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => {
                subscriber.touch_seen();
                handle_client_frame(text.as_str(), &broker, &session, &subscriber);
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => subscriber.touch_seen(),
            Ok(Message::Close(_)) => {
                debug!(subscriber_id = %subscriber.subscriber_id, "client sent close");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "WebSocket read failed");
                break;
            }
        }
    }
    subscriber.cancel.cancel();
}

fn handle_client_frame(
    text: &str,
    broker: &Arc<EventBroker>,
    session: &Arc<StreamSession>,
    subscriber: &Arc<Subscriber>,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            let _ = subscriber.enqueue_direct(Frame::Warning {
                code: "VALIDATION_ERROR".to_string(),
                message: format!("unrecognized client message: {err}"),
            });
            return;
        }
    };

    match frame {
        ClientFrame::Ping => {
            let _ = subscriber.enqueue_direct(Frame::Pong);
        }
        ClientFrame::Subscribe { payload } => {
            subscriber.update_filters(|filters| filters.push(EventFilter::from_spec(payload)));
        }
        ClientFrame::Unsubscribe { payload } => {
            let types = payload.and_then(|p| p.event_types);
            subscriber.update_filters(|filters| filters.unsubscribe(types.as_deref()));
        }
        ClientFrame::FilterUpdate { payload } => {
            subscriber.update_filters(|filters| {
                filters.replace(
                    payload
                        .filters
                        .into_iter()
                        .map(EventFilter::from_spec)
                        .collect(),
                )
            });
        }
        ClientFrame::Replay { payload } => {
            let options = payload.map(ReplayOptions::from).unwrap_or_default();
            spawn_replay(
                Arc::clone(broker),
                Arc::clone(session),
                Arc::clone(subscriber),
                options,
            );
        }
    }
}

fn spawn_replay(
    broker: Arc<EventBroker>,
    session: Arc<StreamSession>,
    subscriber: Arc<Subscriber>,
    options: ReplayOptions,
) {
    tokio::spawn(async move {
        if let Err(err) = broker.replay(&session, &subscriber, options).await {
            let _ = subscriber.enqueue_direct(Frame::Warning {
                code: err.code().to_string(),
                message: err.to_string(),
            });
        }
    });
}

/// Serialize one queue frame into its WebSocket envelope
fn frame_to_json(frame: Frame) -> String {
    match frame {
        Frame::Event { json, .. } => wrap_event_frame(&json),
        Frame::ReplayComplete(summary) => {
            serde_json::to_string(&ServerFrame::ReplayComplete { metadata: summary })
                .unwrap_or_else(|_| fallback_replay_complete(summary))
        }
        Frame::Warning { code, message } => {
            serde_json::to_string(&ServerFrame::error(code, message))
                .unwrap_or_else(|_| r#"{"type":"error"}"#.to_string())
        }
        Frame::Pong => r#"{"type":"pong"}"#.to_string(),
    }
}

fn fallback_replay_complete(summary: ReplaySummary) -> String {
    format!(
        r#"{{"type":"replay_complete","metadata":{{"eventsReplayed":{},"totalEventsConsidered":{},"durationMs":{}}}}}"#,
        summary.events_replayed, summary.total_events_considered, summary.duration_ms
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_to_json_event_envelope() {
        let text = frame_to_json(Frame::Event {
            json: Arc::from(r#"{"id":"evt_1","type":"HEARTBEAT"}"#),
            event_id: "evt_1".into(),
            event_type: flowcast_protocol::EventType::Heartbeat,
        });
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["event"]["id"], "evt_1");
    }

    #[test]
    fn test_frame_to_json_pong_and_replay_complete() {
        assert_eq!(frame_to_json(Frame::Pong), r#"{"type":"pong"}"#);

        let text = frame_to_json(Frame::ReplayComplete(ReplaySummary {
            events_replayed: 2,
            total_events_considered: 3,
            duration_ms: 4,
        }));
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "replay_complete");
        assert_eq!(value["metadata"]["eventsReplayed"], 2);
    }

    #[test]
    fn test_warning_maps_to_error_frame() {
        let text = frame_to_json(Frame::Warning {
            code: "CAPACITY_EXCEEDED".into(),
            message: "too slow".into(),
        });
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["code"], "CAPACITY_EXCEEDED");
    }
}
