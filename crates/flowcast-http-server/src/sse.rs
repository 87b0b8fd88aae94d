//! Server-Sent Events adapter
//!
//! One subscriber per response body. The stream yields the
//! `connection_established` event, then frames from the subscriber queue
//! interleaved with heartbeats. History on connect goes through the replay
//! service so the replay gate keeps live events ordered behind the preamble.
//! Client disconnects surface as the body being dropped, which detaches the
//! subscriber through a guard.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde_json::json;
use tracing::{debug, warn};

use flowcast_broker::{EventBroker, Frame, ReplayOptions, StreamSession, TransportKind};
use flowcast_protocol::{AckMetadata, sse_names};

use crate::handler::{ConnectionQuery, FlowcastHandler, server_capabilities};
use crate::response::{BoxedBody, error_response};

/// Format one SSE frame: `id:<id>\nevent:<name>\ndata:<json>\n\n`
pub fn format_sse(id: Option<&str>, event_name: &str, data: &str) -> String {
    let mut out = String::with_capacity(data.len() + event_name.len() + 24);
    if let Some(id) = id {
        out.push_str("id:");
        out.push_str(id);
        out.push('\n');
    }
    out.push_str("event:");
    out.push_str(event_name);
    out.push('\n');
    out.push_str("data:");
    out.push_str(data);
    out.push_str("\n\n");
    out
}

/// Detaches the subscriber when the response body is dropped
struct DetachGuard {
    broker: Arc<EventBroker>,
    session: Arc<StreamSession>,
    subscriber_id: String,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        debug!(subscriber_id = %self.subscriber_id, "SSE body dropped; detaching");
        self.broker
            .detach_subscriber(&self.session, &self.subscriber_id);
    }
}

/// `GET /api/stream/sse/{streamId}`
pub async fn handle_sse(
    handler: &FlowcastHandler,
    stream_id: &str,
    options: ConnectionQuery,
    request_id: &str,
) -> Response<BoxedBody> {
    let broker = Arc::clone(&handler.broker);

    let Some(session) = broker.session_by_stream_id(stream_id).await else {
        return error_response(
            &flowcast_protocol::BrokerError::NotFound(format!("stream {stream_id}")),
            request_id,
        );
    };

    let (subscriber, mut rx) = match broker
        .attach_subscriber(&session, TransportKind::Sse, options.filters.clone())
        .await
    {
        Ok(attached) => attached,
        Err(err) => return error_response(&err, request_id),
    };
    subscriber.mark_live();

    if options.include_history {
        let replay_broker = Arc::clone(&broker);
        let replay_session = Arc::clone(&session);
        let replay_subscriber = Arc::clone(&subscriber);
        let history_limit = options.history_limit;
        tokio::spawn(async move {
            let result = replay_broker
                .replay(
                    &replay_session,
                    &replay_subscriber,
                    ReplayOptions {
                        max_events: Some(history_limit),
                        ..ReplayOptions::default()
                    },
                )
                .await;
            if let Err(err) = result {
                let _ = replay_subscriber.enqueue_direct(Frame::Warning {
                    code: err.code().to_string(),
                    message: err.to_string(),
                });
            }
        });
    }

    let ack = AckMetadata {
        subscriber_id: subscriber.subscriber_id.clone(),
        stream_id: session.stream_id().to_string(),
        server_capabilities: server_capabilities(),
    };
    let heartbeat = session.config().heartbeat_interval;
    let max_event_size = broker.config().max_event_size_bytes;
    let guard = DetachGuard {
        broker: Arc::clone(&broker),
        session: Arc::clone(&session),
        subscriber_id: subscriber.subscriber_id.clone(),
    };
    let cancel = subscriber.cancel.clone();
    let sub = Arc::clone(&subscriber);

    let sse_stream = async_stream::stream! {
        let _guard = guard;

        let ack_json = serde_json::to_string(&ack).unwrap_or_else(|_| "{}".to_string());
        yield format_sse(None, sse_names::CONNECTION_ESTABLISHED, &ack_json);

        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                maybe_frame = rx.recv() => {
                    match maybe_frame {
                        Some(Frame::Event { json, event_id, .. }) => {
                            if json.len() > max_event_size {
                                warn!(%event_id, size = json.len(), "oversize event dropped for SSE subscriber");
                                let notice = json!({
                                    "code": "EVENT_TOO_LARGE",
                                    "message": format!("event {event_id} exceeds {max_event_size} bytes and was dropped"),
                                }).to_string();
                                yield format_sse(None, sse_names::WARNING, &notice);
                            } else {
                                yield format_sse(Some(&event_id), sse_names::STREAM_EVENT, &json);
                                sub.touch_seen();
                            }
                        }
                        Some(Frame::ReplayComplete(summary)) => {
                            let data = serde_json::to_string(&summary)
                                .unwrap_or_else(|_| "{}".to_string());
                            yield format_sse(None, sse_names::REPLAY_COMPLETE, &data);
                        }
                        Some(Frame::Warning { code, message }) => {
                            let data = json!({"code": code, "message": message}).to_string();
                            yield format_sse(None, sse_names::WARNING, &data);
                        }
                        Some(Frame::Pong) => {}
                        None => {
                            debug!("subscriber queue closed; ending SSE stream");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let data = json!({"timestamp": chrono::Utc::now().to_rfc3339()}).to_string();
                    yield format_sse(None, sse_names::HEARTBEAT, &data);
                    sub.touch_seen();
                }
                _ = cancel.cancelled() => {
                    let reason = sub
                        .close_reason()
                        .map(|r| r.as_str().to_string())
                        .unwrap_or_else(|| "closed".to_string());
                    let data = json!({"reason": reason}).to_string();
                    yield format_sse(None, sse_names::CONNECTION_CLOSE, &data);
                    break;
                }
            }
        }
    };

    let body_stream =
        sse_stream.map(|chunk: String| Ok(hyper::body::Frame::data(Bytes::from(chunk))));
    let body = StreamBody::new(body_stream).boxed_unsync();

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .header("Connection", "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(body)
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_framing_matches_contract() {
        let frame = format_sse(Some("evt_1"), "stream_event", r#"{"a":1}"#);
        assert_eq!(frame, "id:evt_1\nevent:stream_event\ndata:{\"a\":1}\n\n");
    }

    #[test]
    fn test_sse_framing_without_id() {
        let frame = format_sse(None, "heartbeat", "{}");
        assert_eq!(frame, "event:heartbeat\ndata:{}\n\n");
    }
}
