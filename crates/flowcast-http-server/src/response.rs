//! Response body helpers
//!
//! Everything the server returns is an `UnsyncBoxBody` so buffered JSON and
//! streaming SSE bodies share one response type.

use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::{Response, StatusCode};
use serde::Serialize;
use serde_json::json;

use flowcast_protocol::{BrokerError, ErrorBody, PROTOCOL_VERSION};

/// Unified response body type
pub type BoxedBody = http_body_util::combinators::UnsyncBoxBody<Bytes, hyper::Error>;

/// Buffered body from bytes
pub fn full_body(bytes: Bytes) -> BoxedBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

pub fn empty_response(status: StatusCode) -> Response<BoxedBody> {
    Response::builder()
        .status(status)
        .body(full_body(Bytes::new()))
        .unwrap()
}

/// `{success:true, data, metadata}` JSON response
pub fn json_response<T: Serialize>(
    status: StatusCode,
    data: &T,
    request_id: &str,
) -> Response<BoxedBody> {
    let body = json!({
        "success": true,
        "data": data,
        "metadata": {
            "requestId": request_id,
            "version": PROTOCOL_VERSION,
            "timestamp": Utc::now().to_rfc3339(),
        },
    });
    let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());

    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(full_body(Bytes::from(bytes)))
        .unwrap()
}

/// Standard error body with the taxonomy's status mapping
pub fn error_response(err: &BrokerError, request_id: &str) -> Response<BoxedBody> {
    let body = ErrorBody::from_error(err, request_id);
    let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());

    Response::builder()
        .status(StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(full_body(Bytes::from(bytes)))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_status_matches_taxonomy() {
        let err = BrokerError::NotFound("stream x".into());
        let response = error_response(&err, "req-1");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_json_response_is_ok() {
        let response = json_response(StatusCode::OK, &serde_json::json!({"a": 1}), "req-2");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
