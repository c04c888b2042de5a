use std::{convert::Infallible, sync::Arc};

use axum::{
    body::{Body, Bytes},
    extract::{Path, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

/// One request as seen by the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordedRequest {
    pub id: Uuid,
    pub method: String,
    pub path: String,
}

/// What `/echo` reports about the request it received.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Echo {
    pub method: String,
    pub content_length: Option<u64>,
    pub transfer_encoding: Option<String>,
    pub body_length: usize,
    pub body: String,
}

pub type Log = Arc<RwLock<Vec<RecordedRequest>>>;

pub fn app() -> Router {
    let log: Log = Arc::new(RwLock::new(Vec::new()));
    Router::new()
        .route("/status/{code}", any(status))
        .route("/redirect", any(redirect))
        .route("/redirect/{code}", any(redirect_with))
        .route("/headers", any(headers))
        .route("/echo", any(echo))
        .route("/throttled", get(throttled))
        .route("/requests", get(list_requests))
        .layer(middleware::from_fn_with_state(log.clone(), record))
        .with_state(log)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

async fn record(State(log): State<Log>, request: Request, next: Next) -> Response {
    if request.uri().path() != "/requests" {
        let entry = RecordedRequest {
            id: Uuid::new_v4(),
            method: request.method().to_string(),
            path: request.uri().path().to_string(),
        };
        tracing::debug!(method = %entry.method, path = %entry.path, "request");
        log.write().await.push(entry);
    }
    next.run(request).await
}

async fn status(Path(code): Path<u16>) -> Result<Response, StatusCode> {
    let status = StatusCode::from_u16(code).map_err(|_| StatusCode::BAD_REQUEST)?;
    Ok((status, [("X-Foobar", "1")], format!("status {code}")).into_response())
}

async fn redirect(_body: Bytes) -> Response {
    moved(StatusCode::FOUND)
}

/// Any 3xx redirect to `/headers`, after reading a request body if one came.
async fn redirect_with(Path(code): Path<u16>, _body: Bytes) -> Result<Response, StatusCode> {
    match StatusCode::from_u16(code) {
        Ok(status) if status.is_redirection() => Ok(moved(status)),
        _ => Err(StatusCode::BAD_REQUEST),
    }
}

fn moved(status: StatusCode) -> Response {
    (
        status,
        [(header::LOCATION, "/headers"), (header::HeaderName::from_static("foo1"), "bar")],
        "moved",
    )
        .into_response()
}

async fn headers(_body: Bytes) -> impl IntoResponse {
    (StatusCode::OK, [("foo2", "bar")], "final")
}

async fn echo(method: Method, headers: HeaderMap, body: Bytes) -> Json<Echo> {
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let transfer_encoding = headers
        .get(header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Json(Echo {
        method: method.to_string(),
        content_length,
        transfer_encoding,
        body_length: body.len(),
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

/// Sends `abc` and then never finishes the body.
async fn throttled() -> Response {
    let body = stream::once(async { Ok::<_, Infallible>(Bytes::from_static(b"abc")) })
        .chain(stream::pending());
    Response::builder()
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn list_requests(State(log): State<Log>) -> Json<Vec<RecordedRequest>> {
    Json(log.read().await.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_serializes_missing_lengths_as_null() {
        let echo = Echo {
            method: "POST".to_string(),
            content_length: None,
            transfer_encoding: Some("chunked".to_string()),
            body_length: 3,
            body: "abc".to_string(),
        };
        let json = serde_json::to_value(&echo).unwrap();
        assert_eq!(json["content_length"], serde_json::Value::Null);
        assert_eq!(json["transfer_encoding"], "chunked");
        assert_eq!(json["body_length"], 3);
    }

    #[test]
    fn recorded_request_roundtrips_through_json() {
        let entry = RecordedRequest {
            id: Uuid::new_v4(),
            method: "GET".to_string(),
            path: "/status/200".to_string(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: RecordedRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, entry.id);
        assert_eq!(back.path, entry.path);
    }
}
