//! HTTP surface.
//!
//! Adapts the caching handler to an axum [`Router`] with the GraphQL
//! endpoint and a Prometheus metrics endpoint. The reverse-proxy module
//! in front of this router (TLS, routing, websockets) is out of scope;
//! this is the seam it mounts.

use crate::error::Error;
use crate::handler::{ClientRequest, SharedCachingHandler};
use crate::metrics::CacheMetrics;
use crate::origin::BufferedSink;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;

/// Build the HTTP router: `POST /graphql` for proxied requests and
/// `GET /metrics` for Prometheus scrapes.
pub fn graphql_router(handler: SharedCachingHandler) -> Router {
    Router::new()
        .route("/graphql", post(handle_graphql))
        .route("/metrics", get(render_metrics))
        .with_state(handler)
}

async fn handle_graphql(
    State(handler): State<SharedCachingHandler>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload = String::from_utf8_lossy(&body).into_owned();
    let request = ClientRequest::new(payload, headers);
    let mut sink = BufferedSink::new();

    match handler.handle(&request, &mut sink).await {
        Ok(()) => sink_response(sink),
        Err(e) => error_response(&e),
    }
}

async fn render_metrics() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4")
        .body(Body::from(CacheMetrics::global().render()))
        .expect("static response")
}

fn sink_response(sink: BufferedSink) -> Response {
    let status = StatusCode::from_u16(sink.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::builder().status(status);

    if let Some(header_map) = response.headers_mut() {
        for (name, value) in &sink.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            let Ok(value) = HeaderValue::from_str(value) else {
                continue;
            };
            header_map.append(name, value);
        }
    }

    response
        .body(Body::from(sink.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn error_response(error: &Error) -> Response {
    let status = match error {
        Error::Upstream(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    tracing::error!(error = %error, "request handling failed");

    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(error.to_graphql_body().to_string()))
        .unwrap_or_else(|_| status.into_response())
}
