use std::sync::atomic::{AtomicU64, Ordering};

use axum::body::{to_bytes, Body};
use axum::extract::MatchedPath;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

use crate::excerpt;
use crate::webhook::MAX_BODY_BYTES;

static LOG_COUNTER: AtomicU64 = AtomicU64::new(1);

const SHORT_BODY_MAX_CHARS: usize = 160;

pub async fn log_webhook_request(request: Request<Body>, next: Next) -> Response {
    let method = request.method().as_str().to_string();
    let route = request.extensions().get::<MatchedPath>().map_or_else(
        || request.uri().path().to_string(),
        |matched_path| matched_path.as_str().to_string(),
    );
    let log_number = LOG_COUNTER.fetch_add(1, Ordering::Relaxed);
    let handler = handler_name(method.as_str(), route.as_str());

    let (parts, body) = request.into_parts();
    let Ok(body_bytes) = to_bytes(body, MAX_BODY_BYTES).await else {
        warn!(
            request = log_number,
            handler, %route, limit = MAX_BODY_BYTES, "request body unreadable or too large"
        );
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    };

    let short_body = excerpt::shorten(&String::from_utf8_lossy(&body_bytes), SHORT_BODY_MAX_CHARS);
    info!(request = log_number, handler, %route, body = %short_body, "request");

    let request = Request::from_parts(parts, Body::from(body_bytes));
    let response = next.run(request).await;
    info!(
        request = log_number,
        handler,
        status = response.status().as_u16(),
        "response"
    );
    response
}

fn handler_name(method: &str, route: &str) -> &'static str {
    match (method, route) {
        ("POST", "/webhook") => "handlers.receive_webhook",
        ("GET", "/health") => "handlers.health",
        ("GET", "/status") => "handlers.status",
        _ => "unknown.unknown_handler",
    }
}
