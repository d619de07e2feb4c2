//! Request Events Middleware.
//! Publishes a `request` event for every finished request.

use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{header, Request},
    middleware::Next,
    response::Response,
};

use crate::http::events::{EventBus, RequestProperties, ServerEvent};
use crate::observability::metrics;

pub async fn request_events_middleware(State(events): State<EventBus>, req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let url = match req.headers().get(header::HOST).and_then(|h| h.to_str().ok()) {
        Some(host) => format!("http://{}{}", host, req.uri()),
        None => req.uri().to_string(),
    };

    let response = next.run(req).await;
    let status = response.status();

    metrics::record_request(&method, status.as_u16(), start);
    events.emit(ServerEvent::Request(RequestProperties {
        status: status.to_string(),
        method,
        path,
        time: start.elapsed().as_secs_f64() * 1000.0,
        url,
    }));

    response
}
