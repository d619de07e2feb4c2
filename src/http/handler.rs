//! Per-request dispatch policy.
//!
//! # Responsibilities
//! - Reject requests whose verb differs from the matched endpoint's (405)
//! - Run parameter requirement validation when a validator is installed
//! - Account requests against per-client budgets, refusing exhausted ones (429)
//! - Invoke the endpoint handler and hand its result back to the caller
//! - Periodically purge expired budget records
//!
//! # Design Decisions
//! - Policy outcomes are ordinary responses; only handler failures are `Err`
//! - A handler panic is reported as an `Err` of kind `Panic`
//! - A limited client's failure carries its budget so the 500 gets the headers too
//! - A budget unit is spent once per admitted request, even if it is aborted
//! - No timeout is applied to handlers: a hung handler hangs its response

use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use axum::{
    body::Body,
    extract::{ConnectInfo, MatchedPath},
    http::{Request, StatusCode},
    response::Response,
};
use futures_util::FutureExt;
use tokio::task::JoinHandle;

use crate::http::context::Context;
use crate::http::events::EventBus;
use crate::http::response::{apply_rate_limit_headers, json_message, rate_limited};
use crate::observability::metrics;
use crate::routing::endpoint::{Endpoint, HandlerError};
use crate::security::rate_limit::{Admission, RateLimiter};

const TITLE: &str = "RequestHandler";

/// Checks an inbound request against an endpoint's declared requirements.
pub trait RequirementValidator: Send + Sync {
    /// Return a client-facing message when the request is unacceptable.
    fn validate(&self, request: &Request<Body>, endpoint: &Endpoint) -> Result<(), String>;
}

/// Requires every `required` query parameter to be present.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequiredQueryParams;

impl RequirementValidator for RequiredQueryParams {
    fn validate(&self, request: &Request<Body>, endpoint: &Endpoint) -> Result<(), String> {
        let query = request.uri().query().unwrap_or("");
        let present: Vec<&str> = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| pair.split('=').next().unwrap_or(pair))
            .collect();

        match endpoint
            .query_params()
            .iter()
            .find(|req| req.required && !present.contains(&req.name.as_str()))
        {
            Some(missing) => Err(format!("Missing required query parameter '{}'", missing.name)),
            None => Ok(()),
        }
    }
}

/// The single choke point every matched endpoint is invoked through.
pub struct RequestHandler {
    context: Context,
    limiter: Arc<RateLimiter>,
    validator: Option<Arc<dyn RequirementValidator>>,
    purge_task: Mutex<Option<JoinHandle<()>>>,
}

impl RequestHandler {
    /// Create a handler and start its purge sweep on the current tokio runtime.
    ///
    /// Outside a runtime no sweep runs; expired records are still renewed on lookup.
    pub fn new(context: Context) -> Self {
        let config = context.config().rate_limit.clone();
        let interval = config.purge_interval();
        let limiter = Arc::new(RateLimiter::new(config));
        let purge_task = spawn_purge(Arc::downgrade(&limiter), context.events().clone(), interval);

        Self {
            context,
            limiter,
            validator: None,
            purge_task: Mutex::new(purge_task),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn RequirementValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Apply dispatch policy to `request` and run `endpoint` if it passes.
    pub async fn handle(&self, request: Request<Body>, endpoint: &Endpoint) -> Result<Response, HandlerError> {
        let method = request.method().clone();
        let matched = request
            .extensions()
            .get::<MatchedPath>()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| request.uri().path().to_string());

        self.context.debug(
            TITLE,
            format!(
                "Matched {} {} against endpoint {} {}",
                method,
                matched,
                endpoint.verb(),
                endpoint.path()
            ),
        );

        if !endpoint.verb().matches(&method) {
            return Ok(json_message(
                StatusCode::METHOD_NOT_ALLOWED,
                format!(
                    "Endpoint \"{}\" only accepts {} requests, received {}",
                    endpoint.path(),
                    endpoint.verb(),
                    method
                ),
            ));
        }

        if endpoint.has_requirements() {
            if let Some(validator) = &self.validator {
                if let Err(message) = validator.validate(&request, endpoint) {
                    return Ok(json_message(StatusCode::BAD_REQUEST, message));
                }
            }
        }

        let Some(ip) = peer_ip(&request) else {
            return self.run_endpoint(endpoint, request).await;
        };

        match self.limiter.check(ip) {
            Admission::Exempt => self.run_endpoint(endpoint, request).await,
            Admission::Limited(status) => {
                tracing::warn!(client = %ip, path = %endpoint.path(), "Rate limit exceeded");
                metrics::record_rate_limited();
                Ok(rate_limited(&status, SystemTime::now()))
            }
            Admission::Allowed(status) => {
                let mut permit = self.limiter.permit(ip);
                let result = self.run_endpoint(endpoint, request).await;
                permit.settle();

                match result {
                    Ok(mut response) => {
                        apply_rate_limit_headers(response.headers_mut(), &status);
                        Ok(response)
                    }
                    Err(error) => Err(error.with_rate_limit(status)),
                }
            }
        }
    }

    /// Run the endpoint, reporting a panic as a `Panic` error.
    async fn run_endpoint(&self, endpoint: &Endpoint, request: Request<Body>) -> Result<Response, HandlerError> {
        match AssertUnwindSafe(endpoint.run(self.context.clone(), request))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::from_panic(panic)),
        }
    }

    /// Run one purge sweep now. Returns the number of records removed.
    pub fn purge(&self) -> usize {
        purge_once(&self.limiter, self.context.events())
    }

    /// Stop the purge sweep. Later calls do nothing.
    pub fn dispose(&self) {
        let task = self.purge_task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            self.context.debug(TITLE, "Disposing request handler");
            task.abort();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.purge_task.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

impl Drop for RequestHandler {
    fn drop(&mut self) {
        let task = self.purge_task.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

fn peer_ip(request: &Request<Body>) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

fn purge_once(limiter: &RateLimiter, events: &EventBus) -> usize {
    let tracked = limiter.len();
    let removed = limiter.purge_expired(SystemTime::now());
    if tracked > 0 {
        events.debug(TITLE, format!("Cleaned up {} of {} records", removed, tracked));
    }
    removed
}

fn spawn_purge(limiter: Weak<RateLimiter>, events: EventBus, interval: Duration) -> Option<JoinHandle<()>> {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!("No tokio runtime available, rate limit purge sweep disabled");
        return None;
    };

    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match limiter.upgrade() {
                Some(limiter) => {
                    purge_once(&limiter, &events);
                }
                None => break,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::routing::endpoint::{Requirement, RouteOptions, Verb};
    use axum::response::IntoResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(max_requests: u32) -> Context {
        let mut config = ServerConfig::with_routes("./routes");
        config.rate_limit.max_requests = max_requests;
        Context::new(EventBus::new(), Arc::new(config))
    }

    fn counting_endpoint(verb: Verb, hits: Arc<AtomicUsize>) -> Endpoint {
        Endpoint::from_handler(verb, "/count", RouteOptions::default(), move |_, _| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok("counted".into_response())
            }
        })
    }

    fn request_from(method: &str, ip: [u8; 4]) -> Request<Body> {
        let mut request = Request::builder()
            .method(method)
            .uri("/count")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((ip, 40_000))));
        request
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_verb_mismatch_is_405_without_running_handler() {
        let handler = RequestHandler::new(context(10));
        let hits = Arc::new(AtomicUsize::new(0));
        let endpoint = counting_endpoint(Verb::Post, hits.clone());

        let response = handler.handle(request_from("GET", [10, 0, 0, 1]), &endpoint).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let body = body_json(response).await;
        let message = body["message"].as_str().unwrap();
        assert!(message.contains("POST"));
        assert!(message.contains("GET"));
    }

    #[tokio::test]
    async fn test_verb_comparison_ignores_case() {
        let handler = RequestHandler::new(context(10));
        let hits = Arc::new(AtomicUsize::new(0));
        let endpoint = counting_endpoint(Verb::Get, hits.clone());

        let response = handler.handle(request_from("get", [10, 0, 0, 1]), &endpoint).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_exhaustion() {
        let handler = RequestHandler::new(context(3));
        let hits = Arc::new(AtomicUsize::new(0));
        let endpoint = counting_endpoint(Verb::Get, hits.clone());

        for expected_remaining in [3, 2, 1] {
            let response = handler.handle(request_from("GET", [10, 0, 0, 2]), &endpoint).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers()["x-ratelimit-remaining"],
                expected_remaining.to_string().as_str()
            );
            assert_eq!(response.headers()["x-ratelimit-limit"], "3");
            assert!(response.headers().contains_key("x-ratelimit-reset"));
        }

        let response = handler.handle(request_from("GET", [10, 0, 0, 2]), &endpoint).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        // Other clients keep their own budget.
        let response = handler.handle(request_from("GET", [10, 0, 0, 3]), &endpoint).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_loopback_never_limited() {
        let handler = RequestHandler::new(context(1));
        let hits = Arc::new(AtomicUsize::new(0));
        let endpoint = counting_endpoint(Verb::Get, hits.clone());

        for _ in 0..10 {
            let response = handler.handle(request_from("GET", [127, 0, 0, 1]), &endpoint).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key("x-ratelimit-remaining"));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_handler_error_is_returned_and_budget_spent() {
        let handler = RequestHandler::new(context(5));
        let endpoint = Endpoint::from_handler(Verb::Get, "/fail", RouteOptions::default(), |_, _| async {
            Err(HandlerError::new("Boom", "it broke"))
        });

        let err = handler.handle(request_from("GET", [10, 0, 0, 4]), &endpoint).await.unwrap_err();
        assert_eq!(err.kind(), "Boom");
        assert_eq!(err.rate_limit().map(|s| s.remaining), Some(5));

        let record = handler.limiter().record(IpAddr::from([10, 0, 0, 4])).unwrap();
        assert_eq!(record.remaining, 4);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_an_error_with_budget() {
        let handler = RequestHandler::new(context(5));
        let endpoint = Endpoint::from_handler(Verb::Get, "/panic", RouteOptions::default(), |_, _| async {
            if true {
                panic!("handler exploded");
            }
            Ok("unreachable".into_response())
        });

        let err = handler.handle(request_from("GET", [10, 0, 0, 6]), &endpoint).await.unwrap_err();
        assert_eq!(err.kind(), "Panic");
        assert_eq!(err.message(), "handler exploded");
        assert!(err.rate_limit().is_some());

        let record = handler.limiter().record(IpAddr::from([10, 0, 0, 6])).unwrap();
        assert_eq!(record.remaining, 4);
    }

    #[tokio::test]
    async fn test_aborted_request_spends_budget_once() {
        let handler = RequestHandler::new(context(5));
        let endpoint = Endpoint::from_handler(Verb::Get, "/hang", RouteOptions::default(), |_, _| async {
            futures_util::future::pending::<()>().await;
            Ok("never".into_response())
        });

        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            handler.handle(request_from("GET", [10, 0, 0, 5]), &endpoint),
        )
        .await;
        assert!(outcome.is_err(), "hung handlers are not timed out by the dispatcher");

        let record = handler.limiter().record(IpAddr::from([10, 0, 0, 5])).unwrap();
        assert_eq!(record.remaining, 4);
    }

    #[tokio::test]
    async fn test_required_query_params_validator() {
        let handler = RequestHandler::new(context(5)).with_validator(Arc::new(RequiredQueryParams));
        let endpoint = Endpoint::from_handler(
            Verb::Get,
            "/search",
            RouteOptions::new()
                .query(Requirement::required("q"))
                .query(Requirement::optional("page")),
            |_, _| async { Ok("found".into_response()) },
        );

        let request = Request::builder().uri("/search?page=2").body(Body::empty()).unwrap();
        let response = handler.handle(request, &endpoint).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["message"], "Missing required query parameter 'q'");

        let request = Request::builder().uri("/search?q=rust").body(Body::empty()).unwrap();
        let response = handler.handle(request, &endpoint).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_requirements_ignored_without_validator() {
        let handler = RequestHandler::new(context(5));
        let endpoint = Endpoint::from_handler(
            Verb::Get,
            "/search",
            RouteOptions::new().query(Requirement::required("q")),
            |_, _| async { Ok("found".into_response()) },
        );

        let request = Request::builder().uri("/search").body(Body::empty()).unwrap();
        let response = handler.handle(request, &endpoint).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_debug_event_describes_match() {
        let ctx = context(5);
        let mut events = ctx.events().subscribe();
        let handler = RequestHandler::new(ctx);
        let endpoint = counting_endpoint(Verb::Get, Arc::new(AtomicUsize::new(0)));

        handler.handle(request_from("GET", [127, 0, 0, 1]), &endpoint).await.unwrap();

        match events.recv().await.unwrap() {
            crate::http::events::ServerEvent::Debug(message) => {
                assert_eq!(message, "[RequestHandler] Matched GET /count against endpoint GET /count");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let handler = RequestHandler::new(context(5));
        assert!(!handler.is_disposed());

        handler.dispose();
        handler.dispose();
        assert!(handler.is_disposed());
    }

    fn sweeping_context(purge_interval_ms: u64) -> Context {
        let mut config = ServerConfig::with_routes("./routes");
        config.rate_limit.purge_interval_ms = purge_interval_ms;
        Context::new(EventBus::new(), Arc::new(config))
    }

    fn expired_and_live_records(handler: &RequestHandler) {
        let long_ago = SystemTime::now() - Duration::from_secs(2 * 60 * 60);
        handler.limiter().check_at(IpAddr::from([198, 51, 100, 1]), long_ago);
        handler.limiter().check_at(IpAddr::from([198, 51, 100, 2]), SystemTime::now());
        assert_eq!(handler.limiter().len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_records_on_its_own() {
        let handler = RequestHandler::new(sweeping_context(20));
        let mut events = handler.context().events().subscribe();
        expired_and_live_records(&handler);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handler.limiter().len(), 1);
        assert!(handler.limiter().record(IpAddr::from([198, 51, 100, 2])).is_some());

        match events.recv().await.unwrap() {
            crate::http::events::ServerEvent::Debug(message) => assert!(message.contains("Cleaned up 1 of 2 records")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_sweep_after_dispose() {
        let handler = RequestHandler::new(sweeping_context(20));
        handler.dispose();
        expired_and_live_records(&handler);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handler.limiter().len(), 2);
    }

    #[test]
    fn test_no_runtime_means_no_sweep() {
        let handler = RequestHandler::new(context(5));
        assert!(handler.is_disposed());
        handler.dispose();
    }
}
