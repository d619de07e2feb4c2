//! Endpoint descriptors.
//!
//! # Responsibilities
//! - Describe one route: verb, path pattern, declared requirements, handler
//! - Normalise user handlers into a single boxed, shareable function type
//! - Carry handler failures as [`HandlerError`] with a kind and a message
//!
//! # Design Decisions
//! - Immutable once built; cloning shares the handler through an `Arc`
//! - Handlers receive an explicit [`Context`] instead of an implicit receiver
//! - Any `std::error::Error` converts into [`HandlerError`] so handlers can use `?`

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request},
    response::Response,
    routing::MethodFilter,
};
use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

use crate::http::context::Context;
use crate::security::rate_limit::RateLimitStatus;

/// Boxed error type accepted from route factories and validators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The future every endpoint handler resolves to.
pub type HandlerFuture = BoxFuture<'static, Result<Response, HandlerError>>;

/// A type-erased endpoint handler.
pub type EndpointFn = Arc<dyn Fn(Context, Request<Body>) -> HandlerFuture + Send + Sync>;

/// HTTP verbs an endpoint can be declared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Verb {
    pub const ALL: [Verb; 5] = [Verb::Get, Verb::Post, Verb::Put, Verb::Patch, Verb::Delete];

    /// Lowercase name, as used in route keys (`get:/users`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::Post => "post",
            Verb::Put => "put",
            Verb::Patch => "patch",
            Verb::Delete => "delete",
        }
    }

    pub fn method(&self) -> Method {
        match self {
            Verb::Get => Method::GET,
            Verb::Post => Method::POST,
            Verb::Put => Method::PUT,
            Verb::Patch => Method::PATCH,
            Verb::Delete => Method::DELETE,
        }
    }

    pub fn filter(&self) -> MethodFilter {
        match self {
            Verb::Get => MethodFilter::GET,
            Verb::Post => MethodFilter::POST,
            Verb::Put => MethodFilter::PUT,
            Verb::Patch => MethodFilter::PATCH,
            Verb::Delete => MethodFilter::DELETE,
        }
    }

    /// Case-insensitive comparison against an inbound request method.
    pub fn matches(&self, method: &Method) -> bool {
        method.as_str().eq_ignore_ascii_case(self.as_str())
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method().as_str())
    }
}

/// Returned when parsing a verb name that is not supported.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported HTTP verb '{0}'")]
pub struct UnknownVerb(pub String);

impl FromStr for Verb {
    type Err = UnknownVerb;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verb::ALL
            .into_iter()
            .find(|verb| verb.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownVerb(s.to_string()))
    }
}

/// A declared query or path parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    pub required: bool,
}

impl Requirement {
    pub fn required(name: impl Into<String>) -> Self {
        Self { name: name.into(), required: true }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self { name: name.into(), required: false }
    }
}

/// Optional metadata accepted by the registration calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteOptions {
    pub query_params: Vec<Requirement>,
    pub parameters: Vec<Requirement>,
}

impl RouteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, requirement: Requirement) -> Self {
        self.query_params.push(requirement);
        self
    }

    pub fn param(mut self, requirement: Requirement) -> Self {
        self.parameters.push(requirement);
        self
    }
}

/// One route: verb + path pattern + handler.
#[derive(Clone)]
pub struct Endpoint {
    verb: Verb,
    path: String,
    query_params: Vec<Requirement>,
    parameters: Vec<Requirement>,
    run: EndpointFn,
}

impl Endpoint {
    pub fn new(verb: Verb, path: impl Into<String>, options: RouteOptions, run: EndpointFn) -> Self {
        Self {
            verb,
            path: path.into(),
            query_params: options.query_params,
            parameters: options.parameters,
            run,
        }
    }

    /// Build an endpoint from an async handler function.
    pub fn from_handler<F, Fut>(verb: Verb, path: impl Into<String>, options: RouteOptions, handler: F) -> Self
    where
        F: Fn(Context, Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        let run: EndpointFn = Arc::new(move |ctx, req| handler(ctx, req).boxed());
        Self::new(verb, path, options, run)
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_params(&self) -> &[Requirement] {
        &self.query_params
    }

    pub fn parameters(&self) -> &[Requirement] {
        &self.parameters
    }

    pub fn has_requirements(&self) -> bool {
        !self.query_params.is_empty() || !self.parameters.is_empty()
    }

    /// Invoke the handler.
    pub fn run(&self, ctx: Context, request: Request<Body>) -> HandlerFuture {
        (self.run)(ctx, request)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("verb", &self.verb)
            .field("path", &self.path)
            .field("query_params", &self.query_params)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// A failure raised by an endpoint handler.
///
/// Must not implement `std::error::Error`: the blanket `From<E: Error>`
/// conversion below depends on it.
pub struct HandlerError {
    kind: String,
    message: String,
    source: Option<BoxError>,
    rate_limit: Option<RateLimitStatus>,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            source: None,
            rate_limit: None,
        }
    }

    /// Wrap an already boxed error.
    pub fn boxed(error: BoxError) -> Self {
        Self {
            kind: "Error".to_string(),
            message: error.to_string(),
            source: Some(error),
            rate_limit: None,
        }
    }

    /// Convert a panic payload caught while running a handler.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        };
        Self::new("Panic", message)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn source(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// Budget of the client whose request failed, if it was rate limited.
    pub fn rate_limit(&self) -> Option<&RateLimitStatus> {
        self.rate_limit.as_ref()
    }

    pub fn with_rate_limit(mut self, status: RateLimitStatus) -> Self {
        self.rate_limit = Some(status);
        self
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self {
            kind: short_type_name::<E>().to_string(),
            message: error.to_string(),
            source: Some(Box::new(error)),
            rate_limit: None,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerError")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("source", &self.source)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
