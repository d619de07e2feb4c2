//! Prefix-composed routers dispatched through a rate-limited request handler.

pub mod config;
pub mod http;
pub mod routing;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod security;

pub use config::schema::ServerConfig;
pub use http::{Context, HttpServer};
pub use lifecycle::Shutdown;
pub use routing::{Endpoint, HandlerError, RouteOptions, RouteSource, Router, Verb};
