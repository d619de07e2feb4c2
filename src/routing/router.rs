//! Prefix-scoped route collections.
//!
//! # Responsibilities
//! - Register endpoints through verb-specific calls (`get`, `post`, ...)
//! - Nest sub-routers whose prefixes compose onto the parent's
//! - Flatten a router tree into the endpoints it exposes
//!
//! # Design Decisions
//! - Route keys are `"<verb>:<path>"`; re-registering a key replaces it
//! - Endpoint paths are stored fully composed with the router prefix
//! - Ordered maps keep flattening deterministic

use std::collections::BTreeMap;
use std::future::Future;

use axum::{body::Body, http::Request, response::Response};

use crate::http::context::Context;
use crate::routing::endpoint::{Endpoint, HandlerError, RouteOptions, Verb};
use crate::routing::path::convert_path;

/// Anything that can be mounted on the server: exposes a [`Router`].
///
/// Custom router types wrap a `Router` and implement this so that their
/// declared routes (see [`crate::routing::annotations`]) are discovered too.
pub trait RouteSource: Send + Sync + 'static {
    fn router(&self) -> &Router;

    fn prefix(&self) -> &str {
        self.router().prefix()
    }
}

/// A named collection of endpoints and sub-routers sharing a prefix.
#[derive(Debug, Clone)]
pub struct Router {
    prefix: String,
    routes: BTreeMap<String, Endpoint>,
    subrouters: BTreeMap<String, Router>,
}

impl Router {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            routes: BTreeMap::new(),
            subrouters: BTreeMap::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn routes(&self) -> &BTreeMap<String, Endpoint> {
        &self.routes
    }

    pub fn subrouters(&self) -> &BTreeMap<String, Router> {
        &self.subrouters
    }

    /// Look up an endpoint by verb and the path it was registered with.
    pub fn endpoint(&self, verb: Verb, path: &str) -> Option<&Endpoint> {
        self.routes.get(&route_key(verb, path))
    }

    /// Same as [`Router::convert_path`](crate::routing::path::convert_path).
    pub fn convert_path(&self, prefix: &str, to_merge: &str) -> String {
        convert_path(prefix, to_merge)
    }

    /// Create (or replace) the sub-router for `prefix` and return it.
    pub fn route(&mut self, prefix: &str) -> &mut Router {
        let composed = convert_path(&self.prefix, prefix);
        let slot = self
            .subrouters
            .entry(composed.clone())
            .or_insert_with(|| Router::new(composed.clone()));
        *slot = Router::new(composed);
        slot
    }

    /// Register `handler` for `verb` at `path`.
    pub fn on<F, Fut>(&mut self, verb: Verb, path: &str, options: RouteOptions, handler: F) -> &mut Self
    where
        F: Fn(Context, Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        let endpoint = Endpoint::from_handler(verb, convert_path(&self.prefix, path), options, handler);
        self.insert(path, endpoint);
        self
    }

    /// Insert a prebuilt endpoint under the key for `raw_path`.
    pub fn insert(&mut self, raw_path: &str, endpoint: Endpoint) -> &mut Self {
        self.routes.insert(route_key(endpoint.verb(), raw_path), endpoint);
        self
    }

    pub fn get<F, Fut>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Context, Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        self.on(Verb::Get, path, RouteOptions::default(), handler)
    }

    pub fn get_with<F, Fut>(&mut self, path: &str, options: RouteOptions, handler: F) -> &mut Self
    where
        F: Fn(Context, Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        self.on(Verb::Get, path, options, handler)
    }

    pub fn post<F, Fut>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Context, Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        self.on(Verb::Post, path, RouteOptions::default(), handler)
    }

    pub fn post_with<F, Fut>(&mut self, path: &str, options: RouteOptions, handler: F) -> &mut Self
    where
        F: Fn(Context, Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        self.on(Verb::Post, path, options, handler)
    }

    pub fn put<F, Fut>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Context, Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        self.on(Verb::Put, path, RouteOptions::default(), handler)
    }

    pub fn put_with<F, Fut>(&mut self, path: &str, options: RouteOptions, handler: F) -> &mut Self
    where
        F: Fn(Context, Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        self.on(Verb::Put, path, options, handler)
    }

    pub fn patch<F, Fut>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Context, Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        self.on(Verb::Patch, path, RouteOptions::default(), handler)
    }

    pub fn patch_with<F, Fut>(&mut self, path: &str, options: RouteOptions, handler: F) -> &mut Self
    where
        F: Fn(Context, Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        self.on(Verb::Patch, path, options, handler)
    }

    pub fn delete<F, Fut>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(Context, Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        self.on(Verb::Delete, path, RouteOptions::default(), handler)
    }

    pub fn delete_with<F, Fut>(&mut self, path: &str, options: RouteOptions, handler: F) -> &mut Self
    where
        F: Fn(Context, Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        self.on(Verb::Delete, path, options, handler)
    }

    /// Every endpoint of this router and of its sub-routers, depth-first.
    pub fn flatten(&self) -> Vec<Endpoint> {
        let mut endpoints = Vec::new();
        self.collect_into(&mut endpoints);
        endpoints
    }

    fn collect_into(&self, out: &mut Vec<Endpoint>) {
        out.extend(self.routes.values().cloned());
        for subrouter in self.subrouters.values() {
            subrouter.collect_into(out);
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Router::new("/")
    }
}

impl RouteSource for Router {
    fn router(&self) -> &Router {
        self
    }
}

fn route_key(verb: Verb, path: &str) -> String {
    format!("{}:{}", verb.as_str(), path)
}
