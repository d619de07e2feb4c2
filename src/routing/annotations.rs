//! Declarative route registration.
//!
//! # Responsibilities
//! - Record route declarations against a router type
//! - Bind the declared methods of a type to a live instance on lookup
//!
//! # Design Decisions
//! - Explicit side registry keyed by `TypeId`; router types themselves are untouched
//! - Declarations accumulate in declaration order
//! - Receiver-less (static) targets are rejected when declared, before any dispatch
//!
//! # Usage
//! ```ignore
//! let registry = RouteRegistry::new();
//! registry
//!     .declare_route::<UsersRouter>("/", Verb::Get, None)
//!     .method("list", |this, ctx, req| async move { this.list(ctx, req).await });
//! let endpoints = registry.get_route_references(&Arc::new(UsersRouter::new()));
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use axum::{body::Body, http::Request, response::Response};
use futures_util::FutureExt;

use crate::http::context::Context;
use crate::routing::endpoint::{Endpoint, EndpointFn, HandlerError, HandlerFuture, RouteOptions, Verb};
use crate::routing::path::convert_path;
use crate::routing::router::RouteSource;

type DeclaredFn<R> = Arc<dyn Fn(Arc<R>, Context, Request<Body>) -> HandlerFuture + Send + Sync>;

/// Errors raised while declaring routes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnnotationError {
    #[error("Method '{type_name}#{method}' was marked as a static method")]
    StaticMethod { type_name: &'static str, method: String },
}

struct Declared<R> {
    method: String,
    verb: Verb,
    path: String,
    options: RouteOptions,
    run: DeclaredFn<R>,
}

/// Route declarations for every router type, keyed by type identity.
#[derive(Default)]
pub struct RouteRegistry {
    entries: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a declaration of `verb path` on router type `R`.
    pub fn declare_route<R: RouteSource>(
        &self,
        path: &str,
        verb: Verb,
        options: Option<RouteOptions>,
    ) -> RouteDeclaration<'_, R> {
        RouteDeclaration {
            registry: self,
            path: path.to_string(),
            verb,
            options: options.unwrap_or_default(),
            _router: PhantomData,
        }
    }

    /// Declared endpoints of `R`, bound to `instance`, in declaration order.
    pub fn get_route_references<R: RouteSource>(&self, instance: &Arc<R>) -> Vec<Endpoint> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let Some(declared) = entries
            .get(&TypeId::of::<R>())
            .and_then(|entry| entry.downcast_ref::<Vec<Declared<R>>>())
        else {
            return Vec::new();
        };

        declared
            .iter()
            .map(|decl| {
                let this = Arc::clone(instance);
                let run = Arc::clone(&decl.run);
                let bound: EndpointFn = Arc::new(move |ctx, req| run(Arc::clone(&this), ctx, req));
                Endpoint::new(
                    decl.verb,
                    convert_path(instance.prefix(), &decl.path),
                    decl.options.clone(),
                    bound,
                )
            })
            .collect()
    }

    /// Names of the methods declared on `R`, in declaration order.
    pub fn declared_methods<R: RouteSource>(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&TypeId::of::<R>())
            .and_then(|entry| entry.downcast_ref::<Vec<Declared<R>>>())
            .map(|declared| declared.iter().map(|d| d.method.clone()).collect())
            .unwrap_or_default()
    }

    fn push<R: RouteSource>(&self, declared: Declared<R>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let slot = entries
            .entry(TypeId::of::<R>())
            .or_insert_with(|| Box::new(Vec::<Declared<R>>::new()));

        if let Some(list) = slot.downcast_mut::<Vec<Declared<R>>>() {
            tracing::trace!(
                router = std::any::type_name::<R>(),
                method = %declared.method,
                verb = %declared.verb,
                path = %declared.path,
                "Route declared"
            );
            list.push(declared);
        }
    }
}

/// A pending route declaration, completed by naming its target.
pub struct RouteDeclaration<'a, R> {
    registry: &'a RouteRegistry,
    path: String,
    verb: Verb,
    options: RouteOptions,
    _router: PhantomData<fn() -> R>,
}

impl<R: RouteSource> RouteDeclaration<'_, R> {
    /// Attach the declaration to an instance method of `R`.
    pub fn method<F, Fut>(self, name: &str, handler: F)
    where
        F: Fn(Arc<R>, Context, Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        let run: DeclaredFn<R> = Arc::new(move |this, ctx, req| handler(this, ctx, req).boxed());
        self.registry.push(Declared {
            method: name.to_string(),
            verb: self.verb,
            path: self.path,
            options: self.options,
            run,
        });
    }

    /// Attach the declaration to a receiver-less associated function.
    ///
    /// Always rejected; nothing is registered.
    pub fn associated<F, Fut>(self, name: &str, _handler: F) -> Result<(), AnnotationError>
    where
        F: Fn(Context, Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        Err(AnnotationError::StaticMethod {
            type_name: std::any::type_name::<R>(),
            method: name.to_string(),
        })
    }
}
