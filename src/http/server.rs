//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Own the event stream, the request handler and the endpoint manager
//! - Load the route directory before accepting traffic
//! - Wire up middleware (user hooks, request events, tracing, request ID)
//! - Bind the dispatch table to a listener and serve until shutdown
//!
//! # Design Decisions
//! - The dispatch table is materialised into axum once, when serving starts
//! - Unknown paths get a bare 404 from the fallback
//! - User middleware wraps the routes and the fallback; the first one added runs first
//! - The request handler is disposed once serving stops

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::{http::StatusCode, middleware};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::config::{validate_config, ConfigError, ServerConfig};
use crate::http::context::Context;
use crate::http::events::{EventBus, Network, NetworkKind, ServerEvent};
use crate::http::handler::RequestHandler;
use crate::http::middleware::request_events_middleware;
use crate::http::request::{propagate_request_id_layer, set_request_id_layer};
use crate::lifecycle::Shutdown;
use crate::routing::annotations::RouteRegistry;
use crate::routing::manager::{DiscoveryError, DispatchTable, EndpointManager};
use crate::routing::manifest::{MountedRouter, RouteManifest};
use crate::routing::router::RouteSource;

const TITLE: &str = "HttpServer";

/// Failure while starting or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// Hook that wraps the application with extra layers.
pub type Middleware = Arc<dyn Fn(axum::Router) -> axum::Router + Send + Sync>;

/// HTTP server exposing mounted routers.
pub struct HttpServer {
    config: Arc<ServerConfig>,
    context: Context,
    requests: Arc<RequestHandler>,
    manager: EndpointManager,
    manifest: RouteManifest,
    middleware: Vec<Middleware>,
    shutdown: Shutdown,
    shutdown_rx: broadcast::Receiver<()>,
}

impl HttpServer {
    /// Create a server from a validated configuration.
    ///
    /// The request handler's purge sweep starts on the current tokio runtime, if any.
    pub fn new(config: ServerConfig) -> Result<Self, ConfigError> {
        validate_config(&config).map_err(ConfigError::Validation)?;

        let config = Arc::new(config);
        let events = EventBus::new();
        let context = Context::new(events.clone(), Arc::clone(&config));
        let requests = Arc::new(RequestHandler::new(context.clone()));
        let manager = EndpointManager::new(Arc::new(RouteRegistry::new()), events);
        let shutdown = Shutdown::new();
        let shutdown_rx = shutdown.subscribe();

        Ok(Self {
            config,
            context,
            requests,
            manager,
            manifest: RouteManifest::new(),
            middleware: Vec::new(),
            shutdown,
            shutdown_rx,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        self.context.events()
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn requests(&self) -> &Arc<RequestHandler> {
        &self.requests
    }

    /// Registry that router types declare their routes in.
    pub fn registry(&self) -> &Arc<RouteRegistry> {
        self.manager.registry()
    }

    /// Factories the route directory is resolved against.
    pub fn manifest_mut(&mut self) -> &mut RouteManifest {
        &mut self.manifest
    }

    pub fn endpoints(&self) -> &EndpointManager {
        &self.manager
    }

    pub fn add_router<R: RouteSource>(&mut self, router: Arc<R>) -> &mut Self {
        self.manager.add_router(router);
        self
    }

    pub fn mount(&mut self, mounted: MountedRouter) -> &mut Self {
        self.manager.mount(mounted);
        self
    }

    /// Wrap every request, matched or not, in `layer`, e.g.
    /// `|app| app.layer(axum::middleware::from_fn(stamp))`.
    pub fn with_middleware<F>(&mut self, layer: F) -> &mut Self
    where
        F: Fn(axum::Router) -> axum::Router + Send + Sync + 'static,
    {
        self.middleware.push(Arc::new(layer));
        self
    }

    /// Handle that stops a running server from elsewhere.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Ask the server to stop accepting connections and drain.
    pub fn close(&self) {
        self.context.debug(TITLE, "Closing");
        self.shutdown.trigger();
    }

    /// Build the axum application for the routers mounted so far.
    pub fn into_router(&self) -> axum::Router {
        build_app(
            self.manager.table().clone(),
            Arc::clone(&self.requests),
            &self.middleware,
            self.events().clone(),
        )
    }

    /// Load the route directory, then serve on `listener` until shut down.
    pub async fn run(mut self, listener: TcpListener) -> Result<(), ServerError> {
        if let Some(routes) = self.config.routes.clone() {
            self.manager.load(&routes, &self.manifest).await?;
        }

        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            routes = self.manager.table().len(),
            "HTTP server starting"
        );

        let events = self.events().clone();
        let app = build_app(
            self.manager.table().clone(),
            Arc::clone(&self.requests),
            &self.middleware,
            events.clone(),
        );
        let external = if addr.ip().is_unspecified() {
            first_external_ipv4()
        } else {
            None
        };
        events.emit(ServerEvent::Listening(networks(addr, external)));

        let mut shutdown_rx = self.shutdown_rx;
        let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await;

        self.requests.dispose();
        served?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

fn build_app(
    table: DispatchTable,
    requests: Arc<RequestHandler>,
    user_middleware: &[Middleware],
    events: EventBus,
) -> axum::Router {
    let app = table.into_router(requests).fallback(|| async { StatusCode::NOT_FOUND });
    // last applied is outermost
    let app = user_middleware.iter().rev().fold(app, |app, layer| layer(app));

    app.layer(middleware::from_fn_with_state(events, request_events_middleware))
        .layer(propagate_request_id_layer())
        .layer(TraceLayer::new_for_http())
        .layer(set_request_id_layer())
}

/// Addresses reported in the `listening` event.
///
/// For an unspecified bind, `external` (the first non-loopback IPv4
/// interface) is listed after `localhost` when one was found.
fn networks(addr: SocketAddr, external: Option<Ipv4Addr>) -> Vec<Network> {
    let port = addr.port();
    let mut networks = Vec::new();

    if addr.ip().is_unspecified() {
        networks.push(Network {
            kind: NetworkKind::Local,
            host: format!("http://localhost:{}", port),
        });
        if let Some(ip) = external {
            networks.push(Network {
                kind: NetworkKind::Network,
                host: format!("http://{}:{}", ip, port),
            });
        }
    }

    let host = match addr {
        SocketAddr::V4(v4) => v4.ip().to_string(),
        SocketAddr::V6(v6) => format!("[{}]", v6.ip()),
    };
    let bound = format!("http://{}:{}", host, port);
    if !networks.iter().any(|network| network.host == bound) {
        networks.push(Network {
            kind: NetworkKind::Network,
            host: bound,
        });
    }
    networks
}

fn first_external_ipv4() -> Option<Ipv4Addr> {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            tracing::debug!(error = %e, "Failed to list network interfaces");
            return None;
        }
    };
    interfaces
        .iter()
        .filter(|interface| !interface.is_loopback())
        .find_map(|interface| match interface.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
}
