//! endpoint-router server
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ axum (request id, trace, request events)
//!                         │
//!                         ▼
//!                  dispatch table ── (verb, path) ──▶ RequestHandler
//!                         ▲                             │ verb check
//!                         │                             │ rate limit
//!                  EndpointManager                      ▼
//!                         ▲                          Endpoint
//!                         │
//!          Routers (added directly or by route directory)
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::{response::IntoResponse, Json};
use clap::Parser;
use serde_json::json;
use tokio::net::TcpListener;

use endpoint_router::config::{read_config, validate_config, ConfigError, ServerConfig};
use endpoint_router::http::HttpServer;
use endpoint_router::lifecycle::forward_signals;
use endpoint_router::observability::{logging, metrics};
use endpoint_router::routing::{RouteRegistry, RouteSource, Router, Verb};

#[derive(Parser)]
#[command(name = "endpoint-router")]
#[command(about = "Serve prefix-composed routers over HTTP", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Route directory, overrides `routes` from the config file
    #[arg(short, long)]
    routes: Option<String>,

    /// Bind address, overrides `listener.bind_address`
    #[arg(short, long)]
    bind: Option<String>,
}

/// Built-in router reporting liveness and uptime.
struct StatusRouter {
    router: Router,
    started: Instant,
}

impl StatusRouter {
    fn declare(registry: &RouteRegistry) {
        registry
            .declare_route::<StatusRouter>("/uptime", Verb::Get, None)
            .method("uptime", |this: Arc<StatusRouter>, _ctx, _req| async move {
                Ok(Json(json!({ "uptime_secs": this.started.elapsed().as_secs() })).into_response())
            });
    }
}

impl Default for StatusRouter {
    fn default() -> Self {
        let mut router = Router::new("/status");
        router.get("/", |ctx, _req| async move {
            Ok(Json(json!({
                "status": "ok",
                "rate_limit": ctx.config().rate_limit.enabled,
            }))
            .into_response())
        });

        Self {
            router,
            started: Instant::now(),
        }
    }
}

impl RouteSource for StatusRouter {
    fn router(&self) -> &Router {
        &self.router
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => read_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(routes) = cli.routes {
        config.routes = Some(routes);
    }
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init_logging(&config.observability.log_level);
    tracing::info!("endpoint-router v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        routes = config.routes.as_deref().unwrap_or_default(),
        rate_limit = config.rate_limit.enabled,
        max_requests = config.rate_limit.max_requests,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;

    let mut server = HttpServer::new(config)?;
    StatusRouter::declare(server.registry());
    server.manifest_mut().register_default::<StatusRouter>("status");
    server.add_router(Arc::new(StatusRouter::default()));

    forward_signals(server.shutdown_handle());
    server.run(listener).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
