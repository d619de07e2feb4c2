//! Shared utilities for integration testing.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use endpoint_router::config::ServerConfig;
use endpoint_router::http::{HttpServer, ServerError, ServerEvent};
use endpoint_router::lifecycle::Shutdown;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Config pointing at `routes` with limits suited to tests.
pub fn test_config(routes: &Path) -> ServerConfig {
    let mut config = ServerConfig::with_routes(routes.to_string_lossy());
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config
}

/// Run `server` on an ephemeral loopback port.
pub async fn spawn_server(server: HttpServer) -> (SocketAddr, Shutdown, JoinHandle<Result<(), ServerError>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    let handle = tokio::spawn(server.run(listener));
    (addr, shutdown, handle)
}

/// Wait for the first event accepted by `pick`, skipping the rest.
#[allow(dead_code)]
pub async fn next_event<T>(
    rx: &mut broadcast::Receiver<ServerEvent>,
    mut pick: impl FnMut(ServerEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(found) = pick(rx.recv().await.unwrap()) {
                return found;
            }
        }
    })
    .await
    .expect("event not received in time")
}
