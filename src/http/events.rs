//! Server event stream.
//!
//! # Responsibilities
//! - Fan out `listening`, `request`, `debug` and `error` events to subscribers
//! - Mirror every event into `tracing`
//!
//! # Design Decisions
//! - Backed by a `tokio::sync::broadcast` channel, so emitting never blocks
//! - Emitting with no subscribers is not an error
//! - Slow subscribers lag and lose old events rather than stalling requests

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::routing::endpoint::HandlerError;

const EVENT_CAPACITY: usize = 1024;

/// Kind of address reported in a `listening` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Network,
    Local,
    Sock,
}

/// One address the server is reachable on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Network {
    pub kind: NetworkKind,
    pub host: String,
}

/// Summary of a finished request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestProperties {
    /// Status code and reason, e.g. `200 OK`.
    pub status: String,
    pub method: String,
    pub path: String,
    /// Elapsed time in milliseconds.
    pub time: f64,
    pub url: String,
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    Listening(Vec<Network>),
    Request(RequestProperties),
    Debug(String),
    Error(Arc<HandlerError>),
}

/// Cloneable handle to the server's event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ServerEvent) {
        match &event {
            ServerEvent::Listening(networks) => {
                for network in networks {
                    tracing::info!(kind = ?network.kind, host = %network.host, "Listening");
                }
            }
            ServerEvent::Request(props) => {
                tracing::info!(
                    status = %props.status,
                    method = %props.method,
                    path = %props.path,
                    time_ms = props.time,
                    "Request completed"
                );
            }
            ServerEvent::Debug(message) => tracing::debug!("{}", message),
            ServerEvent::Error(error) => {
                tracing::error!(kind = %error.kind(), error = %error.message(), "Handler failed");
            }
        }

        let _ = self.tx.send(event);
    }

    /// Emit a `[title] message` debug event.
    pub fn debug(&self, title: &str, message: impl AsRef<str>) {
        self.emit(ServerEvent::Debug(format!("[{}] {}", title, message.as_ref())));
    }

    pub fn error(&self, error: Arc<HandlerError>) {
        self.emit(ServerEvent::Error(error));
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
