//! Capabilities handed to every endpoint handler.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::http::events::EventBus;

/// Server facilities available inside a handler.
#[derive(Debug, Clone)]
pub struct Context {
    events: EventBus,
    config: Arc<ServerConfig>,
}

impl Context {
    pub fn new(events: EventBus, config: Arc<ServerConfig>) -> Self {
        Self { events, config }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shorthand for emitting a `[title] message` debug event.
    pub fn debug(&self, title: &str, message: impl AsRef<str>) {
        self.events.debug(title, message);
    }
}
