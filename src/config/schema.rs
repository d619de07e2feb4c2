//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration.
    pub listener: ListenerConfig,

    /// Directory scanned for route modules. Required.
    pub routes: Option<String>,

    /// Rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl ServerConfig {
    /// Defaults with the route directory set.
    pub fn with_routes(routes: impl Into<String>) -> Self {
        Self {
            routes: Some(routes.into()),
            ..Self::default()
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:3621").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3621".to_string(),
        }
    }
}

/// Longest accepted rate-limit window: one leap year.
pub const MAX_WINDOW_SECS: u64 = 366 * 24 * 60 * 60;

/// Longest accepted interval between purge sweeps: one day.
pub const MAX_PURGE_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000;

/// Per-client rate limiting.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Requests allowed per client within one window.
    pub max_requests: u32,

    /// Window length in seconds.
    pub window_secs: u64,

    /// Interval between purge sweeps in milliseconds.
    pub purge_interval_ms: u64,

    /// Skip accounting for loopback clients.
    pub exempt_loopback: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 1000,
            window_secs: 60 * 60,
            purge_interval_ms: 30_000,
            exempt_loopback: true,
        }
    }
}

impl RateLimitConfig {
    /// Window length, capped at [`MAX_WINDOW_SECS`].
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.min(MAX_WINDOW_SECS))
    }

    /// Sweep interval, kept within 1ms and [`MAX_PURGE_INTERVAL_MS`].
    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms.clamp(1, MAX_PURGE_INTERVAL_MS))
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
