//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Require the route directory option
//! - Validate value ranges (budgets > 0, bounded intervals, address parses)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{ServerConfig, MAX_PURGE_INTERVAL_MS, MAX_WINDOW_SECS};

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    MissingRoutes,
    InvalidBindAddress(String),
    ZeroMaxRequests,
    ZeroWindow,
    WindowTooLarge(u64),
    ZeroPurgeInterval,
    PurgeIntervalTooLarge(u64),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingRoutes => write!(f, "`routes` was not set, point it at a route directory"),
            ValidationError::InvalidBindAddress(addr) => write!(f, "invalid bind address '{}'", addr),
            ValidationError::ZeroMaxRequests => write!(f, "rate_limit.max_requests must be greater than 0"),
            ValidationError::ZeroWindow => write!(f, "rate_limit.window_secs must be greater than 0"),
            ValidationError::WindowTooLarge(secs) => {
                write!(f, "rate_limit.window_secs is {}, at most {} is allowed", secs, MAX_WINDOW_SECS)
            }
            ValidationError::ZeroPurgeInterval => write!(f, "rate_limit.purge_interval_ms must be greater than 0"),
            ValidationError::PurgeIntervalTooLarge(ms) => {
                write!(f, "rate_limit.purge_interval_ms is {}, at most {} is allowed", ms, MAX_PURGE_INTERVAL_MS)
            }
        }
    }
}

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.routes.as_deref().map_or(true, |r| r.trim().is_empty()) {
        errors.push(ValidationError::MissingRoutes);
    }

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(config.listener.bind_address.clone()));
    }

    let limits = &config.rate_limit;
    if limits.enabled {
        if limits.max_requests == 0 {
            errors.push(ValidationError::ZeroMaxRequests);
        }
        if limits.window_secs == 0 {
            errors.push(ValidationError::ZeroWindow);
        } else if limits.window_secs > MAX_WINDOW_SECS {
            errors.push(ValidationError::WindowTooLarge(limits.window_secs));
        }
        if limits.purge_interval_ms == 0 {
            errors.push(ValidationError::ZeroPurgeInterval);
        } else if limits.purge_interval_ms > MAX_PURGE_INTERVAL_MS {
            errors.push(ValidationError::PurgeIntervalTooLarge(limits.purge_interval_ms));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
