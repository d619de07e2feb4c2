//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Matched request:
//!     → rate_limit.rs (check per-IP budget)
//!     → Pass to the endpoint handler
//! ```
//!
//! # Design Decisions
//! - Budgets are per client IP, not per route
//! - Loopback clients may be exempted

pub mod rate_limit;
