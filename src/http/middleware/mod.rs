//! Middleware wrapped around the dispatch table.

pub mod request_events;

pub use request_events::request_events_middleware;
