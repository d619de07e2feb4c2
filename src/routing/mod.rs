//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Registration (at startup):
//!     Router tree / RouteManifest
//!     → annotations.rs (declared endpoints bound to the instance)
//!     → router.rs (direct and nested endpoints, flattened)
//!     → manager.rs (dispatch table, last write wins)
//!     → axum::Router (materialised once)
//!
//! Incoming Request:
//!     → axum matches (verb, path)
//!     → manager.rs dispatch wrapper
//!     → RequestHandler policy → Endpoint handler
//! ```
//!
//! # Design Decisions
//! - Routes compiled at startup, immutable at runtime
//! - Deterministic: same registrations always yield the same table

pub mod annotations;
pub mod endpoint;
pub mod manager;
pub mod manifest;
pub mod path;
pub mod router;

pub use annotations::{AnnotationError, RouteDeclaration, RouteRegistry};
pub use endpoint::{BoxError, Endpoint, HandlerError, Requirement, RouteOptions, Verb};
pub use manager::{DiscoveryError, DispatchTable, EndpointManager};
pub use manifest::{MountedRouter, RouteManifest};
pub use router::{RouteSource, Router};
