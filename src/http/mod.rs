//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (axum setup, connect info)
//!     → request.rs (add request ID)
//!     → middleware (request events)
//!     → [dispatch table matches verb and path]
//!     → handler.rs (verb check, rate limit, run endpoint)
//!     → response.rs (JSON policy and error bodies)
//!     → Send to client
//! ```

pub mod context;
pub mod events;
pub mod handler;
pub mod middleware;
pub mod request;
pub mod response;
pub mod server;

pub use context::Context;
pub use events::{EventBus, Network, NetworkKind, RequestProperties, ServerEvent};
pub use handler::{RequestHandler, RequiredQueryParams, RequirementValidator};
pub use request::{RequestIdExt, X_REQUEST_ID};
pub use server::{HttpServer, Middleware, ServerError};
