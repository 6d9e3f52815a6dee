//! HTTP forwarding subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, tracing)
//!     → client_key (X-Forwarded-For / X-Real-IP / peer)
//!     → DispatchEngine::route_lease
//!     → hyper client → backend
//!     → lease.finish(outcome)
//!     → Send to client
//! ```

pub mod server;

pub use server::{client_key, AppState, HttpServer};
