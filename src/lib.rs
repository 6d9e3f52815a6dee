//! Health-aware backend dispatch engine.
//!
//! A registry of backends kept current by active and passive health checks,
//! a set of selection algorithms, and a dispatcher that picks a healthy
//! backend per request. Engines are grouped into Host-routed service pools
//! and wrapped by a forwarding HTTP proxy and an admin API.

// Dispatch core
pub mod engine;
pub mod health;
pub mod load_balancer;
pub mod tuning;

// Outer surfaces
pub mod admin;
pub mod config;
pub mod http;
pub mod routing;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::schema::DispatchConfig;
pub use engine::{BackendView, DispatchEngine};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use load_balancer::{Algorithm, DispatchError};
pub use routing::ServiceRouter;
pub use tuning::Tuning;
