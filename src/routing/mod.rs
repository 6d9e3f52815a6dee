//! Host-based service routing.
//!
//! # Data Flow
//! ```text
//! Host header
//!     → normalize_host (lowercase, port dropped)
//!     → ServiceRouter::resolve
//!     → service pool, or the default pool when nothing matches
//!     → DispatchEngine::route_lease
//! ```
//!
//! # Design Decisions
//! - Every service owns a complete engine (registry, dispatcher, health
//!   checker), so pools never share selection state or connection counts
//! - The Host table is fixed at startup; reloads only retune existing pools

pub mod router;

pub use router::{normalize_host, Service, ServiceRouter, DEFAULT_POOL};
