//! HTTP surface of the shield.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, trace + timeout layers)
//!     → middleware.rs (identity, payload buffering, DefenseStack::inspect)
//!     → 429 + Retry-After, or the wrapped handler with X-RateLimit-* headers
//! ```

pub mod middleware;
pub mod server;

pub use middleware::{defense_middleware, CallerIdentity};
pub use server::{AppState, HttpServer};
