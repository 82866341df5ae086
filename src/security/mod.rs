//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request (pipeline.rs):
//!     → incident/ (identity or source blocked?)
//!     → rate_limit.rs (minute + hour buckets)
//!     → abuse/ (heuristic cascade, keyword watch)
//!     → incident/ (violations, auto-block, remediation)
//!     → Decision
//!
//! Authenticated traffic:
//!     → session.rs (validity, timeout, token blacklist)
//! ```
//!
//! # Design Decisions
//! - Defense in depth: the coordinator owns identity blocks, the detector
//!   keeps its own device blocks
//! - Components share nothing but the identity string
//! - Every map is keyed by identity and bounded (eviction.rs)
//! - Blocked requests are decisions, never errors

pub mod abuse;
pub mod eviction;
pub mod incident;
pub mod pipeline;
pub mod rate_limit;
pub mod session;

pub use abuse::AbuseDetector;
pub use incident::IncidentCoordinator;
pub use pipeline::{Decision, DefenseStack, InboundRequest};
pub use rate_limit::RateLimiter;
pub use session::SessionRegistry;
