//! Request-defense and session-lifecycle core.
//!
//! Four cooperating components keyed by an opaque identity string:
//! a dual-window [`RateLimiter`](security::RateLimiter), a heuristic
//! [`AbuseDetector`](security::AbuseDetector), an
//! [`IncidentCoordinator`](security::IncidentCoordinator) that escalates
//! violations into blocks and incidents, and a
//! [`SessionRegistry`](security::SessionRegistry) with token revocation.
//! [`DefenseStack`](security::DefenseStack) wires them into one decision
//! pipeline; `http` and `admin` expose it over axum.

// Core
pub mod clock;
pub mod config;
pub mod error;
pub mod security;

// Service host
pub mod admin;
pub mod http;
pub mod lifecycle;
pub mod observability;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::ShieldConfig;
pub use error::{ShieldError, ShieldResult};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use security::{Decision, DefenseStack, InboundRequest};
