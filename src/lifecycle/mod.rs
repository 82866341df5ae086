//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Signal received → broadcast → server drains, sweeper exits
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!
//! Sweeper (sweeper.rs):
//!     interval tick → DefenseStack::sweep (memory bounding only)
//! ```

pub mod shutdown;
pub mod signals;
pub mod sweeper;

pub use shutdown::Shutdown;
