//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ShieldConfig (validated, immutable)
//!     → sections handed to each component constructor
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::AbuseConfig;
pub use schema::AdminConfig;
pub use schema::IncidentConfig;
pub use schema::ObservabilityConfig;
pub use schema::RateLimitConfig;
pub use schema::SessionConfig;
pub use schema::ShieldConfig;
