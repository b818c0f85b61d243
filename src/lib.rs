//! edgeconf library
//!
//! Configuration reconciliation for an Envoy-based API gateway: fetch
//! declarative resources, normalize them, compile the gateway IR, and check
//! the compiled result for self-consistency.
//! It can be used both as a binary and as a library for testing.

pub mod cli;
pub mod config;
pub mod diag;
pub mod fetch;
pub mod ir;
pub mod models;

// Re-export commonly used types for convenience
pub use config::Settings;
pub use diag::{ErrorLog, ParanoiaReport};
pub use fetch::{ResourceFetcher, ResourceRecord};
pub use ir::{Ir, ResourceStore};
