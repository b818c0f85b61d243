//! Diagnostics
//!
//! Posted configuration errors and the reconstitution ("paranoia") checker that
//! compares the compiled overview against per-source fragments.
//!
//! Structure:
//! - `error_log.rs` - errors and notices keyed by rkey
//! - `paranoia.rs` - overview reconstitution and diff

pub mod error_log;
pub mod paranoia;

pub use error_log::{ErrorLog, GLOBAL_ERROR_KEY, PostedError};
pub use paranoia::{IntermediateSource, ParanoiaReport, check as paranoia_check};
