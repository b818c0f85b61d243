//! Default configuration values
//!
//! Provides default configuration instances and helper functions.

use super::schema::Settings;

/// Get the default settings
pub fn default_settings() -> Settings {
    Settings::default()
}
