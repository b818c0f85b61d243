//! CLI command handling module
//!
//! Handles all CLI subcommands and argument parsing.

mod commands;
mod logging;
mod pipeline;
mod version;

pub use commands::{handle_config_command, ConfigSubcommand};
pub use logging::*;
pub use pipeline::{
    compile, fetch, handle_compile, handle_paranoia, handle_resources, load_settings, InputArgs,
};
pub use version::display_version;
