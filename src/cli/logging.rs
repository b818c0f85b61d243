//! Logging initialization

use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Initialize logging.
///
/// With `debug`, everything goes to a persisted temp file and the path is
/// returned. Otherwise posted errors and warnings go to stderr at `level`.
pub fn init_logging(debug: bool, level: &str) -> Option<PathBuf> {
    if debug {
        let temp_file = tempfile::Builder::new()
            .prefix("edgeconf-")
            .suffix(".log")
            .tempfile()
            .map(|f| {
                let path = f.path().to_path_buf();
                // Leak the handle so the file outlives the process
                std::mem::forget(f);
                path
            })
            .unwrap_or_else(|_| {
                std::env::temp_dir().join(format!("edgeconf-{}.log", std::process::id()))
            });

        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&temp_file);

        match file {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_writer(file)
                    .with_env_filter(
                        EnvFilter::try_from_default_env()
                            .unwrap_or_else(|_| EnvFilter::new("debug")),
                    )
                    .with_ansi(false)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .init();
                Some(temp_file)
            }
            Err(e) => {
                init_stderr("debug");
                tracing::warn!("could not open {}: {}", temp_file.display(), e);
                None
            }
        }
    } else {
        init_stderr(level);
        None
    }
}

fn init_stderr(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
