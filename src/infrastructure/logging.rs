use crate::infrastructure::error::InfraError;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "pomosync.log";
const DEFAULT_FILTER: &str = "info";

/// Installs a JSON-lines subscriber appending to `<logs_dir>/pomosync.log`.
/// `RUST_LOG` overrides the default `info` filter. A second call is a no-op.
pub fn init_logging(logs_dir: &Path) -> Result<(), InfraError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_dir.join(LOG_FILE))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(false)
        .with_target(true)
        .with_writer(Mutex::new(file))
        .try_init();
    Ok(())
}
