//! Utility module
//!
//! Logging setup shared by applications embedding the link.

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::core::{Error, Result};

/// Installs a global fmt subscriber
///
/// `RUST_LOG` wins when set; otherwise everything at `level` and above is
/// logged. Fails if a global subscriber is already installed.
pub fn init_tracing(level: Level) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| Error::config(format!("failed to install tracing subscriber: {}", e)))
}
