//! Error types for the proxy's startup and configuration path.
//!
//! Per-flow errors stay as plain `std::io::Error`, propagated with `?` and
//! logged at the dispatcher boundary where they stop mattering to the rest
//! of the system. Only the small set of fatal, user-facing failures gets a
//! named variant here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid User-Agent regex pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("invalid firewall set name '{0}': must match ^[A-Za-z0-9_]+$")]
    InvalidSetName(String),

    #[error("buffer-size must be between 1024 and 65536 bytes, got {0}")]
    BufferSizeOutOfRange(usize),

    #[error("port must be nonzero")]
    ZeroPort,
}
