use thiserror::Error;

use crate::config::ConfigError;

/// Errors that stop the relay from starting or serving.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
