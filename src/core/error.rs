//! Error types for the streaming library

use thiserror::Error;

/// Main error type for the library
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Decode error for node {node}: {reason}")]
    Decode { node: u32, reason: String },
}
