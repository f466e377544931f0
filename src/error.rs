// src/error.rs
use thiserror::Error;

/// Message shown whenever a container header cannot be trusted.
pub const WRONG_PASSWORD: &str = "wrong password or corrupted file";

#[derive(Debug, Error)]
pub enum VfsError {
    /// Invalid or missing configuration, oversized payloads, bad paths.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// A path segment, folder or file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Block-level invariant violation (double lock, malformed indirect node).
    #[error("block error: {0}")]
    Block(String),

    /// Header unparsable or password/canary mismatch.
    #[error("format error: {0}")]
    Format(String),

    /// Remote endpoint unreachable or protocol fault mid-sync.
    #[error("communication error: {0}")]
    Communication(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VfsError {
    pub fn argument(msg: impl Into<String>) -> Self {
        VfsError::Argument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        VfsError::NotFound(msg.into())
    }

    pub fn block(msg: impl Into<String>) -> Self {
        VfsError::Block(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        VfsError::Format(msg.into())
    }

    pub fn communication(msg: impl Into<String>) -> Self {
        VfsError::Communication(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, VfsError>;
