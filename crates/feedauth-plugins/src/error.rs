//! Plugin protocol error types.

use std::path::PathBuf;
use std::time::Duration;

use crate::messages::MessageMethod;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("operation was cancelled")]
    Cancelled,

    #[error("request '{method}' timed out after {timeout:?}")]
    Timeout {
        method: MessageMethod,
        timeout: Duration,
    },

    #[error("Plugin '{path}' failed on creation: {message}")]
    Creation { path: PathBuf, message: String },

    #[error("plugin handshake failed: {0}")]
    Handshake(String),

    #[error("Plugin initialization failed.")]
    Initialization,

    #[error("{0}")]
    Fault(String),

    #[error("plugin protocol violation: {0}")]
    Protocol(String),

    #[error("plugin connection is closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PluginError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PluginError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;
