//! Credential error types.

use std::path::PathBuf;
use std::time::Duration;

use feedauth_plugins::PluginError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// A plugin handled the request but could not produce usable credentials.
    #[error("{message}")]
    Plugin {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Credential plugin {} exited with unexpected error {exit_code}.", .path.display())]
    UnexpectedStatus { path: PathBuf, exit_code: i32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("credential provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("settings error: {0}")]
    Settings(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CredentialError {
    pub fn plugin(message: impl Into<String>) -> Self {
        CredentialError::Plugin {
            message: message.into(),
            source: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CredentialError::Cancelled)
    }
}

impl From<PluginError> for CredentialError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::Cancelled => CredentialError::Cancelled,
            other => CredentialError::Plugin {
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, CredentialError>;
