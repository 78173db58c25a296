//! Bridges plugin log output into `tracing`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, warn};

use crate::connection::RequestHandler;
use crate::error::Result;
use crate::messages::{LogLevel, LogRequest, Message, ResponseCodePayload};

impl LogLevel {
    /// Protocol level matching the most verbose level currently enabled.
    pub fn from_tracing() -> Self {
        Self::from_filter(LevelFilter::current())
    }

    pub fn from_filter(filter: LevelFilter) -> Self {
        if filter >= LevelFilter::DEBUG {
            LogLevel::Debug
        } else if filter >= LevelFilter::INFO {
            LogLevel::Information
        } else if filter >= LevelFilter::WARN {
            LogLevel::Warning
        } else {
            LogLevel::Error
        }
    }
}

/// Handles `Log` requests by re-emitting them as tracing events.
pub struct LogRequestHandler {
    plugin: PathBuf,
}

impl LogRequestHandler {
    pub fn new(plugin: impl AsRef<Path>) -> Self {
        Self {
            plugin: plugin.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl RequestHandler for LogRequestHandler {
    async fn handle(&self, request: &Message) -> Result<Value> {
        let log: LogRequest = request.payload_as()?;
        let plugin = self.plugin.display();
        match log.log_level {
            LogLevel::Debug | LogLevel::Verbose => {
                debug!(target: "feedauth::plugin", plugin = %plugin, "{}", log.message)
            }
            LogLevel::Information | LogLevel::Minimal => {
                info!(target: "feedauth::plugin", plugin = %plugin, "{}", log.message)
            }
            LogLevel::Warning => {
                warn!(target: "feedauth::plugin", plugin = %plugin, "{}", log.message)
            }
            LogLevel::Error => {
                error!(target: "feedauth::plugin", plugin = %plugin, "{}", log.message)
            }
        }
        Ok(serde_json::to_value(ResponseCodePayload::success())?)
    }
}
