//! Legacy credential providers
//!
//! A legacy provider is a standalone executable launched once per request.
//! Arguments go on the command line, the answer comes back as a JSON object
//! on stdout and the exit code classifies it.

mod provider;
mod runner;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use provider::{ExitCode, PluginCredentialProvider};
pub use runner::{PluginOutput, PluginProcessRunner, TokioProcessRunner};

/// Log verbosity passed to legacy plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Silent,
    Quiet,
    #[default]
    Normal,
    Detailed,
}

impl Verbosity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verbosity::Silent => "silent",
            Verbosity::Quiet => "quiet",
            Verbosity::Normal => "normal",
            Verbosity::Detailed => "detailed",
        }
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verbosity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "silent" => Ok(Verbosity::Silent),
            "quiet" => Ok(Verbosity::Quiet),
            "normal" => Ok(Verbosity::Normal),
            "detailed" => Ok(Verbosity::Detailed),
            other => Err(format!("unknown verbosity: {other}")),
        }
    }
}
