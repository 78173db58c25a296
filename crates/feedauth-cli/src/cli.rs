use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use feedauth_core::CredentialRequestType;

use crate::output::OutputFormat;

#[derive(Parser)]
#[command(name = "feedauth")]
#[command(version, about = "FeedAuth - credentials for authenticated package feeds")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file (defaults to ~/.config/feedauth/config.toml)
    #[arg(long, global = true, env = "FEEDAUTH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Never let plugins prompt the user
    #[arg(long, global = true, env = "FEEDAUTH_NON_INTERACTIVE")]
    pub non_interactive: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Request credentials for a feed URI
    Get(GetArgs),

    /// List discovered credential plugins
    Plugins,

    /// Settings management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Args)]
pub struct GetArgs {
    /// Feed URI needing credentials
    pub uri: String,

    /// Why credentials are needed
    #[arg(long = "type", value_enum, default_value = "unauthorized")]
    pub request_type: RequestTypeArg,

    /// Message shown to the user by interactive plugins
    #[arg(long)]
    pub message: Option<String>,

    /// Print the password instead of a masked form
    #[arg(long)]
    pub show_password: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum RequestTypeArg {
    Unauthorized,
    Forbidden,
    Proxy,
}

impl From<RequestTypeArg> for CredentialRequestType {
    fn from(value: RequestTypeArg) -> Self {
        match value {
            RequestTypeArg::Unauthorized => CredentialRequestType::Unauthorized,
            RequestTypeArg::Forbidden => CredentialRequestType::Forbidden,
            RequestTypeArg::Proxy => CredentialRequestType::Proxy,
        }
    }
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective settings
    Show,
    /// Print the settings file location
    Path,
}
