use std::path::Path;

use anyhow::Result;
use feedauth_core::FeedAuthSettings;

use crate::cli::ConfigCommands;
use crate::output::OutputFormat;
use crate::output::json::print_json;

pub fn run(
    command: ConfigCommands,
    settings: &FeedAuthSettings,
    config_path: Option<&Path>,
    format: OutputFormat,
) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            if format.is_json() {
                return print_json(settings);
            }
            print!("{}", settings.to_toml()?);
            Ok(())
        }
        ConfigCommands::Path => {
            let path = config_path
                .map(Path::to_path_buf)
                .or_else(FeedAuthSettings::default_path);
            match path {
                Some(path) => println!("{}", path.display()),
                None => println!("No configuration directory is available."),
            }
            Ok(())
        }
    }
}
