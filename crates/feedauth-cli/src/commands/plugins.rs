use std::sync::Arc;

use anyhow::Result;
use comfy_table::{Cell, Table};
use feedauth_core::builder::sort_by_directory_then_name;
use feedauth_core::{FeedAuthSettings, PluginCredentialProviderBuilder, sort_plugin_paths};
use feedauth_plugins::{PluginManager, SharedPluginManager, SystemEnvironment};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::output::OutputFormat;
use crate::output::json::print_json;
use crate::output::table::print_table;

#[derive(Serialize)]
struct PluginRow {
    kind: &'static str,
    path: String,
    state: String,
    detail: String,
}

pub async fn run(
    settings: &FeedAuthSettings,
    manager: Arc<SharedPluginManager>,
    format: OutputFormat,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut rows = Vec::new();

    let discovered = manager.find_available_plugins(cancel).await?;
    let discovered = sort_by_directory_then_name(discovered.as_ref().clone(), |result| {
        result.path().to_string_lossy().into_owned()
    });
    for result in discovered {
        rows.push(PluginRow {
            kind: "secure",
            path: result.path().display().to_string(),
            state: format!("{:?}", result.plugin_file.state()),
            detail: result.message().unwrap_or_default(),
        });
    }

    let builder = PluginCredentialProviderBuilder::new(settings, &SystemEnvironment);
    let timeout = builder.timeout_seconds();
    for path in sort_plugin_paths(builder.discover_paths()) {
        rows.push(PluginRow {
            kind: "legacy",
            path: path.display().to_string(),
            state: "Valid".to_string(),
            detail: format!("timeout {timeout}s, verbosity {}", settings.verbosity),
        });
    }

    if format.is_json() {
        return print_json(&rows);
    }

    if rows.is_empty() {
        println!("No credential plugins found.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Kind", "Path", "State", "Detail"]);
    for row in rows {
        table.add_row(vec![
            Cell::new(row.kind),
            Cell::new(row.path),
            Cell::new(row.state),
            Cell::new(row.detail),
        ]);
    }

    print_table(table)
}
