use std::sync::Arc;

use anyhow::{Context, Result, bail};
use feedauth_core::{CredentialProviders, FeedAuthSettings};
use feedauth_plugins::{SharedPluginManager, SystemEnvironment};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cli::GetArgs;
use crate::output::OutputFormat;
use crate::output::json::print_json;

#[derive(Serialize)]
struct CredentialOutput {
    uri: String,
    username: String,
    password: String,
    auth_types: Option<Vec<String>>,
}

pub async fn run(
    args: GetArgs,
    settings: FeedAuthSettings,
    manager: Arc<SharedPluginManager>,
    format: OutputFormat,
    cancel: &CancellationToken,
) -> Result<()> {
    let uri = Url::parse(&args.uri).with_context(|| format!("invalid URI: {}", args.uri))?;
    let service = CredentialProviders::new(settings, Arc::new(SystemEnvironment), manager).into_service();

    let credentials = service
        .get_credentials(
            &uri,
            None,
            args.request_type.into(),
            args.message.as_deref(),
            cancel,
        )
        .await?;
    let Some(credentials) = credentials else {
        bail!("No credentials are available for {uri}");
    };

    let credential = credentials.network_credential();
    let output = CredentialOutput {
        uri: uri.to_string(),
        username: credential.username().to_string(),
        password: if args.show_password {
            credential.password().to_string()
        } else {
            credential.masked_password()
        },
        auth_types: credentials.auth_types().map(<[String]>::to_vec),
    };

    if format.is_json() {
        return print_json(&output);
    }

    println!("URI:        {}", output.uri);
    println!("Username:   {}", output.username);
    println!("Password:   {}", output.password);
    if let Some(auth_types) = &output.auth_types {
        println!("Auth types: {}", auth_types.join(", "));
    }
    Ok(())
}
