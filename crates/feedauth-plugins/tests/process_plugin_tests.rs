//! End-to-end tests against a real plugin process.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use feedauth_plugins::{
    AcceptAllVerifier, GetAuthenticationCredentialsRequest, GetAuthenticationCredentialsResponse,
    MessageMethod, MessageResponseCode, OperationClaim, PluginDiscoveryResult, PluginFile,
    PluginFileState, PluginManager, PluginManagerConfig, ProcessLauncher, SharedPluginManager,
    SourceAgnosticPlugin,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const SCRIPT: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"RequestId":"\([^"]*\)".*/\1/p')
  method=$(printf '%s' "$line" | sed -n 's/.*"Method":"\([^"]*\)".*/\1/p')
  kind=$(printf '%s' "$line" | sed -n 's/.*"Type":"\([^"]*\)".*/\1/p')
  [ "$kind" = "Request" ] || continue
  case "$method" in
    Close) exit 0 ;;
    Handshake) payload='{"ResponseCode":"Success","ProtocolVersion":"2.0.0"}' ;;
    GetOperationClaims) payload='{"Claims":["Authentication"]}' ;;
    GetAuthenticationCredentials) payload='{"Username":"shell-user","Password":"shell-pass","ResponseCode":"Success"}' ;;
    *) payload='{"ResponseCode":"Success"}' ;;
  esac
  printf '{"RequestId":"%s","Type":"Response","Method":"%s","Payload":%s}\n' "$id" "$method" "$payload"
done
"#;

fn write_plugin(dir: &Path) -> PathBuf {
    let path = dir.join("nuget-plugin-shell");
    std::fs::write(&path, SCRIPT).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

// ─── Process Lifecycle ───

#[tokio::test]
async fn test_shell_plugin_round_trip() {
    let temp = TempDir::new().unwrap();
    let path = write_plugin(temp.path());
    let config = PluginManagerConfig {
        idle_timeout: Duration::ZERO,
        ..PluginManagerConfig::default()
    };
    let manager = SharedPluginManager::new(config, Arc::new(ProcessLauncher), Arc::new(AcceptAllVerifier));
    let discovery = PluginDiscoveryResult::new(PluginFile::with_state(&path, PluginFileState::Valid));
    let cancel = CancellationToken::new();

    let result = manager
        .try_get_source_agnostic_plugin(&discovery, &OperationClaim::Authentication, &cancel)
        .await
        .unwrap();
    let handle = match result {
        SourceAgnosticPlugin::Available(handle) => handle,
        SourceAgnosticPlugin::ClaimNotSupported => panic!("claim not supported"),
        SourceAgnosticPlugin::Failed { message, .. } => panic!("plugin failed: {message}"),
    };
    assert!(handle.plugin().process_id().is_some());

    let response: GetAuthenticationCredentialsResponse = handle
        .connection()
        .send_request(
            MessageMethod::GetAuthenticationCredentials,
            &GetAuthenticationCredentialsRequest {
                uri: "https://feed.example/v3/index.json".to_string(),
                is_retry: false,
                is_non_interactive: true,
                can_show_dialog: false,
            },
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(response.response_code, MessageResponseCode::Success);
    assert_eq!(response.username.as_deref(), Some("shell-user"));

    let plugin = handle.plugin().clone();
    drop(handle);
    assert!(plugin.connection().is_closed());
    assert!(!manager.factory().is_tracked(&path));
}

#[tokio::test]
async fn test_missing_executable_fails_creation() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("nuget-plugin-absent");
    let manager = SharedPluginManager::new(
        PluginManagerConfig::default(),
        Arc::new(ProcessLauncher),
        Arc::new(AcceptAllVerifier),
    );
    let discovery = PluginDiscoveryResult::new(PluginFile::with_state(&path, PluginFileState::Valid));

    let result = manager
        .try_get_source_agnostic_plugin(
            &discovery,
            &OperationClaim::Authentication,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    match result {
        SourceAgnosticPlugin::Failed { message, error } => {
            assert!(message.contains("Problem starting the plugin"));
            assert!(error.is_some());
        }
        _ => panic!("expected creation failure"),
    }
}
