#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use feedauth_core::{
    CredentialError, CredentialProvider, CredentialProviders, CredentialRequestType, CredentialService,
    FeedAuthSettings, PluginCredentialProvider, Verbosity,
};
use feedauth_plugins::env::CREDENTIAL_PROVIDERS_PATH;
use feedauth_plugins::testkit::{FakePluginLauncher, FakePluginScript};
use feedauth_plugins::{
    AcceptAllVerifier, MapEnvironment, MessageMethod, OperationClaim, PluginManagerConfig,
    SharedPluginManager,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use url::Url;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\necho \"$@\" >> \"$0.calls\"\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn calls(script: &Path) -> Vec<String> {
    let log = PathBuf::from(format!("{}.calls", script.display()));
    std::fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn manager(plugins: &[PathBuf], script: FakePluginScript) -> (Arc<SharedPluginManager>, Arc<FakePluginLauncher>) {
    let raw = plugins
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(";");
    let config = PluginManagerConfig {
        raw_plugin_paths: Some(raw),
        idle_timeout: Duration::from_secs(30),
        ..PluginManagerConfig::default()
    };
    let launcher = Arc::new(FakePluginLauncher::new(script));
    let manager = Arc::new(SharedPluginManager::new(
        config,
        launcher.clone(),
        Arc::new(AcceptAllVerifier),
    ));
    (manager, launcher)
}

fn service_for(
    settings: FeedAuthSettings,
    legacy_dir: &Path,
    manager: Arc<SharedPluginManager>,
) -> CredentialService {
    let env = Arc::new(
        MapEnvironment::new().with(CREDENTIAL_PROVIDERS_PATH, legacy_dir.display().to_string()),
    );
    CredentialProviders::new(settings, env, manager)
        .with_legacy_default_directory(None)
        .into_service()
}

async fn request(
    service: &CredentialService,
    uri: &str,
) -> Result<Option<Arc<feedauth_core::Credentials>>, CredentialError> {
    service
        .get_credentials(
            &Url::parse(uri).unwrap(),
            None,
            CredentialRequestType::Unauthorized,
            None,
            &CancellationToken::new(),
        )
        .await
}

const SUCCESS: &str = r#"case " $* " in
  *" -isRetry "*) echo '{"Username":"retry-user","Password":"retry-pass"}' ;;
  *) echo '{"Username":"legacy-user","Password":"legacy-pass","Message":""}' ;;
esac
exit 0"#;

// ─── Provider ordering and fallback ───

#[tokio::test]
async fn test_falls_back_from_secure_to_legacy() {
    let dir = TempDir::new().unwrap();
    let legacy_dir = dir.path().join("legacy");
    let script = write_script(&legacy_dir, "CredentialProvider.Feed.exe", SUCCESS);
    let plugin = write_script(&dir.path().join("secure"), "nuget-plugin-download", "exit 0");
    let (manager, launcher) = manager(
        &[plugin],
        FakePluginScript::with_claims(vec![OperationClaim::DownloadPackage]),
    );
    let service = service_for(FeedAuthSettings::default(), &legacy_dir, manager);

    let credentials = request(&service, "https://feed.example/v3/index.json")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(credentials.network_credential().username(), "legacy-user");
    assert_eq!(launcher.requests(MessageMethod::GetOperationClaims).len(), 1);
    assert!(launcher.requests(MessageMethod::GetAuthenticationCredentials).is_empty());
    assert_eq!(calls(&script).len(), 1);
}

#[tokio::test]
async fn test_secure_plugin_answers_before_legacy() {
    let dir = TempDir::new().unwrap();
    let legacy_dir = dir.path().join("legacy");
    let script = write_script(&legacy_dir, "CredentialProvider.Feed.exe", SUCCESS);
    let plugin = write_script(&dir.path().join("secure"), "nuget-plugin-auth", "exit 0");
    let (manager, launcher) = manager(&[plugin], FakePluginScript::default());
    let service = service_for(FeedAuthSettings::default(), &legacy_dir, manager);

    let credentials = request(&service, "https://feed.example/v3/index.json")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(credentials.network_credential().username(), "user");
    assert_eq!(launcher.requests(MessageMethod::GetAuthenticationCredentials).len(), 1);
    assert!(calls(&script).is_empty());
}

// ─── Cache and retry ───

#[tokio::test]
async fn test_cache_hit_then_retry_reaches_plugin() {
    let dir = TempDir::new().unwrap();
    let legacy_dir = dir.path().join("legacy");
    let script = write_script(&legacy_dir, "CredentialProvider.Feed.exe", SUCCESS);
    let (manager, _) = manager(&[], FakePluginScript::default());
    let service = service_for(FeedAuthSettings::default(), &legacy_dir, manager);

    let first = request(&service, "https://feed.example/a").await.unwrap().unwrap();
    let cached = request(&service, "https://feed.example/b").await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &cached));
    assert_eq!(calls(&script).len(), 1);

    let retried = request(&service, "https://feed.example/a").await.unwrap().unwrap();
    assert_eq!(retried.network_credential().username(), "retry-user");
    let invocations = calls(&script);
    assert_eq!(invocations.len(), 2);
    assert!(invocations[1].contains("-isRetry"));

    let good = service
        .try_get_last_known_good_credentials(&Url::parse("https://feed.example/c").unwrap(), false)
        .unwrap();
    assert!(Arc::ptr_eq(&good, &retried));
}

#[tokio::test]
async fn test_declining_plugin_yields_none() {
    let dir = TempDir::new().unwrap();
    let legacy_dir = dir.path().join("legacy");
    write_script(&legacy_dir, "CredentialProvider.Feed.exe", "exit 1");
    let (manager, _) = manager(&[], FakePluginScript::default());
    let service = service_for(FeedAuthSettings::default(), &legacy_dir, manager);

    assert!(request(&service, "https://feed.example/").await.unwrap().is_none());
    assert!(
        service
            .try_get_last_known_good_credentials(&Url::parse("https://feed.example/").unwrap(), false)
            .is_none()
    );
}

// ─── Legacy process behaviour ───

#[tokio::test]
async fn test_old_plugin_rejecting_verbosity_is_retried() {
    let dir = TempDir::new().unwrap();
    let legacy_dir = dir.path().join("legacy");
    let script = write_script(
        &legacy_dir,
        "CredentialProvider.Old.exe",
        &format!("case \" $* \" in *\" -verbosity \"*) exit 9 ;; esac\n{SUCCESS}"),
    );
    let (manager, _) = manager(&[], FakePluginScript::default());
    let settings = FeedAuthSettings {
        verbosity: Verbosity::Detailed,
        ..FeedAuthSettings::default()
    };
    let service = service_for(settings, &legacy_dir, manager);

    let credentials = request(&service, "https://feed.example/").await.unwrap().unwrap();

    assert_eq!(credentials.network_credential().username(), "legacy-user");
    let invocations = calls(&script);
    assert_eq!(invocations.len(), 2);
    assert!(invocations[0].ends_with("-verbosity detailed"));
    assert!(!invocations[1].contains("-verbosity"));
}

#[tokio::test]
async fn test_failure_exit_code_surfaces_message() {
    let dir = TempDir::new().unwrap();
    let legacy_dir = dir.path().join("legacy");
    write_script(
        &legacy_dir,
        "CredentialProvider.Broken.exe",
        r#"echo '{"Message":"Token expired."}'
exit 2"#,
    );
    let (manager, _) = manager(&[], FakePluginScript::default());
    let service = service_for(FeedAuthSettings::default(), &legacy_dir, manager);

    let err = request(&service, "https://feed.example/").await.unwrap_err();
    assert!(err.to_string().ends_with("unable to provide credentials. Token expired."));
}

#[tokio::test]
async fn test_slow_plugin_times_out() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "CredentialProvider.Slow.exe", "sleep 5\nexit 0");
    let provider = PluginCredentialProvider::new(&script, 1, Verbosity::Normal);
    let service = CredentialService::from_providers(vec![Arc::new(provider) as Arc<dyn CredentialProvider>], true);

    let err = request(&service, "https://feed.example/").await.unwrap_err();
    assert!(matches!(err, CredentialError::Timeout(_)));
}

#[tokio::test]
async fn test_cancellation_stops_running_plugin() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "CredentialProvider.Slow.exe", "sleep 5\nexit 0");
    let provider = PluginCredentialProvider::new(&script, 30, Verbosity::Normal);
    let service = CredentialService::from_providers(vec![Arc::new(provider) as Arc<dyn CredentialProvider>], true);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = service
        .get_credentials(
            &Url::parse("https://feed.example/").unwrap(),
            None,
            CredentialRequestType::Unauthorized,
            None,
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}
