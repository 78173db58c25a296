//! Credential service
//!
//! Coordinates an ordered list of credential providers:
//! - The provider list is resolved once, on first use
//! - Calls into any one provider are serialized
//! - Outcomes are cached per authority; retries bypass the cache

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::cache::{CacheKey, CredentialCache};
use crate::error::{CredentialError, Result};
use crate::provider::{CredentialProvider, CredentialRequest};
use crate::types::{CredentialRequestType, CredentialStatus, Credentials, WebProxy};

pub type ProviderList = Vec<Arc<dyn CredentialProvider>>;

/// Produces the provider list. Invoked until it first succeeds.
pub type ProviderLoader =
    Box<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<ProviderList>> + Send + Sync>;

pub struct CredentialService {
    loader: ProviderLoader,
    providers: OnceCell<Arc<ProviderList>>,
    provider_locks: DashMap<String, Arc<Mutex<()>>>,
    requested: DashSet<(String, bool)>,
    cache: Arc<CredentialCache>,
    non_interactive: bool,
    handles_default_credentials: bool,
}

impl CredentialService {
    pub fn new(loader: ProviderLoader, non_interactive: bool, handles_default_credentials: bool) -> Self {
        Self {
            loader,
            providers: OnceCell::new(),
            provider_locks: DashMap::new(),
            requested: DashSet::new(),
            cache: Arc::new(CredentialCache::new()),
            non_interactive,
            handles_default_credentials,
        }
    }

    /// Service over a fixed provider list.
    pub fn from_providers(providers: ProviderList, non_interactive: bool) -> Self {
        let providers = Arc::new(providers);
        Self::new(
            Box::new(move |_| {
                let providers = providers.clone();
                async move { Ok(providers.as_ref().clone()) }.boxed()
            }),
            non_interactive,
            false,
        )
    }

    /// Use `cache` instead of a private one.
    pub fn with_cache(mut self, cache: Arc<CredentialCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<CredentialCache> {
        &self.cache
    }

    pub fn handles_default_credentials(&self) -> bool {
        self.handles_default_credentials
    }

    pub fn non_interactive(&self) -> bool {
        self.non_interactive
    }

    /// Obtain credentials for `uri`.
    ///
    /// Returns `None` when every provider declined or the user canceled.
    /// Provider errors are returned unchanged.
    pub async fn get_credentials(
        &self,
        uri: &Url,
        proxy: Option<&WebProxy>,
        request_type: CredentialRequestType,
        message: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<Credentials>>> {
        if cancel.is_cancelled() {
            return Err(CredentialError::Cancelled);
        }

        let is_proxy = request_type.is_proxy();
        let key = CacheKey::new(uri, is_proxy);
        let is_retry = !self.requested.insert((uri.as_str().to_string(), is_proxy));

        if !is_retry && let Some(cached) = self.cache.get(&key) {
            debug!(authority = %key.authority(), is_proxy, "Credential cache hit");
            return Ok(cached);
        }

        let providers = self.providers(cancel).await?;
        let request = CredentialRequest {
            uri,
            proxy,
            request_type,
            message,
            is_retry,
            non_interactive: self.non_interactive,
        };

        let mut outcome = None;
        for provider in providers.iter() {
            let lock = self.lock_for(provider.id());
            let _guard = tokio::select! {
                guard = lock.lock() => guard,
                _ = cancel.cancelled() => return Err(CredentialError::Cancelled),
            };

            // A concurrent request for the same authority may have finished while we waited.
            if !is_retry && let Some(cached) = self.cache.get(&key) {
                debug!(authority = %key.authority(), is_proxy, "Credential cache filled while waiting");
                return Ok(cached);
            }

            let response = provider.get(&request, cancel).await?;
            debug!(
                provider = provider.id(),
                status = ?response.status(),
                is_retry,
                "Credential provider responded"
            );
            match response.status() {
                CredentialStatus::ProviderNotApplicable => continue,
                CredentialStatus::Success | CredentialStatus::UserCanceled => {
                    outcome = response.into_credentials();
                    break;
                }
            }
        }

        self.cache.insert(key, outcome.clone());
        Ok(outcome)
    }

    /// Cached credentials from an earlier successful request, without
    /// consulting any provider.
    pub fn try_get_last_known_good_credentials(
        &self,
        uri: &Url,
        is_proxy: bool,
    ) -> Option<Arc<Credentials>> {
        self.cache.last_known_good(&CacheKey::new(uri, is_proxy))
    }

    async fn providers(&self, cancel: &CancellationToken) -> Result<Arc<ProviderList>> {
        let providers = self
            .providers
            .get_or_try_init(|| async {
                let providers = (self.loader)(cancel.clone()).await?;
                info!(count = providers.len(), "Credential providers resolved");
                Ok::<_, CredentialError>(Arc::new(providers))
            })
            .await?;
        Ok(providers.clone())
    }

    fn lock_for(&self, provider_id: &str) -> Arc<Mutex<()>> {
        self.provider_locks
            .entry(provider_id.to_string())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::MockCredentialProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    fn service(providers: Vec<Arc<MockCredentialProvider>>) -> CredentialService {
        let providers: ProviderList = providers
            .into_iter()
            .map(|p| p as Arc<dyn CredentialProvider>)
            .collect();
        CredentialService::from_providers(providers, true)
    }

    async fn get(service: &CredentialService, uri: &str) -> Result<Option<Arc<Credentials>>> {
        service
            .get_credentials(
                &url(uri),
                None,
                CredentialRequestType::Unauthorized,
                None,
                &CancellationToken::new(),
            )
            .await
    }

    #[tokio::test]
    async fn test_first_call_is_not_retry_second_is() {
        let provider = Arc::new(MockCredentialProvider::succeeding("a", "user", "pass"));
        let service = service(vec![provider.clone()]);

        get(&service, "http://host/some/path").await.unwrap();
        get(&service, "http://host/some/path").await.unwrap();

        assert_eq!(provider.retries(), vec![false, true]);
    }

    #[tokio::test]
    async fn test_passes_request_through() {
        let provider = Arc::new(MockCredentialProvider::succeeding("a", "user", "pass"));
        let service = service(vec![provider.clone()]);
        let proxy = WebProxy::new(url("http://proxy:8080"));

        service
            .get_credentials(
                &url("http://host/index.json"),
                Some(&proxy),
                CredentialRequestType::Forbidden,
                Some("please"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let seen = provider.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].uri, "http://host/index.json");
        assert_eq!(seen[0].request_type, CredentialRequestType::Forbidden);
        assert_eq!(seen[0].message.as_deref(), Some("please"));
        assert!(seen[0].had_proxy);
        assert!(seen[0].non_interactive);
    }

    #[tokio::test]
    async fn test_same_authority_returns_cached_instance() {
        let provider = Arc::new(MockCredentialProvider::succeeding("a", "user", "pass"));
        let service = service(vec![provider.clone()]);

        let first = get(&service, "http://host/some/path").await.unwrap().unwrap();
        let second = get(&service, "http://host/some2/path2").await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_for_one_authority_call_provider_once() {
        let provider = Arc::new(
            MockCredentialProvider::succeeding("a", "user", "pass").with_delay(Duration::from_millis(50)),
        );
        let service = Arc::new(service(vec![provider.clone()]));

        let first = tokio::spawn({
            let service = service.clone();
            async move { get(&service, "http://host/a").await.unwrap().unwrap() }
        });
        let second = tokio::spawn({
            let service = service.clone();
            async move { get(&service, "http://host/b").await.unwrap().unwrap() }
        });
        let first = first.await.unwrap();
        let second = second.await.unwrap();

        assert_eq!(provider.calls(), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_retry_bypasses_cache() {
        let provider = Arc::new(MockCredentialProvider::succeeding("a", "user", "pass"));
        let service = service(vec![provider.clone()]);

        let first = get(&service, "http://host/some/path").await.unwrap().unwrap();
        let second = get(&service, "http://host/some/path").await.unwrap().unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.network_credential(), second.network_credential());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_declines_are_cached() {
        let provider = Arc::new(MockCredentialProvider::declining("a"));
        let service = service(vec![provider.clone()]);

        assert!(get(&service, "http://host/a").await.unwrap().is_none());
        assert!(get(&service, "http://host/b").await.unwrap().is_none());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_tries_every_provider_when_all_decline() {
        let providers: Vec<_> = (0..3)
            .map(|i| Arc::new(MockCredentialProvider::declining(&format!("p{i}"))))
            .collect();
        let service = service(providers.clone());

        let result = get(&service, "http://host/").await.unwrap();

        assert!(result.is_none());
        for provider in &providers {
            assert_eq!(provider.calls(), 1);
        }
    }

    #[tokio::test]
    async fn test_success_short_circuits_later_providers() {
        let first = Arc::new(MockCredentialProvider::declining("first"));
        let second = Arc::new(MockCredentialProvider::succeeding("second", "user", "pass"));
        let third = Arc::new(MockCredentialProvider::succeeding("third", "other", "pass"));
        let service = service(vec![first.clone(), second.clone(), third.clone()]);

        let credentials = get(&service, "http://host/").await.unwrap().unwrap();

        assert_eq!(credentials.network_credential().username(), "user");
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 1);
        assert_eq!(third.calls(), 0);
    }

    #[tokio::test]
    async fn test_user_cancel_stops_search() {
        let first = Arc::new(MockCredentialProvider::canceling("first"));
        let second = Arc::new(MockCredentialProvider::succeeding("second", "user", "pass"));
        let service = service(vec![first.clone(), second.clone()]);

        let result = get(&service, "http://host/").await.unwrap();

        assert!(result.is_none());
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn test_provider_error_propagates() {
        let provider = Arc::new(MockCredentialProvider::failing("a", "plugin exploded"));
        let service = service(vec![provider]);

        let err = get(&service, "http://host/").await.unwrap_err();
        assert_eq!(err.to_string(), "plugin exploded");
    }

    #[tokio::test]
    async fn test_cancellation_propagates_unchanged() {
        let provider = Arc::new(
            MockCredentialProvider::succeeding("a", "user", "pass").with_delay(Duration::from_secs(30)),
        );
        let service = service(vec![provider]);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = service
            .get_credentials(
                &url("http://host/"),
                None,
                CredentialRequestType::Unauthorized,
                None,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_single_threaded_access_to_each_provider() {
        let provider = Arc::new(
            MockCredentialProvider::succeeding("a", "user", "pass").with_delay(Duration::from_millis(5)),
        );
        let service = Arc::new(service(vec![provider.clone()]));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let service = service.clone();
            tasks.push(tokio::spawn(async move {
                get(&service, "http://host/index.json").await.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(provider.max_concurrency(), 1);
        assert_eq!(provider.calls(), 10);
    }

    #[tokio::test]
    async fn test_provider_list_resolved_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let loader: ProviderLoader = Box::new(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                let provider: Arc<dyn CredentialProvider> =
                    Arc::new(MockCredentialProvider::declining("a"));
                Ok(vec![provider])
            }
            .boxed()
        });
        let service = Arc::new(CredentialService::new(loader, true, false));

        let mut tasks = Vec::new();
        for i in 0..10 {
            let service = service.clone();
            tasks.push(tokio::spawn(async move {
                get(&service, &format!("http://host{i}/")).await.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_last_known_good_only_after_success() {
        let provider = Arc::new(MockCredentialProvider::succeeding("a", "user", "pass"));
        let service = service(vec![provider]);
        let uri = url("http://host/index.json");

        assert!(service.try_get_last_known_good_credentials(&uri, false).is_none());

        let credentials = get(&service, "http://host/index.json").await.unwrap().unwrap();
        let cached = service.try_get_last_known_good_credentials(&uri, false).unwrap();
        assert!(Arc::ptr_eq(&credentials, &cached));
        assert!(service.try_get_last_known_good_credentials(&uri, true).is_none());
    }

    #[tokio::test]
    async fn test_last_known_good_ignores_declines() {
        for provider in [
            MockCredentialProvider::declining("a"),
            MockCredentialProvider::canceling("a"),
        ] {
            let service = service(vec![Arc::new(provider)]);
            let uri = url("http://host/index.json");

            for request_type in [CredentialRequestType::Unauthorized, CredentialRequestType::Proxy] {
                service
                    .get_credentials(&uri, None, request_type, None, &CancellationToken::new())
                    .await
                    .unwrap();
                assert!(
                    service
                        .try_get_last_known_good_credentials(&uri, request_type.is_proxy())
                        .is_none()
                );
            }
        }
    }

    #[tokio::test]
    async fn test_shared_cache_across_services() {
        let cache = Arc::new(CredentialCache::new());
        let first = service(vec![Arc::new(MockCredentialProvider::succeeding("a", "user", "pass"))])
            .with_cache(cache.clone());
        let second = service(vec![Arc::new(MockCredentialProvider::declining("b"))])
            .with_cache(cache.clone());

        let credentials = get(&first, "http://host/").await.unwrap().unwrap();
        let cached = get(&second, "http://host/").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&credentials, &cached));
    }
}
