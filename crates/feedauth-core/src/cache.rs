//! Credential cache keyed by authority.

use std::sync::Arc;

use dashmap::DashMap;
use url::Url;

use crate::types::{Credentials, authority};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    authority: String,
    is_proxy: bool,
}

impl CacheKey {
    pub fn new(uri: &Url, is_proxy: bool) -> Self {
        Self {
            authority: authority(uri),
            is_proxy,
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn is_proxy(&self) -> bool {
        self.is_proxy
    }
}

/// Final outcome of each request, per authority and proxy flag.
///
/// A `None` value records that every provider declined or the user canceled.
/// Shareable between services; entries live until [`CredentialCache::clear`].
#[derive(Debug, Default)]
pub struct CredentialCache {
    entries: DashMap<CacheKey, Option<Arc<Credentials>>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached outcome, which may itself be a decline.
    pub fn get(&self, key: &CacheKey) -> Option<Option<Arc<Credentials>>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, key: CacheKey, credentials: Option<Arc<Credentials>>) {
        self.entries.insert(key, credentials);
    }

    /// Only successful outcomes.
    pub fn last_known_good(&self, key: &CacheKey) -> Option<Arc<Credentials>> {
        self.entries.get(key).and_then(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
