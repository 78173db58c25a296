//! FeedAuth Core - credentials for authenticated package feeds
//!
//! This crate provides:
//! - The credential model and the `CredentialProvider` capability
//! - `CredentialService`, which orders providers, serializes access and caches outcomes
//! - Legacy process-based providers and secure plugin providers
//! - Builders that discover and order providers, and TOML settings

pub mod builder;
pub mod cache;
pub mod error;
pub mod legacy;
pub mod provider;
pub mod providers;
pub mod secure;
pub mod service;
pub mod settings;
#[cfg(any(test, feature = "test-utils"))]
pub mod testkit;
pub mod types;

pub use builder::{
    PluginCredentialProviderBuilder, SecurePluginCredentialProviderBuilder, sort_plugin_paths,
};
pub use cache::{CacheKey, CredentialCache};
pub use error::{CredentialError, Result};
pub use legacy::{PluginCredentialProvider, PluginProcessRunner, TokioProcessRunner, Verbosity};
pub use provider::{CredentialProvider, CredentialRequest};
pub use providers::CredentialProviders;
pub use secure::SecurePluginCredentialProvider;
pub use service::{CredentialService, ProviderList, ProviderLoader};
pub use settings::FeedAuthSettings;
pub use types::{
    CredentialRequestType, CredentialResponse, CredentialStatus, Credentials, NetworkCredential,
    WebProxy,
};
