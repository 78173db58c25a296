//! Core credential types
//!
//! Defines request classification, provider outcomes, and the credentials
//! handed back to callers.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

/// Why credentials are being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialRequestType {
    Unauthorized,
    Forbidden,
    Proxy,
}

impl CredentialRequestType {
    pub fn is_proxy(self) -> bool {
        self == CredentialRequestType::Proxy
    }
}

/// Classification of a single provider attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Success,
    ProviderNotApplicable,
    UserCanceled,
}

/// Username and password for one endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct NetworkCredential {
    username: String,
    password: String,
}

impl NetworkCredential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Get a display-safe version of the password. Only the length is shown.
    pub fn masked_password(&self) -> String {
        format!("********({} chars)", self.password.chars().count())
    }
}

impl fmt::Debug for NetworkCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkCredential")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Credentials returned by a provider, optionally limited to certain HTTP
/// authentication schemes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    credential: NetworkCredential,
    auth_types: Option<Vec<String>>,
}

impl Credentials {
    /// Credentials that apply to every authentication scheme.
    pub fn new(credential: NetworkCredential) -> Self {
        Self {
            credential,
            auth_types: None,
        }
    }

    /// Credentials limited to `auth_types` (for example `basic`, `negotiate`).
    pub fn with_auth_types(credential: NetworkCredential, auth_types: Vec<String>) -> Self {
        Self {
            credential,
            auth_types: Some(auth_types),
        }
    }

    pub fn network_credential(&self) -> &NetworkCredential {
        &self.credential
    }

    pub fn auth_types(&self) -> Option<&[String]> {
        self.auth_types.as_deref()
    }

    /// The credential to use for `auth_type`, compared case-insensitively.
    /// Any credential applies when no scheme is requested.
    pub fn credential_for(&self, auth_type: Option<&str>) -> Option<&NetworkCredential> {
        match (&self.auth_types, auth_type) {
            (None, _) | (_, None) => Some(&self.credential),
            (Some(types), Some(auth_type))
                if types.iter().any(|t| t.eq_ignore_ascii_case(auth_type)) =>
            {
                Some(&self.credential)
            }
            _ => None,
        }
    }
}

/// Outcome of one provider attempt.
///
/// Credentials are present exactly when the status is
/// [`CredentialStatus::Success`].
#[derive(Debug, Clone)]
pub struct CredentialResponse {
    status: CredentialStatus,
    credentials: Option<Arc<Credentials>>,
}

impl CredentialResponse {
    pub fn success(credentials: Credentials) -> Self {
        Self {
            status: CredentialStatus::Success,
            credentials: Some(Arc::new(credentials)),
        }
    }

    pub fn not_applicable() -> Self {
        Self {
            status: CredentialStatus::ProviderNotApplicable,
            credentials: None,
        }
    }

    pub fn user_canceled() -> Self {
        Self {
            status: CredentialStatus::UserCanceled,
            credentials: None,
        }
    }

    pub fn status(&self) -> CredentialStatus {
        self.status
    }

    pub fn credentials(&self) -> Option<&Arc<Credentials>> {
        self.credentials.as_ref()
    }

    pub fn into_credentials(self) -> Option<Arc<Credentials>> {
        self.credentials
    }
}

/// Proxy through which the request is sent.
#[derive(Debug, Clone, Default)]
pub struct WebProxy {
    address: Option<Url>,
    credentials: Option<NetworkCredential>,
}

impl WebProxy {
    pub fn new(address: Url) -> Self {
        Self {
            address: Some(address),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: NetworkCredential) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn address(&self) -> Option<&Url> {
        self.address.as_ref()
    }

    pub fn credentials(&self) -> Option<&NetworkCredential> {
        self.credentials.as_ref()
    }
}

/// Scheme, host and effective port of `uri`.
pub fn authority(uri: &Url) -> String {
    let host = uri.host_str().unwrap_or_default().to_ascii_lowercase();
    match uri.port_or_known_default() {
        Some(port) => format!("{}://{}:{}", uri.scheme(), host, port),
        None => format!("{}://{}", uri.scheme(), host),
    }
}
