//! Credential provider capability.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Result;
use crate::types::{CredentialRequestType, CredentialResponse, WebProxy};

/// Everything a provider needs to answer one credential request.
#[derive(Debug, Clone, Copy)]
pub struct CredentialRequest<'a> {
    pub uri: &'a Url,
    pub proxy: Option<&'a WebProxy>,
    pub request_type: CredentialRequestType,
    pub message: Option<&'a str>,
    pub is_retry: bool,
    pub non_interactive: bool,
}

impl<'a> CredentialRequest<'a> {
    pub fn new(uri: &'a Url, request_type: CredentialRequestType) -> Self {
        Self {
            uri,
            proxy: None,
            request_type,
            message: None,
            is_retry: false,
            non_interactive: false,
        }
    }
}

/// A source of credentials.
///
/// Implementations decline with [`CredentialResponse::not_applicable`] rather
/// than failing when they have nothing to offer. Cancellation must surface as
/// [`crate::CredentialError::Cancelled`].
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Stable identity, also used to serialize calls into this provider.
    fn id(&self) -> &str;

    async fn get(
        &self,
        request: &CredentialRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<CredentialResponse>;
}
