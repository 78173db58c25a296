//! Scripted credential providers for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{CredentialError, Result};
use crate::provider::{CredentialProvider, CredentialRequest};
use crate::types::{CredentialRequestType, CredentialResponse, Credentials, NetworkCredential};

/// Owned copy of a request seen by [`MockCredentialProvider`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub uri: String,
    pub request_type: CredentialRequestType,
    pub message: Option<String>,
    pub had_proxy: bool,
    pub is_retry: bool,
    pub non_interactive: bool,
}

#[derive(Debug, Clone)]
enum Reply {
    Success(String, String),
    NotApplicable,
    UserCanceled,
    Fail(String),
}

pub struct MockCredentialProvider {
    id: String,
    reply: Reply,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockCredentialProvider {
    fn with_reply(id: &str, reply: Reply) -> Self {
        Self {
            id: id.to_string(),
            reply,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answers every request with fresh credentials.
    pub fn succeeding(id: &str, username: &str, password: &str) -> Self {
        Self::with_reply(id, Reply::Success(username.to_string(), password.to_string()))
    }

    pub fn declining(id: &str) -> Self {
        Self::with_reply(id, Reply::NotApplicable)
    }

    pub fn canceling(id: &str) -> Self {
        Self::with_reply(id, Reply::UserCanceled)
    }

    pub fn failing(id: &str, message: &str) -> Self {
        Self::with_reply(id, Reply::Fail(message.to_string()))
    }

    /// Hold each call for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn retries(&self) -> Vec<bool> {
        self.requests.lock().iter().map(|r| r.is_retry).collect()
    }
}

#[async_trait]
impl CredentialProvider for MockCredentialProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get(
        &self,
        request: &CredentialRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<CredentialResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(RecordedRequest {
            uri: request.uri.to_string(),
            request_type: request.request_type,
            message: request.message.map(str::to_string),
            had_proxy: request.proxy.is_some(),
            is_retry: request.is_retry,
            non_interactive: request.non_interactive,
        });

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let waited = if self.delay.is_zero() {
            tokio::task::yield_now().await;
            Ok(())
        } else {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => Ok(()),
                _ = cancel.cancelled() => Err(CredentialError::Cancelled),
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        waited?;

        match &self.reply {
            Reply::Success(username, password) => Ok(CredentialResponse::success(
                Credentials::new(NetworkCredential::new(username.as_str(), password.as_str())),
            )),
            Reply::NotApplicable => Ok(CredentialResponse::not_applicable()),
            Reply::UserCanceled => Ok(CredentialResponse::user_canceled()),
            Reply::Fail(message) => Err(CredentialError::plugin(message.as_str())),
        }
    }
}
