//! Per-request context handed to the backend.

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::version::ApiVersion;

/// Request-scoped context: the negotiated API version and a cancellation
/// token.
///
/// Cancelling the token (client disconnect, timeout, explicit cancel) is
/// the signal a backend must observe to abort an in-flight build.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    api_version: ApiVersion,
    cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(api_version: ApiVersion) -> Self {
        Self {
            api_version,
            cancel: CancellationToken::new(),
        }
    }

    /// Build a context around an existing token.
    pub fn with_token(api_version: ApiVersion, cancel: CancellationToken) -> Self {
        Self { api_version, cancel }
    }

    pub fn api_version(&self) -> ApiVersion {
        self.api_version
    }

    /// Replace the API version, keeping the same cancellation token.
    pub fn with_api_version(mut self, api_version: ApiVersion) -> Self {
        self.api_version = api_version;
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Derive a context whose cancellation follows this one but can also
    /// be cancelled on its own.
    pub fn child(&self) -> RequestContext {
        RequestContext {
            api_version: self.api_version,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}
