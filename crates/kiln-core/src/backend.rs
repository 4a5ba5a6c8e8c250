//! The backend capability interface.
//!
//! The orchestrator only knows a backend through [`Backend`]. Anything
//! that can consume a context stream and report an image identifier can
//! sit behind it: the daemon's reference backend, or a test stub.

use std::future::Future;
use std::pin::Pin;

use crate::context::RequestContext;
use crate::error::BuildResult;
use crate::options::{BuildOptions, CachePruneOptions, CachePruneReport};
use crate::progress::ProgressWriter;
use crate::source::BuildSource;

/// Boxed `Send` future alias used by [`Backend`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything one build needs, created once per request.
pub struct BuildConfig<'a> {
    /// The uploaded context, or `None` when the request carried no body.
    pub source: Option<BuildSource>,
    pub progress: ProgressWriter<'a>,
    pub options: BuildOptions,
}

/// Build engine operations consumed by the API layer.
pub trait Backend: Send + Sync {
    /// Run a build and return the resulting image identifier.
    ///
    /// Implementations must treat `config.source` as single-pass, may
    /// write progress at any point, and must return promptly with
    /// [`BuildError::Canceled`](crate::BuildError::Canceled) once `ctx`
    /// is cancelled.
    fn build<'a>(
        &'a self,
        ctx: RequestContext,
        config: BuildConfig<'a>,
    ) -> BoxFuture<'a, BuildResult<String>>;

    /// Cancel the build registered under `id`.
    fn cancel<'a>(&'a self, ctx: RequestContext, id: &'a str) -> BoxFuture<'a, BuildResult<()>>;

    /// Remove build cache records.
    fn prune_cache(
        &self,
        ctx: RequestContext,
        options: CachePruneOptions,
    ) -> BoxFuture<'_, BuildResult<CachePruneReport>>;
}
