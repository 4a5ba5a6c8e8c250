//! kiln-api — HTTP surface of the kiln build daemon.
//!
//! The build route reads the uploaded context and streams progress on the
//! same connection. Each route is also served under a `/{version}` prefix
//! (`/v1.44/build`).
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/_ping` | Liveness |
//! | POST | `/build` | Streaming build from a tar context |
//! | POST | `/build/cancel?id=` | Cancel a build by `buildid` |
//! | POST | `/build/prune` | Prune the build cache |

pub mod decode;
pub mod error;
pub mod handlers;
pub mod orchestrator;
pub mod transport;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use kiln_core::{Backend, BuildSettings, DaemonConfig};

pub use decode::{DecodedBuild, Decoder, InboundRequest};
pub use error::{ApiError, DecodeError, HandleError, TransportError};
pub use orchestrator::Orchestrator;
pub use transport::{ChannelSink, ResponseSink, try_enable_duplex};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub settings: BuildSettings,
}

impl ApiState {
    /// State for `backend` using the `[api]` and `[build]` sections of
    /// `config`.
    pub fn new(backend: Arc<dyn Backend>, config: &DaemonConfig) -> Self {
        let decoder = Decoder::new(config.api.default_version, config.api.min_version);
        Self {
            orchestrator: Arc::new(Orchestrator::new(backend, decoder)),
            settings: config.build.clone(),
        }
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/_ping", get(handlers::ping))
        .route("/build", post(handlers::post_build))
        .route("/build/cancel", post(handlers::cancel_build))
        .route("/build/prune", post(handlers::prune_cache))
        .route("/{version}/_ping", get(handlers::ping_versioned))
        .route("/{version}/build", post(handlers::post_build_versioned))
        .route("/{version}/build/cancel", post(handlers::cancel_build_versioned))
        .route("/{version}/build/prune", post(handlers::prune_cache_versioned))
        .with_state(state)
}
