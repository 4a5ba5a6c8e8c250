//! kiln-core — shared types for the kiln build daemon.
//!
//! Holds the data model that flows between the HTTP layer and a build
//! backend: the inbound [`BuildSource`], the outbound [`ProgressWriter`],
//! [`BuildOptions`], the [`Backend`] trait, progress frames
//! ([`JsonMessage`]) and daemon configuration.

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod message;
pub mod options;
pub mod progress;
pub mod source;
pub mod version;

pub use backend::{Backend, BoxFuture, BuildConfig};
pub use config::{BuildSettings, DaemonConfig};
pub use context::RequestContext;
pub use error::{BuildError, BuildResult, ConfigError};
pub use message::{FrameKind, JsonMessage, decode_frames};
pub use options::{BuildOptions, BuildOutput, BuilderVersion, CachePruneOptions, CachePruneReport};
pub use progress::{ProgressSink, ProgressWriter, SinkFuture};
pub use source::{BuildSource, ByteStream};
pub use version::ApiVersion;
