//! The streaming build handler.
//!
//! [`Orchestrator::handle`] decodes a request, hands the body and the
//! response sink to the backend, and writes exactly one terminal frame
//! once the backend returns. It never spawns: the backend runs inside the
//! caller's future.

use std::sync::Arc;

use bytes::BytesMut;
use kiln_core::{Backend, BuildConfig, JsonMessage, ProgressWriter, RequestContext};
use tracing::{debug, info, warn};

use crate::decode::{DecodedBuild, Decoder, InboundRequest};
use crate::error::HandleError;
use crate::transport::{ResponseSink, try_enable_duplex};

/// Wires one request's inbound context, outbound progress and
/// cancellation to a [`Backend`].
pub struct Orchestrator {
    backend: Arc<dyn Backend>,
    decoder: Decoder,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn Backend>, decoder: Decoder) -> Self {
        Self { backend, decoder }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// Run one build request to completion.
    ///
    /// Returns `Ok(())` once the terminal frame is written, whether the
    /// build succeeded or failed. `Err(Decode)` means nothing was written
    /// and the caller should answer with a status code.
    pub async fn handle<S: ResponseSink>(
        &self,
        ctx: RequestContext,
        sink: &mut S,
        request: InboundRequest,
    ) -> Result<(), HandleError> {
        let has_body = request.has_body();
        let DecodedBuild {
            api_version,
            options,
            source,
        } = self.decoder.decode(request)?;
        let ctx = ctx.with_api_version(api_version);

        let duplex = has_body && try_enable_duplex(sink);
        let quiet = options.suppress_output;
        info!(
            %api_version,
            has_body,
            duplex,
            quiet,
            tags = ?options.tags,
            "build started"
        );

        let mut captured = BytesMut::new();
        let result = {
            let progress = if quiet {
                ProgressWriter::captured(&mut captured)
            } else {
                ProgressWriter::new(&mut *sink)
            };
            let config = BuildConfig {
                source,
                progress,
                options,
            };
            self.backend.build(ctx.clone(), config).await
        };

        match result {
            Ok(image_id) => {
                info!(%image_id, "build finished");
                let mut out = ProgressWriter::new(&mut *sink);
                if quiet {
                    out.stream(format!("{image_id}\n"))
                        .await
                        .map_err(HandleError::Write)?;
                }
                out.write_message(&JsonMessage::image_id(&image_id))
                    .await
                    .map_err(HandleError::Write)?;
            }
            Err(e) => {
                if e.is_canceled() {
                    info!("build canceled");
                } else {
                    warn!(error = %e, "build failed");
                }
                if quiet && !captured.is_empty() {
                    debug!(bytes = captured.len(), "flushing captured build output");
                    sink.send(captured.freeze())
                        .await
                        .map_err(HandleError::Write)?;
                }
                ProgressWriter::new(&mut *sink)
                    .write_message(&JsonMessage::error(e.to_string()))
                    .await
                    .map_err(HandleError::Write)?;
            }
        }
        Ok(())
    }
}
