//! HTTP handlers.
//!
//! `POST /build` streams newline-delimited JSON frames; every other route
//! answers with a single JSON envelope.

use std::io;

use axum::Json;
use axum::body::{Body, HttpBody};
use axum::extract::{Path, Query, Request, State};
use axum::http::{Uri, header};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use kiln_core::{ApiVersion, ByteStream, RequestContext};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ApiState;
use crate::decode::{InboundRequest, prune_options};
use crate::error::{ApiError, DecodeError, HandleError};
use crate::transport::{BuildBody, ChannelSink, HandlerFuture};

/// Response wrapper for non-streaming routes.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

// ── Ping ───────────────────────────────────────────────────────

/// GET /_ping
pub async fn ping() -> &'static str {
    "OK"
}

/// GET /{version}/_ping
pub async fn ping_versioned(
    State(state): State<ApiState>,
    Path(version): Path<String>,
) -> Response {
    match resolve(&state, Some(&version)) {
        Ok(_) => ping().await.into_response(),
        Err(e) => e.into_response(),
    }
}

// ── Build ──────────────────────────────────────────────────────

/// POST /build
pub async fn post_build(State(state): State<ApiState>, request: Request) -> Response {
    start_build(state, None, request).await
}

/// POST /{version}/build
pub async fn post_build_versioned(
    State(state): State<ApiState>,
    Path(version): Path<String>,
    request: Request,
) -> Response {
    start_build(state, Some(version), request).await
}

/// Wire a build request to a streaming response.
///
/// The orchestrator future runs inside the response body. Before the
/// response head is returned it is polled until it either commits its
/// first frame or finishes, so a decode failure can still be answered
/// with a status code.
async fn start_build(state: ApiState, version: Option<String>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let settings = state.settings.clone();

    let body: Option<ByteStream> = if body.is_end_stream() {
        None
    } else {
        Some(Box::pin(body.into_data_stream().map_err(io::Error::other)) as ByteStream)
    };

    let (mut sink, mut channel) = ChannelSink::new(settings.progress_buffer, settings.full_duplex);
    let body = body.map(|stream| Box::pin(sink.hold_body(stream)) as ByteStream);

    let inbound = InboundRequest {
        version,
        uri: parts.uri,
        headers: parts.headers,
        body,
    };

    let orchestrator = state.orchestrator.clone();
    let token = CancellationToken::new();
    let ctx = RequestContext::with_token(
        orchestrator.decoder().default_version(),
        token.clone(),
    );
    let timeout = settings.timeout();

    let mut handler: HandlerFuture = Box::pin(async move {
        let run = orchestrator.handle(ctx.clone(), &mut sink, inbound);
        let Some(limit) = timeout else {
            return run.await;
        };
        tokio::pin!(run);
        tokio::select! {
            out = &mut run => return out,
            _ = tokio::time::sleep(limit) => {
                warn!(?limit, "build timed out, cancelling");
                ctx.cancel();
            }
        }
        run.await
    });

    let pending = tokio::select! {
        biased;
        result = &mut handler => {
            match result {
                Err(HandleError::Decode(e)) => {
                    debug!(error = %e, "rejecting build request");
                    return ApiError::from(e).into_response();
                }
                Err(e) => warn!(error = %e, "build handler ended with error"),
                Ok(()) => {}
            }
            None
        }
        _ = &mut channel.committed => Some(handler),
    };

    let body = BuildBody::new(pending, channel, token.drop_guard());
    (
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(body),
    )
        .into_response()
}

// ── Cancel ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    pub id: Option<String>,
}

/// POST /build/cancel?id=
pub async fn cancel_build(State(state): State<ApiState>, Query(query): Query<CancelQuery>) -> Response {
    cancel(state, None, query).await
}

/// POST /{version}/build/cancel?id=
pub async fn cancel_build_versioned(
    State(state): State<ApiState>,
    Path(version): Path<String>,
    Query(query): Query<CancelQuery>,
) -> Response {
    cancel(state, Some(version), query).await
}

async fn cancel(state: ApiState, version: Option<String>, query: CancelQuery) -> Response {
    let api_version = match resolve(&state, version.as_deref()) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let Some(id) = query.id.filter(|id| !id.is_empty()) else {
        return ApiError::from(DecodeError::MissingParameter("id")).into_response();
    };
    let ctx = RequestContext::new(api_version);
    match state.orchestrator.backend().cancel(ctx, &id).await {
        Ok(()) => {
            debug!(build_id = %id, "cancel requested");
            ApiResponse::ok("cancelled").into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

// ── Prune ──────────────────────────────────────────────────────

/// POST /build/prune
pub async fn prune_cache(State(state): State<ApiState>, uri: Uri) -> Response {
    prune(state, None, uri).await
}

/// POST /{version}/build/prune
pub async fn prune_cache_versioned(
    State(state): State<ApiState>,
    Path(version): Path<String>,
    uri: Uri,
) -> Response {
    prune(state, Some(version), uri).await
}

async fn prune(state: ApiState, version: Option<String>, uri: Uri) -> Response {
    let api_version = match resolve(&state, version.as_deref()) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let options = match prune_options(&uri) {
        Ok(options) => options,
        Err(e) => return ApiError::from(e).into_response(),
    };
    let ctx = RequestContext::new(api_version);
    match state.orchestrator.backend().prune_cache(ctx, options).await {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

fn resolve(state: &ApiState, version: Option<&str>) -> Result<ApiVersion, ApiError> {
    state
        .orchestrator
        .decoder()
        .resolve_version(version)
        .map_err(ApiError::from)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::body::to_bytes;
    use axum::http::StatusCode;
    use kiln_core::{
        Backend, BoxFuture, BuildConfig, BuildError, BuildResult, BuildSettings,
        CachePruneOptions, CachePruneReport, FrameKind, decode_frames,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::build_router;
    use crate::decode::Decoder;
    use crate::orchestrator::Orchestrator;

    /// Echoes the body length back as the image id.
    #[derive(Default)]
    struct EchoBackend {
        cancelled: Mutex<Vec<String>>,
    }

    impl Backend for EchoBackend {
        fn build<'a>(
            &'a self,
            _ctx: RequestContext,
            mut config: BuildConfig<'a>,
        ) -> BoxFuture<'a, BuildResult<String>> {
            Box::pin(async move {
                config
                    .progress
                    .stream("reading\n")
                    .await
                    .map_err(BuildError::Progress)?;
                let mut source = config.source.ok_or(BuildError::MissingContext)?;
                while source.next_chunk().await.transpose()?.is_some() {}
                Ok(format!("len-{}", source.bytes_read()))
            })
        }

        fn cancel<'a>(&'a self, _ctx: RequestContext, id: &'a str) -> BoxFuture<'a, BuildResult<()>> {
            Box::pin(async move {
                self.cancelled.lock().unwrap().push(id.to_string());
                Ok(())
            })
        }

        fn prune_cache(
            &self,
            _ctx: RequestContext,
            options: CachePruneOptions,
        ) -> BoxFuture<'_, BuildResult<CachePruneReport>> {
            Box::pin(async move {
                if options.filters.contains_key("bogus") {
                    return Err(BuildError::InvalidArgument("bogus".to_string()));
                }
                Ok(CachePruneReport {
                    caches_deleted: vec!["c1".to_string()],
                    space_reclaimed: 42,
                })
            })
        }
    }

    fn test_state(backend: Arc<EchoBackend>) -> ApiState {
        ApiState {
            orchestrator: Arc::new(Orchestrator::new(backend, Decoder::default())),
            settings: BuildSettings::default(),
        }
    }

    fn post(uri: &str, body: Body) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-tar")
            .body(body)
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn build_streams_frames() {
        let app = build_router(test_state(Arc::default()));
        let resp = app
            .oneshot(post("/build", Body::from(vec![7u8; 300])))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/json");

        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let messages = decode_frames(&bytes).unwrap();
        assert_eq!(messages[0].stream.as_deref(), Some("reading\n"));
        assert_eq!(
            messages.last().map(|m| m.kind()),
            Some(FrameKind::Success("len-300".to_string()))
        );
    }

    #[tokio::test]
    async fn build_without_body_reports_missing_context_in_stream() {
        let app = build_router(test_state(Arc::default()));
        let resp = app.oneshot(post("/build", Body::empty())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let kinds: Vec<FrameKind> = decode_frames(&bytes)
            .unwrap()
            .iter()
            .map(|m| m.kind())
            .collect();
        assert_eq!(kinds.len(), 2);
        assert!(matches!(&kinds[1], FrameKind::Error(msg) if msg.contains("no build context")));
    }

    #[tokio::test]
    async fn decode_failure_is_status_coded() {
        let app = build_router(test_state(Arc::default()));
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/build")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("not a tar"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(json_body(resp).await["success"], false);
    }

    #[tokio::test]
    async fn versioned_build_checks_version() {
        let app = build_router(test_state(Arc::default()));
        let resp = app
            .clone()
            .oneshot(post("/v1.12/build", Body::from("x")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app.oneshot(post("/v1.44/build", Body::from("x"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cancel_requires_id() {
        let backend = Arc::new(EchoBackend::default());
        let app = build_router(test_state(backend.clone()));

        let resp = app
            .clone()
            .oneshot(post("/build/cancel", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(post("/v1.44/build/cancel?id=b-7", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(*backend.cancelled.lock().unwrap(), vec!["b-7".to_string()]);
    }

    #[tokio::test]
    async fn prune_returns_report() {
        let app = build_router(test_state(Arc::default()));
        let resp = app
            .oneshot(post("/build/prune?all=1", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["SpaceReclaimed"], 42);
    }

    #[tokio::test]
    async fn prune_maps_backend_errors() {
        let app = build_router(test_state(Arc::default()));
        let resp = app
            .oneshot(post(
                "/build/prune?filters=%7B%22bogus%22%3A%5B%22x%22%5D%7D",
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ping_answers_ok() {
        let app = build_router(test_state(Arc::default()));
        let req = axum::http::Request::builder()
            .uri("/_ping")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"OK");
    }

    /// Reports a `status` frame per chunk, then optionally stalls until
    /// cancelled.
    struct ChunkCounter {
        stall: bool,
    }

    impl Backend for ChunkCounter {
        fn build<'a>(
            &'a self,
            ctx: RequestContext,
            mut config: BuildConfig<'a>,
        ) -> BoxFuture<'a, BuildResult<String>> {
            Box::pin(async move {
                let mut source = config.source.ok_or(BuildError::MissingContext)?;
                let mut chunks = 0;
                while source.next_chunk().await.transpose()?.is_some() {
                    chunks += 1;
                    config
                        .progress
                        .progress("context", "Receiving", chunks, None)
                        .await
                        .map_err(BuildError::Progress)?;
                }
                if self.stall {
                    ctx.cancelled().await;
                    return Err(BuildError::Canceled);
                }
                Ok(format!("chunks-{chunks}"))
            })
        }

        fn cancel<'a>(&'a self, _: RequestContext, _: &'a str) -> BoxFuture<'a, BuildResult<()>> {
            Box::pin(async { Ok(()) })
        }

        fn prune_cache(
            &self,
            _: RequestContext,
            _: CachePruneOptions,
        ) -> BoxFuture<'_, BuildResult<CachePruneReport>> {
            Box::pin(async { Ok(CachePruneReport::default()) })
        }
    }

    fn half_duplex_router(stall: bool) -> axum::Router {
        let settings = BuildSettings {
            full_duplex: false,
            progress_buffer: 4,
            ..Default::default()
        };
        build_router(ApiState {
            orchestrator: Arc::new(Orchestrator::new(
                Arc::new(ChunkCounter { stall }),
                Decoder::default(),
            )),
            settings,
        })
    }

    fn chunked_body(chunks: usize) -> Body {
        let items = (0..chunks).map(|_| Ok::<_, io::Error>(bytes::Bytes::from_static(b"chunk")));
        Body::from_stream(futures::stream::iter(items))
    }

    #[tokio::test]
    async fn half_duplex_progress_is_coalesced_to_the_buffer() {
        let resp = half_duplex_router(false)
            .oneshot(post("/build", chunked_body(5_000)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let messages = decode_frames(&bytes).unwrap();
        assert!(messages.len() <= 5, "got {} frames", messages.len());

        let last_progress = messages
            .iter()
            .filter_map(|m| m.progress_detail.as_ref())
            .map(|p| p.current)
            .last();
        assert_eq!(last_progress, Some(5_000));
        assert_eq!(
            messages.last().map(|m| m.kind()),
            Some(FrameKind::Success("chunks-5000".to_string()))
        );
    }

    #[tokio::test]
    async fn half_duplex_releases_progress_once_the_upload_ends() {
        use futures::StreamExt;

        let resp = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            half_duplex_router(true).oneshot(post("/build", chunked_body(3))),
        )
        .await
        .expect("response head waited for the build to finish")
        .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let mut body = resp.into_body().into_data_stream();
        let first = tokio::time::timeout(std::time::Duration::from_secs(5), body.next())
            .await
            .expect("held progress was not released")
            .unwrap()
            .unwrap();
        let messages = decode_frames(&first).unwrap();
        assert_eq!(messages[0].progress_detail.as_ref().map(|p| p.current), Some(1));
    }

    #[tokio::test]
    async fn build_timeout_cancels_context() {
        struct Stall;
        impl Backend for Stall {
            fn build<'a>(
                &'a self,
                ctx: RequestContext,
                _config: BuildConfig<'a>,
            ) -> BoxFuture<'a, BuildResult<String>> {
                Box::pin(async move {
                    ctx.cancelled().await;
                    Err(BuildError::Canceled)
                })
            }
            fn cancel<'a>(&'a self, _: RequestContext, _: &'a str) -> BoxFuture<'a, BuildResult<()>> {
                Box::pin(async { Ok(()) })
            }
            fn prune_cache(
                &self,
                _: RequestContext,
                _: CachePruneOptions,
            ) -> BoxFuture<'_, BuildResult<CachePruneReport>> {
                Box::pin(async { Ok(CachePruneReport::default()) })
            }
        }

        let settings = BuildSettings {
            timeout_secs: Some(1),
            ..Default::default()
        };
        let state = ApiState {
            orchestrator: Arc::new(Orchestrator::new(Arc::new(Stall), Decoder::default())),
            settings,
        };
        let resp = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            build_router(state).oneshot(post("/build", Body::empty())),
        )
        .await
        .unwrap()
        .unwrap();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let messages = decode_frames(&bytes).unwrap();
        assert_eq!(
            messages.last().map(|m| m.kind()),
            Some(FrameKind::Error("build canceled".to_string()))
        );
    }
}
