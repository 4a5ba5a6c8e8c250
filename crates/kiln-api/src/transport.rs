//! Duplex transport plumbing.
//!
//! # Model
//!
//! ```text
//!  request body ──► DrainSignal ──► BuildSource ──► backend
//!                        │ (ended / dropped)
//!                        ▼ release
//!  backend ──► ProgressWriter ──► ChannelSink ──┬─► hold queue ──┐
//!                                               └─► mpsc ────────┴─► BuildBody ──► response body
//! ```
//!
//! In full-duplex mode `ChannelSink` forwards frames as soon as they are
//! written. In half-duplex mode frames written while the request body is
//! still arriving go to the hold queue. The queue is released the moment
//! the body ends or its stream is dropped, and `BuildBody` drains it before
//! anything sent through the channel afterwards.
//!
//! Both sides are bounded by `capacity`. The outbound channel applies
//! backpressure: when the client reads slower than the backend writes,
//! the backend's write awaits. The hold queue cannot block its writer,
//! which is also the body reader, so once full it coalesces instead:
//!
//! 1. a `status` frame evicts the oldest held `status` frame with the
//!    same `id`;
//! 2. otherwise the oldest held `status` frame is dropped;
//! 3. otherwise the oldest held frame is dropped.
//!
//! The frame being written is never the one discarded, so a terminal
//! frame always survives.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use kiln_core::{BoxFuture, ByteStream, JsonMessage, ProgressSink, SinkFuture};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::DropGuard;
use tracing::{debug, warn};

use crate::error::{HandleError, TransportError};

/// A response writer the orchestrator can stream frames into.
pub trait ResponseSink: ProgressSink {
    /// Allow response bytes to be sent before the request body has been
    /// fully received. One-way for the lifetime of the request.
    fn enable_full_duplex(&mut self) -> Result<(), TransportError> {
        Err(TransportError::NotSupported)
    }
}

/// In-memory sink with no upload to interleave with.
impl ResponseSink for Vec<Bytes> {}

/// Ask `sink` for full duplex and report whether it was granted.
///
/// Failure is logged and otherwise ignored: the result is only meant for
/// observability.
pub fn try_enable_duplex<S: ResponseSink + ?Sized>(sink: &mut S) -> bool {
    match sink.enable_full_duplex() {
        Ok(()) => {
            debug!("full duplex enabled");
            true
        }
        Err(e) => {
            warn!(error = %e, "could not enable full duplex; progress will follow the upload");
            false
        }
    }
}

struct HeldFrame {
    frame: Bytes,
    /// `Some(id)` for a `status` frame, the only kind that may be coalesced
    /// by id.
    status_id: Option<Option<String>>,
}

impl HeldFrame {
    fn new(frame: Bytes) -> Self {
        let status_id = serde_json::from_slice::<JsonMessage>(&frame)
            .ok()
            .filter(|m| m.status.is_some() && m.stream.is_none())
            .filter(|m| m.error.is_none() && m.error_detail.is_none() && m.aux.is_none())
            .map(|m| m.id);
        Self { frame, status_id }
    }
}

/// State shared by the sink, the drain signal and the response body.
struct Gate {
    holding: bool,
    held: VecDeque<HeldFrame>,
    limit: usize,
    dropped: u64,
    commit: Option<oneshot::Sender<()>>,
}

impl Gate {
    fn hold(&mut self, frame: Bytes) {
        let frame = HeldFrame::new(frame);
        if self.held.len() >= self.limit {
            self.make_room(&frame);
        }
        self.held.push_back(frame);
    }

    fn make_room(&mut self, incoming: &HeldFrame) {
        let superseded = incoming.status_id.as_ref().and_then(|id| {
            self.held
                .iter()
                .position(|h| h.status_id.as_ref() == Some(id))
        });
        let victim = superseded
            .or_else(|| self.held.iter().position(|h| h.status_id.is_some()))
            .unwrap_or(0);
        self.held.remove(victim);
        self.dropped += 1;
    }

    /// Stop holding. Commits the response if anything is waiting.
    fn release(&mut self) {
        if !self.holding {
            return;
        }
        self.holding = false;
        if self.dropped > 0 {
            debug!(dropped = self.dropped, "coalesced progress held during upload");
        }
        if !self.held.is_empty() {
            self.commit();
        }
    }

    fn commit(&mut self) {
        if let Some(commit) = self.commit.take() {
            let _ = commit.send(());
        }
    }
}

type SharedGate = Arc<Mutex<Gate>>;

fn lock(gate: &SharedGate) -> MutexGuard<'_, Gate> {
    gate.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Released half-duplex frames, drained by [`BuildBody`].
pub struct HeldFrames(SharedGate);

impl HeldFrames {
    /// Next released frame, if the hold has ended and anything is queued.
    fn pop_released(&self) -> Option<Bytes> {
        let mut gate = lock(&self.0);
        if gate.holding {
            return None;
        }
        gate.held.pop_front().map(|h| h.frame)
    }
}

/// Receiving half of a [`ChannelSink`].
pub struct ResponseChannel {
    pub frames: mpsc::Receiver<Bytes>,
    pub held: HeldFrames,
    /// Fires once the first frame is ready for the client.
    pub committed: oneshot::Receiver<()>,
}

/// Response sink backed by a bounded channel.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
    allow_full_duplex: bool,
    full_duplex: bool,
    gate: SharedGate,
}

impl ChannelSink {
    /// Create a sink that queues at most `capacity` frames toward the
    /// client. `allow_full_duplex = false` makes every duplex request fail.
    pub fn new(capacity: usize, allow_full_duplex: bool) -> (Self, ResponseChannel) {
        let capacity = capacity.max(1);
        let (tx, frames) = mpsc::channel(capacity);
        let (commit, committed) = oneshot::channel();
        let gate = Arc::new(Mutex::new(Gate {
            holding: false,
            held: VecDeque::new(),
            limit: capacity,
            dropped: 0,
            commit: Some(commit),
        }));
        let sink = Self {
            tx,
            allow_full_duplex,
            full_duplex: false,
            gate: gate.clone(),
        };
        let channel = ResponseChannel {
            frames,
            held: HeldFrames(gate),
            committed,
        };
        (sink, channel)
    }

    /// Hold frames until `body` ends or is dropped. Returns the body
    /// wrapped so that it releases the hold.
    pub fn hold_body(&mut self, body: ByteStream) -> DrainSignal {
        if !self.full_duplex {
            lock(&self.gate).holding = true;
        }
        DrainSignal {
            inner: body,
            gate: Some(self.gate.clone()),
        }
    }

    pub fn is_full_duplex(&self) -> bool {
        self.full_duplex
    }

    /// Frames currently held back waiting for the upload to finish.
    pub fn held(&self) -> usize {
        lock(&self.gate).held.len()
    }

    /// Queue `frame` if the hold is active, otherwise hand it back.
    fn try_hold(&self, frame: Bytes) -> Option<Bytes> {
        let mut gate = lock(&self.gate);
        if gate.holding {
            gate.hold(frame);
            return None;
        }
        Some(frame)
    }

    async fn push(&mut self, frame: Bytes) -> io::Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))?;
        lock(&self.gate).commit();
        Ok(())
    }
}

impl ProgressSink for ChannelSink {
    fn send(&mut self, frame: Bytes) -> SinkFuture<'_> {
        Box::pin(async move {
            match self.try_hold(frame) {
                Some(frame) => self.push(frame).await,
                None => Ok(()),
            }
        })
    }
}

impl ResponseSink for ChannelSink {
    fn enable_full_duplex(&mut self) -> Result<(), TransportError> {
        if !self.allow_full_duplex {
            return Err(TransportError::NotSupported);
        }
        let mut gate = lock(&self.gate);
        if gate.commit.is_none() {
            return Err(TransportError::AlreadyCommitted);
        }
        gate.release();
        self.full_duplex = true;
        Ok(())
    }
}

impl Drop for ChannelSink {
    fn drop(&mut self) {
        // Nothing else will be written; whatever is held is final.
        lock(&self.gate).release();
    }
}

/// Wraps the inbound body and releases the hold when it ends or is
/// dropped.
pub struct DrainSignal {
    inner: ByteStream,
    gate: Option<SharedGate>,
}

impl DrainSignal {
    fn release(&mut self) {
        if let Some(gate) = self.gate.take() {
            lock(&gate).release();
        }
    }
}

impl Stream for DrainSignal {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let next = this.inner.as_mut().poll_next(cx);
        if let Poll::Ready(None) = next {
            this.release();
        }
        next
    }
}

impl Drop for DrainSignal {
    fn drop(&mut self) {
        self.release();
    }
}

/// The orchestrator future as driven by a response body.
pub type HandlerFuture = BoxFuture<'static, Result<(), HandleError>>;

/// Streaming response body that also drives the build.
///
/// Each poll advances the handler future (which reads the request body
/// and writes frames), then yields released held frames, then the next
/// channel frame. Everything runs on the connection's own task. Dropping
/// the body (client gone) drops the handler and cancels the request
/// context.
pub struct BuildBody {
    handler: Option<HandlerFuture>,
    frames: mpsc::Receiver<Bytes>,
    held: HeldFrames,
    _cancel_on_drop: DropGuard,
}

impl BuildBody {
    pub fn new(
        handler: Option<HandlerFuture>,
        channel: ResponseChannel,
        cancel_on_drop: DropGuard,
    ) -> Self {
        Self {
            handler,
            frames: channel.frames,
            held: channel.held,
            _cancel_on_drop: cancel_on_drop,
        }
    }
}

impl Stream for BuildBody {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(handler) = this.handler.as_mut() {
            if let Poll::Ready(result) = handler.as_mut().poll(cx) {
                this.handler = None;
                if let Err(e) = result {
                    warn!(error = %e, "build handler ended with error");
                }
            }
        }
        // Held frames predate anything sent through the channel.
        if let Some(frame) = this.held.pop_released() {
            return Poll::Ready(Some(Ok(frame)));
        }
        match this.frames.poll_recv(cx) {
            Poll::Ready(Some(frame)) => Poll::Ready(Some(Ok(frame))),
            // Every sender is gone: the handler has finished.
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use kiln_core::message::JsonProgress;
    use tokio_util::sync::CancellationToken;

    fn body_of(chunks: Vec<&'static [u8]>) -> ByteStream {
        let items: Vec<io::Result<Bytes>> =
            chunks.into_iter().map(|c| Ok(Bytes::from_static(c))).collect();
        Box::pin(futures::stream::iter(items))
    }

    fn pending_body() -> ByteStream {
        Box::pin(futures::stream::pending())
    }

    fn released(channel: &ResponseChannel) -> Vec<Bytes> {
        std::iter::from_fn(|| channel.held.pop_released()).collect()
    }

    fn upload_status(current: u64) -> Bytes {
        let mut message = JsonMessage::status(Some("context".to_string()), "Receiving build context");
        message.progress_detail = Some(JsonProgress {
            current,
            total: None,
        });
        message.to_frame()
    }

    fn current_of(frame: &Bytes) -> Option<u64> {
        let message: JsonMessage = serde_json::from_slice(frame).unwrap();
        message.progress_detail.map(|p| p.current)
    }

    #[tokio::test]
    async fn full_duplex_forwards_immediately() {
        let (mut sink, mut channel) = ChannelSink::new(8, true);
        let _body = sink.hold_body(body_of(vec![b"ctx"]));

        assert!(try_enable_duplex(&mut sink));
        assert!(sink.is_full_duplex());

        sink.send(Bytes::from_static(b"one")).await.unwrap();
        assert_eq!(sink.held(), 0);
        assert_eq!(channel.frames.recv().await.unwrap(), "one");
        assert!(channel.committed.try_recv().is_ok());
    }

    #[tokio::test]
    async fn half_duplex_holds_until_body_ends() {
        let (mut sink, mut channel) = ChannelSink::new(8, false);
        let mut body = sink.hold_body(body_of(vec![b"a", b"b"]));

        assert!(!try_enable_duplex(&mut sink));

        sink.send(Bytes::from_static(b"first")).await.unwrap();
        sink.send(Bytes::from_static(b"second")).await.unwrap();
        assert_eq!(sink.held(), 2);
        assert!(released(&channel).is_empty());
        assert!(channel.frames.try_recv().is_err());
        assert!(channel.committed.try_recv().is_err());

        while body.next().await.is_some() {}

        // Released as soon as the body ends, without waiting for a write.
        assert!(channel.committed.try_recv().is_ok());
        assert_eq!(released(&channel), vec!["first", "second"]);

        sink.send(Bytes::from_static(b"third")).await.unwrap();
        assert_eq!(channel.frames.recv().await.unwrap(), "third");
    }

    #[tokio::test]
    async fn half_duplex_releases_when_body_dropped() {
        let (mut sink, channel) = ChannelSink::new(8, false);
        let body = sink.hold_body(body_of(vec![b"never read"]));

        sink.send(Bytes::from_static(b"held")).await.unwrap();
        assert_eq!(sink.held(), 1);
        drop(body);

        assert_eq!(released(&channel), vec!["held"]);
    }

    #[tokio::test]
    async fn hold_is_bounded_and_keeps_latest_status() {
        let (mut sink, channel) = ChannelSink::new(4, false);
        let _body = sink.hold_body(pending_body());

        sink.send(JsonMessage::stream("Step 1/1 : FROM scratch\n").to_frame())
            .await
            .unwrap();
        for current in 1..=10_000 {
            sink.send(upload_status(current)).await.unwrap();
        }
        sink.send(JsonMessage::error("boom").to_frame()).await.unwrap();
        assert!(sink.held() <= 4, "held {} frames", sink.held());

        drop(sink);
        let frames = released(&channel);
        assert_eq!(frames.len(), 4);
        assert!(String::from_utf8_lossy(&frames[0]).contains("Step 1/1"));
        assert_eq!(current_of(&frames[1]), Some(9_999));
        assert_eq!(current_of(&frames[2]), Some(10_000));
        assert!(String::from_utf8_lossy(&frames[3]).contains("boom"));
    }

    #[tokio::test]
    async fn full_hold_of_plain_lines_drops_oldest() {
        let (mut sink, channel) = ChannelSink::new(2, false);
        let _body = sink.hold_body(pending_body());

        for line in ["a", "b", "c", "d"] {
            sink.send(Bytes::from(line)).await.unwrap();
        }
        assert_eq!(sink.held(), 2);

        drop(sink);
        assert_eq!(released(&channel), vec!["c", "d"]);
    }

    #[tokio::test]
    async fn no_body_means_no_holding() {
        let (mut sink, mut channel) = ChannelSink::new(8, false);
        sink.send(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(channel.frames.recv().await.unwrap(), "x");
    }

    #[tokio::test]
    async fn duplex_refused_after_commit() {
        let (mut sink, _channel) = ChannelSink::new(8, true);
        sink.send(Bytes::from_static(b"x")).await.unwrap();
        assert!(matches!(
            sink.enable_full_duplex(),
            Err(TransportError::AlreadyCommitted)
        ));
    }

    #[tokio::test]
    async fn send_fails_once_client_is_gone() {
        let (mut sink, channel) = ChannelSink::new(8, true);
        drop(channel);
        let err = sink.send(Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn vec_sink_does_not_support_duplex() {
        let mut sink: Vec<Bytes> = Vec::new();
        assert!(!try_enable_duplex(&mut sink));
    }

    #[tokio::test]
    async fn build_body_drives_handler_and_yields_frames() {
        let (mut sink, channel) = ChannelSink::new(1, true);
        let handler: HandlerFuture = Box::pin(async move {
            for i in 0..5 {
                sink.send(Bytes::from(format!("frame-{i}")))
                    .await
                    .map_err(HandleError::Write)?;
            }
            Ok(())
        });
        let token = CancellationToken::new();
        let body = BuildBody::new(Some(handler), channel, token.clone().drop_guard());

        let frames: Vec<Bytes> = body.map(|f| f.unwrap()).collect().await;
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[4], "frame-4");
        assert!(token.is_cancelled(), "dropping the body cancels the request");
    }

    #[tokio::test]
    async fn build_body_yields_held_frames_before_later_ones() {
        let (mut sink, channel) = ChannelSink::new(8, false);
        let mut upload = sink.hold_body(body_of(vec![b"ctx"]));
        let handler: HandlerFuture = Box::pin(async move {
            sink.send(Bytes::from_static(b"during"))
                .await
                .map_err(HandleError::Write)?;
            while upload.next().await.is_some() {}
            sink.send(Bytes::from_static(b"after"))
                .await
                .map_err(HandleError::Write)?;
            Ok(())
        });
        let token = CancellationToken::new();
        let body = BuildBody::new(Some(handler), channel, token.drop_guard());

        let frames: Vec<Bytes> = body.map(|f| f.unwrap()).collect().await;
        assert_eq!(frames, vec!["during", "after"]);
    }
}
