//! Outbound progress plumbing.
//!
//! The backend never sees the HTTP response. It receives a
//! [`ProgressWriter`] that borrows the response's [`ProgressSink`] for the
//! duration of one `build` call. The borrow is what keeps the orchestrator
//! from writing concurrently: it can only emit the terminal frame once the
//! writer, and with it the backend future, is gone.

use std::future::Future;
use std::io;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use serde::Serialize;

use crate::message::{JsonMessage, JsonProgress};

/// Boxed future returned by [`ProgressSink::send`].
pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>>;

/// A destination for outbound frames.
///
/// Frames are delivered in the order `send` is awaited. An error means the
/// peer is gone; callers should stop producing output.
pub trait ProgressSink: Send {
    fn send(&mut self, frame: Bytes) -> SinkFuture<'_>;
}

/// Collects frames in memory.
impl ProgressSink for Vec<Bytes> {
    fn send(&mut self, frame: Bytes) -> SinkFuture<'_> {
        self.push(frame);
        Box::pin(async { Ok(()) })
    }
}

enum Output<'a> {
    Sink(&'a mut dyn ProgressSink),
    /// Quiet builds: output is captured so it can be replayed on failure.
    Captured(&'a mut BytesMut),
}

/// The backend's handle on the outbound stream.
pub struct ProgressWriter<'a> {
    output: Output<'a>,
}

impl<'a> ProgressWriter<'a> {
    /// Write straight through to `sink`.
    pub fn new(sink: &'a mut dyn ProgressSink) -> Self {
        Self {
            output: Output::Sink(sink),
        }
    }

    /// Capture everything into `buf` instead of sending it.
    pub fn captured(buf: &'a mut BytesMut) -> Self {
        Self {
            output: Output::Captured(buf),
        }
    }

    /// Whether output is being captured rather than streamed.
    pub fn is_quiet(&self) -> bool {
        matches!(self.output, Output::Captured(_))
    }

    /// Write raw bytes. The caller is responsible for framing.
    pub async fn write(&mut self, frame: impl Into<Bytes>) -> io::Result<()> {
        let frame = frame.into();
        if frame.is_empty() {
            return Ok(());
        }
        match &mut self.output {
            Output::Sink(sink) => sink.send(frame).await,
            Output::Captured(buf) => {
                buf.extend_from_slice(&frame);
                Ok(())
            }
        }
    }

    pub async fn write_message(&mut self, message: &JsonMessage) -> io::Result<()> {
        self.write(message.to_frame()).await
    }

    /// Emit a build-output line.
    pub async fn stream(&mut self, text: impl Into<String>) -> io::Result<()> {
        self.write_message(&JsonMessage::stream(text)).await
    }

    /// Emit a status line.
    pub async fn status(&mut self, id: Option<&str>, status: impl Into<String>) -> io::Result<()> {
        self.write_message(&JsonMessage::status(id.map(str::to_string), status))
            .await
    }

    /// Emit a status line with transfer progress.
    pub async fn progress(
        &mut self,
        id: &str,
        status: impl Into<String>,
        current: u64,
        total: Option<u64>,
    ) -> io::Result<()> {
        let mut message = JsonMessage::status(Some(id.to_string()), status);
        message.progress_detail = Some(JsonProgress { current, total });
        self.write_message(&message).await
    }

    /// Emit an auxiliary structured payload.
    pub async fn aux<T: Serialize>(&mut self, value: &T) -> io::Result<()> {
        let value = serde_json::to_value(value).map_err(io::Error::other)?;
        self.write_message(&JsonMessage::aux(value)).await
    }
}
