//! Progress frames.
//!
//! Every frame on the outbound stream is one JSON object followed by a
//! newline. Three kinds share the same shape:
//!
//! | kind | example |
//! |---|---|
//! | progress | `{"stream":"Step 1/3 : FROM scratch\n"}` |
//! | success | `{"aux":{"ID":"sha256:…"}}` |
//! | error | `{"errorDetail":{"message":"…"},"error":"…"}` |

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Error detail carried by an error frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonError {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<u16>,
    pub message: String,
}

/// Transfer progress for a `status` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonProgress {
    pub current: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub total: Option<u64>,
}

/// One message on the progress stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonMessage {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stream: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<String>,
    #[serde(rename = "progressDetail", skip_serializing_if = "Option::is_none", default)]
    pub progress_detail: Option<JsonProgress>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub progress: Option<String>,
    #[serde(rename = "errorDetail", skip_serializing_if = "Option::is_none", default)]
    pub error_detail: Option<JsonError>,
    /// Legacy plain-text copy of `errorDetail.message`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub aux: Option<serde_json::Value>,
}

/// Classification of a decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Progress,
    /// Terminal success carrying the image identifier.
    Success(String),
    /// Terminal failure carrying the error message.
    Error(String),
}

impl JsonMessage {
    /// A plain build-output line.
    pub fn stream(text: impl Into<String>) -> Self {
        Self {
            stream: Some(text.into()),
            ..Default::default()
        }
    }

    /// A status line, optionally tied to an id (a layer, a context upload).
    pub fn status(id: Option<String>, status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            id,
            ..Default::default()
        }
    }

    /// An auxiliary structured payload.
    pub fn aux(value: serde_json::Value) -> Self {
        Self {
            aux: Some(value),
            ..Default::default()
        }
    }

    /// The terminal success frame.
    pub fn image_id(id: &str) -> Self {
        Self::aux(serde_json::json!({ "ID": id }))
    }

    /// The terminal error frame.
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            error_detail: Some(JsonError {
                code: None,
                message: message.clone(),
            }),
            error: Some(message),
            ..Default::default()
        }
    }

    pub fn kind(&self) -> FrameKind {
        if let Some(detail) = &self.error_detail {
            return FrameKind::Error(detail.message.clone());
        }
        if let Some(message) = &self.error {
            return FrameKind::Error(message.clone());
        }
        if let Some(id) = self
            .aux
            .as_ref()
            .and_then(|aux| aux.get("ID"))
            .and_then(|id| id.as_str())
        {
            return FrameKind::Success(id.to_string());
        }
        FrameKind::Progress
    }

    /// Serialize as a single newline-terminated frame.
    pub fn to_frame(&self) -> Bytes {
        // Serializing this struct cannot fail: every field is a string,
        // integer or an already-valid JSON value.
        let mut buf = serde_json::to_vec(self).unwrap_or_default();
        buf.push(b'\n');
        Bytes::from(buf)
    }
}

/// Decode a buffer of concatenated JSON messages.
///
/// Messages may be separated by newlines or written back to back; both
/// appear on the wire since backends are free to write raw bytes.
pub fn decode_frames(buf: &[u8]) -> serde_json::Result<Vec<JsonMessage>> {
    serde_json::Deserializer::from_slice(buf)
        .into_iter::<JsonMessage>()
        .collect()
}
