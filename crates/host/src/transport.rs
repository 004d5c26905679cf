//! Transport-layer seams: raw socket frames and the JSON-decode path.

use std::{fmt, sync::Arc};

use {async_trait::async_trait, bytes::Bytes};

/// One raw unit observed on the host application's gateway socket.
///
/// Mirrors the four shapes a socket payload arrives in: UTF-8 text, a binary
/// buffer, a typed view over a larger buffer, and a blob that must be
/// materialized asynchronously before it can be read.
#[derive(Clone)]
pub enum TransportUnit {
    Text(String),
    Binary(Bytes),
    View {
        buffer: Bytes,
        offset: usize,
        len: usize,
    },
    Blob(Arc<dyn BlobLike>),
}

impl TransportUnit {
    /// Short label for logging and counters.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::View { .. } => "view",
            Self::Blob(_) => "blob",
        }
    }
}

impl fmt::Debug for TransportUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(&text.len()).finish(),
            Self::Binary(bytes) => f.debug_tuple("Binary").field(&bytes.len()).finish(),
            Self::View { offset, len, .. } => f
                .debug_struct("View")
                .field("offset", offset)
                .field("len", len)
                .finish(),
            Self::Blob(_) => f.write_str("Blob"),
        }
    }
}

/// A blob-like payload that has to be pulled into memory asynchronously.
#[async_trait]
pub trait BlobLike: Send + Sync {
    async fn materialize(&self) -> anyhow::Result<Bytes>;
}

/// Engine-side tap invoked by the binding for every inbound socket frame.
pub trait FrameTap: Send + Sync {
    fn on_frame(&self, unit: TransportUnit);
}

/// Engine-side tap invoked by the binding for every value the page decodes
/// through its global JSON-decode primitive.
pub trait DecodeTap: Send + Sync {
    fn on_decoded(&self, value: &serde_json::Value);
}

/// The binding's transport surface. Both installers must be idempotent from
/// the binding's point of view; the engine additionally guards against
/// re-installation on its own side.
pub trait TransportHost: Send + Sync {
    fn install_frame_tap(&self, tap: Arc<dyn FrameTap>) -> anyhow::Result<()>;
    fn install_decode_tap(&self, tap: Arc<dyn DecodeTap>) -> anyhow::Result<()>;
}

/// A listener the host application registered on its socket, as seen through
/// the binding. Identity is stable for the lifetime of the page so wrapping
/// can be referentially transparent.
pub trait AppListener: Send + Sync {
    fn listener_id(&self) -> u64;
    fn invoke(&self, unit: &TransportUnit);
}
