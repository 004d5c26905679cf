//! Payload decoding: raw transport units to candidate JSON values.
//!
//! Every failure degrades to "no payload recovered" and a counter bump;
//! nothing on this path may panic or propagate.

use std::{
    io::Read,
    sync::atomic::{AtomicU64, Ordering},
};

use {
    flate2::read::{DeflateDecoder, ZlibDecoder},
    serde::Serialize,
    serde_json::Value,
    tracing::{debug, warn},
};

use pagetap_host::TransportUnit;

/// Inflated frames are capped to keep a hostile payload from ballooning.
const MAX_INFLATED_LEN: u64 = 16 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct DecodeCounters {
    pub text_frames: AtomicU64,
    pub binary_frames: AtomicU64,
    pub blob_frames: AtomicU64,
    pub decoded: AtomicU64,
    pub decode_errors: AtomicU64,
    pub inflate_errors: AtomicU64,
}

/// Point-in-time copy of the counters for diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DecodeSnapshot {
    pub text_frames: u64,
    pub binary_frames: u64,
    pub blob_frames: u64,
    pub decoded: u64,
    pub decode_errors: u64,
    pub inflate_errors: u64,
}

impl DecodeCounters {
    #[must_use]
    pub fn snapshot(&self) -> DecodeSnapshot {
        DecodeSnapshot {
            text_frames: self.text_frames.load(Ordering::Relaxed),
            binary_frames: self.binary_frames.load(Ordering::Relaxed),
            blob_frames: self.blob_frames.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            inflate_errors: self.inflate_errors.load(Ordering::Relaxed),
        }
    }

    fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct PayloadDecoder {
    counters: DecodeCounters,
}

impl PayloadDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn counters(&self) -> &DecodeCounters {
        &self.counters
    }

    /// Decode one transport unit. `None` means no payload was recovered; the
    /// reason is visible in the counters.
    pub async fn decode(&self, unit: TransportUnit) -> Option<Value> {
        match unit {
            TransportUnit::Text(text) => {
                self.counters.bump(&self.counters.text_frames);
                self.parse_text(&text)
            },
            TransportUnit::Binary(bytes) => {
                self.counters.bump(&self.counters.binary_frames);
                self.decode_binary(&bytes)
            },
            TransportUnit::View {
                buffer,
                offset,
                len,
            } => {
                self.counters.bump(&self.counters.binary_frames);
                match offset.checked_add(len).and_then(|end| buffer.get(offset..end)) {
                    Some(slice) => self.decode_binary(slice),
                    None => {
                        self.counters.bump(&self.counters.decode_errors);
                        debug!(offset, len, buffer_len = buffer.len(), "view out of range");
                        None
                    },
                }
            },
            TransportUnit::Blob(blob) => {
                self.counters.bump(&self.counters.blob_frames);
                match blob.materialize().await {
                    Ok(bytes) => self.decode_binary(&bytes),
                    Err(error) => {
                        self.counters.bump(&self.counters.decode_errors);
                        warn!(error = %error, "blob materialization failed");
                        None
                    },
                }
            },
        }
    }

    /// Text frames get a single direct parse; there is no fallback.
    fn parse_text(&self, text: &str) -> Option<Value> {
        match serde_json::from_str(text) {
            Ok(value) => {
                self.counters.bump(&self.counters.decoded);
                Some(value)
            },
            Err(error) => {
                self.counters.bump(&self.counters.decode_errors);
                debug!(error = %error, "text frame is not json");
                None
            },
        }
    }

    fn decode_binary(&self, bytes: &[u8]) -> Option<Value> {
        // Uncompressed binary frames parse directly.
        if let Ok(text) = std::str::from_utf8(bytes) {
            if let Ok(value) = serde_json::from_str(text) {
                self.counters.bump(&self.counters.decoded);
                return Some(value);
            }
        }

        let Some(inflated) = inflate(bytes) else {
            self.counters.bump(&self.counters.inflate_errors);
            self.counters.bump(&self.counters.decode_errors);
            debug!(len = bytes.len(), "binary frame failed every decompressor");
            return None;
        };

        match std::str::from_utf8(&inflated)
            .ok()
            .and_then(|text| serde_json::from_str(text).ok())
        {
            Some(value) => {
                self.counters.bump(&self.counters.decoded);
                Some(value)
            },
            None => {
                self.counters.bump(&self.counters.decode_errors);
                debug!(inflated_len = inflated.len(), "inflated frame is not json");
                None
            },
        }
    }
}

#[derive(Clone, Copy)]
enum InflateAlgo {
    Raw,
    Zlib,
}

/// Try both deflate framings. A leading `0x78` byte suggests a zlib header,
/// so that framing goes first; the order only minimizes failed attempts.
fn inflate(bytes: &[u8]) -> Option<Vec<u8>> {
    let order = if bytes.first() == Some(&0x78) {
        [InflateAlgo::Zlib, InflateAlgo::Raw]
    } else {
        [InflateAlgo::Raw, InflateAlgo::Zlib]
    };
    order.into_iter().find_map(|algo| inflate_with(algo, bytes))
}

fn inflate_with(algo: InflateAlgo, bytes: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let result = match algo {
        InflateAlgo::Raw => DeflateDecoder::new(bytes)
            .take(MAX_INFLATED_LEN)
            .read_to_end(&mut out),
        InflateAlgo::Zlib => ZlibDecoder::new(bytes)
            .take(MAX_INFLATED_LEN)
            .read_to_end(&mut out),
    };
    match result {
        Ok(0) => None,
        Ok(_) => Some(out),
        Err(_) => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use {
        bytes::Bytes,
        flate2::{
            Compression,
            write::{DeflateEncoder, ZlibEncoder},
        },
    };

    use super::*;

    fn zlib(payload: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap()
    }

    fn deflate(payload: &[u8]) -> Vec<u8> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn test_text_frame_parses() {
        let decoder = PayloadDecoder::new();
        let value = decoder
            .decode(TransportUnit::Text(r#"{"t":"PING"}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(value["t"], "PING");
        assert_eq!(decoder.counters().snapshot().decoded, 1);
    }

    #[tokio::test]
    async fn test_text_frame_garbage_counts_error() {
        let decoder = PayloadDecoder::new();
        assert!(
            decoder
                .decode(TransportUnit::Text("not json".to_string()))
                .await
                .is_none()
        );
        let snapshot = decoder.counters().snapshot();
        assert_eq!(snapshot.decode_errors, 1);
        assert_eq!(snapshot.decoded, 0);
    }

    #[tokio::test]
    async fn test_uncompressed_binary_frame() {
        let decoder = PayloadDecoder::new();
        let value = decoder
            .decode(TransportUnit::Binary(Bytes::from_static(br#"{"ok":true}"#)))
            .await
            .unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn test_zlib_binary_frame() {
        let decoder = PayloadDecoder::new();
        let compressed = zlib(br#"{"via":"zlib"}"#);
        assert_eq!(compressed[0], 0x78);
        let value = decoder
            .decode(TransportUnit::Binary(Bytes::from(compressed)))
            .await
            .unwrap();
        assert_eq!(value["via"], "zlib");
        // The successful path must not leave a decode error behind.
        let snapshot = decoder.counters().snapshot();
        assert_eq!(snapshot.decode_errors, 0);
        assert_eq!(snapshot.inflate_errors, 0);
    }

    #[tokio::test]
    async fn test_raw_deflate_binary_frame() {
        let decoder = PayloadDecoder::new();
        let compressed = deflate(br#"{"via":"deflate"}"#);
        let value = decoder
            .decode(TransportUnit::Binary(Bytes::from(compressed)))
            .await
            .unwrap();
        assert_eq!(value["via"], "deflate");
    }

    #[tokio::test]
    async fn test_undecodable_binary_counts_inflate_error() {
        let decoder = PayloadDecoder::new();
        assert!(
            decoder
                .decode(TransportUnit::Binary(Bytes::from_static(&[
                    0xff, 0xfe, 0x01, 0x02
                ])))
                .await
                .is_none()
        );
        let snapshot = decoder.counters().snapshot();
        assert_eq!(snapshot.inflate_errors, 1);
        assert_eq!(snapshot.decode_errors, 1);
    }

    #[tokio::test]
    async fn test_view_slices_buffer() {
        let decoder = PayloadDecoder::new();
        let mut buffer = b"xxxx".to_vec();
        buffer.extend_from_slice(br#"{"view":1}"#);
        let value = decoder
            .decode(TransportUnit::View {
                buffer: Bytes::from(buffer),
                offset: 4,
                len: 10,
            })
            .await
            .unwrap();
        assert_eq!(value["view"], 1);
    }

    #[tokio::test]
    async fn test_view_out_of_range_is_error_not_panic() {
        let decoder = PayloadDecoder::new();
        assert!(
            decoder
                .decode(TransportUnit::View {
                    buffer: Bytes::from_static(b"abc"),
                    offset: 2,
                    len: 50,
                })
                .await
                .is_none()
        );
        assert_eq!(decoder.counters().snapshot().decode_errors, 1);
    }

    struct StaticBlob(Vec<u8>);

    #[async_trait::async_trait]
    impl pagetap_host::BlobLike for StaticBlob {
        async fn materialize(&self) -> anyhow::Result<Bytes> {
            Ok(Bytes::from(self.0.clone()))
        }
    }

    #[tokio::test]
    async fn test_blob_materializes_then_decodes() {
        let decoder = PayloadDecoder::new();
        let blob = StaticBlob(zlib(br#"{"blob":true}"#));
        let value = decoder
            .decode(TransportUnit::Blob(std::sync::Arc::new(blob)))
            .await
            .unwrap();
        assert_eq!(value["blob"], true);
    }
}
