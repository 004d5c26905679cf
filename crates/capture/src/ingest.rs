//! Shared acceptance path for gateway-style payloads.
//!
//! The transport tap, the decode tap, and an attached dispatcher all hand
//! decoded values to one pipeline, so acceptance rules (identifier present,
//! channel scoping, label resolution) live in exactly one place.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    serde_json::Value,
    tracing::{debug, info},
};

use crate::{
    message::{self, CaptureSource},
    sink::EmissionSink,
    watch::WatcherShared,
};

pub(crate) struct IngestPipeline {
    sink: Arc<EmissionSink>,
    shared: Arc<WatcherShared>,
    channel_names: HashMap<String, String>,
    verbose: bool,
    filtered: AtomicU64,
}

impl IngestPipeline {
    pub fn new(
        sink: Arc<EmissionSink>,
        shared: Arc<WatcherShared>,
        channel_names: HashMap<String, String>,
        verbose: bool,
    ) -> Self {
        Self {
            sink,
            shared,
            channel_names,
            verbose,
            filtered: AtomicU64::new(0),
        }
    }

    /// Cross-channel events dropped by the scoping filter.
    pub fn filtered(&self) -> u64 {
        self.filtered.load(Ordering::Relaxed)
    }

    /// Normalize and emit a decoded value if it is a message-creation event
    /// the operator is watching. Returns whether a record was emitted.
    pub fn accept_value(&self, value: &Value, source: CaptureSource) -> bool {
        let Some(mut msg) = message::message_from_payload(value, source) else {
            return false;
        };
        if msg.id.is_empty() {
            return false;
        }

        // Channel scoping: while the route names a channel, gateway events
        // for other channels are dropped, not surfaced. Best-effort — with
        // no parsed route key there is no filter.
        if let Some(key) = self.shared.channel_key() {
            if !msg.channel_id.is_empty() && msg.channel_id != key.channel_id {
                self.filtered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    channel = %msg.channel_id,
                    watching = %key.channel_id,
                    source = %source,
                    "dropped cross-channel event"
                );
                return false;
            }
            if msg.guild_id.is_empty() {
                msg.guild_id = key.guild_id;
            }
        }

        if msg.channel_name.is_empty() {
            if let Some(name) = self.channel_names.get(&msg.channel_id) {
                msg.channel_name = name.clone();
            }
        }
        if msg.timestamp.is_empty() {
            msg.timestamp = chrono::Utc::now().to_rfc3339();
        }

        if self.verbose {
            info!(id = %msg.id, channel = %msg.channel_id, source = %source, "captured message");
        }
        self.sink.emit(msg)
    }
}
