//! DOM capture channel: container polling, snapshots, and live insertions.
//!
//! The channel is a small state machine — searching until a message-list
//! container is found, observing while it stays attached, re-searching when
//! the page replaces it. A fixed-interval tick re-validates the container
//! and detects navigation through the route-derived channel key.

use std::sync::Arc;

use {
    tokio::{
        sync::mpsc::{self, UnboundedSender},
        task::JoinHandle,
        time::MissedTickBehavior,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use pagetap_host::{DomSurface, NodeHandle};

use crate::{
    config::CaptureConfig,
    dedup::DedupStore,
    message::{CaptureSource, CapturedMessage, ChannelKey, resolve_channel_label},
    sink::EmissionSink,
    watch::{WatchMode, WatcherShared},
};

/// Attribute prefix carried by message-content elements.
const CONTENT_ID_PREFIX: &str = "message-content-";

pub(crate) struct DomChannel {
    dom: Arc<dyn DomSurface>,
    dedup: Arc<DedupStore>,
    sink: Arc<EmissionSink>,
    shared: Arc<WatcherShared>,
    config: CaptureConfig,
}

impl DomChannel {
    pub fn new(
        dom: Arc<dyn DomSurface>,
        dedup: Arc<DedupStore>,
        sink: Arc<EmissionSink>,
        shared: Arc<WatcherShared>,
        config: CaptureConfig,
    ) -> Self {
        Self {
            dom,
            dedup,
            sink,
            shared,
            config,
        }
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let (insert_tx, mut insert_rx) = mpsc::unbounded_channel::<NodeHandle>();
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<NodeHandle>();

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.shared.set_timer_active(true);
        if self.shared.mode() != WatchMode::Observing {
            self.shared.set_mode(WatchMode::Searching);
        }

        let mut ticks: u32 = 0;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll(&insert_tx, &retry_tx, &cancel);
                    ticks = ticks.wrapping_add(1);
                    if self.config.sweep_every_ticks > 0
                        && ticks % self.config.sweep_every_ticks == 0
                    {
                        self.dedup.sweep();
                    }
                },
                Some(subtree) = insert_rx.recv() => {
                    for element in self.dom.message_elements(&subtree) {
                        self.handle_element(element, &retry_tx, &cancel);
                    }
                },
                Some(element) = retry_rx.recv() => {
                    self.handle_element(element, &retry_tx, &cancel);
                },
            }
        }

        self.shared.set_timer_active(false);
        self.shared.disconnect_observer();
    }

    /// One re-validation tick: keep the container and observer live, track
    /// navigation, snapshot freshly opened channels.
    fn poll(
        &self,
        insert_tx: &UnboundedSender<NodeHandle>,
        retry_tx: &UnboundedSender<NodeHandle>,
        cancel: &CancellationToken,
    ) {
        // Track navigation first so snapshots and conversions see the key
        // for the channel actually on screen.
        let new_key = ChannelKey::from_path(&self.dom.location_path());
        let key_changed = new_key != self.shared.channel_key();
        if key_changed {
            self.shared.set_channel_key(new_key.clone());
            if let Some(key) = &new_key {
                let label =
                    resolve_channel_label(&self.config.channel_names, "", &key.channel_id);
                info!(channel = %key.key(), label = %label, "channel switch");
                self.sink.emit_system(format!("watching: {label}"), false);
            }
        }

        let (container, just_snapshotted) = self.ensure_container(insert_tx, retry_tx, cancel);
        if key_changed && !just_snapshotted {
            if let Some(container) = &container {
                self.snapshot(container, retry_tx, cancel);
            }
        }
    }

    /// Re-validate the observed container, re-searching when it was detached
    /// or replaced. Returns the live container, if any, and whether attaching
    /// it already snapshotted the rendered history.
    fn ensure_container(
        &self,
        insert_tx: &UnboundedSender<NodeHandle>,
        retry_tx: &UnboundedSender<NodeHandle>,
        cancel: &CancellationToken,
    ) -> (Option<NodeHandle>, bool) {
        let current = self.shared.container();
        let current_ok = current.as_ref().is_some_and(|c| c.is_connected());
        if current_ok && self.shared.observer_installed() {
            return (current, false);
        }

        if self.shared.mode() == WatchMode::Observing {
            debug!("message container lost; re-searching");
            self.sink.emit_system("message container lost; re-searching", false);
        }
        self.shared.set_mode(WatchMode::Searching);
        self.shared.disconnect_observer();
        self.shared.set_container(None);

        let Some(container) = self.dom.find_message_container() else {
            return (None, false);
        };
        match self.dom.observe_insertions(&container, insert_tx.clone()) {
            Ok(guard) => {
                self.shared.install_observer(guard);
                self.shared.set_container(Some(Arc::clone(&container)));
                self.shared.set_mode(WatchMode::Observing);
                info!(container = container.node_id(), "observer attached");
                self.sink.emit_system("observer attached", false);
                self.snapshot(&container, retry_tx, cancel);
                (Some(container), true)
            },
            Err(error) => {
                warn!(error = %error, "failed to attach insertion observer");
                (None, false)
            },
        }
    }

    /// Convert the most recent rendered entries so a freshly observed channel
    /// yields immediate history. Bounded; not a backfill.
    fn snapshot(
        &self,
        container: &NodeHandle,
        retry_tx: &UnboundedSender<NodeHandle>,
        cancel: &CancellationToken,
    ) {
        let entries = self
            .dom
            .recent_messages(container, self.config.snapshot_limit);
        debug!(entries = entries.len(), "snapshot");
        for entry in entries {
            for element in self.dom.message_elements(&entry) {
                self.handle_element(element, retry_tx, cancel);
            }
        }
    }

    /// Convert one content element, rescheduling nodes whose text has not
    /// rendered yet (rich content lags insertion) up to the attempt cap.
    fn handle_element(
        &self,
        element: NodeHandle,
        retry_tx: &UnboundedSender<NodeHandle>,
        cancel: &CancellationToken,
    ) {
        if self.dedup.is_node_handled(&element) || self.dedup.attempts_exhausted(&element) {
            return;
        }

        match self.convert(&element) {
            Some(message) => {
                if self.config.verbose {
                    info!(id = %message.id, node = element.node_id(), "dom message converted");
                }
                self.dedup.mark_node_handled(&element);
                self.sink.emit(message);
            },
            None => {
                let attempts = self.dedup.record_attempt(&element);
                if attempts >= self.config.max_node_attempts {
                    debug!(node = element.node_id(), attempts, "node abandoned");
                    return;
                }
                let retry_tx = retry_tx.clone();
                let cancel = cancel.clone();
                let delay = self.config.retry_delay();
                tokio::spawn(async move {
                    tokio::select! {
                        () = cancel.cancelled() => {},
                        () = tokio::time::sleep(delay) => {
                            let _ = retry_tx.send(element);
                        },
                    }
                });
            },
        }
    }

    /// Node → message conversion. `None` means the node has no rendered text
    /// yet and should be retried.
    fn convert(&self, element: &NodeHandle) -> Option<CapturedMessage> {
        let text = element.text_content();
        let content = text.trim();
        if content.is_empty() {
            return None;
        }

        let hint = self.dom.author_hint(element);
        let (guild_id, channel_id) = self
            .shared
            .channel_key()
            .map(|key| (key.guild_id, key.channel_id))
            .unwrap_or_default();
        let channel_name = self
            .config
            .channel_names
            .get(&channel_id)
            .cloned()
            .unwrap_or_default();

        Some(CapturedMessage {
            id: self.extract_message_id(element),
            content: content.to_string(),
            author: hint.name.unwrap_or_default(),
            author_id: hint.id.unwrap_or_default(),
            channel_id,
            channel_name,
            guild_id,
            mention_everyone: false,
            mentions: Vec::new(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            source: CaptureSource::Dom,
        })
    }

    /// Stable message id from the content element's own id attribute, or
    /// synthesized from the enclosing list-item id suffix. Empty when neither
    /// yields one; such nodes de-duplicate by identity only.
    fn extract_message_id(&self, element: &NodeHandle) -> String {
        if let Some(attr) = element.attribute("id") {
            if let Some(id) = attr.strip_prefix(CONTENT_ID_PREFIX) {
                if !id.is_empty() {
                    return id.to_string();
                }
            }
        }
        if let Some(item_id) = self.dom.enclosing_item_id(element) {
            if let Some(suffix) = item_id.rsplit('-').next() {
                if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                    return suffix.to_string();
                }
            }
        }
        String::new()
    }
}
