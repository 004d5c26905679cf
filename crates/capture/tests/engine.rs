#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end engine tests over in-memory fake hosts: every capture channel,
//! dedup across channels, activation idempotence, and discovery fallback.

use std::{
    collections::HashMap,
    io::Write,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use {
    bytes::Bytes,
    serde_json::Value,
    tokio::sync::mpsc::UnboundedSender,
};

use {
    pagetap_capture::{CaptureConfig, CaptureEngine, HostBindings},
    pagetap_host::{
        AuthorHint, BusHandler, DecodeTap, DomNode, DomSurface, FrameTap, ModuleExports, ModuleId,
        ModuleRegistry, NodeHandle, NoopRegistryProvider, ObserverGuard, RegistryProvider,
        TransportHost, TransportUnit,
    },
};

// ── Fake DOM ────────────────────────────────────────────────────────────────

struct FakeNode {
    id: u64,
    attrs: Mutex<HashMap<String, String>>,
    text: Mutex<String>,
    connected: AtomicBool,
    children: Mutex<Vec<Arc<FakeNode>>>,
    text_reads: AtomicU32,
}

impl FakeNode {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            attrs: Mutex::new(HashMap::new()),
            text: Mutex::new(String::new()),
            connected: AtomicBool::new(true),
            children: Mutex::new(Vec::new()),
            text_reads: AtomicU32::new(0),
        })
    }

    fn set_attr(&self, name: &str, value: &str) {
        self.attrs
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
    }

    fn set_text(&self, text: &str) {
        *self.text.lock().unwrap() = text.to_string();
    }

    fn detach(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    fn is_content(&self) -> bool {
        let attrs = self.attrs.lock().unwrap();
        attrs
            .get("id")
            .is_some_and(|id| id.starts_with("message-content-"))
            || attrs.get("class").is_some_and(|c| c.contains("messageContent"))
    }
}

impl DomNode for FakeNode {
    fn node_id(&self) -> u64 {
        self.id
    }

    fn attribute(&self, name: &str) -> Option<String> {
        self.attrs.lock().unwrap().get(name).cloned()
    }

    fn text_content(&self) -> String {
        self.text_reads.fetch_add(1, Ordering::Relaxed);
        self.text.lock().unwrap().clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

struct FakeObserver {
    connected: Arc<AtomicBool>,
}

impl ObserverGuard for FakeObserver {
    fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct FakeDom {
    path: Mutex<String>,
    container: Mutex<Option<Arc<FakeNode>>>,
    nodes: Mutex<HashMap<u64, Arc<FakeNode>>>,
    observer: Mutex<Option<(UnboundedSender<NodeHandle>, Arc<AtomicBool>)>>,
    observe_calls: AtomicU32,
}

impl FakeDom {
    fn make_node(&self, id: u64) -> Arc<FakeNode> {
        let node = FakeNode::new(id);
        self.nodes.lock().unwrap().insert(id, Arc::clone(&node));
        node
    }

    fn set_path(&self, path: &str) {
        *self.path.lock().unwrap() = path.to_string();
    }

    fn set_container(&self, container: Arc<FakeNode>) {
        *self.container.lock().unwrap() = Some(container);
    }

    /// Append a subtree under the container and notify the live observer,
    /// the way a mutation observer would.
    fn insert(&self, subtree: Arc<FakeNode>) {
        if let Some(container) = self.container.lock().unwrap().as_ref() {
            container.children.lock().unwrap().push(Arc::clone(&subtree));
        }
        let observer = self.observer.lock().unwrap();
        if let Some((tx, connected)) = observer.as_ref() {
            if connected.load(Ordering::Relaxed) {
                let _ = tx.send(subtree as NodeHandle);
            }
        }
    }

    fn resolve(&self, handle: &NodeHandle) -> Option<Arc<FakeNode>> {
        self.nodes.lock().unwrap().get(&handle.node_id()).cloned()
    }

    fn collect_content(node: &Arc<FakeNode>, out: &mut Vec<NodeHandle>) {
        if node.is_content() {
            out.push(Arc::clone(node) as NodeHandle);
        }
        for child in node.children.lock().unwrap().iter() {
            Self::collect_content(child, out);
        }
    }
}

impl DomSurface for FakeDom {
    fn location_path(&self) -> String {
        self.path.lock().unwrap().clone()
    }

    fn find_message_container(&self) -> Option<NodeHandle> {
        self.container
            .lock()
            .unwrap()
            .as_ref()
            .filter(|c| c.is_connected())
            .map(|c| Arc::clone(c) as NodeHandle)
    }

    fn recent_messages(&self, container: &NodeHandle, limit: usize) -> Vec<NodeHandle> {
        let Some(container) = self.resolve(container) else {
            return Vec::new();
        };
        let children = container.children.lock().unwrap();
        let skip = children.len().saturating_sub(limit);
        children
            .iter()
            .skip(skip)
            .map(|c| Arc::clone(c) as NodeHandle)
            .collect()
    }

    fn message_elements(&self, subtree: &NodeHandle) -> Vec<NodeHandle> {
        let mut out = Vec::new();
        if let Some(node) = self.resolve(subtree) {
            Self::collect_content(&node, &mut out);
        }
        out
    }

    fn enclosing_item_id(&self, element: &NodeHandle) -> Option<String> {
        element.attribute("data-item-id")
    }

    fn author_hint(&self, element: &NodeHandle) -> AuthorHint {
        AuthorHint {
            name: element.attribute("data-author"),
            id: element.attribute("data-author-id"),
        }
    }

    fn sample_texts(&self, container: &NodeHandle, limit: usize) -> Vec<String> {
        self.recent_messages(container, limit)
            .iter()
            .map(|node| node.text_content())
            .filter(|text| !text.is_empty())
            .collect()
    }

    fn observe_insertions(
        &self,
        _container: &NodeHandle,
        inserted: UnboundedSender<NodeHandle>,
    ) -> anyhow::Result<Box<dyn ObserverGuard>> {
        self.observe_calls.fetch_add(1, Ordering::Relaxed);
        let connected = Arc::new(AtomicBool::new(true));
        *self.observer.lock().unwrap() = Some((inserted, Arc::clone(&connected)));
        Ok(Box::new(FakeObserver { connected }))
    }
}

// ── Fake transport ──────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeTransport {
    frame_tap: Mutex<Option<Arc<dyn FrameTap>>>,
    decode_tap: Mutex<Option<Arc<dyn DecodeTap>>>,
}

impl FakeTransport {
    fn feed_frame(&self, unit: TransportUnit) {
        if let Some(tap) = self.frame_tap.lock().unwrap().as_ref() {
            tap.on_frame(unit);
        }
    }

    fn feed_decoded(&self, value: &Value) {
        if let Some(tap) = self.decode_tap.lock().unwrap().as_ref() {
            tap.on_decoded(value);
        }
    }
}

impl TransportHost for FakeTransport {
    fn install_frame_tap(&self, tap: Arc<dyn FrameTap>) -> anyhow::Result<()> {
        *self.frame_tap.lock().unwrap() = Some(tap);
        Ok(())
    }

    fn install_decode_tap(&self, tap: Arc<dyn DecodeTap>) -> anyhow::Result<()> {
        *self.decode_tap.lock().unwrap() = Some(tap);
        Ok(())
    }
}

// ── Fake module registry ────────────────────────────────────────────────────

struct FakeBus {
    handlers: Mutex<Vec<(Option<String>, BusHandler)>>,
}

impl FakeBus {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: Mutex::new(Vec::new()),
        })
    }

    fn dispatch(&self, event_type: &str, payload: &Value) {
        for (filter, handler) in self.handlers.lock().unwrap().iter() {
            if filter.as_deref().is_none_or(|f| f == event_type) {
                handler.as_ref()(event_type, payload);
            }
        }
    }
}

impl ModuleExports for FakeBus {
    fn has_capability(&self, name: &str) -> bool {
        matches!(name, "dispatch" | "subscribe")
    }

    fn subscribe(&self, event_type: &str, handler: BusHandler) -> bool {
        self.handlers
            .lock()
            .unwrap()
            .push((Some(event_type.to_string()), handler));
        true
    }

    fn register(&self, _handler: BusHandler) -> bool {
        false
    }

    fn intercept_dispatch(&self, _handler: BusHandler) -> bool {
        false
    }
}

struct BusRegistry {
    bus: Arc<FakeBus>,
}

impl ModuleRegistry for BusRegistry {
    fn module_count(&self) -> usize {
        3
    }

    fn instantiated_ids(&self) -> Vec<ModuleId> {
        Vec::new()
    }

    fn all_ids(&self) -> Vec<ModuleId> {
        vec!["10".to_string(), "11".to_string(), "12".to_string()]
    }

    fn factory_source(&self, id: &str) -> Option<String> {
        match id {
            "11" => Some("e.dispatch=..., e.subscribe=..., e.waitFor=...".to_string()),
            _ => Some("function(){ return 0 }".to_string()),
        }
    }

    fn instantiate(&self, id: &str) -> Option<Arc<dyn ModuleExports>> {
        (id == "11").then(|| Arc::clone(&self.bus) as Arc<dyn ModuleExports>)
    }
}

struct BusProvider(Arc<BusRegistry>);

impl RegistryProvider for BusProvider {
    fn direct(&self) -> Option<Arc<dyn ModuleRegistry>> {
        Some(Arc::clone(&self.0) as Arc<dyn ModuleRegistry>)
    }

    fn probe(&self) -> Option<Arc<dyn ModuleRegistry>> {
        None
    }
}

// ── Stream capture and helpers ──────────────────────────────────────────────

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    fn records(&self) -> Vec<Value> {
        let raw = self.0.lock().unwrap().clone();
        String::from_utf8(raw)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn messages(&self) -> Vec<Value> {
        self.records()
            .into_iter()
            .filter(|record| record.get("system").is_none())
            .collect()
    }

    fn system_records(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|record| record.get("system").is_some())
            .filter_map(|record| record["content"].as_str().map(str::to_string))
            .collect()
    }
}

async fn wait_until(deadline_ms: u64, predicate: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(deadline_ms);
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn fast_config() -> CaptureConfig {
    CaptureConfig {
        poll_interval_ms: 10,
        retry_delay_ms: 20,
        scan_interval_ms: 5,
        sweep_every_ticks: 5,
        dispatcher_scan: false,
        ..CaptureConfig::default()
    }
}

struct Rig {
    dom: Arc<FakeDom>,
    transport: Arc<FakeTransport>,
    engine: CaptureEngine,
    buf: SharedBuf,
    container: Arc<FakeNode>,
}

/// Fake page on `/channels/g1/c1` with an empty message container.
fn rig_with(config: CaptureConfig, registry: Arc<dyn RegistryProvider>) -> Rig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let dom = Arc::new(FakeDom::default());
    dom.set_path("/channels/g1/c1");
    let container = dom.make_node(1);
    dom.set_container(Arc::clone(&container));

    let transport = Arc::new(FakeTransport::default());
    let buf = SharedBuf::default();
    let engine = CaptureEngine::with_writer(
        HostBindings {
            dom: Arc::clone(&dom) as Arc<dyn DomSurface>,
            transport: Arc::clone(&transport) as Arc<dyn TransportHost>,
            registry,
        },
        config,
        Box::new(buf.clone()),
    );

    Rig {
        dom,
        transport,
        engine,
        buf,
        container,
    }
}

fn rig() -> Rig {
    rig_with(fast_config(), Arc::new(NoopRegistryProvider))
}

fn content_node(dom: &FakeDom, node_id: u64, message_id: &str, text: &str) -> Arc<FakeNode> {
    let node = dom.make_node(node_id);
    node.set_attr("id", &format!("message-content-{message_id}"));
    node.set_attr("data-author", "alice");
    node.set_attr("data-author-id", "u42");
    node.set_text(text);
    node
}

fn ws_frame(id: &str, content: &str, channel: &str) -> String {
    serde_json::json!({
        "t": "MESSAGE_CREATE",
        "s": 1,
        "op": 0,
        "d": {
            "id": id,
            "content": content,
            "channel_id": channel,
            "author": {"username": "bob", "id": "u1"}
        }
    })
    .to_string()
}

// ── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn transport_frame_emits_once_and_dom_duplicate_is_suppressed() {
    let rig = rig();
    let report = rig.engine.activate();
    assert!(report.ok);
    assert_eq!(report.status, "activated");

    assert!(wait_until(2_000, || rig.engine.diagnostics().mode == "observing").await);

    rig.transport.feed_frame(TransportUnit::Text(ws_frame(
        "123456789012345678",
        "hi",
        "c1",
    )));
    assert!(wait_until(2_000, || rig.buf.messages().len() == 1).await);

    let messages = rig.buf.messages();
    assert_eq!(messages[0]["id"], "123456789012345678");
    assert_eq!(messages[0]["content"], "hi");
    assert_eq!(messages[0]["author"], "bob");
    assert_eq!(messages[0]["source"], "ws");

    // The same message rendering in the DOM later must not re-emit.
    let node = content_node(&rig.dom, 50, "123456789012345678", "hi");
    rig.dom.insert(node);
    assert!(wait_until(2_000, || rig.engine.diagnostics().suppressed >= 1).await);
    assert_eq!(rig.buf.messages().len(), 1);
}

#[tokio::test]
async fn dom_insertion_emits_with_extracted_identifier() {
    let rig = rig();
    assert!(rig.engine.activate().ok);
    assert!(wait_until(2_000, || rig.engine.diagnostics().mode == "observing").await);

    let node = content_node(&rig.dom, 60, "987654321098765432", "hello world");
    rig.dom.insert(node);

    assert!(wait_until(2_000, || !rig.buf.messages().is_empty()).await);
    let messages = rig.buf.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["id"], "987654321098765432");
    assert_eq!(messages[0]["content"], "hello world");
    assert_eq!(messages[0]["author"], "alice");
    assert_eq!(messages[0]["author_id"], "u42");
    assert_eq!(messages[0]["channel_id"], "c1");
    assert_eq!(messages[0]["guild_id"], "g1");
    assert_eq!(messages[0]["source"], "dom");
}

#[tokio::test]
async fn compressed_binary_frame_emits_without_decode_error() {
    use flate2::{Compression, write::ZlibEncoder};

    let rig = rig();
    assert!(rig.engine.activate().ok);

    let payload = ws_frame("42", "compressed hello", "c1");
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload.as_bytes()).unwrap();
    let compressed = encoder.finish().unwrap();

    rig.transport
        .feed_frame(TransportUnit::Binary(Bytes::from(compressed)));

    assert!(wait_until(2_000, || rig.buf.messages().len() == 1).await);
    let diag = rig.engine.diagnostics();
    assert_eq!(diag.decode.decode_errors, 0);
    assert_eq!(diag.decode.inflate_errors, 0);
    assert_eq!(rig.buf.messages()[0]["content"], "compressed hello");
}

#[tokio::test]
async fn second_activation_reports_already_active_without_second_observer() {
    let rig = rig();
    assert_eq!(rig.engine.activate().status, "activated");
    assert!(wait_until(2_000, || rig.engine.diagnostics().mode == "observing").await);

    let report = rig.engine.activate();
    assert!(report.ok);
    assert_eq!(report.status, "already-active");
    assert_eq!(rig.dom.observe_calls.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn stale_container_triggers_controlled_reset() {
    // A poll interval far beyond the test horizon: the first tick attaches
    // the observer, after which only activation itself re-validates, so the
    // stale-resource path is what heals the engine here.
    let mut config = fast_config();
    config.poll_interval_ms = 60_000;
    let rig = rig_with(config, Arc::new(NoopRegistryProvider));
    assert!(rig.engine.activate().ok);
    assert!(wait_until(2_000, || rig.engine.diagnostics().mode == "observing").await);

    // The page tears the container out and renders a fresh one.
    rig.container.detach();
    let fresh = rig.dom.make_node(2);
    rig.dom.set_container(Arc::clone(&fresh));

    let report = rig.engine.activate();
    assert!(report.ok);
    assert_eq!(report.status, "reset");
    assert!(wait_until(2_000, || {
        let diag = rig.engine.diagnostics();
        diag.mode == "observing" && diag.container_reachable
    })
    .await);
    assert!(rig.dom.observe_calls.load(Ordering::Relaxed) >= 2);
}

#[tokio::test]
async fn decode_tap_catches_messages_bypassing_the_socket() {
    let rig = rig();
    assert!(rig.engine.activate().ok);
    assert!(wait_until(2_000, || rig.engine.diagnostics().mode == "observing").await);

    let value: Value = serde_json::json!({
        "id": "555",
        "channel_id": "c1",
        "content": "parsed elsewhere",
        "author": {"username": "carol", "id": "u3"}
    });
    rig.transport.feed_decoded(&value);

    assert!(wait_until(2_000, || rig.buf.messages().len() == 1).await);
    assert_eq!(rig.buf.messages()[0]["source"], "json");
}

#[tokio::test]
async fn cross_channel_gateway_events_are_dropped() {
    let rig = rig();
    assert!(rig.engine.activate().ok);
    assert!(wait_until(2_000, || rig.engine.diagnostics().mode == "observing").await);
    assert!(wait_until(2_000, || {
        rig.engine.diagnostics().channel_key.as_deref() == Some("g1:c1")
    })
    .await);

    rig.transport
        .feed_frame(TransportUnit::Text(ws_frame("7", "other room", "c9")));
    assert!(wait_until(2_000, || rig.engine.diagnostics().filtered == 1).await);
    assert!(rig.buf.messages().is_empty());

    rig.transport
        .feed_frame(TransportUnit::Text(ws_frame("8", "this room", "c1")));
    assert!(wait_until(2_000, || rig.buf.messages().len() == 1).await);
}

#[tokio::test]
async fn unrendered_node_is_retried_then_abandoned() {
    let rig = rig();
    assert!(rig.engine.activate().ok);
    assert!(wait_until(2_000, || rig.engine.diagnostics().mode == "observing").await);

    let node = content_node(&rig.dom, 70, "111", "");
    rig.dom.insert(Arc::clone(&node));

    // Three attempts (initial + two debounced retries), then abandonment.
    assert!(wait_until(2_000, || node.text_reads.load(Ordering::Relaxed) == 3).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(node.text_reads.load(Ordering::Relaxed), 3);
    assert!(rig.buf.messages().is_empty());

    // Text arriving after abandonment stays unemitted.
    node.set_text("too late");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rig.buf.messages().is_empty());
}

#[tokio::test]
async fn node_rendering_before_the_cap_is_emitted() {
    let rig = rig();
    assert!(rig.engine.activate().ok);
    assert!(wait_until(2_000, || rig.engine.diagnostics().mode == "observing").await);

    let node = content_node(&rig.dom, 71, "222", "");
    rig.dom.insert(Arc::clone(&node));
    assert!(wait_until(2_000, || node.text_reads.load(Ordering::Relaxed) >= 1).await);
    node.set_text("late embed");

    assert!(wait_until(2_000, || rig.buf.messages().len() == 1).await);
    assert_eq!(rig.buf.messages()[0]["content"], "late embed");
}

#[tokio::test]
async fn idless_nodes_deduplicate_by_node_identity() {
    let rig = rig();
    assert!(rig.engine.activate().ok);
    assert!(wait_until(2_000, || rig.engine.diagnostics().mode == "observing").await);

    let node = rig.dom.make_node(80);
    node.set_attr("class", "messageContent");
    node.set_text("no identifier here");
    rig.dom.insert(Arc::clone(&node));

    assert!(wait_until(2_000, || rig.buf.messages().len() == 1).await);
    // Delivering the same node again (e.g. via a snapshot overlap) is a no-op.
    rig.dom.insert(node);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.buf.messages().len(), 1);
}

#[tokio::test]
async fn snapshot_converts_rendered_history_on_attach() {
    let rig = rig();
    // Render history before activation.
    for i in 0..3 {
        let node = content_node(&rig.dom, 90 + i, &format!("90{i}"), &format!("old {i}"));
        rig.container.children.lock().unwrap().push(node);
    }

    assert!(rig.engine.activate().ok);
    assert!(wait_until(2_000, || rig.buf.messages().len() == 3).await);
    assert!(
        rig.buf
            .system_records()
            .iter()
            .any(|content| content == "observer attached")
    );
}

#[tokio::test]
async fn channel_switch_emits_watching_record_and_resnapshots() {
    let mut config = fast_config();
    config
        .channel_names
        .insert("c2".to_string(), "general".to_string());
    let rig = rig_with(config, Arc::new(NoopRegistryProvider));

    assert!(rig.engine.activate().ok);
    assert!(wait_until(2_000, || rig.engine.diagnostics().mode == "observing").await);

    rig.dom.set_path("/channels/g1/c2");
    assert!(wait_until(2_000, || {
        rig.buf
            .system_records()
            .iter()
            .any(|content| content == "watching: general")
    })
    .await);
    assert!(wait_until(2_000, || {
        rig.engine.diagnostics().channel_key.as_deref() == Some("g1:c2")
    })
    .await);
}

#[tokio::test]
async fn dispatcher_discovery_attaches_and_wins_over_gateway() {
    let bus = FakeBus::new();
    let registry = Arc::new(BusRegistry {
        bus: Arc::clone(&bus),
    });
    let mut config = fast_config();
    config.dispatcher_scan = true;
    let rig = rig_with(config, Arc::new(BusProvider(registry)));

    assert!(rig.engine.activate().ok);
    assert!(
        wait_until(2_000, || {
            rig.engine.diagnostics().mode == "attached-dispatcher"
        })
        .await
    );

    bus.dispatch(
        "MESSAGE_CREATE",
        &serde_json::json!({
            "type": "MESSAGE_CREATE",
            "channelId": "c1",
            "message": {
                "id": "31337",
                "content": "straight from the bus",
                "channel_id": "c1",
                "author": {"username": "dora", "id": "u7"}
            }
        }),
    );
    assert!(wait_until(2_000, || rig.buf.messages().len() == 1).await);
    assert_eq!(rig.buf.messages()[0]["source"], "dispatcher");

    // The gateway tap stays installed as a hot standby; its copy of the
    // same message is suppressed by the shared dedup store.
    rig.transport
        .feed_frame(TransportUnit::Text(ws_frame("31337", "straight from the bus", "c1")));
    assert!(wait_until(2_000, || rig.engine.diagnostics().suppressed >= 1).await);
    assert_eq!(rig.buf.messages().len(), 1);
}

#[tokio::test]
async fn exhausted_discovery_falls_back_to_dom_capture() {
    let mut config = fast_config();
    config.dispatcher_scan = true;
    config.scan_budget_base = 2;
    let rig = rig_with(config, Arc::new(NoopRegistryProvider));

    assert!(rig.engine.activate().ok);
    assert_eq!(rig.engine.diagnostics().mode, "waiting-dispatcher");

    assert!(wait_until(2_000, || rig.engine.diagnostics().mode == "observing").await);
    assert!(
        rig.buf
            .system_records()
            .iter()
            .any(|content| content.contains("dispatcher discovery exhausted"))
    );

    // DOM capture works after the fallback.
    let node = content_node(&rig.dom, 95, "777", "after fallback");
    rig.dom.insert(node);
    assert!(wait_until(2_000, || rig.buf.messages().len() == 1).await);
}

#[tokio::test]
async fn deactivation_cancels_tasks_and_leaves_taps_dormant() {
    let rig = rig();
    assert!(rig.engine.activate().ok);
    assert!(wait_until(2_000, || rig.engine.diagnostics().mode == "observing").await);

    rig.engine.deactivate();
    let diag = rig.engine.diagnostics();
    assert_eq!(diag.mode, "inactive");
    assert!(!diag.active);
    assert!(!diag.observer_installed);
    // Taps stay installed but dormant: feeding traffic emits nothing.
    assert!(diag.frame_tap_installed);
    rig.transport
        .feed_frame(TransportUnit::Text(ws_frame("1", "ghost", "c1")));
    rig.transport.feed_decoded(&serde_json::json!({
        "id": "2", "channel_id": "c1", "content": "ghost"
    }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rig.buf.messages().is_empty());

    // Reactivation brings the channels back.
    assert_eq!(rig.engine.activate().status, "activated");
    assert!(wait_until(2_000, || rig.engine.diagnostics().mode == "observing").await);
}
