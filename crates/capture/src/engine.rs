//! The engine context: owns every component, drives activation and teardown.
//!
//! One engine instance owns one set of watcher/dedup state, so independent
//! engines can coexist in a process (and in tests). All page access goes
//! through [`HostBindings`].

use std::{
    io::Write,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    serde::Serialize,
    tokio::time::MissedTickBehavior,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use pagetap_host::{DomSurface, RegistryProvider, TransportHost};

use crate::{
    config::CaptureConfig,
    decode::{DecodeSnapshot, PayloadDecoder},
    dedup::DedupStore,
    dom::DomChannel,
    error::Result,
    gateway::GatewayHooks,
    ingest::IngestPipeline,
    scanner::{DispatcherScanner, ScanOutcome, ScannerDiag},
    sink::EmissionSink,
    watch::{WatchMode, WatcherShared},
};

/// The host-environment surfaces the engine runs against, wired up once by
/// the binding layer.
pub struct HostBindings {
    pub dom: Arc<dyn DomSurface>,
    pub transport: Arc<dyn TransportHost>,
    pub registry: Arc<dyn RegistryProvider>,
}

/// Result of an activation call; mirrors the injection status contract the
/// out-of-process supervisor consumes.
#[derive(Debug, Clone, Serialize)]
pub struct ActivationReport {
    pub ok: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub diag: Diagnostics,
}

/// Read-only engine health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub mode: String,
    pub active: bool,
    pub observer_installed: bool,
    pub timer_installed: bool,
    pub frame_tap_installed: bool,
    pub decode_tap_installed: bool,
    pub queue_len: usize,
    pub dedup_size: usize,
    pub container_reachable: bool,
    pub channel_key: Option<String>,
    pub recent_texts: Vec<String>,
    pub decode: DecodeSnapshot,
    pub filtered: u64,
    pub emitted: u64,
    pub suppressed: u64,
    pub dropped_empty: u64,
    pub scanner: ScannerDiag,
}

pub struct CaptureEngine {
    config: CaptureConfig,
    host: HostBindings,
    shared: Arc<WatcherShared>,
    dedup: Arc<DedupStore>,
    decoder: Arc<PayloadDecoder>,
    sink: Arc<EmissionSink>,
    pipeline: Arc<IngestPipeline>,
    hooks: Arc<GatewayHooks>,
    dom_channel: Arc<DomChannel>,
    scanner: Arc<DispatcherScanner>,
    cancel: Mutex<Option<CancellationToken>>,
    active: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CaptureEngine {
    /// Engine emitting to stdout, the default for a live binding.
    #[must_use]
    pub fn new(host: HostBindings, config: CaptureConfig) -> Self {
        let dedup = Arc::new(DedupStore::new(config.max_node_attempts));
        let sink = Arc::new(EmissionSink::to_stdout(
            Arc::clone(&dedup),
            config.queue_capacity,
        ));
        Self::assemble(host, config, dedup, sink)
    }

    /// Engine emitting to an injected writer; tests capture the stream.
    #[must_use]
    pub fn with_writer(
        host: HostBindings,
        config: CaptureConfig,
        writer: Box<dyn Write + Send>,
    ) -> Self {
        let dedup = Arc::new(DedupStore::new(config.max_node_attempts));
        let sink = Arc::new(EmissionSink::new(
            Arc::clone(&dedup),
            config.queue_capacity,
            writer,
        ));
        Self::assemble(host, config, dedup, sink)
    }

    fn assemble(
        host: HostBindings,
        config: CaptureConfig,
        dedup: Arc<DedupStore>,
        sink: Arc<EmissionSink>,
    ) -> Self {
        let shared = Arc::new(WatcherShared::new());
        let decoder = Arc::new(PayloadDecoder::new());
        let pipeline = Arc::new(IngestPipeline::new(
            Arc::clone(&sink),
            Arc::clone(&shared),
            config.channel_names.clone(),
            config.verbose,
        ));
        let hooks = Arc::new(GatewayHooks::new(
            Arc::clone(&decoder),
            Arc::clone(&pipeline),
        ));
        let dom_channel = Arc::new(DomChannel::new(
            Arc::clone(&host.dom),
            Arc::clone(&dedup),
            Arc::clone(&sink),
            Arc::clone(&shared),
            config.clone(),
        ));
        let scanner = Arc::new(DispatcherScanner::new(
            Arc::clone(&host.registry),
            Arc::clone(&pipeline),
            Arc::clone(&shared),
            Arc::clone(&sink),
            config.clone(),
        ));

        Self {
            config,
            host,
            shared,
            dedup,
            decoder,
            sink,
            pipeline,
            hooks,
            dom_channel,
            scanner,
            cancel: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    /// Gateway hook surface, for bindings that intercept listener
    /// registration and need the wrap/lookup map.
    #[must_use]
    pub fn hooks(&self) -> Arc<GatewayHooks> {
        Arc::clone(&self.hooks)
    }

    /// Activate the engine. Idempotent: while active with live resources it
    /// reports "already-active"; a stale resource triggers a controlled
    /// reset. Failures come back structured, never as panics leaking into
    /// the page.
    pub fn activate(&self) -> ActivationReport {
        match self.try_activate() {
            Ok(status) => ActivationReport {
                ok: true,
                status: status.to_string(),
                error: None,
                diag: self.diagnostics(),
            },
            Err(error) => ActivationReport {
                ok: false,
                status: "error".to_string(),
                error: Some(error.to_string()),
                diag: self.diagnostics(),
            },
        }
    }

    fn try_activate(&self) -> Result<&'static str> {
        self.config.validate()?;

        if self.active.load(Ordering::Relaxed) {
            if !self.resource_stale() {
                return Ok("already-active");
            }
            info!("active channel resource is stale; resetting");
            self.teardown();
            self.sink.emit_system("activation reset", true);
            self.start_tasks();
            return Ok("reset");
        }

        self.start_tasks();
        Ok("activated")
    }

    /// Deactivation is total: every task is cancelled through the root token
    /// and the observer disconnected. Installed taps stay in place, dormant —
    /// the binding-side patches are not safely reversible.
    pub fn deactivate(&self) {
        self.teardown();
        info!("engine deactivated");
    }

    #[must_use]
    pub fn diagnostics(&self) -> Diagnostics {
        let container = self.shared.container();
        let container_reachable = container.as_ref().is_some_and(|c| c.is_connected());
        let recent_texts = container
            .as_ref()
            .map(|c| self.host.dom.sample_texts(c, 5))
            .unwrap_or_default();

        Diagnostics {
            mode: self.shared.mode().label().to_string(),
            active: self.active.load(Ordering::Relaxed),
            observer_installed: self.shared.observer_installed(),
            timer_installed: self.shared.timer_active(),
            frame_tap_installed: self.hooks.frame_tap_installed(),
            decode_tap_installed: self.hooks.decode_tap_installed(),
            queue_len: self.sink.queue_len(),
            dedup_size: self.dedup.seen_len(),
            container_reachable,
            channel_key: self.shared.channel_key().map(|key| key.key()),
            recent_texts,
            decode: self.decoder.counters().snapshot(),
            filtered: self.pipeline.filtered(),
            emitted: self.sink.emitted(),
            suppressed: self.sink.suppressed(),
            dropped_empty: self.sink.dropped_empty(),
            scanner: self.scanner.diag(),
        }
    }

    /// A DOM-driven engine whose container vanished is stale; searching and
    /// dispatcher modes self-heal and are not.
    fn resource_stale(&self) -> bool {
        match self.shared.mode() {
            WatchMode::Observing => {
                let container_ok = self
                    .shared
                    .container()
                    .is_some_and(|container| container.is_connected());
                !(container_ok && self.shared.observer_installed())
            },
            _ => false,
        }
    }

    fn start_tasks(&self) {
        let cancel = CancellationToken::new();
        *lock(&self.cancel) = Some(cancel.clone());

        // Gateway taps go in unconditionally; each installs independently
        // and a failure leaves DOM capture as the baseline.
        let report = self.hooks.install(self.host.transport.as_ref());
        if !report.errors.is_empty() {
            warn!(errors = report.errors.len(), "some taps failed to install");
        }
        self.hooks.start_worker(cancel.child_token());

        if self.config.dispatcher_scan && !self.scanner.gave_up() {
            self.shared.set_mode(WatchMode::WaitingDispatcher);
            self.spawn_discovery(cancel.child_token());
        } else {
            self.shared.set_mode(WatchMode::Hooks);
            Arc::clone(&self.dom_channel).spawn(cancel.child_token());
        }

        self.active.store(true, Ordering::Relaxed);
    }

    /// Drive scan ticks until attach or exhaustion; exhaustion falls back to
    /// DOM capture under the same cancellation root.
    fn spawn_discovery(&self, cancel: CancellationToken) {
        let scanner = Arc::clone(&self.scanner);
        let dom_channel = Arc::clone(&self.dom_channel);
        let interval = self.config.scan_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => match scanner.tick() {
                        ScanOutcome::Pending => {},
                        ScanOutcome::Attached => break,
                        ScanOutcome::Exhausted => {
                            Arc::clone(&dom_channel).spawn(cancel.clone());
                            break;
                        },
                    },
                }
            }
        });
    }

    fn teardown(&self) {
        if let Some(cancel) = lock(&self.cancel).take() {
            cancel.cancel();
        }
        self.hooks.stop_worker();
        self.shared.disconnect_observer();
        self.shared.set_timer_active(false);
        self.shared.set_container(None);
        self.shared.set_mode(WatchMode::Inactive);
        self.active.store(false, Ordering::Relaxed);
    }
}
