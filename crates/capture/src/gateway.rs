//! Gateway capture channel: transport frame tap and JSON-decode tap.
//!
//! Both taps are passive, idempotent, and installed unconditionally at
//! activation. Once installed they are never uninstalled — deactivation only
//! makes them dormant — because the binding-side patches are process-wide
//! and not safely reversible.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use {
    tokio::{sync::mpsc, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use pagetap_host::{AppListener, DecodeTap, FrameTap, TransportHost, TransportUnit};

use crate::{decode::PayloadDecoder, ingest::IngestPipeline, message::CaptureSource};

/// Outcome of a tap installation pass.
#[derive(Debug, Default)]
pub struct TapReport {
    pub frame_tap: bool,
    pub decode_tap: bool,
    pub errors: Vec<String>,
}

pub struct GatewayHooks {
    decoder: Arc<PayloadDecoder>,
    pipeline: Arc<IngestPipeline>,
    frame_tap_installed: AtomicBool,
    decode_tap_installed: AtomicBool,
    dormant: AtomicBool,
    frames: Mutex<Option<mpsc::UnboundedSender<TransportUnit>>>,
    wrapped: Mutex<HashMap<u64, Arc<WrappedListener>>>,
    next_wrapper_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl GatewayHooks {
    pub(crate) fn new(decoder: Arc<PayloadDecoder>, pipeline: Arc<IngestPipeline>) -> Self {
        Self {
            decoder,
            pipeline,
            frame_tap_installed: AtomicBool::new(false),
            decode_tap_installed: AtomicBool::new(false),
            dormant: AtomicBool::new(true),
            frames: Mutex::new(None),
            wrapped: Mutex::new(HashMap::new()),
            next_wrapper_id: AtomicU64::new(1),
        }
    }

    /// Install both taps. Each installs independently; a failure is reported
    /// and retried on the next activation, never fatal. Re-installation of an
    /// already-installed tap is a no-op.
    pub fn install(self: &Arc<Self>, host: &dyn TransportHost) -> TapReport {
        let mut report = TapReport::default();

        if !self.frame_tap_installed.load(Ordering::Relaxed) {
            match host.install_frame_tap(Arc::clone(self) as Arc<dyn FrameTap>) {
                Ok(()) => self.frame_tap_installed.store(true, Ordering::Relaxed),
                Err(error) => {
                    warn!(error = %error, "frame tap installation failed");
                    report.errors.push(format!("frame tap: {error}"));
                },
            }
        }
        if !self.decode_tap_installed.load(Ordering::Relaxed) {
            match host.install_decode_tap(Arc::clone(self) as Arc<dyn DecodeTap>) {
                Ok(()) => self.decode_tap_installed.store(true, Ordering::Relaxed),
                Err(error) => {
                    warn!(error = %error, "decode tap installation failed");
                    report.errors.push(format!("decode tap: {error}"));
                },
            }
        }

        report.frame_tap = self.frame_tap_installed.load(Ordering::Relaxed);
        report.decode_tap = self.decode_tap_installed.load(Ordering::Relaxed);
        report
    }

    #[must_use]
    pub fn frame_tap_installed(&self) -> bool {
        self.frame_tap_installed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn decode_tap_installed(&self) -> bool {
        self.decode_tap_installed.load(Ordering::Relaxed)
    }

    /// Start the frame worker: mirrored frames are decoded off the tap
    /// callback and fed to the shared acceptance path.
    pub(crate) fn start_worker(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<TransportUnit>();
        *lock(&self.frames) = Some(tx);
        self.dormant.store(false, Ordering::Relaxed);

        let hooks = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    unit = rx.recv() => {
                        let Some(unit) = unit else { break };
                        if let Some(value) = hooks.decoder.decode(unit).await {
                            hooks.pipeline.accept_value(&value, CaptureSource::Ws);
                        }
                    }
                }
            }
        })
    }

    /// Go dormant: mirrored frames and decoded values are ignored until the
    /// next activation. The binding-side taps stay in place.
    pub(crate) fn stop_worker(&self) {
        self.dormant.store(true, Ordering::Relaxed);
        lock(&self.frames).take();
    }

    /// Wrap a listener the host application is registering. Referentially
    /// transparent: the same original always maps to the same wrapper, and a
    /// wrapper passed back in is returned unchanged, never double-wrapped.
    pub fn wrap_listener(self: &Arc<Self>, listener: Arc<dyn AppListener>) -> Arc<dyn AppListener> {
        let id = listener.listener_id();
        let mut wrapped = lock(&self.wrapped);

        if wrapped.values().any(|wrapper| wrapper.id == id) {
            return listener;
        }
        if let Some(wrapper) = wrapped.get(&id) {
            return Arc::clone(wrapper) as Arc<dyn AppListener>;
        }

        let wrapper = Arc::new(WrappedListener {
            id: WRAPPER_ID_BIT | self.next_wrapper_id.fetch_add(1, Ordering::Relaxed),
            inner: listener,
            hooks: Arc::downgrade(self),
        });
        wrapped.insert(id, Arc::clone(&wrapper));
        wrapper
    }

    /// The wrapper previously handed out for an original listener, so the
    /// binding can honor the host application's remove-listener calls.
    #[must_use]
    pub fn wrapped_for(&self, listener_id: u64) -> Option<Arc<dyn AppListener>> {
        lock(&self.wrapped)
            .get(&listener_id)
            .map(|wrapper| Arc::clone(wrapper) as Arc<dyn AppListener>)
    }

    fn mirror(&self, unit: TransportUnit) {
        if let Some(tx) = lock(&self.frames).as_ref() {
            if tx.send(unit).is_err() {
                debug!("frame worker gone; dropping mirrored frame");
            }
        }
    }
}

impl FrameTap for GatewayHooks {
    fn on_frame(&self, unit: TransportUnit) {
        self.mirror(unit);
    }
}

impl DecodeTap for GatewayHooks {
    fn on_decoded(&self, value: &serde_json::Value) {
        if self.dormant.load(Ordering::Relaxed) {
            return;
        }
        self.pipeline.accept_value(value, CaptureSource::Json);
    }
}

/// Wrapper ids live in their own namespace so they can never collide with
/// ids the binding assigns to the host application's listeners.
const WRAPPER_ID_BIT: u64 = 1 << 63;

struct WrappedListener {
    id: u64,
    inner: Arc<dyn AppListener>,
    hooks: Weak<GatewayHooks>,
}

impl AppListener for WrappedListener {
    fn listener_id(&self) -> u64 {
        self.id
    }

    fn invoke(&self, unit: &TransportUnit) {
        if let Some(hooks) = self.hooks.upgrade() {
            hooks.mirror(unit.clone());
        }
        self.inner.invoke(unit);
    }
}
