//! Dispatcher discovery: find the host application's event bus inside its
//! module registry and subscribe directly.
//!
//! Scanning is incremental — a fixed-size batch of module ids per tick —
//! under three escalating strictness tiers. The tier only ever widens within
//! a session; a registry-size change (freshly loaded code) restarts the scan
//! from strict with a cleared tried-set.

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    serde::Serialize,
    tracing::{debug, info},
};

use pagetap_host::{
    BusCapability, BusHandler, ModuleExports, ModuleId, ModuleRegistry, RegistryProvider,
};

use crate::{
    config::CaptureConfig,
    ingest::IngestPipeline,
    message::CaptureSource,
    sink::EmissionSink,
    watch::{WatchMode, WatcherShared},
};

/// The event type the bus distributes for message creation.
const MESSAGE_CREATE_EVENT: &str = "MESSAGE_CREATE";

/// Strict tier: dispatch co-located with one of these in the factory source.
const STRICT_COMPANIONS: &[&str] = &["subscribe", "register", "waitFor"];

/// Loose tier: any one of the wider bus vocabulary.
const LOOSE_VOCAB: &[&str] = &[
    "dispatch",
    "subscribe",
    "register",
    "waitFor",
    "emitter",
    "addChangeListener",
    "actionLogger",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanTier {
    Strict,
    Loose,
    All,
}

impl ScanTier {
    fn next(self) -> Option<Self> {
        match self {
            Self::Strict => Some(Self::Loose),
            Self::Loose => Some(Self::All),
            Self::All => None,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Loose => "loose",
            Self::All => "all",
        }
    }
}

/// Scan state persisted across ticks.
struct ScanState {
    tier: ScanTier,
    candidates: Vec<ModuleId>,
    candidates_built: bool,
    cursor: usize,
    tried: HashSet<ModuleId>,
    warm_pass_done: bool,
    last_count: usize,
    ticks_spent: u32,
    budget: u32,
}

impl ScanState {
    fn new(budget: u32) -> Self {
        Self {
            tier: ScanTier::Strict,
            candidates: Vec::new(),
            candidates_built: false,
            cursor: 0,
            tried: HashSet::new(),
            warm_pass_done: false,
            last_count: 0,
            ticks_spent: 0,
            budget,
        }
    }

    /// Restart from strict with a clean slate; spent ticks are kept so the
    /// session budget still bounds total work.
    fn restart(&mut self) {
        self.tier = ScanTier::Strict;
        self.candidates.clear();
        self.candidates_built = false;
        self.cursor = 0;
        self.tried.clear();
        self.warm_pass_done = false;
    }
}

/// Outcome of one scan tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanOutcome {
    Attached,
    Exhausted,
    Pending,
}

/// Read-only scanner state for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ScannerDiag {
    pub tier: ScanTier,
    pub cursor: usize,
    pub candidates: usize,
    pub tried: usize,
    pub ticks_spent: u32,
    pub budget: u32,
    pub attached: bool,
    pub gave_up: bool,
}

pub(crate) struct DispatcherScanner {
    provider: Arc<dyn RegistryProvider>,
    pipeline: Arc<IngestPipeline>,
    shared: Arc<WatcherShared>,
    sink: Arc<EmissionSink>,
    config: CaptureConfig,
    state: Mutex<ScanState>,
    registry: Mutex<Option<Arc<dyn ModuleRegistry>>>,
    attached: AtomicBool,
    gave_up: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DispatcherScanner {
    pub fn new(
        provider: Arc<dyn RegistryProvider>,
        pipeline: Arc<IngestPipeline>,
        shared: Arc<WatcherShared>,
        sink: Arc<EmissionSink>,
        config: CaptureConfig,
    ) -> Self {
        let budget = config.scan_budget_base;
        Self {
            provider,
            pipeline,
            shared,
            sink,
            config,
            state: Mutex::new(ScanState::new(budget)),
            registry: Mutex::new(None),
            attached: AtomicBool::new(false),
            gave_up: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn attached(&self) -> bool {
        self.attached.load(Ordering::Relaxed)
    }

    /// Giving up is permanent for the session; later activations go straight
    /// to DOM capture.
    #[must_use]
    pub fn gave_up(&self) -> bool {
        self.gave_up.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn diag(&self) -> ScannerDiag {
        let state = lock(&self.state);
        ScannerDiag {
            tier: state.tier,
            cursor: state.cursor,
            candidates: state.candidates.len(),
            tried: state.tried.len(),
            ticks_spent: state.ticks_spent,
            budget: state.budget,
            attached: self.attached(),
            gave_up: self.gave_up(),
        }
    }

    /// One bounded scan step. Never iterates the whole registry in one pass.
    pub fn tick(&self) -> ScanOutcome {
        if self.attached() {
            return ScanOutcome::Attached;
        }
        if self.gave_up() {
            return ScanOutcome::Exhausted;
        }

        let mut state = lock(&self.state);
        state.ticks_spent = state.ticks_spent.saturating_add(1);
        if state.ticks_spent > self.config.scan_budget_max {
            drop(state);
            self.give_up("scan budget exhausted");
            return ScanOutcome::Exhausted;
        }

        let Some(registry) = self.acquire_registry() else {
            if state.ticks_spent >= state.budget {
                drop(state);
                self.give_up("module registry unreachable");
                return ScanOutcome::Exhausted;
            }
            return ScanOutcome::Pending;
        };

        // Freshly loaded code invalidates candidate lists.
        let count = registry.module_count();
        if state.last_count != 0 && count != state.last_count {
            debug!(
                previous = state.last_count,
                current = count,
                "module registry changed; rescanning from strict"
            );
            state.restart();
        }
        state.last_count = count;

        // Cheap pass over already-instantiated modules before touching
        // factories at all.
        if !state.warm_pass_done {
            let batch = self.config.scan_batch_filtered;
            let pending: Vec<ModuleId> = registry
                .instantiated_ids()
                .into_iter()
                .filter(|id| !state.tried.contains(id))
                .take(batch)
                .collect();
            if pending.is_empty() {
                state.warm_pass_done = true;
            } else {
                for id in pending {
                    state.tried.insert(id.clone());
                    if self.try_candidate(registry.as_ref(), &id) {
                        return ScanOutcome::Attached;
                    }
                }
                return ScanOutcome::Pending;
            }
        }

        if !state.candidates_built {
            let candidates = build_candidates(registry.as_ref(), state.tier, &state.tried);
            state.candidates = candidates;
            state.candidates_built = true;
            state.cursor = 0;
            debug!(
                tier = state.tier.label(),
                candidates = state.candidates.len(),
                "candidate list built"
            );
        }

        let batch = match state.tier {
            ScanTier::All => self.config.scan_batch_all,
            _ => self.config.scan_batch_filtered,
        };
        let end = (state.cursor + batch).min(state.candidates.len());
        let ids: Vec<ModuleId> = state.candidates[state.cursor..end].to_vec();
        state.cursor = end;

        for id in ids {
            if !state.tried.insert(id.clone()) {
                continue;
            }
            if self.try_candidate(registry.as_ref(), &id) {
                return ScanOutcome::Attached;
            }
        }

        if state.cursor >= state.candidates.len() {
            match state.tier.next() {
                Some(next) => {
                    info!(tier = next.label(), "dispatcher scan tier widened");
                    state.tier = next;
                    state.candidates.clear();
                    state.candidates_built = false;
                    state.cursor = 0;
                    state.tried.clear();
                    state.budget = state
                        .budget
                        .saturating_mul(2)
                        .min(self.config.scan_budget_max);
                },
                None => {
                    drop(state);
                    self.give_up("all tiers scanned without a dispatcher");
                    return ScanOutcome::Exhausted;
                },
            }
        }

        ScanOutcome::Pending
    }

    fn acquire_registry(&self) -> Option<Arc<dyn ModuleRegistry>> {
        let mut registry = lock(&self.registry);
        if registry.is_none() {
            *registry = self.provider.direct().or_else(|| self.provider.probe());
        }
        registry.clone()
    }

    /// Instantiate and classify one candidate; attach on the first usable
    /// bus. Capability resolution happens once, here, never per event.
    fn try_candidate(&self, registry: &dyn ModuleRegistry, id: &str) -> bool {
        let Some(exports) = registry.instantiate(id) else {
            return false;
        };
        let capability = classify(exports.as_ref());
        if capability == BusCapability::None {
            return false;
        }

        let handler = self.event_handler();
        let attached = match capability {
            BusCapability::Subscribable => exports.subscribe(MESSAGE_CREATE_EVENT, handler),
            BusCapability::Registrable => exports.register(handler),
            BusCapability::DispatchOnly => exports.intercept_dispatch(handler),
            BusCapability::None => false,
        };
        if !attached {
            debug!(module = %id, capability = capability.label(), "candidate refused attach");
            return false;
        }

        self.attached.store(true, Ordering::Relaxed);
        self.shared.set_mode(WatchMode::AttachedDispatcher);
        info!(module = %id, capability = capability.label(), "dispatcher attached");
        self.sink.emit_system(
            format!("dispatcher attached ({})", capability.label()),
            true,
        );
        true
    }

    /// The uniform handler given to every attach path. Register and
    /// dispatch-intercept surfaces deliver every event, so the handler
    /// filters by type itself.
    fn event_handler(&self) -> BusHandler {
        let pipeline = Arc::clone(&self.pipeline);
        let handler = move |event_type: &str, payload: &serde_json::Value| {
            if event_type == MESSAGE_CREATE_EVENT {
                pipeline.accept_value(payload, CaptureSource::Dispatcher);
            }
        };
        Arc::new(handler)
    }

    fn give_up(&self, reason: &str) {
        if self.gave_up.swap(true, Ordering::Relaxed) {
            return;
        }
        info!(reason, "dispatcher discovery exhausted; falling back to dom capture");
        self.sink.emit_system(
            format!("dispatcher discovery exhausted ({reason}); falling back to dom capture"),
            true,
        );
    }
}

/// Resolve a candidate's capability as a tagged variant, once.
fn classify(exports: &dyn ModuleExports) -> BusCapability {
    if !exports.has_capability("dispatch") {
        return BusCapability::None;
    }
    if exports.has_capability("subscribe") {
        BusCapability::Subscribable
    } else if exports.has_capability("register") {
        BusCapability::Registrable
    } else {
        BusCapability::DispatchOnly
    }
}

fn build_candidates(
    registry: &dyn ModuleRegistry,
    tier: ScanTier,
    tried: &HashSet<ModuleId>,
) -> Vec<ModuleId> {
    registry
        .all_ids()
        .into_iter()
        .filter(|id| !tried.contains(id))
        .filter(|id| match tier {
            ScanTier::All => true,
            filtered => {
                let Some(source) = registry.factory_source(id) else {
                    return false;
                };
                match filtered {
                    ScanTier::Strict => {
                        source.contains("dispatch")
                            && STRICT_COMPANIONS.iter().any(|needle| source.contains(needle))
                    },
                    _ => LOOSE_VOCAB.iter().any(|needle| source.contains(needle)),
                }
            },
        })
        .collect()
}
