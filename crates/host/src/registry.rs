//! Module-registry seams used by dispatcher discovery.
//!
//! The host application's bundler keeps a runtime table of lazily
//! instantiated modules. The scanner only ever sees it through these traits:
//! enumerate ids, peek at factory source text, instantiate, and probe the
//! resulting exports for event-bus capabilities.

use std::sync::Arc;

/// Module identifiers are opaque; bundlers use both numeric and string ids.
pub type ModuleId = String;

/// Registry acquisition strategies, tried in order by the scanner.
pub trait RegistryProvider: Send + Sync {
    /// A directly exposed registry accessor, when the page has one.
    fn direct(&self) -> Option<Arc<dyn ModuleRegistry>>;

    /// Coerce the accessor into existence via a harmless probe against a
    /// known bundle-chunk array.
    fn probe(&self) -> Option<Arc<dyn ModuleRegistry>>;
}

/// Provider for hosts without a reachable module registry; discovery then
/// exhausts immediately and the engine falls back to DOM capture.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRegistryProvider;

impl RegistryProvider for NoopRegistryProvider {
    fn direct(&self) -> Option<Arc<dyn ModuleRegistry>> {
        None
    }

    fn probe(&self) -> Option<Arc<dyn ModuleRegistry>> {
        None
    }
}

pub trait ModuleRegistry: Send + Sync {
    /// Total number of known module factories. Growth signals freshly loaded
    /// code and triggers a re-scan.
    fn module_count(&self) -> usize;

    /// Ids of modules that are already instantiated (cheap to inspect).
    fn instantiated_ids(&self) -> Vec<ModuleId>;

    /// Every known module id, instantiated or not.
    fn all_ids(&self) -> Vec<ModuleId>;

    /// Source text of the module factory, for candidate filtering.
    fn factory_source(&self, id: &str) -> Option<String>;

    /// Instantiate the module and expose its exports, if that succeeds.
    fn instantiate(&self, id: &str) -> Option<Arc<dyn ModuleExports>>;
}

/// Handler invoked by an attached bus with `(event_type, payload)`.
pub type BusHandler = Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>;

/// Duck-typed exports of an instantiated module. All probes are fallible and
/// side-effect free until one of the attach methods returns true.
pub trait ModuleExports: Send + Sync {
    /// Whether the exports expose a capability by name
    /// (`dispatch`, `subscribe`, `register`, `waitFor`).
    fn has_capability(&self, name: &str) -> bool;

    /// Subscribe the handler to one event type. Returns false when the
    /// exports have no usable subscribe surface.
    fn subscribe(&self, event_type: &str, handler: BusHandler) -> bool;

    /// Register a catch-all handler receiving every event.
    fn register(&self, handler: BusHandler) -> bool;

    /// Intercept the bare dispatch entry point, for candidates exposing
    /// nothing but `dispatch`.
    fn intercept_dispatch(&self, handler: BusHandler) -> bool;
}

/// What a scanned candidate turned out to support, resolved exactly once at
/// discovery time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusCapability {
    /// Exposes `dispatch` plus a per-event-type subscribe surface.
    Subscribable,
    /// Exposes `dispatch` plus a catch-all register surface.
    Registrable,
    /// Exposes only `dispatch`; usable by intercepting it.
    DispatchOnly,
    /// Not a bus.
    None,
}

impl BusCapability {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Subscribable => "subscribe",
            Self::Registrable => "register",
            Self::DispatchOnly => "dispatch-only",
            Self::None => "none",
        }
    }
}
