//! Watcher state: the per-engine singleton describing the active channel.

use std::{
    fmt,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    pagetap_host::{NodeHandle, ObserverGuard},
    serde::Serialize,
};

use crate::message::ChannelKey;

/// Which capture channel currently drives the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatchMode {
    /// Engine not activated, or deactivated.
    Inactive,
    /// Gateway taps installed; DOM capture starting, discovery skipped.
    Hooks,
    /// Gateway taps installed; dispatcher discovery in progress.
    WaitingDispatcher,
    /// DOM capture active but no valid message container located yet.
    Searching,
    /// DOM capture observing a live container.
    Observing,
    /// Subscribed directly to the application's dispatcher.
    AttachedDispatcher,
}

impl WatchMode {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Hooks => "hooks",
            Self::WaitingDispatcher => "waiting-dispatcher",
            Self::Searching => "searching",
            Self::Observing => "observing",
            Self::AttachedDispatcher => "attached-dispatcher",
        }
    }
}

impl fmt::Display for WatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Shared watcher state. Lock scopes are short and never held across awaits.
pub struct WatcherShared {
    mode: Mutex<WatchMode>,
    channel_key: Mutex<Option<ChannelKey>>,
    container: Mutex<Option<NodeHandle>>,
    observer: Mutex<Option<Box<dyn ObserverGuard>>>,
    timer_active: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for WatcherShared {
    fn default() -> Self {
        Self::new()
    }
}

impl WatcherShared {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(WatchMode::Inactive),
            channel_key: Mutex::new(None),
            container: Mutex::new(None),
            observer: Mutex::new(None),
            timer_active: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn mode(&self) -> WatchMode {
        *lock(&self.mode)
    }

    pub fn set_mode(&self, mode: WatchMode) {
        *lock(&self.mode) = mode;
    }

    #[must_use]
    pub fn channel_key(&self) -> Option<ChannelKey> {
        lock(&self.channel_key).clone()
    }

    pub fn set_channel_key(&self, key: Option<ChannelKey>) {
        *lock(&self.channel_key) = key;
    }

    #[must_use]
    pub fn container(&self) -> Option<NodeHandle> {
        lock(&self.container).clone()
    }

    pub fn set_container(&self, container: Option<NodeHandle>) {
        *lock(&self.container) = container;
    }

    /// Whether a live insertion observer is attached.
    #[must_use]
    pub fn observer_installed(&self) -> bool {
        lock(&self.observer)
            .as_ref()
            .is_some_and(|guard| guard.is_connected())
    }

    /// Replace the observer, disconnecting any previous one.
    pub fn install_observer(&self, guard: Box<dyn ObserverGuard>) {
        let mut slot = lock(&self.observer);
        if let Some(previous) = slot.take() {
            previous.disconnect();
        }
        *slot = Some(guard);
    }

    pub fn disconnect_observer(&self) {
        if let Some(guard) = lock(&self.observer).take() {
            guard.disconnect();
        }
    }

    #[must_use]
    pub fn timer_active(&self) -> bool {
        self.timer_active.load(Ordering::Relaxed)
    }

    pub fn set_timer_active(&self, active: bool) {
        self.timer_active.store(active, Ordering::Relaxed);
    }
}
