//! Engine configuration. All toggles are fixed before activation.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Most recent rendered entries converted when a channel is first
    /// observed. Not a backfill — only rendered DOM is visible.
    pub snapshot_limit: usize,

    /// Emission queue capacity; overflow evicts oldest entries.
    pub queue_capacity: usize,

    /// DOM container re-validation interval.
    pub poll_interval_ms: u64,

    /// Debounce delay before re-reading a not-yet-rendered node.
    pub retry_delay_ms: u64,

    /// Extraction attempts per node before it is abandoned.
    pub max_node_attempts: u32,

    /// Dispatcher-scan tick interval.
    pub scan_interval_ms: u64,

    /// Module ids examined per tick in the strict and loose tiers.
    pub scan_batch_filtered: usize,

    /// Module ids examined per tick in the unfiltered tier; instantiating
    /// arbitrary factories is expensive, so this batch is smaller.
    pub scan_batch_all: usize,

    /// Initial scan budget in ticks; doubles on each tier escalation.
    pub scan_budget_base: u32,

    /// Hard ceiling on total scan ticks for the session.
    pub scan_budget_max: u32,

    /// Liveness sweep of weak node bookkeeping, every N poll ticks.
    pub sweep_every_ticks: u32,

    /// Per-frame diagnostic noise.
    pub verbose: bool,

    /// Attempt dispatcher discovery at all; disabled goes straight to
    /// hooks + DOM capture.
    pub dispatcher_scan: bool,

    /// Display labels for channels the page chrome does not name.
    pub channel_names: HashMap<String, String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            snapshot_limit: 50,
            queue_capacity: 500,
            poll_interval_ms: 500,
            retry_delay_ms: 250,
            max_node_attempts: 3,
            scan_interval_ms: 1_000,
            scan_batch_filtered: 200,
            scan_batch_all: 40,
            scan_budget_base: 40,
            scan_budget_max: 400,
            sweep_every_ticks: 20,
            verbose: false,
            dispatcher_scan: true,
            channel_names: HashMap::new(),
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<()> {
        if self.snapshot_limit == 0 {
            return Err(Error::invalid_config("snapshot_limit must be non-zero"));
        }
        if self.queue_capacity == 0 {
            return Err(Error::invalid_config("queue_capacity must be non-zero"));
        }
        if self.poll_interval_ms == 0 || self.scan_interval_ms == 0 || self.retry_delay_ms == 0 {
            return Err(Error::invalid_config("intervals must be non-zero"));
        }
        if self.max_node_attempts == 0 {
            return Err(Error::invalid_config("max_node_attempts must be non-zero"));
        }
        if self.scan_batch_filtered == 0 || self.scan_batch_all == 0 {
            return Err(Error::invalid_config("scan batch sizes must be non-zero"));
        }
        if self.scan_budget_base == 0 || self.scan_budget_max < self.scan_budget_base {
            return Err(Error::invalid_config(
                "scan budget must be non-zero and scan_budget_max >= scan_budget_base",
            ));
        }
        Ok(())
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub(crate) fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub(crate) fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}
