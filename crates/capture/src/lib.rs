//! In-page chat-message capture engine.
//!
//! Captures message-creation events from a live single-page application
//! through redundant, self-healing channels — DOM observation, transport
//! frame taps, the page's JSON-decode path, and (when discoverable) the
//! application's own internal dispatcher — then re-emits them as one
//! normalized, de-duplicated line stream.
//!
//! The engine is host-agnostic: all page access goes through the trait seams
//! in `pagetap-host`, wired up once by a binding layer.

pub mod config;
pub mod decode;
pub mod dedup;
pub mod dom;
pub mod engine;
pub mod error;
pub mod gateway;
mod ingest;
pub mod message;
pub mod scanner;
pub mod sink;
pub mod watch;

pub use {
    config::CaptureConfig,
    engine::{ActivationReport, CaptureEngine, Diagnostics, HostBindings},
    error::{Error, Result},
    message::{CaptureSource, CapturedMessage, ChannelKey},
    sink::{EmissionSink, SystemRecord},
    watch::WatchMode,
};
