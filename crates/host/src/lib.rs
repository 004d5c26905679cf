//! Host-binding seams for the pagetap capture engine.
//!
//! The engine never touches a live page directly. A binding layer (a
//! remote-debugging bridge, an embedded webview shim, or the in-memory fakes
//! used in tests) implements these traits once at startup; the core logic in
//! `pagetap-capture` depends only on the interfaces.

pub mod dom;
pub mod registry;
pub mod transport;

pub use {
    dom::{AuthorHint, DomNode, DomSurface, NodeHandle, ObserverGuard},
    registry::{
        BusCapability, BusHandler, ModuleExports, ModuleId, ModuleRegistry, NoopRegistryProvider,
        RegistryProvider,
    },
    transport::{AppListener, BlobLike, DecodeTap, FrameTap, TransportHost, TransportUnit},
};
