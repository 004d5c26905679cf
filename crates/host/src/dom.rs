//! DOM seams: node handles, the message-list surface, and insertion observers.

use std::sync::Arc;

use tokio::sync::mpsc;

/// Handle to a rendered DOM node.
///
/// The binding owns the node; the engine holds handles only transiently and
/// stores [`std::sync::Weak`] references for bookkeeping, so engine state
/// never keeps a detached node alive.
pub trait DomNode: Send + Sync {
    /// Identity stable for the lifetime of the node.
    fn node_id(&self) -> u64;

    fn attribute(&self, name: &str) -> Option<String>;

    /// Rendered text of the node and its subtree.
    fn text_content(&self) -> String;

    /// Whether the node is still attached to the document.
    fn is_connected(&self) -> bool;
}

pub type NodeHandle = Arc<dyn DomNode>;

/// Best-effort author extraction near a message-content element (nearby
/// attributes, profile links, avatar alt text — whatever the page offers).
#[derive(Debug, Clone, Default)]
pub struct AuthorHint {
    pub name: Option<String>,
    pub id: Option<String>,
}

/// Guard for an attached insertion observer.
pub trait ObserverGuard: Send + Sync {
    fn disconnect(&self);

    /// False once disconnected or once the observed container is gone.
    fn is_connected(&self) -> bool;
}

/// The page surface the DOM capture channel runs against.
pub trait DomSurface: Send + Sync {
    /// Current location path, e.g. `/channels/<guild>/<channel>`.
    fn location_path(&self) -> String;

    /// Locate the message-list container, if one is currently rendered.
    fn find_message_container(&self) -> Option<NodeHandle>;

    /// The most recent `limit` message entries rendered in the container,
    /// oldest first.
    fn recent_messages(&self, container: &NodeHandle, limit: usize) -> Vec<NodeHandle>;

    /// Message-content elements inside an inserted subtree (including the
    /// subtree root itself when it matches).
    fn message_elements(&self, subtree: &NodeHandle) -> Vec<NodeHandle>;

    /// Identifier of the list item enclosing a content element, if any.
    fn enclosing_item_id(&self, element: &NodeHandle) -> Option<String>;

    fn author_hint(&self, element: &NodeHandle) -> AuthorHint;

    /// Rendered text of the most recent messages, for diagnostics.
    fn sample_texts(&self, container: &NodeHandle, limit: usize) -> Vec<String>;

    /// Attach a subtree-insertion observer on the container. Inserted subtree
    /// roots are delivered on `inserted` until the guard is disconnected.
    fn observe_insertions(
        &self,
        container: &NodeHandle,
        inserted: mpsc::UnboundedSender<NodeHandle>,
    ) -> anyhow::Result<Box<dyn ObserverGuard>>;
}
