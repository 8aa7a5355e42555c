//! Request correlation and event dispatch.
//!
//! Routes each decoded node to at most one pending request waiter (matched
//! on the node's `id` attribute) and to any number of pattern listeners,
//! synchronously and in registration order. Unmatched nodes are
//! diagnostic-only, never an error.
//!
//! Correlation ids are a per-connection 2-character random prefix plus a
//! monotonically increasing counter: unique within the connection lifetime
//! with no cross-connection coordination.

use crate::core::node::Node;
use crate::error::{ClientError, Result};
use crate::utils::crypto::random_bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Composite listener match key.
///
/// A listener fires when the node produces this key as one of its match
/// candidates; `None` fields are wildcards. The key is a structured tuple
/// compared field-wise, so attribute values containing arbitrary characters
/// cannot collide with other keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerKey {
    /// Node tag, always required.
    pub tag: String,
    /// Attribute key to match, if any.
    pub attr_key: Option<String>,
    /// Attribute value to match; requires `attr_key`.
    pub attr_value: Option<String>,
    /// First-child tag to match, if any.
    pub first_child: Option<String>,
}

impl ListenerKey {
    /// Match every node with the given tag.
    pub fn tag(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attr_key: None,
            attr_value: None,
            first_child: None,
        }
    }

    /// Match on tag plus the presence of an attribute key.
    pub fn attr(tag: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            attr_key: Some(key.into()),
            ..Self::tag(tag)
        }
    }

    /// Match on tag plus an exact attribute key/value pair.
    pub fn attr_value(
        tag: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            attr_key: Some(key.into()),
            attr_value: Some(value.into()),
            ..Self::tag(tag)
        }
    }

    /// Match on tag plus the first child's tag.
    pub fn child(tag: impl Into<String>, first_child: impl Into<String>) -> Self {
        Self {
            first_child: Some(first_child.into()),
            ..Self::tag(tag)
        }
    }

    /// Narrow any key to additionally require a first-child tag.
    pub fn with_child(mut self, first_child: impl Into<String>) -> Self {
        self.first_child = Some(first_child.into());
        self
    }

    /// All keys this node can be delivered under.
    fn candidates(node: &Node) -> Vec<ListenerKey> {
        let tag = node.tag.clone();
        let first_child = node.first_child_tag().map(str::to_string);

        let mut keys = Vec::with_capacity(node.attrs.len() * 3 + 2);
        for (key, value) in &node.attrs {
            keys.push(ListenerKey {
                tag: tag.clone(),
                attr_key: Some(key.clone()),
                attr_value: Some(value.clone()),
                first_child: first_child.clone(),
            });
            keys.push(ListenerKey::attr_value(tag.clone(), key.clone(), value.clone()));
            keys.push(ListenerKey::attr(tag.clone(), key.clone()));
        }
        if let Some(child) = &first_child {
            keys.push(ListenerKey::child(tag.clone(), child.clone()));
        }
        keys.push(ListenerKey::tag(tag));
        keys
    }
}

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback = Arc<dyn Fn(&Node) + Send + Sync>;

struct ListenerEntry {
    id: ListenerId,
    key: ListenerKey,
    callback: Callback,
}

/// Per-connection correlation and dispatch state.
pub struct Dispatcher {
    waiters: Mutex<HashMap<String, oneshot::Sender<Node>>>,
    listeners: RwLock<Vec<ListenerEntry>>,
    next_listener_id: AtomicU64,
    tag_prefix: String,
    epoch: AtomicU64,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Fresh dispatch state for one connection.
    pub fn new() -> Self {
        let prefix = random_bytes::<1>();
        Self {
            waiters: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            tag_prefix: format!("{:02x}-", prefix[0]),
            epoch: AtomicU64::new(0),
        }
    }

    /// Next correlation id, unique within this connection.
    pub fn next_tag(&self) -> String {
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", self.tag_prefix, epoch)
    }

    /// Register a one-shot waiter for the node whose `id` attribute equals
    /// `id`. The waiter is removed on first resolution or teardown.
    pub fn register_waiter(&self, id: &str) -> oneshot::Receiver<Node> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        waiters.insert(id.to_string(), tx);
        rx
    }

    /// Drop the waiter for `id`, if still pending (query timed out locally).
    pub fn forget_waiter(&self, id: &str) {
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        waiters.remove(id);
    }

    /// Register a pattern listener. Listeners fire synchronously on the
    /// receive path, in registration order.
    pub fn listen<F>(&self, key: ListenerKey, callback: F) -> ListenerId
    where
        F: Fn(&Node) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.push(ListenerEntry {
            id,
            key,
            callback: Arc::new(callback),
        });
        id
    }

    /// Remove a listener; returns whether it was still registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }

    /// Deliver a decoded node: one waiter delivery (by correlation id) plus
    /// every matching listener, in registration order.
    ///
    /// Returns whether anything consumed the node.
    pub fn dispatch(&self, node: &Node) -> bool {
        let mut handled = false;

        if let Some(id) = node.id() {
            let waiter = {
                let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
                waiters.remove(id)
            };
            if let Some(tx) = waiter {
                // receiver may have timed out locally; a late response is
                // dropped, not an error
                if tx.send(node.clone()).is_err() {
                    debug!(id, "late response for timed-out query dropped");
                } else {
                    handled = true;
                }
            }
        }

        let candidates = ListenerKey::candidates(node);
        // snapshot the matches so callbacks can listen/remove_listener
        // without re-entering the lock
        let matches: Vec<Callback> = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            listeners
                .iter()
                .filter(|entry| candidates.contains(&entry.key))
                .map(|entry| Arc::clone(&entry.callback))
                .collect()
        };
        for callback in &matches {
            callback(node);
            handled = true;
        }

        if !handled {
            trace!(tag = %node.tag, id = ?node.id(), "unhandled node");
        }
        handled
    }

    /// Reject every outstanding waiter; called once on teardown. Receivers
    /// observe the drop as `ConnectionClosed`.
    pub fn reject_all_waiters(&self) {
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        let count = waiters.len();
        waiters.clear();
        if count > 0 {
            debug!(count, "rejected outstanding request waiters on teardown");
        }
    }

    /// Await a waiter, mapping a dropped sender to `ConnectionClosed`.
    pub async fn await_response(rx: oneshot::Receiver<Node>) -> Result<Node> {
        rx.await.map_err(|_| ClientError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn ping_node() -> Node {
        Node::new("iq")
            .attr("id", "q-7")
            .attr("type", "get")
            .children(vec![Node::new("ping")])
    }

    #[tokio::test]
    async fn waiter_resolves_on_matching_id_only() {
        let dispatcher = Dispatcher::new();
        let rx = dispatcher.register_waiter("q-7");

        dispatcher.dispatch(&Node::new("iq").attr("id", "other"));
        dispatcher.dispatch(&ping_node());

        let node = Dispatcher::await_response(rx).await.unwrap();
        assert_eq!(node.id(), Some("q-7"));
    }

    #[tokio::test]
    async fn concurrent_waiters_never_cross_resolve() {
        let dispatcher = Dispatcher::new();
        let rx_a = dispatcher.register_waiter("a");
        let rx_b = dispatcher.register_waiter("b");

        dispatcher.dispatch(&Node::new("iq").attr("id", "b").attr("which", "b"));
        dispatcher.dispatch(&Node::new("iq").attr("id", "a").attr("which", "a"));

        assert_eq!(
            Dispatcher::await_response(rx_a).await.unwrap().get_attr("which"),
            Some("a")
        );
        assert_eq!(
            Dispatcher::await_response(rx_b).await.unwrap().get_attr("which"),
            Some("b")
        );
    }

    #[test]
    fn listener_fan_out_in_registration_order() {
        let dispatcher = Dispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, key) in [
            ("tag", ListenerKey::tag("iq")),
            ("attr", ListenerKey::attr_value("iq", "type", "get")),
            (
                "full",
                ListenerKey::attr_value("iq", "type", "get").with_child("ping"),
            ),
        ] {
            let order = order.clone();
            dispatcher.listen(key, move |_| {
                order.lock().unwrap().push(label);
            });
        }

        assert!(dispatcher.dispatch(&ping_node()));
        assert_eq!(*order.lock().unwrap(), vec!["tag", "attr", "full"]);
    }

    #[test]
    fn non_matching_listener_stays_quiet() {
        let dispatcher = Dispatcher::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        dispatcher.listen(ListenerKey::attr_value("iq", "type", "set"), move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        // type:get node; the type:set listener must not fire
        dispatcher.dispatch(&ping_node());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn removed_listener_no_longer_fires() {
        let dispatcher = Dispatcher::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let id = dispatcher.listen(ListenerKey::tag("iq"), move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch(&ping_node());
        assert!(dispatcher.remove_listener(id));
        dispatcher.dispatch(&ping_node());
        assert!(!dispatcher.remove_listener(id));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_can_remove_itself_from_its_callback() {
        let dispatcher = Arc::new(Dispatcher::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let id = {
            let dispatcher = Arc::clone(&dispatcher);
            let fired = Arc::clone(&fired);
            let slot = Arc::clone(&slot);
            dispatcher.clone().listen(ListenerKey::tag("iq"), move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = slot.lock().unwrap().take() {
                    assert!(dispatcher.remove_listener(id));
                }
            })
        };
        *slot.lock().unwrap() = Some(id);

        // one-shot: the first dispatch unregisters, the second finds nothing
        dispatcher.dispatch(&ping_node());
        dispatcher.dispatch(&ping_node());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_can_register_another_from_its_callback() {
        let dispatcher = Arc::new(Dispatcher::new());
        let fired = Arc::new(AtomicUsize::new(0));

        {
            let dispatcher = Arc::clone(&dispatcher);
            let fired = Arc::clone(&fired);
            dispatcher.clone().listen(ListenerKey::tag("iq"), move |_| {
                let fired = Arc::clone(&fired);
                dispatcher.listen(ListenerKey::tag("presence"), move |_| {
                    fired.fetch_add(1, Ordering::SeqCst);
                });
            });
        }

        dispatcher.dispatch(&ping_node());
        dispatcher.dispatch(&Node::new("presence"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn teardown_rejects_pending_waiters() {
        let dispatcher = Dispatcher::new();
        let rx = dispatcher.register_waiter("will-never-arrive");
        dispatcher.reject_all_waiters();
        assert!(matches!(
            Dispatcher::await_response(rx).await,
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[test]
    fn tags_are_unique_and_prefixed() {
        let dispatcher = Dispatcher::new();
        let a = dispatcher.next_tag();
        let b = dispatcher.next_tag();
        assert_ne!(a, b);
        assert_eq!(a.split('-').next(), b.split('-').next());
    }

    #[test]
    fn attribute_values_with_separators_do_not_collide() {
        let dispatcher = Dispatcher::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        dispatcher.listen(ListenerKey::attr_value("iq", "type", "get,ping"), move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        // tag=iq type=get firstChild=ping must not match the listener whose
        // literal attribute value is "get,ping"
        dispatcher.dispatch(&ping_node());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
