//! Transport lifecycle events and handler registration.

use crate::lock;
use crate::transport::NodeId;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

/// Kind of lifecycle transition reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetEventType {
    /// Connection established (or failed to establish)
    Connect,
    /// Connection closed
    Disconnect,
    /// Socket write failed
    SendError,
    /// Socket read failed
    ReceiveError,
}

/// Outcome attached to a lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetEventResult {
    /// Transition completed
    Success,
    /// Transition failed
    Failure,
}

/// Lifecycle event fired by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetEventState {
    /// Node of the firing transport, if it has been assigned one
    pub node: Option<NodeId>,
    /// Transition kind
    pub kind: NetEventType,
    /// Transition outcome
    pub result: NetEventResult,
}

/// Receiver of transport lifecycle events
///
/// Handlers are called synchronously from the thread that caused the
/// transition, after the transport has released its internal state.
pub trait TransportEventHandler: Send + Sync + Debug {
    /// Handle one lifecycle event
    fn on_event(&self, state: NetEventState);
}

/// Registered event handlers of one transport
#[derive(Debug, Default)]
pub struct EventHandlers {
    handlers: Mutex<Vec<Arc<dyn TransportEventHandler>>>,
}

impl EventHandlers {
    /// Create an empty handler list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler
    pub fn register(&self, handler: Arc<dyn TransportEventHandler>) {
        lock(&self.handlers).push(handler);
    }

    /// Remove every registration of `handler`
    pub fn unregister(&self, handler: &Arc<dyn TransportEventHandler>) {
        let target = Arc::as_ptr(handler) as *const ();
        lock(&self.handlers).retain(|h| Arc::as_ptr(h) as *const () != target);
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        lock(&self.handlers).len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        lock(&self.handlers).is_empty()
    }

    /// Deliver an event to every handler
    pub fn notify(&self, state: NetEventState) {
        let handlers = lock(&self.handlers).clone();
        for handler in handlers {
            handler.on_event(state);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Handler recording every event it sees
    #[derive(Debug, Default)]
    pub(crate) struct Recorder {
        pub(crate) events: Mutex<Vec<NetEventState>>,
    }

    impl Recorder {
        pub(crate) fn count(&self, kind: NetEventType) -> usize {
            lock(&self.events).iter().filter(|e| e.kind == kind).count()
        }
    }

    impl TransportEventHandler for Recorder {
        fn on_event(&self, state: NetEventState) {
            lock(&self.events).push(state);
        }
    }

    fn connect_event() -> NetEventState {
        NetEventState {
            node: Some(NodeId(1)),
            kind: NetEventType::Connect,
            result: NetEventResult::Success,
        }
    }

    #[test]
    fn test_notify_reaches_every_handler() {
        let handlers = EventHandlers::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        handlers.register(first.clone());
        handlers.register(second.clone());

        handlers.notify(connect_event());
        assert_eq!(first.count(NetEventType::Connect), 1);
        assert_eq!(second.count(NetEventType::Connect), 1);
    }

    #[test]
    fn test_unregister_by_identity() {
        let handlers = EventHandlers::new();
        let kept = Arc::new(Recorder::default());
        let removed: Arc<dyn TransportEventHandler> = Arc::new(Recorder::default());
        handlers.register(kept.clone());
        handlers.register(removed.clone());

        handlers.unregister(&removed);
        assert_eq!(handlers.len(), 1);

        handlers.notify(connect_event());
        assert_eq!(kept.count(NetEventType::Connect), 1);
    }
}
