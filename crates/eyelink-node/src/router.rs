//! Message router -- per-connection fan-out from message code to handlers.
//!
//! Each code maps to an ordered list of handlers for its payload type.
//! A frame is decoded once per dispatch, and only when at least one
//! handler wants it, so malformed traffic nobody listens to is never
//! parsed. Handlers run in subscription order; a handler that errors or
//! panics is logged and the rest still run.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use eyelink_protocol::{deserialize_payload, Frame, MessageCode, Payload, ProtocolError};

type Handler<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

/// Token returned by [`MessageRouter::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    code: MessageCode,
    id: u64,
}

impl SubscriptionId {
    pub fn code(&self) -> MessageCode {
        self.code
    }
}

/// What happened to a dispatched frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Unknown code or no subscribers; the payload was not decoded.
    Dropped,
    /// Payload decoded and handed to `handlers` handlers, `failed` of which
    /// returned an error or panicked.
    Delivered { handlers: usize, failed: usize },
}

trait HandlerSet: Send + Sync {
    fn dispatch(&self, payload: &[u8]) -> Result<DispatchOutcome, ProtocolError>;
    fn without(&self, id: u64) -> Option<Arc<dyn HandlerSet>>;
    fn len(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
}

struct TypedHandlers<T: Payload> {
    handlers: Vec<(u64, Handler<T>)>,
}

impl<T: Payload> HandlerSet for TypedHandlers<T> {
    fn dispatch(&self, payload: &[u8]) -> Result<DispatchOutcome, ProtocolError> {
        let message: T = deserialize_payload(payload)?;

        let mut failed = 0;
        for (id, handler) in &self.handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    tracing::warn!(
                        code = T::CODE.name(),
                        subscription = id,
                        "router: handler failed: {e:#}"
                    );
                }
                Err(_) => {
                    failed += 1;
                    tracing::error!(
                        code = T::CODE.name(),
                        subscription = id,
                        "router: handler panicked"
                    );
                }
            }
        }

        Ok(DispatchOutcome::Delivered {
            handlers: self.handlers.len(),
            failed,
        })
    }

    fn without(&self, id: u64) -> Option<Arc<dyn HandlerSet>> {
        let handlers: Vec<_> = self
            .handlers
            .iter()
            .filter(|(hid, _)| *hid != id)
            .cloned()
            .collect();
        if handlers.is_empty() {
            None
        } else {
            Some(Arc::new(TypedHandlers { handlers }))
        }
    }

    fn len(&self) -> usize {
        self.handlers.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Registry of message handlers for one connection.
///
/// Handler lists are copy-on-write: dispatch clones the current list and
/// releases the lock before invoking anything, so handlers may subscribe
/// or unsubscribe (including themselves) while running.
pub struct MessageRouter {
    table: Mutex<HashMap<MessageCode, Arc<dyn HandlerSet>>>,
    next_id: AtomicU64,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<MessageCode, Arc<dyn HandlerSet>>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a handler for messages of type `T`. Handlers for the same type
    /// run in the order they were added.
    pub fn subscribe<T, F>(&self, handler: F) -> SubscriptionId
    where
        T: Payload,
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut table = self.table();

        let mut handlers: Vec<(u64, Handler<T>)> = table
            .get(&T::CODE)
            .and_then(|set| set.as_any().downcast_ref::<TypedHandlers<T>>())
            .map(|set| set.handlers.clone())
            .unwrap_or_default();
        handlers.push((id, Arc::new(handler)));
        table.insert(T::CODE, Arc::new(TypedHandlers { handlers }));

        tracing::trace!(code = T::CODE.name(), subscription = id, "router: subscribed");
        SubscriptionId { code: T::CODE, id }
    }

    /// Remove a handler. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        let mut table = self.table();
        let Some(set) = table.get(&subscription.code) else {
            return false;
        };
        let before = set.len();
        match set.without(subscription.id) {
            Some(rest) => {
                let removed = rest.len() < before;
                table.insert(subscription.code, rest);
                removed
            }
            None => {
                table.remove(&subscription.code);
                true
            }
        }
    }

    pub fn subscriber_count(&self, code: MessageCode) -> usize {
        self.table().get(&code).map(|set| set.len()).unwrap_or(0)
    }

    /// Route one frame to its subscribers.
    ///
    /// A `Decode` error means the payload did not match the schema of a
    /// type somebody subscribed to; it concerns this frame only.
    pub fn dispatch(&self, frame: &Frame) -> Result<DispatchOutcome, ProtocolError> {
        let code = match frame.message_code() {
            Ok(code) => code,
            Err(_) => {
                tracing::trace!(code = frame.code, "router: unknown code, dropped");
                return Ok(DispatchOutcome::Dropped);
            }
        };

        let set = self.table().get(&code).cloned();
        match set {
            Some(set) => set.dispatch(&frame.payload),
            None => {
                tracing::trace!(code = code.name(), "router: no subscribers, dropped");
                Ok(DispatchOutcome::Dropped)
            }
        }
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}
