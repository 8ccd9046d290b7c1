use crate::net::connection::CloseReason;
use crate::net::identity::NetworkId;
use crate::net::support::{ErrorType, NetError, NetResult};
use keel::logging;
use std::sync::{Arc, Mutex, RwLock};

/// Handler ordering within an accessor. Higher priorities run first.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Priority {
    Lowest,
    Low,
    Normal,
    High,
    Highest,
}

/// An event posted through a dispatcher. Events are mutable while being
/// posted; only cancellable events accept `set_cancelled`.
pub trait Event: Send {
    #[inline]
    fn is_cancellable(&self) -> bool {
        false
    }

    #[inline]
    fn is_cancelled(&self) -> bool {
        false
    }

    fn set_cancelled(&mut self, _cancelled: bool) -> NetResult<()> {
        Err(NetError::Fatal(ErrorType::NotCancellable))
    }
}

/// Embeddable cancelled flag for cancellable event types.
#[derive(Debug, Default)]
pub struct Cancellation {
    cancelled: bool,
}

impl Cancellation {
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    #[inline]
    pub fn set(&mut self, cancelled: bool) {
        self.cancelled = cancelled;
    }
}

pub struct HandlerRecord<E> {
    callback: Box<dyn Fn(&mut E) + Send + Sync>,
    priority: Priority,
    receive_cancelled: bool,
}

impl<E> HandlerRecord<E> {
    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[inline]
    pub fn receives_cancelled(&self) -> bool {
        self.receive_cancelled
    }
}

/// Per-event ordered handler set. Registration takes the write lock,
/// posting takes the read lock; handlers run in non-increasing priority
/// order with stable ordering for ties.
pub struct Accessor<E> {
    handlers: RwLock<Vec<HandlerRecord<E>>>,
}

impl<E: Event> Accessor<E> {
    #[inline]
    pub fn new() -> Arc<Accessor<E>> {
        Arc::new(Accessor {
            handlers: RwLock::new(Vec::new()),
        })
    }

    /// Register a handler. Ties on priority keep registration order.
    pub fn add_handler<F>(&self, priority: Priority, receive_cancelled: bool, callback: F)
    where
        F: Fn(&mut E) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().expect("Accessor lock poisoned");

        let position = handlers
            .iter()
            .position(|record| record.priority < priority)
            .unwrap_or(handlers.len());

        handlers.insert(
            position,
            HandlerRecord {
                callback: Box::new(callback),
                priority,
                receive_cancelled,
            },
        );
    }

    /// Post the event to all handlers. A handler that did not opt into
    /// cancelled delivery is skipped while the event is cancelled at that
    /// moment. Returns the event's final cancelled flag.
    pub fn post(&self, event: &mut E) -> bool {
        let handlers = self.handlers.read().expect("Accessor lock poisoned");

        for record in handlers.iter() {
            if event.is_cancelled() && !record.receive_cancelled {
                continue;
            }

            (record.callback)(event);
        }

        event.is_cancelled()
    }

    /// Run the supplied closure with the handler set locked for reading.
    #[inline]
    pub fn with_locked<R, F: FnOnce(&[HandlerRecord<E>]) -> R>(&self, body: F) -> R {
        let handlers = self.handlers.read().expect("Accessor lock poisoned");
        body(&handlers)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.handlers.read().expect("Accessor lock poisoned").len()
    }
}

/// Wraps an accessor with a source description for logs and a gate that
/// serializes posts: one event at a time per dispatcher, handlers called
/// directly on the posting thread.
pub struct Dispatcher<E: Event> {
    accessor: Arc<Accessor<E>>,
    source: Box<dyn Fn() -> String + Send + Sync>,
    gate: Mutex<()>,
    log: logging::Logger,
}

impl<E: Event> Dispatcher<E> {
    pub fn new<'a, S, L>(accessor: Arc<Accessor<E>>, source: S, log: L) -> Dispatcher<E>
    where
        S: Fn() -> String + Send + Sync + 'static,
        L: Into<Option<&'a logging::Logger>>,
    {
        let dispatcher_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        Dispatcher {
            accessor,
            source: Box::new(source),
            gate: Mutex::new(()),
            log: dispatcher_log,
        }
    }

    #[inline]
    pub fn accessor(&self) -> &Arc<Accessor<E>> {
        &self.accessor
    }

    /// Post a ready-made event; returns it with its final cancelled state.
    #[inline]
    pub fn post(&self, event: E) -> E {
        self.post_with(|| event)
    }

    /// Synthesize the event just before posting, under the dispatch gate.
    pub fn post_with<F: FnOnce() -> E>(&self, build: F) -> E {
        let _gate = self.gate.lock().expect("Dispatcher gate poisoned");

        let mut event = build();

        logging::trace!(self.log, "posting event";
                        "context" => "post",
                        "source" => (self.source)());

        let cancelled = self.accessor.post(&mut event);

        logging::trace!(self.log, "event posted";
                        "context" => "post",
                        "cancelled" => cancelled);

        event
    }
}

/// A connection finished opening and may carry traffic.
#[derive(Debug)]
pub struct ConnectionOpenedEvent {
    pub remote: NetworkId,
}

impl Event for ConnectionOpenedEvent {}

/// A connection reached its terminal state. Emitted exactly once per
/// connection.
#[derive(Debug)]
pub struct ConnectionClosedEvent {
    pub remote: NetworkId,
    pub cause: CloseReason,
}

impl Event for ConnectionClosedEvent {}

/// The bounded handler queue rejected a packet. Cancelling the event
/// downgrades the rejection log to debug.
#[derive(Debug)]
pub struct PacketRejectedEvent {
    pub remote: NetworkId,
    cancellation: Cancellation,
}

impl PacketRejectedEvent {
    #[inline]
    pub fn new(remote: NetworkId) -> PacketRejectedEvent {
        PacketRejectedEvent {
            remote,
            cancellation: Cancellation::default(),
        }
    }
}

impl Event for PacketRejectedEvent {
    #[inline]
    fn is_cancellable(&self) -> bool {
        true
    }

    #[inline]
    fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    fn set_cancelled(&mut self, cancelled: bool) -> NetResult<()> {
        self.cancellation.set(cancelled);
        Ok(())
    }
}
