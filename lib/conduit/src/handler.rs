use crate::event::{Dispatcher, Event, PacketRejectedEvent};
use crate::net::connection::Connection;
use crate::net::identity::NetworkId;
use crate::net::packet::Packet;
use keel::logging;
use hashbrown::HashMap;
use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

/// Delivery context handed to packet handlers alongside each packet.
/// `reply` re-enters `send` on the originating connection.
#[derive(Clone)]
pub struct PacketContext {
    connection: Arc<Connection>,
}

impl PacketContext {
    #[inline]
    pub fn new(connection: Arc<Connection>) -> PacketContext {
        PacketContext { connection }
    }

    #[inline]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    #[inline]
    pub fn remote(&self) -> &NetworkId {
        self.connection.remote()
    }

    /// The user-supplied opaque blob attached to the connection.
    #[inline]
    pub fn custom(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.connection.custom()
    }

    /// Send a packet back on the same connection.
    #[inline]
    pub fn reply(&self, packet: Box<dyn Packet>) -> bool {
        self.connection.send(packet)
    }
}

/// A node in the packet handler chain. Decoded packets are shared
/// immutably, so one packet can fan out to several handlers.
pub trait PacketHandler: Send + Sync {
    fn handle(&self, packet: Arc<dyn Packet>, context: &PacketContext);

    /// True for handlers that do nothing; `combine` collapses these.
    #[inline]
    fn is_empty_handler(&self) -> bool {
        false
    }

    /// Downcast hook used by `combine` to flatten nested lists.
    #[inline]
    fn as_multi(&self) -> Option<&MultiPacketHandler> {
        None
    }
}

/// The do-nothing handler.
pub struct EmptyPacketHandler;

impl PacketHandler for EmptyPacketHandler {
    fn handle(&self, _packet: Arc<dyn Packet>, _context: &PacketContext) {}

    fn is_empty_handler(&self) -> bool {
        true
    }
}

/// An ordered list of handlers, each receiving every packet.
pub struct MultiPacketHandler {
    list: Vec<Arc<dyn PacketHandler>>,
}

impl MultiPacketHandler {
    #[inline]
    pub fn new(list: Vec<Arc<dyn PacketHandler>>) -> MultiPacketHandler {
        MultiPacketHandler { list }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.list.len()
    }
}

impl PacketHandler for MultiPacketHandler {
    fn handle(&self, packet: Arc<dyn Packet>, context: &PacketContext) {
        for handler in self.list.iter() {
            handler.handle(packet.clone(), context);
        }
    }

    fn is_empty_handler(&self) -> bool {
        self.list.is_empty()
    }

    fn as_multi(&self) -> Option<&MultiPacketHandler> {
        Some(self)
    }
}

/// Collapse empty handlers, merge lists, otherwise nest into a new list.
pub fn combine(a: Arc<dyn PacketHandler>, b: Arc<dyn PacketHandler>) -> Arc<dyn PacketHandler> {
    if a.is_empty_handler() {
        return b;
    }

    if b.is_empty_handler() {
        return a;
    }

    let mut list = Vec::new();

    match a.as_multi() {
        Some(multi) => list.extend(multi.list.iter().cloned()),
        None => list.push(a.clone()),
    }

    match b.as_multi() {
        Some(multi) => list.extend(multi.list.iter().cloned()),
        None => list.push(b.clone()),
    }

    Arc::new(MultiPacketHandler::new(list))
}

struct TypedHandler<T, F> {
    callback: F,
    _marker: PhantomData<fn(T)>,
}

impl<T, F> PacketHandler for TypedHandler<T, F>
where
    T: Packet + 'static,
    F: Fn(&T, &PacketContext) + Send + Sync,
{
    fn handle(&self, packet: Arc<dyn Packet>, context: &PacketContext) {
        if let Some(typed) = packet.as_any().downcast_ref::<T>() {
            (self.callback)(typed, context);
        }
    }
}

/// Dispatches packets to the handler registered for their concrete type.
/// Registration is only possible while the handler is mutable; receipt of
/// the first packet locks it implicitly. Unknown types fall through to the
/// configurable default handler.
pub struct TypeIndexedHandler {
    entries: RwLock<HashMap<TypeId, Arc<dyn PacketHandler>>>,
    default: RwLock<Arc<dyn PacketHandler>>,
    locked: AtomicBool,
}

impl TypeIndexedHandler {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> TypeIndexedHandler {
        let handler_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        TypeIndexedHandler {
            entries: RwLock::new(HashMap::new()),
            default: RwLock::new(Arc::new(UnhandledLogger { log: handler_log })),
            locked: AtomicBool::new(false),
        }
    }

    /// Register a typed callback. Returns true on success, false when the
    /// type is already registered or the handler is locked.
    pub fn register<T, F>(&self, callback: F) -> bool
    where
        T: Packet + 'static,
        F: Fn(&T, &PacketContext) + Send + Sync + 'static,
    {
        self.register_boxed(
            TypeId::of::<T>(),
            Arc::new(TypedHandler::<T, F> {
                callback,
                _marker: PhantomData,
            }),
        )
    }

    pub fn register_boxed(&self, type_id: TypeId, handler: Arc<dyn PacketHandler>) -> bool {
        if self.locked.load(Ordering::Acquire) {
            return false;
        }

        let mut entries = self.entries.write().expect("Handler lock poisoned");

        if entries.contains_key(&type_id) {
            return false;
        }

        entries.insert(type_id, handler);
        true
    }

    /// Replace the default handler for unregistered packet types.
    pub fn set_default(&self, handler: Arc<dyn PacketHandler>) -> bool {
        if self.locked.load(Ordering::Acquire) {
            return false;
        }

        *self.default.write().expect("Handler lock poisoned") = handler;
        true
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

impl PacketHandler for TypeIndexedHandler {
    fn handle(&self, packet: Arc<dyn Packet>, context: &PacketContext) {
        // Receipt activates the lock implicitly.
        self.locked.store(true, Ordering::Release);

        let type_id = packet.as_any().type_id();

        let handler = {
            let entries = self.entries.read().expect("Handler lock poisoned");
            entries.get(&type_id).cloned()
        };

        match handler {
            Some(handler) => handler.handle(packet, context),
            None => {
                let default = self.default.read().expect("Handler lock poisoned").clone();
                default.handle(packet, context);
            }
        }
    }
}

struct UnhandledLogger {
    log: logging::Logger,
}

impl PacketHandler for UnhandledLogger {
    fn handle(&self, _packet: Arc<dyn Packet>, context: &PacketContext) {
        logging::debug!(self.log, "no handler for packet type, dropped";
                        "context" => "handle",
                        "remote" => %context.remote());
    }
}

struct QueueEntry {
    packet: Arc<dyn Packet>,
    context: PacketContext,
}

/// Bounded single-thread serializer isolating user handlers from the IO
/// threads. A dedicated worker drains the queue into the delegate; queue
/// overflow posts a rejection event and drops the packet.
pub struct ThreadPacketHandler {
    sender: Mutex<Option<crossbeam_channel::Sender<QueueEntry>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    rejected: Arc<Dispatcher<PacketRejectedEvent>>,
    log: logging::Logger,
}

impl ThreadPacketHandler {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        capacity: usize,
        delegate: Arc<dyn PacketHandler>,
        rejected: Arc<Dispatcher<PacketRejectedEvent>>,
        log: L,
    ) -> Arc<ThreadPacketHandler> {
        let handler_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        let worker_log = handler_log.new(logging::o!());

        let (sender, receiver) = crossbeam_channel::bounded::<QueueEntry>(capacity);

        let handle = thread::Builder::new()
            .name("packet-handler".to_string())
            .spawn(move || {
                // Draining continues until all senders are gone; an entry
                // already dequeued is always finished.
                for entry in receiver.iter() {
                    delegate.handle(entry.packet, &entry.context);
                }

                logging::debug!(worker_log, "handler worker stopped"; "context" => "worker");
            })
            .expect("Handler thread spawn failed");

        Arc::new(ThreadPacketHandler {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(handle)),
            rejected,
            log: handler_log,
        })
    }

    /// Disconnect the queue and join the worker. Queued packets are still
    /// delivered before the worker ends.
    pub fn halt(&self) {
        self.sender.lock().expect("Handler lock poisoned").take();

        if let Some(handle) = self.worker.lock().expect("Handler lock poisoned").take() {
            drop(handle.join());
        }
    }
}

impl PacketHandler for ThreadPacketHandler {
    fn handle(&self, packet: Arc<dyn Packet>, context: &PacketContext) {
        // Clone the sender out so rejection handlers never run under the
        // queue lock.
        let sender = self
            .sender
            .lock()
            .expect("Handler lock poisoned")
            .as_ref()
            .cloned();

        let sender = match sender {
            Some(sender) => sender,
            None => {
                logging::debug!(self.log, "handler queue halted, packet dropped";
                                "context" => "offer");
                return;
            }
        };

        let remote = context.remote().clone();

        let entry = QueueEntry {
            packet,
            context: context.clone(),
        };

        match sender.try_send(entry) {
            Ok(_) => {}
            Err(crossbeam_channel::TrySendError::Full(_)) => {
                let event = self
                    .rejected
                    .post_with(|| PacketRejectedEvent::new(remote.clone()));

                if event.is_cancelled() {
                    logging::debug!(self.log, "handler queue full, packet dropped";
                                    "context" => "offer",
                                    "remote" => %remote);
                } else {
                    logging::warn!(self.log, "handler queue full, packet dropped";
                                   "context" => "offer",
                                   "remote" => %remote);
                }
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                logging::debug!(self.log, "handler queue disconnected, packet dropped";
                                "context" => "offer");
            }
        }
    }
}

impl Drop for ThreadPacketHandler {
    fn drop(&mut self) {
        self.halt();
    }
}
