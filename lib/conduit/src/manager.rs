use crate::config::Config;
use crate::event::{
    Accessor, ConnectionClosedEvent, ConnectionOpenedEvent, Dispatcher, PacketRejectedEvent,
    Priority,
};
use crate::handler::{
    combine, PacketContext, PacketHandler, ThreadPacketHandler, TypeIndexedHandler,
};
use crate::net::accumulator::{Accumulator, AdapterRef, FrameAdapter};
use crate::net::connection::{CloseReason, Connection, ConnectionChannel};
use crate::net::encode::Encoder;
use crate::net::identity::{ConnectionType, NetworkId, ServerType};
use crate::net::packet::{Packet, PacketRegistry};
use crate::net::support::{CheckId, ErrorType, NetError, NetResult, Side};
use crate::net::wire::{WireContext, WireFormat};
use crate::task::{Executor, WorkerExecutor};
use crate::transport::internal::{default_switch, InternalChannel, InternalPeer, InternalSwitch};
use crate::transport::{tcp, udp, Service};
use keel::logging;
use keel::time::timestamp_millis;
use hashbrown::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::Duration;

type InfoSupplier = Box<dyn Fn() -> Box<dyn Packet> + Send + Sync>;

/// Mutable root of the user handler chain, so handlers can be composed
/// after the thread worker has been wired on top.
struct DelegateCell {
    inner: RwLock<Arc<dyn PacketHandler>>,
}

impl DelegateCell {
    fn new(initial: Arc<dyn PacketHandler>) -> Arc<DelegateCell> {
        Arc::new(DelegateCell {
            inner: RwLock::new(initial),
        })
    }

    fn get(&self) -> Arc<dyn PacketHandler> {
        self.inner.read().expect("Delegate lock poisoned").clone()
    }

    fn set(&self, handler: Arc<dyn PacketHandler>) {
        *self.inner.write().expect("Delegate lock poisoned") = handler;
    }
}

impl PacketHandler for DelegateCell {
    fn handle(&self, packet: Arc<dyn Packet>, context: &PacketContext) {
        self.get().handle(packet, context);
    }
}

/// Owns the registries, codec facilities, connections, event dispatchers
/// and the handler chain; mediates between transport IO and the connection
/// state machines.
pub struct NetworkManager {
    local: NetworkId,
    side: Side,
    config: Arc<Config>,
    registry: Arc<PacketRegistry>,
    wire: Arc<WireContext>,
    connections: Mutex<HashMap<NetworkId, Arc<Connection>>>,
    datagram_peers: Mutex<HashMap<SocketAddr, NetworkId>>,
    indexed: Arc<TypeIndexedHandler>,
    delegate: Arc<DelegateCell>,
    chain: Arc<dyn PacketHandler>,
    thread_handler: Option<Arc<ThreadPacketHandler>>,
    opened: Arc<Dispatcher<ConnectionOpenedEvent>>,
    closed: Arc<Dispatcher<ConnectionClosedEvent>>,
    rejected: Arc<Dispatcher<PacketRejectedEvent>>,
    encode_executor: Option<Arc<WorkerExecutor>>,
    decode_executor: Option<Arc<WorkerExecutor>>,
    services: Mutex<Vec<Service>>,
    info_supplier: RwLock<Option<InfoSupplier>>,
    switch: Arc<InternalSwitch>,
    server_type: Option<ServerType>,
    weak: Weak<NetworkManager>,
    log: logging::Logger,
}

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("local", &self.local)
            .field("side", &self.side)
            .finish()
    }
}

impl NetworkManager {
    /// A client-side manager using the process-wide internal switch.
    pub fn client<'a, L: Into<Option<&'a logging::Logger>>>(
        local: NetworkId,
        config: Arc<Config>,
        log: L,
    ) -> Arc<NetworkManager> {
        Self::client_with_switch(local, config, default_switch(), log)
    }

    pub fn client_with_switch<'a, L: Into<Option<&'a logging::Logger>>>(
        local: NetworkId,
        config: Arc<Config>,
        switch: Arc<InternalSwitch>,
        log: L,
    ) -> Arc<NetworkManager> {
        let manager = Self::build(local, Side::Client, config, switch, None, log);
        manager.start_common_services();
        manager
    }

    /// A server-side manager; binds and starts the endpoints named by the
    /// server type.
    pub fn server<'a, L: Into<Option<&'a logging::Logger>>>(
        local: NetworkId,
        server_type: ServerType,
        config: Arc<Config>,
        log: L,
    ) -> NetResult<Arc<NetworkManager>> {
        Self::server_with_switch(local, server_type, config, default_switch(), log)
    }

    pub fn server_with_switch<'a, L: Into<Option<&'a logging::Logger>>>(
        local: NetworkId,
        server_type: ServerType,
        config: Arc<Config>,
        switch: Arc<InternalSwitch>,
        log: L,
    ) -> NetResult<Arc<NetworkManager>> {
        server_type.resolve(&local)?;

        let manager = Self::build(
            local,
            Side::Server,
            config,
            switch,
            Some(server_type),
            log,
        );

        if server_type.serves_internal() {
            manager
                .switch
                .register(manager.local.label(), manager.weak.clone())?;
        }

        if server_type.serves_tcp() {
            let address = manager.local.require_address()?;
            let service = tcp::start_server(&manager, address, server_type.blocking)?;
            manager.services.lock().expect("Service lock poisoned").push(service);
        }

        if server_type.serves_udp() {
            let address = manager.local.require_address()?;
            let service = udp::start_server(&manager, address, server_type.blocking)?;
            manager.services.lock().expect("Service lock poisoned").push(service);
        }

        manager.start_common_services();

        Ok(manager)
    }

    fn build<'a, L: Into<Option<&'a logging::Logger>>>(
        local: NetworkId,
        side: Side,
        config: Arc<Config>,
        switch: Arc<InternalSwitch>,
        server_type: Option<ServerType>,
        log: L,
    ) -> Arc<NetworkManager> {
        let manager_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        let registry = Arc::new(PacketRegistry::new());

        let encode_executor = match config.use_encoder_thread_pool {
            true => Some(WorkerExecutor::new("encoder", &manager_log)),
            false => None,
        };

        let decode_executor = match config.use_decoder_thread_pool {
            true => Some(WorkerExecutor::new("decoder", &manager_log)),
            false => None,
        };

        let wire = Arc::new(WireContext::new(
            registry.clone(),
            config.packet_buffer_initial_size,
            decode_executor
                .clone()
                .map(|executor| executor as Arc<dyn Executor>),
            &manager_log,
        ));

        let source_label = local.to_string();
        let source = move || format!("manager {}", source_label);

        let opened = Arc::new(Dispatcher::new(
            Accessor::<ConnectionOpenedEvent>::new(),
            source.clone(),
            &manager_log,
        ));
        let closed = Arc::new(Dispatcher::new(
            Accessor::<ConnectionClosedEvent>::new(),
            source.clone(),
            &manager_log,
        ));
        let rejected = Arc::new(Dispatcher::new(
            Accessor::<PacketRejectedEvent>::new(),
            source,
            &manager_log,
        ));

        let indexed = Arc::new(TypeIndexedHandler::new(&manager_log));
        let delegate = DelegateCell::new(indexed.clone());

        let (chain, thread_handler): (Arc<dyn PacketHandler>, _) = match config.use_handler_thread {
            true => {
                let worker = ThreadPacketHandler::new(
                    config.handler_queue_capacity,
                    delegate.clone(),
                    rejected.clone(),
                    &manager_log,
                );
                (worker.clone() as Arc<dyn PacketHandler>, Some(worker))
            }
            false => (delegate.clone() as Arc<dyn PacketHandler>, None),
        };

        Arc::new_cyclic(|weak| NetworkManager {
            local,
            side,
            config,
            registry,
            wire,
            connections: Mutex::new(HashMap::new()),
            datagram_peers: Mutex::new(HashMap::new()),
            indexed,
            delegate,
            chain,
            thread_handler,
            opened,
            closed,
            rejected,
            encode_executor,
            decode_executor,
            services: Mutex::new(Vec::new()),
            info_supplier: RwLock::new(None),
            switch,
            server_type,
            weak: weak.clone(),
            log: manager_log,
        })
    }

    fn start_common_services(&self) {
        if self.config.global_connection_check {
            let service = self.start_ticker();
            self.services.lock().expect("Service lock poisoned").push(service);
        }
    }

    /// Periodic ticker driving `update` on every connection.
    fn start_ticker(&self) -> Service {
        let weak = self.weak.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = thread::Builder::new()
            .name("connection-check".to_string())
            .spawn(move || loop {
                if stop_flag.load(Ordering::Acquire) {
                    break;
                }

                thread::sleep(Duration::from_millis(250));

                let manager = match weak.upgrade() {
                    Some(manager) => manager,
                    None => break,
                };

                let now = timestamp_millis();

                for connection in manager.active_connections() {
                    connection.update(now);
                }
            })
            .expect("Ticker thread spawn failed");

        Service::new("connection-check".to_string(), stop, handle)
    }

    #[inline]
    pub fn local(&self) -> &NetworkId {
        &self.local
    }

    #[inline]
    pub fn side(&self) -> Side {
        self.side
    }

    #[inline]
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    #[inline]
    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    #[inline]
    pub(crate) fn wire_context(&self) -> &Arc<WireContext> {
        &self.wire
    }

    #[inline]
    pub(crate) fn log(&self) -> &logging::Logger {
        &self.log
    }

    #[inline]
    pub(crate) fn weak_ref(&self) -> Weak<NetworkManager> {
        self.weak.clone()
    }

    /// Register a packet type under its wire tag.
    #[inline]
    pub fn register_packet<T>(&self, tag: u32) -> NetResult<()>
    where
        T: Packet + Default + 'static,
    {
        self.registry.register::<T>(tag)
    }

    /// Register a typed packet callback on the type-indexed handler.
    #[inline]
    pub fn register_handler<T, F>(&self, callback: F) -> bool
    where
        T: Packet + 'static,
        F: Fn(&T, &PacketContext) + Send + Sync + 'static,
    {
        self.indexed.register::<T, F>(callback)
    }

    /// Replace the fallback for unregistered packet types.
    #[inline]
    pub fn set_default_handler(&self, handler: Arc<dyn PacketHandler>) -> bool {
        self.indexed.set_default(handler)
    }

    /// Append a handler node to the chain; every packet reaches both the
    /// existing chain and the new node.
    pub fn append_handler(&self, handler: Arc<dyn PacketHandler>) {
        let merged = combine(self.delegate.get(), handler);
        self.delegate.set(merged);
    }

    pub fn on_connection_opened<F>(&self, priority: Priority, callback: F)
    where
        F: Fn(&mut ConnectionOpenedEvent) + Send + Sync + 'static,
    {
        self.opened.accessor().add_handler(priority, false, callback);
    }

    pub fn on_connection_closed<F>(&self, priority: Priority, callback: F)
    where
        F: Fn(&mut ConnectionClosedEvent) + Send + Sync + 'static,
    {
        self.closed.accessor().add_handler(priority, false, callback);
    }

    pub fn on_packet_rejected<F>(&self, priority: Priority, receive_cancelled: bool, callback: F)
    where
        F: Fn(&mut PacketRejectedEvent) + Send + Sync + 'static,
    {
        self.rejected
            .accessor()
            .add_handler(priority, receive_cancelled, callback);
    }

    /// Supplier for the server-info answer sent in response to info
    /// request datagrams.
    pub fn set_info_supplier<F>(&self, supplier: F)
    where
        F: Fn() -> Box<dyn Packet> + Send + Sync + 'static,
    {
        *self.info_supplier.write().expect("Supplier lock poisoned") = Some(Box::new(supplier));
    }

    /// Open a connection to the remote id, inferring the transport from
    /// its features.
    #[inline]
    pub fn open_connection(&self, remote: NetworkId) -> NetResult<Arc<Connection>> {
        self.open_connection_typed(ConnectionType::Default, remote)
    }

    pub fn open_connection_typed(
        &self,
        connection_type: ConnectionType,
        remote: NetworkId,
    ) -> NetResult<Arc<Connection>> {
        let resolved = connection_type.resolve(&remote)?;

        if self
            .connections
            .lock()
            .expect("Connection lock poisoned")
            .contains_key(&remote)
        {
            return Err(NetError::Fatal(ErrorType::DuplicateRegistration));
        }

        logging::debug!(self.log, "opening connection";
                        "context" => "open",
                        "remote" => %remote,
                        "type" => ?resolved);

        match resolved {
            ConnectionType::Internal => self.open_internal(remote),
            ConnectionType::Tcp => self.open_tcp(remote),
            ConnectionType::Udp => self.open_udp(remote),
            ConnectionType::Default => unreachable!(),
        }
    }

    fn open_internal(&self, remote: NetworkId) -> NetResult<Arc<Connection>> {
        let server = self
            .switch
            .lookup(remote.label())
            .ok_or(NetError::Fatal(ErrorType::Closed))?;

        let channel = InternalChannel::new(remote.label().to_string());
        let connection = self.build_connection(remote.clone(), channel.clone());

        self.insert_connection(&connection);
        connection.open()?;

        let client_peer = InternalPeer {
            accumulator: Arc::new(Mutex::new(Accumulator::new(
                self.config.packet_buffer_initial_size,
                &self.log,
            ))),
            adapter: self.connection_adapter(&connection),
            context: self.wire.clone(),
        };

        if let Err(err) = server.admit_internal(self.local.clone(), client_peer, &channel) {
            self.evict(&connection);
            return Err(err);
        }

        Ok(connection)
    }

    /// Server-side half of an internal connect: wires the twin channels,
    /// admits the peer connection and confirms the client through the wire.
    pub(crate) fn admit_internal(
        &self,
        client: NetworkId,
        client_peer: InternalPeer,
        client_channel: &Arc<InternalChannel>,
    ) -> NetResult<()> {
        let server_channel = InternalChannel::new(client.label().to_string());
        let connection = self.build_connection(client.clone(), server_channel.clone());

        // The server writes into the client's accumulator and vice versa.
        server_channel.connect_peer(client_peer);
        client_channel.connect_peer(InternalPeer {
            accumulator: Arc::new(Mutex::new(Accumulator::new(
                self.config.packet_buffer_initial_size,
                &self.log,
            ))),
            adapter: self.connection_adapter(&connection),
            context: self.wire.clone(),
        });

        self.insert_connection(&connection);
        connection.open()?;
        connection.confirm_open();
        self.notify_opened(&connection);

        // Confirm the twin in-band.
        server_channel.deliver(&WireFormat::ConnectionAccepted.tag_bytes())?;

        Ok(())
    }

    fn open_tcp(&self, remote: NetworkId) -> NetResult<Arc<Connection>> {
        let address = remote.require_address()?;

        let (channel, write) = tcp::TcpChannel::new(self.config.packet_buffer_initial_size, address);
        let connection = self.build_connection(remote, channel);

        self.insert_connection(&connection);
        connection.open()?;

        let adapter = self.connection_adapter(&connection);

        let service = match tcp::start_client(self, connection.clone(), adapter, address, write) {
            Ok(service) => service,
            Err(err) => {
                self.evict(&connection);
                return Err(err);
            }
        };

        self.services.lock().expect("Service lock poisoned").push(service);

        Ok(connection)
    }

    fn open_udp(&self, remote: NetworkId) -> NetResult<Arc<Connection>> {
        let address = remote.require_address()?;

        let (channel, socket) = udp::UdpChannel::bind_client(address)?;
        let connection = self.build_connection(remote.clone(), channel.clone());

        self.insert_connection(&connection);
        self.datagram_peers
            .lock()
            .expect("Peer lock poisoned")
            .insert(address, remote);
        connection.open()?;

        // Datagram login; the server answers with a connection-accepted
        // frame.
        channel.deliver(&WireFormat::UdpLogin.tag_bytes())?;

        let adapter = self.connection_adapter(&connection);

        let service = match udp::start_client(
            self,
            connection.clone(),
            adapter,
            socket,
            address,
            self.config.datagram_packet_size,
        ) {
            Ok(service) => service,
            Err(err) => {
                self.evict(&connection);
                return Err(err);
            }
        };

        self.services.lock().expect("Service lock poisoned").push(service);

        Ok(connection)
    }

    /// Admit a connection for an accepted TCP stream. The TCP handshake is
    /// the transport confirmation, so the connection opens immediately.
    pub(crate) fn admit_stream_peer(
        &self,
        remote: NetworkId,
        channel: Arc<dyn ConnectionChannel>,
    ) -> Arc<Connection> {
        let connection = self.build_connection(remote, channel);

        self.insert_connection(&connection);
        drop(connection.open());
        connection.confirm_open();
        self.notify_opened(&connection);

        connection
    }

    /// Admit a datagram peer after its login frame. Idempotent per
    /// address: a repeated login just re-sends the confirmation.
    pub(crate) fn admit_datagram_peer(
        &self,
        address: SocketAddr,
        channel: Arc<dyn ConnectionChannel>,
    ) {
        if let Some(connection) = self.connection_by_address(&address) {
            logging::debug!(self.log, "repeated datagram login, reconfirming";
                            "context" => "admit",
                            "address" => %address);
            drop(channel.deliver(&WireFormat::ConnectionAccepted.tag_bytes()));
            drop(connection);
            return;
        }

        let remote = NetworkId::connect(format!("udp-{}", address), address);

        let connection = self.build_connection(remote.clone(), channel.clone());

        self.insert_connection(&connection);
        self.datagram_peers
            .lock()
            .expect("Peer lock poisoned")
            .insert(address, remote);

        drop(connection.open());
        connection.confirm_open();
        self.notify_opened(&connection);

        drop(channel.deliver(&WireFormat::ConnectionAccepted.tag_bytes()));
    }

    fn build_connection(
        &self,
        remote: NetworkId,
        channel: Arc<dyn ConnectionChannel>,
    ) -> Arc<Connection> {
        let encoder = Encoder::new(
            self.registry.clone(),
            self.config.packet_buffer_initial_size,
            self.config.compression_size,
            &self.log,
        );

        let encode_executor = self
            .encode_executor
            .clone()
            .map(|executor| executor as Arc<dyn Executor>);

        let connection = Connection::new(
            self.local.clone(),
            remote.clone(),
            self.side,
            self.config.connection_check_timeout,
            channel,
            encoder,
            encode_executor,
            &self.log,
        );

        let weak = self.weak.clone();
        connection.set_close_notice(Box::new(move |reason| {
            if let Some(manager) = weak.upgrade() {
                manager.connection_closed(&remote, reason);
            }
        }));

        connection
    }

    pub(crate) fn connection_adapter(&self, connection: &Arc<Connection>) -> AdapterRef {
        Arc::new(ConnectionAdapter {
            connection: Arc::downgrade(connection),
            manager: self.weak.clone(),
            log: self.log.new(logging::o!()),
        })
    }

    /// Back out a connection whose opening failed partway.
    fn evict(&self, connection: &Arc<Connection>) {
        self.connections
            .lock()
            .expect("Connection lock poisoned")
            .remove(connection.remote());

        if let Some(address) = connection.remote().address() {
            self.datagram_peers
                .lock()
                .expect("Peer lock poisoned")
                .remove(&address);
        }
    }

    fn insert_connection(&self, connection: &Arc<Connection>) {
        self.connections
            .lock()
            .expect("Connection lock poisoned")
            .insert(connection.remote().clone(), connection.clone());
    }

    fn active_connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .lock()
            .expect("Connection lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    #[inline]
    pub fn connection(&self, remote: &NetworkId) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .expect("Connection lock poisoned")
            .get(remote)
            .cloned()
    }

    pub(crate) fn connection_by_address(&self, address: &SocketAddr) -> Option<Arc<Connection>> {
        let remote = {
            let peers = self.datagram_peers.lock().expect("Peer lock poisoned");
            peers.get(address).cloned()
        };

        remote.and_then(|remote| self.connection(&remote))
    }

    #[inline]
    pub fn connection_count(&self) -> usize {
        self.connections.lock().expect("Connection lock poisoned").len()
    }

    /// Send a packet to the peer named by the remote id. Returns whether
    /// sending was attempted.
    pub fn send_to(&self, remote: &NetworkId, packet: Box<dyn Packet>) -> bool {
        match self.connection(remote) {
            Some(connection) => connection.send(packet),
            None => false,
        }
    }

    /// Close a connection locally. Returns true when this call closed it.
    pub fn close_connection(&self, remote: &NetworkId) -> bool {
        match self.connection(remote) {
            Some(connection) => connection.close(CloseReason::Local),
            None => false,
        }
    }

    /// Ask the remote server for its info packet. Only datagram transports
    /// carry the info path.
    pub fn request_server_info(&self, remote: &NetworkId) -> NetResult<()> {
        let connection = self
            .connection(remote)
            .ok_or(NetError::Fatal(ErrorType::InvalidState))?;

        connection.channel().info_request()
    }

    /// Encode the configured server-info answer, or `None` when no
    /// supplier is installed.
    pub(crate) fn answer_info(&self) -> Option<Vec<u8>> {
        let supplier = self.info_supplier.read().expect("Supplier lock poisoned");
        let packet = supplier.as_ref().map(|supplier| supplier())?;

        let mut encoder = Encoder::new(
            self.registry.clone(),
            self.config.packet_buffer_initial_size,
            self.config.compression_size,
            &self.log,
        );

        match encoder.encode_packet(WireFormat::InfoAnswer, packet.as_ref()) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                logging::error!(self.log, "server info packet failed to encode";
                                "context" => "info",
                                "error" => ?err);
                None
            }
        }
    }

    /// Route a decoded packet into the handler chain.
    pub(crate) fn dispatch_packet(&self, connection: &Arc<Connection>, packet: Box<dyn Packet>) {
        let context = PacketContext::new(connection.clone());
        let packet: Arc<dyn Packet> = packet.into();

        self.chain.handle(packet, &context);
    }

    pub(crate) fn notify_opened(&self, connection: &Arc<Connection>) {
        let remote = connection.remote().clone();
        self.opened.post(ConnectionOpenedEvent { remote });
    }

    /// Invoked by the connection's close notice, exactly once per
    /// connection.
    fn connection_closed(&self, remote: &NetworkId, reason: CloseReason) {
        self.connections
            .lock()
            .expect("Connection lock poisoned")
            .remove(remote);

        if let Some(address) = remote.address() {
            self.datagram_peers
                .lock()
                .expect("Peer lock poisoned")
                .remove(&address);
        }

        logging::debug!(self.log, "connection removed";
                        "context" => "close",
                        "remote" => %remote,
                        "reason" => ?reason);

        self.closed.post(ConnectionClosedEvent {
            remote: remote.clone(),
            cause: reason,
        });
    }

    /// Close all connections, stop all services and workers and release
    /// the codec resources.
    pub fn shutdown(&self) {
        logging::debug!(self.log, "manager shutting down"; "context" => "shutdown");

        let mut services = {
            let mut held = self.services.lock().expect("Service lock poisoned");
            std::mem::replace(&mut *held, Vec::new())
        };

        for service in services.iter_mut() {
            logging::trace!(self.log, "halting service";
                            "context" => "shutdown",
                            "service" => service.name());
            service.halt();
        }

        if let Some(server_type) = self.server_type {
            if server_type.serves_internal() {
                self.switch.unregister(self.local.label());
            }
        }

        for connection in self.active_connections() {
            connection.close(CloseReason::Local);
        }

        if let Some(ref handler) = self.thread_handler {
            handler.halt();
        }

        if let Some(ref executor) = self.encode_executor {
            executor.halt();
        }

        if let Some(ref executor) = self.decode_executor {
            executor.halt();
        }

        self.wire.release();
    }
}

/// Routes complete frames of an established connection: packets to the
/// handler chain, control frames to the state machine.
pub(crate) struct ConnectionAdapter {
    connection: Weak<Connection>,
    manager: Weak<NetworkManager>,
    log: logging::Logger,
}

impl ConnectionAdapter {
    fn upgrade(&self) -> Option<(Arc<Connection>, Arc<NetworkManager>)> {
        Some((self.connection.upgrade()?, self.manager.upgrade()?))
    }
}

impl FrameAdapter for ConnectionAdapter {
    fn receive_packet(&self, packet: Box<dyn Packet>) {
        if let Some((connection, manager)) = self.upgrade() {
            manager.dispatch_packet(&connection, packet);
        }
    }

    fn receive_check(&self, id: CheckId) {
        if let Some(connection) = self.connection.upgrade() {
            connection.receive_check(id);
        }
    }

    fn receive_check_reply(&self, id: CheckId) {
        if let Some(connection) = self.connection.upgrade() {
            connection.receive_check_reply(id);
        }
    }

    fn receive_udp_login(&self) {
        // Login frames belong to the server's shared socket path; on an
        // established connection they are always a protocol violation.
        logging::warn!(self.log, "unexpected login frame on established connection, discarded";
                       "context" => "adapter");
    }

    fn receive_udp_logout(&self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.close(CloseReason::Remote);
        }
    }

    fn receive_info_request(&self) {
        logging::debug!(self.log, "info request on established connection, discarded";
                        "context" => "adapter");
    }

    fn receive_info_answer(&self, packet: Box<dyn Packet>) {
        if let Some((connection, manager)) = self.upgrade() {
            manager.dispatch_packet(&connection, packet);
        }
    }

    fn receive_connection_accepted(&self) {
        if let Some((connection, manager)) = self.upgrade() {
            if connection.confirm_open() {
                manager.notify_opened(&connection);
            } else {
                logging::debug!(self.log, "redundant connection-accepted frame";
                                "context" => "adapter");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::ConnectionState;
    use crate::net::packet::testkit::{Probe, Pulse};
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> Arc<Config> {
        Config::builder()
            .use_handler_thread(false)
            .connection_check_timeout(-1)
            .build()
            .unwrap()
    }

    fn pair(label: &str, config: Arc<Config>) -> (Arc<NetworkManager>, Arc<NetworkManager>) {
        let switch = Arc::new(InternalSwitch::new());

        let server = NetworkManager::server_with_switch(
            NetworkId::internal(label),
            ServerType::INTERNAL,
            config.clone(),
            switch.clone(),
            None,
        )
        .unwrap();

        let client = NetworkManager::client_with_switch(
            NetworkId::internal("client"),
            config,
            switch,
            None,
        );

        for manager in [&server, &client].iter() {
            manager.register_packet::<Probe>(1).unwrap();
            manager.register_packet::<Pulse>(2).unwrap();
        }

        (server, client)
    }

    fn probe(value: i32, label: &str) -> Box<dyn Packet> {
        Box::new(Probe {
            value,
            label: label.to_string(),
        })
    }

    #[test]
    fn test_internal_end_to_end() {
        let (server, client) = pair("echo-hub", test_config());

        // The server doubles the value and replies.
        server.register_handler::<Probe, _>(|packet, ctx| {
            ctx.reply(Box::new(Probe {
                value: packet.value * 2,
                label: packet.label.clone(),
            }));
        });

        let replies = Arc::new(Mutex::new(Vec::new()));
        let seen = replies.clone();
        client.register_handler::<Probe, _>(move |packet, _ctx| {
            seen.lock().unwrap().push(packet.value);
        });

        let connection = client
            .open_connection(NetworkId::internal("echo-hub"))
            .unwrap();

        assert_eq!(connection.state(), ConnectionState::Open);
        assert!(connection.send(probe(21, "double me")));

        assert_eq!(*replies.lock().unwrap(), vec![42]);
    }

    #[test]
    fn test_opened_events_fire_both_sides() {
        let (server, client) = pair("event-hub", test_config());

        let openings = Arc::new(AtomicUsize::new(0));

        let counter = openings.clone();
        server.on_connection_opened(Priority::Normal, move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let counter = openings.clone();
        client.on_connection_opened(Priority::Normal, move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        client
            .open_connection(NetworkId::internal("event-hub"))
            .unwrap();

        assert_eq!(openings.load(Ordering::SeqCst), 2);
        assert_eq!(server.connection_count(), 1);
        assert_eq!(client.connection_count(), 1);
    }

    #[test]
    fn test_ping_over_internal() {
        let (_server, client) = pair("ping-hub", test_config());

        let connection = client
            .open_connection(NetworkId::internal("ping-hub"))
            .unwrap();

        assert_eq!(connection.round_trip(), -1);

        connection.check().unwrap();

        // The reply travels synchronously through the twin accumulators.
        assert!(connection.round_trip() >= 0);
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[test]
    fn test_close_propagates_to_peer() {
        let (server, client) = pair("close-hub", test_config());

        let causes = Arc::new(Mutex::new(Vec::new()));
        let seen = causes.clone();
        server.on_connection_closed(Priority::Normal, move |event| {
            seen.lock().unwrap().push(event.cause);
        });

        client
            .open_connection(NetworkId::internal("close-hub"))
            .unwrap();
        assert_eq!(server.connection_count(), 1);

        assert!(client.close_connection(&NetworkId::internal("close-hub")));

        assert_eq!(client.connection_count(), 0);
        assert_eq!(server.connection_count(), 0);
        assert_eq!(*causes.lock().unwrap(), vec![CloseReason::Remote]);
    }

    #[test]
    fn test_duplicate_connection_rejected() {
        let (_server, client) = pair("dup-hub", test_config());

        client
            .open_connection(NetworkId::internal("dup-hub"))
            .unwrap();

        let result = client.open_connection(NetworkId::internal("dup-hub"));

        assert_eq!(
            result.unwrap_err(),
            NetError::Fatal(ErrorType::DuplicateRegistration)
        );
    }

    #[test]
    fn test_unknown_internal_server_rejected() {
        let (_server, client) = pair("known-hub", test_config());

        let result = client.open_connection(NetworkId::internal("nowhere"));

        assert_eq!(result.unwrap_err(), NetError::Fatal(ErrorType::Closed));
    }

    #[test]
    fn test_send_to_by_remote_id() {
        let (server, client) = pair("sendto-hub", test_config());

        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        server.register_handler::<Pulse, _>(move |packet, _ctx| {
            assert_eq!(packet.tick, 7);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let remote = NetworkId::internal("sendto-hub");
        client.open_connection(remote.clone()).unwrap();

        assert!(client.send_to(&remote, Box::new(Pulse { tick: 7 })));
        assert!(!client.send_to(&NetworkId::internal("absent"), Box::new(Pulse { tick: 7 })));

        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_thread_path() {
        let config = Config::builder()
            .use_handler_thread(true)
            .connection_check_timeout(-1)
            .build()
            .unwrap();

        let (server, client) = pair("threaded-hub", config);

        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        server.register_handler::<Probe, _>(move |_packet, _ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        client
            .open_connection(NetworkId::internal("threaded-hub"))
            .unwrap();
        client.send_to(&NetworkId::internal("threaded-hub"), probe(1, "x"));

        // Delivery happens on the worker thread.
        for _ in 0..100 {
            if received.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(received.load(Ordering::SeqCst), 1);

        server.shutdown();
        client.shutdown();
    }

    #[test]
    fn test_shutdown_closes_connections() {
        let (server, client) = pair("bye-hub", test_config());

        let connection = client
            .open_connection(NetworkId::internal("bye-hub"))
            .unwrap();

        client.shutdown();

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(client.connection_count(), 0);
        // The server observed the in-band goodbye.
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_internal_server_label_conflict() {
        let switch = Arc::new(InternalSwitch::new());

        let _first = NetworkManager::server_with_switch(
            NetworkId::internal("solo"),
            ServerType::INTERNAL,
            test_config(),
            switch.clone(),
            None,
        )
        .unwrap();

        let second = NetworkManager::server_with_switch(
            NetworkId::internal("solo"),
            ServerType::INTERNAL,
            test_config(),
            switch,
            None,
        );

        assert_eq!(
            second.unwrap_err(),
            NetError::Fatal(ErrorType::DuplicateRegistration)
        );
    }

    #[test]
    fn test_info_request_needs_datagram_transport() {
        let (_server, client) = pair("info-hub", test_config());

        let remote = NetworkId::internal("info-hub");
        client.open_connection(remote.clone()).unwrap();

        assert_eq!(
            client.request_server_info(&remote).unwrap_err(),
            NetError::Fatal(ErrorType::InvalidState)
        );
    }

    #[test]
    fn test_custom_blob_reaches_handlers() {
        let (server, client) = pair("blob-hub", test_config());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let labels = seen.clone();
        server.register_handler::<Probe, _>(move |_packet, ctx| {
            let blob = ctx.custom().expect("blob expected");
            labels
                .lock()
                .unwrap()
                .push(blob.downcast_ref::<String>().unwrap().clone());
        });

        client
            .open_connection(NetworkId::internal("blob-hub"))
            .unwrap();

        // Attach the blob on the server-side connection.
        let server_conn = server
            .connection(&NetworkId::internal("client"))
            .expect("server side connection");
        server_conn.set_custom(Arc::new("session-token".to_string()));

        client.send_to(&NetworkId::internal("blob-hub"), probe(1, "x"));

        assert_eq!(*seen.lock().unwrap(), vec!["session-token".to_string()]);
    }
}
