use crate::manager::NetworkManager;
use crate::net::accumulator::{Accumulator, AdapterRef, FrameAdapter};
use crate::net::connection::{CloseReason, Connection, ConnectionChannel, ConnectionState};
use crate::net::packet::Packet;
use crate::net::pool::DecoderPool;
use crate::net::support::{CheckId, NetResult};
use crate::net::wire::WireFormat;
use crate::transport::Service;
use keel::logging;
use mio::net::UdpSocket;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

const SOCKET_TOKEN: mio::Token = mio::Token(0);

/// Datagram channel bound to one remote address. Sends are best-effort: a
/// full socket buffer drops the datagram, as the transport itself would.
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
}

impl UdpChannel {
    /// Bind an ephemeral client socket talking to `target`.
    pub fn bind_client(target: SocketAddr) -> NetResult<(Arc<UdpChannel>, Arc<UdpSocket>)> {
        let local: SocketAddr = match target.is_ipv4() {
            true => "0.0.0.0:0".parse()?,
            false => "[::]:0".parse()?,
        };

        let socket = Arc::new(UdpSocket::bind(&local)?);

        Ok((
            Arc::new(UdpChannel {
                socket: socket.clone(),
                target,
            }),
            socket,
        ))
    }

    /// A peer channel sharing the server's receive socket.
    pub fn for_peer(socket: Arc<UdpSocket>, target: SocketAddr) -> Arc<UdpChannel> {
        Arc::new(UdpChannel { socket, target })
    }
}

impl ConnectionChannel for UdpChannel {
    fn deliver(&self, bytes: &[u8]) -> NetResult<()> {
        match self.socket.send_to(bytes, &self.target) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn goodbye(&self) {
        drop(self.deliver(&WireFormat::UdpLogout.tag_bytes()));
    }

    fn info_request(&self) -> NetResult<()> {
        self.deliver(&WireFormat::InfoRequest.tag_bytes())
    }

    fn describe(&self) -> String {
        format!("udp:{}", self.target)
    }
}

/// Routes frames decoded from the shared server socket for one source
/// address: login admits a connection, data and control frames go to the
/// admitted connection, info requests are answered in place.
pub(crate) struct ServerDatagramAdapter {
    manager: Weak<NetworkManager>,
    address: SocketAddr,
    socket: Arc<UdpSocket>,
    log: logging::Logger,
}

impl ServerDatagramAdapter {
    fn connection(&self) -> Option<Arc<Connection>> {
        self.manager
            .upgrade()
            .and_then(|manager| manager.connection_by_address(&self.address))
    }
}

impl FrameAdapter for ServerDatagramAdapter {
    fn receive_packet(&self, packet: Box<dyn Packet>) {
        match (self.manager.upgrade(), self.connection()) {
            (Some(manager), Some(connection)) => manager.dispatch_packet(&connection, packet),
            _ => {
                logging::debug!(self.log, "packet from unknown datagram peer, dropped";
                                "context" => "udp-server",
                                "address" => %self.address);
            }
        }
    }

    fn receive_check(&self, id: CheckId) {
        if let Some(connection) = self.connection() {
            connection.receive_check(id);
        }
    }

    fn receive_check_reply(&self, id: CheckId) {
        if let Some(connection) = self.connection() {
            connection.receive_check_reply(id);
        }
    }

    fn receive_udp_login(&self) {
        if let Some(manager) = self.manager.upgrade() {
            let channel = UdpChannel::for_peer(self.socket.clone(), self.address);
            manager.admit_datagram_peer(self.address, channel);
        }
    }

    fn receive_udp_logout(&self) {
        match self.connection() {
            Some(connection) => {
                connection.close(CloseReason::Remote);
            }
            None => {
                logging::debug!(self.log, "logout from unknown datagram peer, ignored";
                                "context" => "udp-server",
                                "address" => %self.address);
            }
        }
    }

    fn receive_info_request(&self) {
        let answer = self
            .manager
            .upgrade()
            .and_then(|manager| manager.answer_info());

        match answer {
            Some(bytes) => {
                drop(self.socket.send_to(&bytes, &self.address));
            }
            None => {
                logging::debug!(self.log, "info request without supplier, ignored";
                                "context" => "udp-server",
                                "address" => %self.address);
            }
        }
    }

    fn receive_info_answer(&self, _packet: Box<dyn Packet>) {
        logging::warn!(self.log, "info answer frame on the server socket, discarded";
                       "context" => "udp-server",
                       "address" => %self.address);
    }

    fn receive_connection_accepted(&self) {
        logging::warn!(self.log, "connection-accepted frame on the server socket, discarded";
                       "context" => "udp-server",
                       "address" => %self.address);
    }
}

fn poll_timeout(blocking: bool) -> Duration {
    match blocking {
        true => Duration::from_millis(500),
        false => Duration::from_millis(50),
    }
}

/// Shared-socket server endpoint: every inbound datagram is decoded
/// through the per-address pool.
pub fn start_server(
    manager: &NetworkManager,
    address: SocketAddr,
    blocking: bool,
) -> NetResult<Service> {
    let socket = Arc::new(UdpSocket::bind(&address)?);

    let poll = mio::Poll::new()?;
    poll.register(
        &*socket,
        SOCKET_TOKEN,
        mio::Ready::readable(),
        mio::PollOpt::edge(),
    )?;

    let weak = manager.weak_ref();
    let wire = manager.wire_context().clone();
    let datagram_size = manager.config().datagram_packet_size;
    let log = manager.log().new(logging::o!());
    let pool = DecoderPool::new(wire, &log);

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    logging::debug!(log, "udp server listening";
                    "context" => "udp-server",
                    "address" => %address);

    let handle = thread::Builder::new()
        .name("udp-server".to_string())
        .spawn(move || {
            let mut events = mio::Events::with_capacity(64);
            let mut scratch = vec![0u8; datagram_size];
            let timeout = poll_timeout(blocking);

            while !stop_flag.load(Ordering::Acquire) {
                if poll.poll(&mut events, Some(timeout)).is_err() {
                    break;
                }

                for event in &events {
                    if !event.readiness().is_readable() {
                        continue;
                    }

                    loop {
                        match socket.recv_from(&mut scratch) {
                            Ok((count, from)) => {
                                let adapter: AdapterRef = Arc::new(ServerDatagramAdapter {
                                    manager: weak.clone(),
                                    address: from,
                                    socket: socket.clone(),
                                    log: log.new(logging::o!()),
                                });

                                pool.decode(from, &scratch[..count], &adapter);
                            }
                            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                            Err(err) => {
                                logging::debug!(log, "datagram receive failed";
                                                "context" => "udp-server",
                                                "error" => ?err);
                                break;
                            }
                        }
                    }
                }
            }

            logging::debug!(log, "udp server stopped"; "context" => "udp-server");
        })
        .expect("Endpoint thread spawn failed");

    Ok(Service::new("udp-server".to_string(), stop, handle))
}

/// Client endpoint: a private socket, one accumulator, datagrams accepted
/// only from the connected server address.
pub fn start_client(
    manager: &NetworkManager,
    connection: Arc<Connection>,
    adapter: AdapterRef,
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    datagram_size: usize,
) -> NetResult<Service> {
    let poll = mio::Poll::new()?;
    poll.register(
        &*socket,
        SOCKET_TOKEN,
        mio::Ready::readable(),
        mio::PollOpt::edge(),
    )?;

    let wire = manager.wire_context().clone();
    let initial_size = manager.config().packet_buffer_initial_size;
    let log = manager.log().new(logging::o!());

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    let handle = thread::Builder::new()
        .name("udp-client".to_string())
        .spawn(move || {
            let mut accumulator = Accumulator::new(initial_size, &log);
            let mut events = mio::Events::with_capacity(64);
            let mut scratch = vec![0u8; datagram_size];

            while !stop_flag.load(Ordering::Acquire) {
                if poll.poll(&mut events, Some(poll_timeout(false))).is_err() {
                    break;
                }

                for event in &events {
                    if !event.readiness().is_readable() {
                        continue;
                    }

                    loop {
                        match socket.recv_from(&mut scratch) {
                            Ok((count, from)) => {
                                if from != server {
                                    logging::debug!(log, "datagram from unexpected source, dropped";
                                                    "context" => "udp-client",
                                                    "address" => %from);
                                    continue;
                                }

                                accumulator.push(&scratch[..count], &adapter, &wire);
                            }
                            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                            Err(err) => {
                                logging::debug!(log, "datagram receive failed";
                                                "context" => "udp-client",
                                                "error" => ?err);
                                break;
                            }
                        }
                    }
                }

                if connection.state() == ConnectionState::Closed {
                    break;
                }
            }

            logging::debug!(log, "udp client stopped"; "context" => "udp-client");
        })
        .expect("Endpoint thread spawn failed");

    Ok(Service::new("udp-client".to_string(), stop, handle))
}
