use crate::manager::NetworkManager;
use crate::net::accumulator::{Accumulator, AdapterRef};
use crate::net::buffer::Buffer;
use crate::net::connection::{CloseReason, Connection, ConnectionChannel, ConnectionState};
use crate::net::identity::NetworkId;
use crate::net::support::NetResult;
use crate::net::wire::WireContext;
use crate::transport::Service;
use indexmap::IndexSet;
use keel::logging;
use mio::net::{TcpListener, TcpStream};
use std::io;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

const SERVER_TOKEN: mio::Token = mio::Token(0);
const SCRATCH_SIZE: usize = 65536;

/// Stream channel: sends are buffered under a mutex and flushed by the
/// endpoint service on every tick and on writable readiness.
pub struct TcpChannel {
    write: Arc<Mutex<Buffer>>,
    peer: SocketAddr,
}

impl TcpChannel {
    pub fn new(
        initial_size: usize,
        peer: SocketAddr,
    ) -> (Arc<dyn ConnectionChannel>, Arc<Mutex<Buffer>>) {
        let write = Arc::new(Mutex::new(Buffer::new(initial_size)));

        (
            Arc::new(TcpChannel {
                write: write.clone(),
                peer,
            }),
            write,
        )
    }
}

impl ConnectionChannel for TcpChannel {
    fn deliver(&self, bytes: &[u8]) -> NetResult<()> {
        self.write.lock().expect("Write lock poisoned").extend(bytes);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("tcp:{}", self.peer)
    }
}

struct TcpPeer {
    stream: TcpStream,
    connection: Arc<Connection>,
    adapter: AdapterRef,
    accumulator: Accumulator,
    write: Arc<Mutex<Buffer>>,
}

impl TcpPeer {
    /// Drain the stream into the accumulator. Returns false once the peer
    /// is gone and the slot should be reclaimed.
    fn service_read(&mut self, scratch: &mut [u8], wire: &Arc<WireContext>) -> bool {
        loop {
            match self.stream.read(scratch) {
                Ok(0) => {
                    self.connection.close(CloseReason::Remote);
                    return false;
                }
                Ok(count) => {
                    self.accumulator.push(&scratch[..count], &self.adapter, wire);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return true,
                Err(err) => {
                    self.connection.close(CloseReason::Transport(err.kind()));
                    return false;
                }
            }
        }
    }

    /// Flush buffered writes. Returns false on a fatal transport error.
    fn service_write(&mut self) -> bool {
        let mut buffer = self.write.lock().expect("Write lock poisoned");

        match buffer.egress(&mut self.stream) {
            Ok(_) => true,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => true,
            Err(err) => {
                self.connection.close(CloseReason::Transport(err.kind()));
                false
            }
        }
    }
}

fn poll_timeout(blocking: bool) -> Duration {
    // The blocking variant parks longer in the selector; the stop flag
    // bounds both.
    match blocking {
        true => Duration::from_millis(500),
        false => Duration::from_millis(50),
    }
}

/// Listener endpoint: accepts streams, admits connections on the manager
/// and pumps all peer IO on one service thread.
pub fn start_server(
    manager: &NetworkManager,
    address: SocketAddr,
    blocking: bool,
) -> NetResult<Service> {
    let listener = TcpListener::bind(&address)?;

    let poll = mio::Poll::new()?;
    poll.register(
        &listener,
        SERVER_TOKEN,
        mio::Ready::readable(),
        mio::PollOpt::edge(),
    )?;

    let weak = manager.weak_ref();
    let wire = manager.wire_context().clone();
    let initial_size = manager.config().packet_buffer_initial_size;
    let log = manager.log().new(logging::o!());

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    logging::debug!(log, "tcp server listening";
                    "context" => "tcp-server",
                    "address" => %address);

    let handle = thread::Builder::new()
        .name("tcp-server".to_string())
        .spawn(move || {
            run_server(listener, poll, weak, wire, initial_size, blocking, stop_flag, log);
        })
        .expect("Endpoint thread spawn failed");

    Ok(Service::new("tcp-server".to_string(), stop, handle))
}

fn run_server(
    listener: TcpListener,
    poll: mio::Poll,
    weak: Weak<NetworkManager>,
    wire: Arc<WireContext>,
    initial_size: usize,
    blocking: bool,
    stop: Arc<AtomicBool>,
    log: logging::Logger,
) {
    let mut peers: Vec<Option<TcpPeer>> = Vec::new();
    let mut free: Vec<usize> = Vec::new();
    let mut live: IndexSet<usize> = IndexSet::new();
    let mut events = mio::Events::with_capacity(1024);
    let mut scratch = vec![0u8; SCRATCH_SIZE];
    let timeout = poll_timeout(blocking);

    while !stop.load(Ordering::Acquire) {
        if poll.poll(&mut events, Some(timeout)).is_err() {
            break;
        }

        let manager = match weak.upgrade() {
            Some(manager) => manager,
            None => break,
        };

        for event in &events {
            let token = event.token();

            if token == SERVER_TOKEN {
                accept_pending(
                    &listener, &poll, &manager, &mut peers, &mut free, &mut live, initial_size,
                    &log,
                );
                continue;
            }

            let index = usize::from(token) - 1;

            let retain = match peers.get_mut(index).and_then(Option::as_mut) {
                Some(peer) => {
                    let mut retain = true;

                    if event.readiness().is_readable() {
                        retain = peer.service_read(&mut scratch, &wire);
                    }

                    if retain && event.readiness().is_writable() {
                        retain = peer.service_write();
                    }

                    retain
                }
                None => continue,
            };

            if !retain {
                reclaim(&poll, &mut peers, &mut free, &mut live, index, &log);
            }
        }

        // Flush buffered egress and sweep closed connections every tick.
        let snapshot: Vec<usize> = live.iter().copied().collect();

        for index in snapshot {
            let retain = match peers[index].as_mut() {
                Some(peer) => {
                    if peer.connection.state() == ConnectionState::Closed {
                        drop(peer.service_write());
                        false
                    } else {
                        peer.service_write()
                    }
                }
                None => continue,
            };

            if !retain {
                reclaim(&poll, &mut peers, &mut free, &mut live, index, &log);
            }
        }
    }

    logging::debug!(log, "tcp server stopped"; "context" => "tcp-server");
}

fn accept_pending(
    listener: &TcpListener,
    poll: &mio::Poll,
    manager: &Arc<NetworkManager>,
    peers: &mut Vec<Option<TcpPeer>>,
    free: &mut Vec<usize>,
    live: &mut IndexSet<usize>,
    initial_size: usize,
    log: &logging::Logger,
) {
    loop {
        match listener.accept() {
            Ok((stream, address)) => {
                let remote = NetworkId::connect(format!("tcp-{}", address), address);
                let (channel, write) = TcpChannel::new(initial_size, address);
                let connection = manager.admit_stream_peer(remote, channel);
                let adapter = manager.connection_adapter(&connection);

                let index = match free.pop() {
                    Some(index) => index,
                    None => {
                        peers.push(None);
                        peers.len() - 1
                    }
                };

                if poll
                    .register(
                        &stream,
                        mio::Token(index + 1),
                        mio::Ready::readable() | mio::Ready::writable(),
                        mio::PollOpt::edge(),
                    )
                    .is_err()
                {
                    logging::error!(log, "stream registration failed, dropping peer";
                                    "context" => "tcp-server",
                                    "address" => %address);
                    connection.close(CloseReason::Transport(io::ErrorKind::Other));
                    free.push(index);
                    continue;
                }

                logging::debug!(log, "stream peer admitted";
                                "context" => "tcp-server",
                                "address" => %address);

                peers[index] = Some(TcpPeer {
                    stream,
                    connection,
                    adapter,
                    accumulator: Accumulator::new(initial_size, log),
                    write,
                });
                live.insert(index);
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => {
                logging::error!(log, "accept failed";
                                "context" => "tcp-server",
                                "error" => ?err);
                break;
            }
        }
    }
}

fn reclaim(
    poll: &mio::Poll,
    peers: &mut Vec<Option<TcpPeer>>,
    free: &mut Vec<usize>,
    live: &mut IndexSet<usize>,
    index: usize,
    log: &logging::Logger,
) {
    if let Some(peer) = peers[index].take() {
        drop(poll.deregister(&peer.stream));
        live.swap_remove(&index);
        free.push(index);

        logging::debug!(log, "stream peer reclaimed";
                        "context" => "tcp-server",
                        "remote" => %peer.connection.remote());
    }
}

/// Client endpoint: a single stream pumped on its own service thread. The
/// first writable readiness after the connect completes confirms the
/// connection.
pub fn start_client(
    manager: &NetworkManager,
    connection: Arc<Connection>,
    adapter: AdapterRef,
    address: SocketAddr,
    write: Arc<Mutex<Buffer>>,
) -> NetResult<Service> {
    let stream = TcpStream::connect(&address)?;

    let poll = mio::Poll::new()?;
    poll.register(
        &stream,
        mio::Token(0),
        mio::Ready::readable() | mio::Ready::writable(),
        mio::PollOpt::edge(),
    )?;

    let weak = manager.weak_ref();
    let wire = manager.wire_context().clone();
    let initial_size = manager.config().packet_buffer_initial_size;
    let log = manager.log().new(logging::o!());

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    let handle = thread::Builder::new()
        .name("tcp-client".to_string())
        .spawn(move || {
            let mut peer = TcpPeer {
                stream,
                connection,
                adapter,
                accumulator: Accumulator::new(initial_size, &log),
                write,
            };

            let mut events = mio::Events::with_capacity(64);
            let mut scratch = vec![0u8; SCRATCH_SIZE];
            let mut confirmed = false;

            while !stop_flag.load(Ordering::Acquire) {
                if poll.poll(&mut events, Some(poll_timeout(false))).is_err() {
                    break;
                }

                let manager = match weak.upgrade() {
                    Some(manager) => manager,
                    None => break,
                };

                let mut alive = true;

                for event in &events {
                    if event.readiness().is_writable() && !confirmed {
                        // The three-way handshake has completed once the
                        // socket reports a peer.
                        if peer.stream.peer_addr().is_ok() {
                            confirmed = true;

                            if peer.connection.confirm_open() {
                                manager.notify_opened(&peer.connection);
                            }
                        }
                    }

                    if event.readiness().is_readable() {
                        alive = peer.service_read(&mut scratch, &wire);

                        if !alive {
                            break;
                        }
                    }
                }

                if alive && confirmed {
                    alive = peer.service_write();
                }

                if !alive || peer.connection.state() == ConnectionState::Closed {
                    drop(peer.service_write());
                    break;
                }
            }

            logging::debug!(log, "tcp client stopped"; "context" => "tcp-client");
        })
        .expect("Endpoint thread spawn failed");

    Ok(Service::new("tcp-client".to_string(), stop, handle))
}
