use crate::net::encode::Encoder;
use crate::net::identity::NetworkId;
use crate::net::packet::Packet;
use crate::net::support::{CheckId, ErrorType, NetError, NetResult, Side};
use crate::net::wire::Frame;
use crate::task::Executor;
use keel::logging;
use keel::time::timestamp_millis;
use std::any::Any;
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Process-wide source of check correlation ids; monotonically increasing
/// across all connections.
static NEXT_CHECK_ID: AtomicI32 = AtomicI32::new(1);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Initialized,
    Opening,
    Open,
    Checking,
    Closing,
    Closed,
}

/// Why a connection reached its terminal state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloseReason {
    /// Closed by the local side.
    Local,
    /// Closed by the remote peer.
    Remote,
    /// A liveness check exceeded its deadline.
    CheckTimeout,
    /// The underlying transport failed.
    Transport(io::ErrorKind),
}

/// The transport seam a connection writes through. Implementations buffer
/// or transmit the supplied wire bytes; `goodbye` performs the transport's
/// farewell on graceful local closure.
pub trait ConnectionChannel: Send + Sync {
    fn deliver(&self, bytes: &[u8]) -> NetResult<()>;

    fn goodbye(&self) {}

    /// Ask the remote endpoint for its server info. Only datagram
    /// transports carry the info path.
    fn info_request(&self) -> NetResult<()> {
        Err(NetError::Fatal(ErrorType::InvalidState))
    }

    fn describe(&self) -> String;
}

struct StateCell {
    state: ConnectionState,
    /// Packets accepted while opening; flushed on confirmation, never lost.
    queued: Vec<Box<dyn Packet>>,
}

struct CheckState {
    /// Correlation id of the outstanding check, -1 when idle.
    pending_id: CheckId,
    /// Wall-clock start of the outstanding check, milliseconds.
    started_at: u64,
    /// Last measured round trip in milliseconds, -1 before the first.
    last_round_trip: i32,
}

type CloseNotice = Box<dyn Fn(CloseReason) + Send + Sync>;

/// One logical connection to a remote peer: lifecycle state machine,
/// liveness checks with correlation ids, send gating by state and the link
/// to the transport channel. The state cell and the check sub-state are
/// guarded by separate monitors so checks do not contend with data sends.
pub struct Connection {
    local: NetworkId,
    remote: NetworkId,
    side: Side,
    check_timeout: i32,
    channel: Arc<dyn ConnectionChannel>,
    encoder: Mutex<Encoder>,
    encode_executor: Option<Arc<dyn Executor>>,
    state: Mutex<StateCell>,
    check: Mutex<CheckState>,
    custom: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    on_closed: Mutex<Option<CloseNotice>>,
    weak: Weak<Connection>,
    log: logging::Logger,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("side", &self.side)
            .finish()
    }
}

impl Connection {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        local: NetworkId,
        remote: NetworkId,
        side: Side,
        check_timeout: i32,
        channel: Arc<dyn ConnectionChannel>,
        encoder: Encoder,
        encode_executor: Option<Arc<dyn Executor>>,
        log: L,
    ) -> Arc<Connection> {
        let connection_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        Arc::new_cyclic(|weak| Connection {
            local,
            remote,
            side,
            check_timeout,
            channel,
            encoder: Mutex::new(encoder),
            encode_executor,
            state: Mutex::new(StateCell {
                state: ConnectionState::Initialized,
                queued: Vec::new(),
            }),
            check: Mutex::new(CheckState {
                pending_id: -1,
                started_at: 0,
                last_round_trip: -1,
            }),
            custom: Mutex::new(None),
            on_closed: Mutex::new(None),
            weak: weak.clone(),
            log: connection_log,
        })
    }

    #[inline]
    pub fn local(&self) -> &NetworkId {
        &self.local
    }

    #[inline]
    pub fn remote(&self) -> &NetworkId {
        &self.remote
    }

    #[inline]
    pub fn side(&self) -> Side {
        self.side
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state.lock().expect("State lock poisoned").state
    }

    /// The last measured round trip in milliseconds, -1 before any check
    /// completed.
    #[inline]
    pub fn round_trip(&self) -> i32 {
        self.check.lock().expect("Check lock poisoned").last_round_trip
    }

    /// The user-supplied opaque blob delivered to packet handlers.
    #[inline]
    pub fn custom(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.custom.lock().expect("Custom lock poisoned").clone()
    }

    #[inline]
    pub fn set_custom(&self, value: Arc<dyn Any + Send + Sync>) {
        *self.custom.lock().expect("Custom lock poisoned") = Some(value);
    }

    #[inline]
    pub(crate) fn channel(&self) -> &Arc<dyn ConnectionChannel> {
        &self.channel
    }

    /// Install the exactly-once closure notice. Owned by the manager.
    pub(crate) fn set_close_notice(&self, notice: CloseNotice) {
        *self.on_closed.lock().expect("Notice lock poisoned") = Some(notice);
    }

    /// Begin opening. Only one `open` can start; any state but
    /// `Initialized` is a precondition error.
    pub fn open(&self) -> NetResult<()> {
        let mut cell = self.state.lock().expect("State lock poisoned");

        if cell.state != ConnectionState::Initialized {
            return Err(NetError::Fatal(ErrorType::InvalidState));
        }

        cell.state = ConnectionState::Opening;

        logging::debug!(self.log, "connection opening";
                        "context" => "open",
                        "remote" => %self.remote);

        Ok(())
    }

    /// Transport confirmation arrived; flush packets queued while opening.
    /// Returns true when the transition happened on this call.
    pub fn confirm_open(&self) -> bool {
        let queued = {
            let mut cell = self.state.lock().expect("State lock poisoned");

            if cell.state != ConnectionState::Opening {
                return false;
            }

            cell.state = ConnectionState::Open;
            std::mem::replace(&mut cell.queued, Vec::new())
        };

        logging::debug!(self.log, "connection open";
                        "context" => "open",
                        "remote" => %self.remote,
                        "queued" => queued.len());

        for packet in queued {
            self.submit(packet);
        }

        true
    }

    /// Attempt to send a packet. The return signals whether sending was
    /// attempted, not whether it succeeded: true in `Open` and `Checking`;
    /// in `Opening` the packet is queued internally and flushed on
    /// confirmation. All other states return false without any event.
    pub fn send(&self, packet: Box<dyn Packet>) -> bool {
        {
            let mut cell = self.state.lock().expect("State lock poisoned");

            match cell.state {
                ConnectionState::Open | ConnectionState::Checking => {}
                ConnectionState::Opening => {
                    cell.queued.push(packet);
                    return true;
                }
                _ => return false,
            }
        }

        self.submit(packet);
        true
    }

    /// Route the encode through the worker when one is configured.
    fn submit(&self, packet: Box<dyn Packet>) {
        match self.encode_executor {
            Some(ref executor) => {
                if let Some(connection) = self.weak.upgrade() {
                    executor.execute(Box::new(move || {
                        connection.encode_and_deliver(&Frame::Packet(packet));
                    }));
                }
            }
            None => self.encode_and_deliver(&Frame::Packet(packet)),
        }
    }

    fn encode_and_deliver(&self, frame: &Frame) {
        let encoded = {
            let mut encoder = self.encoder.lock().expect("Encoder lock poisoned");
            encoder.encode(frame)
        };

        let bytes = match encoded {
            Ok(bytes) => bytes,
            Err(err) => {
                logging::error!(self.log, "frame failed to encode";
                                "context" => "send",
                                "remote" => %self.remote,
                                "error" => ?err);
                return;
            }
        };

        match self.channel.deliver(&bytes) {
            Ok(_) | Err(NetError::Wait) => {}
            Err(NetError::Fatal(ErrorType::Io(kind))) => {
                self.close(CloseReason::Transport(kind));
            }
            Err(err) => {
                logging::error!(self.log, "transport rejected frame";
                                "context" => "send",
                                "remote" => %self.remote,
                                "error" => ?err);
                self.close(CloseReason::Transport(io::ErrorKind::Other));
            }
        }
    }

    /// Issue a liveness check. Assigns a fresh process-wide correlation id,
    /// records the start time and sends a check frame. An outstanding check
    /// is superseded with a log note.
    pub fn check(&self) -> NetResult<CheckId> {
        self.check_at(timestamp_millis())
    }

    fn check_at(&self, now: u64) -> NetResult<CheckId> {
        {
            let mut cell = self.state.lock().expect("State lock poisoned");

            match cell.state {
                ConnectionState::Open => cell.state = ConnectionState::Checking,
                ConnectionState::Checking => {}
                _ => return Err(NetError::Fatal(ErrorType::InvalidState)),
            }
        }

        let id = NEXT_CHECK_ID.fetch_add(1, Ordering::Relaxed);

        {
            let mut check = self.check.lock().expect("Check lock poisoned");

            if check.pending_id != -1 {
                logging::debug!(self.log, "superseding outstanding check";
                                "context" => "check",
                                "remote" => %self.remote,
                                "old_id" => check.pending_id,
                                "new_id" => id);
            }

            check.pending_id = id;
            check.started_at = now;
        }

        self.encode_and_deliver(&Frame::Check(id));

        Ok(id)
    }

    /// The peer asked for a liveness proof; answer with the same id.
    pub fn receive_check(&self, id: CheckId) {
        match self.state() {
            ConnectionState::Open | ConnectionState::Checking => {
                self.encode_and_deliver(&Frame::CheckReply(id));
            }
            state => {
                logging::debug!(self.log, "check received outside open state, dropped";
                                "context" => "check",
                                "remote" => %self.remote,
                                "state" => ?state);
            }
        }
    }

    /// A check reply arrived. Only the id of the most recent outstanding
    /// check updates the round trip; any other id is dropped with a note.
    pub fn receive_check_reply(&self, id: CheckId) {
        self.receive_check_reply_at(id, timestamp_millis());
    }

    fn receive_check_reply_at(&self, id: CheckId, now: u64) {
        {
            let mut check = self.check.lock().expect("Check lock poisoned");

            if check.pending_id != id {
                logging::debug!(self.log, "dropping mismatched check reply";
                                "context" => "check",
                                "remote" => %self.remote,
                                "pending_id" => check.pending_id,
                                "reply_id" => id);
                return;
            }

            check.last_round_trip = now.saturating_sub(check.started_at) as i32;
            check.pending_id = -1;

            logging::debug!(self.log, "check completed";
                            "context" => "check",
                            "remote" => %self.remote,
                            "check_id" => id,
                            "round_trip" => check.last_round_trip);
        }

        let mut cell = self.state.lock().expect("State lock poisoned");

        if cell.state == ConnectionState::Checking {
            cell.state = ConnectionState::Open;
        }
    }

    /// Periodic tick from the scheduler. Escalates an expired check
    /// deadline to closure.
    pub fn update(&self, now: u64) {
        if self.check_timeout < 0 || self.state() != ConnectionState::Checking {
            return;
        }

        let expired = {
            let check = self.check.lock().expect("Check lock poisoned");
            check.pending_id != -1
                && now.saturating_sub(check.started_at) > self.check_timeout as u64
        };

        if expired {
            logging::debug!(self.log, "check deadline expired, closing";
                            "context" => "update",
                            "remote" => %self.remote,
                            "timeout" => self.check_timeout);

            self.close(CloseReason::CheckTimeout);
        }
    }

    /// Transition to the terminal state and report the closure exactly
    /// once. Returns true when this call performed the close.
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut cell = self.state.lock().expect("State lock poisoned");

            match cell.state {
                ConnectionState::Closing | ConnectionState::Closed => return false,
                _ => {}
            }

            cell.state = ConnectionState::Closing;
            cell.queued.clear();
        }

        if reason == CloseReason::Local {
            self.channel.goodbye();
        }

        {
            let mut cell = self.state.lock().expect("State lock poisoned");
            cell.state = ConnectionState::Closed;
        }

        logging::debug!(self.log, "connection closed";
                        "context" => "close",
                        "remote" => %self.remote,
                        "reason" => ?reason);

        let notice = self.on_closed.lock().expect("Notice lock poisoned").take();

        if let Some(notice) = notice {
            notice(reason);
        }

        true
    }

    #[inline]
    pub fn describe(&self) -> String {
        format!("{} -> {} ({})", self.local, self.remote, self.channel.describe())
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;

    /// Channel that records every delivered byte run.
    pub struct MockChannel {
        pub delivered: Mutex<Vec<Vec<u8>>>,
        pub goodbyes: AtomicI32,
        pub fail_with: Mutex<Option<io::ErrorKind>>,
    }

    impl MockChannel {
        pub fn new() -> Arc<MockChannel> {
            Arc::new(MockChannel {
                delivered: Mutex::new(Vec::new()),
                goodbyes: AtomicI32::new(0),
                fail_with: Mutex::new(None),
            })
        }

        pub fn frames(&self) -> Vec<Vec<u8>> {
            self.delivered.lock().unwrap().clone()
        }
    }

    impl ConnectionChannel for MockChannel {
        fn deliver(&self, bytes: &[u8]) -> NetResult<()> {
            if let Some(kind) = *self.fail_with.lock().unwrap() {
                return Err(NetError::Fatal(ErrorType::Io(kind)));
            }

            self.delivered.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }

        fn goodbye(&self) {
            self.goodbyes.fetch_add(1, Ordering::SeqCst);
        }

        fn describe(&self) -> String {
            "mock".to_string()
        }
    }
}
