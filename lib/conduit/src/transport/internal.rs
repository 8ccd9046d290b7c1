use crate::manager::NetworkManager;
use crate::net::accumulator::{Accumulator, AdapterRef};
use crate::net::connection::ConnectionChannel;
use crate::net::support::{ErrorType, NetError, NetResult};
use crate::net::wire::WireContext;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::sync::{Arc, Mutex, Weak};

lazy_static! {
    static ref DEFAULT_SWITCH: Arc<InternalSwitch> = Arc::new(InternalSwitch::new());
}

/// The process-wide default switch. Managers accept an explicit switch as a
/// collaborator; this accessor exists for the common single-switch case.
#[inline]
pub fn default_switch() -> Arc<InternalSwitch> {
    DEFAULT_SWITCH.clone()
}

/// Registry of in-process server managers, keyed by their internal label.
/// Connecting through the switch wires twin connections whose channels feed
/// the peer accumulator synchronously on the caller's thread.
pub struct InternalSwitch {
    servers: Mutex<HashMap<String, Weak<NetworkManager>>>,
}

impl InternalSwitch {
    #[inline]
    pub fn new() -> InternalSwitch {
        InternalSwitch {
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a server manager under its label. Duplicate labels are
    /// rejected.
    pub fn register(&self, label: &str, manager: Weak<NetworkManager>) -> NetResult<()> {
        let mut servers = self.servers.lock().expect("Switch lock poisoned");

        if let Some(existing) = servers.get(label) {
            if existing.upgrade().is_some() {
                return Err(NetError::Fatal(ErrorType::DuplicateRegistration));
            }
        }

        servers.insert(label.to_string(), manager);
        Ok(())
    }

    pub fn unregister(&self, label: &str) {
        self.servers
            .lock()
            .expect("Switch lock poisoned")
            .remove(label);
    }

    /// Look up a live server manager by label.
    pub fn lookup(&self, label: &str) -> Option<Arc<NetworkManager>> {
        self.servers
            .lock()
            .expect("Switch lock poisoned")
            .get(label)
            .and_then(Weak::upgrade)
    }
}

/// The receiving half an internal channel writes into: the peer's
/// accumulator together with its adapter and decode context.
pub struct InternalPeer {
    pub accumulator: Arc<Mutex<Accumulator>>,
    pub adapter: AdapterRef,
    pub context: Arc<WireContext>,
}

/// In-process transport channel. Delivery pushes the encoded bytes
/// straight into the twin's accumulator on the caller's thread, making the
/// transport lossless and ordered by construction.
pub struct InternalChannel {
    label: String,
    peer: Mutex<Option<InternalPeer>>,
}

impl InternalChannel {
    #[inline]
    pub fn new(label: String) -> Arc<InternalChannel> {
        Arc::new(InternalChannel {
            label,
            peer: Mutex::new(None),
        })
    }

    /// Wire the twin side. Called once during connection setup.
    pub fn connect_peer(&self, peer: InternalPeer) {
        *self.peer.lock().expect("Channel lock poisoned") = Some(peer);
    }
}

impl ConnectionChannel for InternalChannel {
    fn deliver(&self, bytes: &[u8]) -> NetResult<()> {
        let peer = self.peer.lock().expect("Channel lock poisoned");

        match peer.as_ref() {
            Some(peer) => {
                peer.accumulator
                    .lock()
                    .expect("Accumulator lock poisoned")
                    .push(bytes, &peer.adapter, &peer.context);
                Ok(())
            }
            None => Err(NetError::Fatal(ErrorType::Closed)),
        }
    }

    /// The internal goodbye travels in-band so the twin observes a
    /// peer-initiated closure.
    fn goodbye(&self) {
        drop(self.deliver(b"BYEX"));
    }

    fn describe(&self) -> String {
        format!("internal:{}", self.label)
    }
}
