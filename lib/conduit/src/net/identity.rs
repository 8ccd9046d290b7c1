use crate::net::support::{ErrorType, NetError, NetResult};
use std::fmt;
use std::net::SocketAddr;
use std::ops;

/// Capability bits carried by a `NetworkId`. Connection and server types
/// are validated against these at resolution time.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Features(u8);

impl Features {
    pub const NONE: Features = Features(0);
    /// In-process endpoints.
    pub const INTERNAL: Features = Features(1);
    /// Endpoints reachable through a socket address.
    pub const NETWORK: Features = Features(1 << 1);
    /// The address is local and may be bound.
    pub const BIND: Features = Features(1 << 2);
    /// The address is remote and may be connected to.
    pub const CONNECT: Features = Features(1 << 3);

    #[inline]
    pub fn contains(self, other: Features) -> bool {
        self.0 & other.0 == other.0
    }
}

impl ops::BitOr for Features {
    type Output = Features;

    #[inline]
    fn bitor(self, rhs: Features) -> Features {
        Features(self.0 | rhs.0)
    }
}

/// Names one peer of the runtime: a unique label, the feature set the id
/// supports and an optional socket address for network-reachable peers.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct NetworkId {
    label: String,
    features: Features,
    address: Option<SocketAddr>,
}

impl NetworkId {
    /// An in-process endpoint, addressable by label only.
    #[inline]
    pub fn internal<S: Into<String>>(label: S) -> NetworkId {
        NetworkId {
            label: label.into(),
            features: Features::INTERNAL,
            address: None,
        }
    }

    /// A local endpoint address for servers to bind.
    #[inline]
    pub fn bind<S: Into<String>>(label: S, address: SocketAddr) -> NetworkId {
        NetworkId {
            label: label.into(),
            features: Features::NETWORK | Features::BIND,
            address: Some(address),
        }
    }

    /// A remote endpoint address for clients to connect to.
    #[inline]
    pub fn connect<S: Into<String>>(label: S, address: SocketAddr) -> NetworkId {
        NetworkId {
            label: label.into(),
            features: Features::NETWORK | Features::CONNECT,
            address: Some(address),
        }
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[inline]
    pub fn features(&self) -> Features {
        self.features
    }

    #[inline]
    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// The socket address, or a typed precondition error for ids without
    /// one.
    #[inline]
    pub fn require_address(&self) -> NetResult<SocketAddr> {
        self.address
            .ok_or(NetError::Fatal(ErrorType::InvalidArgument))
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.address {
            Some(address) => write!(f, "{}@{}", self.label, address),
            None => write!(f, "{}", self.label),
        }
    }
}

/// How a client-side connection reaches its remote peer. `Default` defers
/// the choice to the remote id's features.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionType {
    Default,
    Internal,
    Tcp,
    Udp,
}

impl ConnectionType {
    /// Validate this type against the remote id, inferring a concrete type
    /// for `Default`. A feature mismatch is a typed precondition error.
    pub fn resolve(self, remote: &NetworkId) -> NetResult<ConnectionType> {
        match self {
            ConnectionType::Default => {
                if remote.features().contains(Features::INTERNAL) {
                    Ok(ConnectionType::Internal)
                } else if remote.features().contains(Features::NETWORK | Features::CONNECT) {
                    Ok(ConnectionType::Tcp)
                } else {
                    Err(NetError::Fatal(ErrorType::FeatureMismatch))
                }
            }
            ConnectionType::Internal => {
                if remote.features().contains(Features::INTERNAL) {
                    Ok(self)
                } else {
                    Err(NetError::Fatal(ErrorType::FeatureMismatch))
                }
            }
            ConnectionType::Tcp | ConnectionType::Udp => {
                if remote.features().contains(Features::NETWORK | Features::CONNECT) {
                    remote.require_address()?;
                    Ok(self)
                } else {
                    Err(NetError::Fatal(ErrorType::FeatureMismatch))
                }
            }
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ServerKind {
    Internal,
    Tcp,
    Udp,
    Combined,
}

/// Which transports a server endpoint runs, with a blocking or selector
/// driven IO variant. Both variants are served by the same endpoints; the
/// flag selects the poll timeout strategy.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ServerType {
    pub kind: ServerKind,
    pub blocking: bool,
}

impl ServerType {
    pub const INTERNAL: ServerType = ServerType {
        kind: ServerKind::Internal,
        blocking: false,
    };
    pub const TCP: ServerType = ServerType {
        kind: ServerKind::Tcp,
        blocking: false,
    };
    pub const TCP_BLOCKING: ServerType = ServerType {
        kind: ServerKind::Tcp,
        blocking: true,
    };
    pub const UDP: ServerType = ServerType {
        kind: ServerKind::Udp,
        blocking: false,
    };
    pub const UDP_BLOCKING: ServerType = ServerType {
        kind: ServerKind::Udp,
        blocking: true,
    };
    pub const COMBINED: ServerType = ServerType {
        kind: ServerKind::Combined,
        blocking: false,
    };
    pub const COMBINED_BLOCKING: ServerType = ServerType {
        kind: ServerKind::Combined,
        blocking: true,
    };

    /// Validate this server type against the local id it should serve.
    pub fn resolve(self, local: &NetworkId) -> NetResult<()> {
        let required = match self.kind {
            ServerKind::Internal => Features::INTERNAL,
            _ => Features::NETWORK | Features::BIND,
        };

        if local.features().contains(required) {
            Ok(())
        } else {
            Err(NetError::Fatal(ErrorType::FeatureMismatch))
        }
    }

    #[inline]
    pub fn serves_tcp(self) -> bool {
        match self.kind {
            ServerKind::Tcp | ServerKind::Combined => true,
            _ => false,
        }
    }

    #[inline]
    pub fn serves_udp(self) -> bool {
        match self.kind {
            ServerKind::Udp | ServerKind::Combined => true,
            _ => false,
        }
    }

    #[inline]
    pub fn serves_internal(self) -> bool {
        match self.kind {
            ServerKind::Internal => true,
            _ => false,
        }
    }
}
