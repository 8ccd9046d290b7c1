use std::io;
use std::net;

pub type NetResult<T> = Result<T, NetError>;

/// Correlation identifier carried by liveness check frames.
pub type CheckId = i32;

/// Which end of a connection this process plays.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Side {
    Client,
    Server,
}

#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    InvalidState,
    InvalidArgument,
    FeatureMismatch,
    DuplicateRegistration,
    RegistryLocked,
    UnknownFormat,
    UnknownPacket,
    InvalidFrame,
    CheckTimeout,
    QueueOverflow,
    Capacity,
    Serialization,
    Compression,
    NotCancellable,
    Closed,
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            kind => NetError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetError::Wait) => false,
            _ => true,
        }
    }
}
