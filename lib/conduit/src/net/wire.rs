use crate::net::packet::{Packet, PacketRegistry};
use crate::net::stream::ByteReader;
use crate::net::support::{CheckId, NetResult};
use crate::net::zip::Inflater;
use crate::task::Executor;
use keel::logging;
use std::sync::{Arc, Mutex};

/// Sign bit of the body-length field, marking a compressed body.
pub const COMPRESSED_FLAG: u32 = 0x8000_0000;

/// The fixed catalogue of framing variants. Every frame on the wire starts
/// with the 4-byte ASCII tag of its format, followed by a format-specific
/// payload.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum WireFormat {
    /// Length-prefixed application packet.
    Packet,
    /// Liveness check request carrying a correlation id.
    Check,
    /// Liveness check reply carrying the correlated id.
    CheckReply,
    /// Datagram login signal, sent by a connecting UDP client.
    UdpLogin,
    /// Datagram logout signal, the graceful UDP goodbye.
    UdpLogout,
    /// Server info query, connectionless.
    InfoRequest,
    /// Server info answer, shaped like a packet frame.
    InfoAnswer,
    /// Connection admission notice sent by the server.
    ConnectionAccepted,
}

const CATALOGUE: [WireFormat; 8] = [
    WireFormat::Packet,
    WireFormat::Check,
    WireFormat::CheckReply,
    WireFormat::UdpLogin,
    WireFormat::UdpLogout,
    WireFormat::InfoRequest,
    WireFormat::InfoAnswer,
    WireFormat::ConnectionAccepted,
];

impl WireFormat {
    #[inline]
    pub fn tag_bytes(self) -> [u8; 4] {
        match self {
            WireFormat::Packet => *b"PACK",
            WireFormat::Check => *b"CHCK",
            WireFormat::CheckReply => *b"CHRP",
            WireFormat::UdpLogin => *b"HELO",
            WireFormat::UdpLogout => *b"BYEX",
            WireFormat::InfoRequest => *b"SIRQ",
            WireFormat::InfoAnswer => *b"SIAN",
            WireFormat::ConnectionAccepted => *b"CACC",
        }
    }

    #[inline]
    pub fn tag(self) -> u32 {
        u32::from_le_bytes(self.tag_bytes())
    }

    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            WireFormat::Packet => "packet",
            WireFormat::Check => "check",
            WireFormat::CheckReply => "check-reply",
            WireFormat::UdpLogin => "udp-login",
            WireFormat::UdpLogout => "udp-logout",
            WireFormat::InfoRequest => "info-request",
            WireFormat::InfoAnswer => "info-answer",
            WireFormat::ConnectionAccepted => "connection-accepted",
        }
    }

    /// Resolve a format by its 32-bit tag.
    #[inline]
    pub fn from_tag(tag: u32) -> Option<WireFormat> {
        CATALOGUE.iter().copied().find(|format| format.tag() == tag)
    }

    /// True only for the packet-bearing formats.
    #[inline]
    pub fn supports_compression(self) -> bool {
        match self {
            WireFormat::Packet | WireFormat::InfoAnswer => true,
            _ => false,
        }
    }

    /// Given the payload bytes accumulated so far, returns how many more
    /// are needed: positive to request more, zero when exactly complete,
    /// negative when the accumulated run is invalid for this format.
    pub fn receive_more(self, partial: &[u8]) -> i32 {
        let accumulated = partial.len() as i32;

        match self {
            WireFormat::Packet | WireFormat::InfoAnswer => {
                if accumulated < 8 {
                    return 8 - accumulated;
                }

                let raw_len = i32::from_le_bytes([partial[4], partial[5], partial[6], partial[7]]);
                let body_len = (raw_len as u32 & !COMPRESSED_FLAG) as i32;

                (8 + body_len) - accumulated
            }
            WireFormat::Check | WireFormat::CheckReply => 4 - accumulated,
            _ => -accumulated,
        }
    }

    /// Parse a complete payload into a frame. `None` drops the frame
    /// silently; the caller resets regardless.
    pub fn decode(self, context: &WireContext, complete: &[u8]) -> Option<Frame> {
        match self {
            WireFormat::Packet => Self::decode_packet(context, complete).map(Frame::Packet),
            WireFormat::InfoAnswer => Self::decode_packet(context, complete).map(Frame::InfoAnswer),
            WireFormat::Check => Self::decode_check(complete).map(Frame::Check),
            WireFormat::CheckReply => Self::decode_check(complete).map(Frame::CheckReply),
            WireFormat::UdpLogin => Some(Frame::UdpLogin),
            WireFormat::UdpLogout => Some(Frame::UdpLogout),
            WireFormat::InfoRequest => Some(Frame::InfoRequest),
            WireFormat::ConnectionAccepted => Some(Frame::ConnectionAccepted),
        }
    }

    fn decode_packet(context: &WireContext, complete: &[u8]) -> Option<Box<dyn Packet>> {
        let mut reader = ByteReader::new(complete);

        let tag = reader.read_int().ok()? as u32;
        let raw_len = reader.read_int().ok()?;

        let body = if (raw_len as u32) & COMPRESSED_FLAG != 0 {
            let packed_len = (raw_len as u32 & !COMPRESSED_FLAG) as usize;
            let packed = reader.read_bytes(packed_len).ok()?;

            match context.inflate(&packed) {
                Ok(body) => body,
                Err(err) => {
                    logging::debug!(context.log, "dropping frame with corrupt compressed body";
                                    "context" => "decode",
                                    "packet_tag" => tag,
                                    "error" => ?err);
                    return None;
                }
            }
        } else {
            reader.read_bytes(raw_len as usize).ok()?
        };

        let mut packet = match context.registry.create(tag) {
            Some(packet) => packet,
            None => {
                logging::error!(context.log, "no packet type registered for tag";
                                "context" => "decode",
                                "packet_tag" => tag);
                return None;
            }
        };

        let mut body_reader = ByteReader::new(&body);

        if let Err(err) = packet.read_from(&mut body_reader) {
            logging::debug!(context.log, "packet body failed to parse";
                            "context" => "decode",
                            "packet_tag" => tag,
                            "error" => ?err);
            return None;
        }

        Some(packet)
    }

    #[inline]
    fn decode_check(complete: &[u8]) -> Option<CheckId> {
        let mut reader = ByteReader::new(complete);
        reader.read_int().ok()
    }
}

/// A decoded wire frame, one variant per format.
pub enum Frame {
    Packet(Box<dyn Packet>),
    Check(CheckId),
    CheckReply(CheckId),
    UdpLogin,
    UdpLogout,
    InfoRequest,
    InfoAnswer(Box<dyn Packet>),
    ConnectionAccepted,
}

impl Frame {
    #[inline]
    pub fn format(&self) -> WireFormat {
        match self {
            Frame::Packet(_) => WireFormat::Packet,
            Frame::Check(_) => WireFormat::Check,
            Frame::CheckReply(_) => WireFormat::CheckReply,
            Frame::UdpLogin => WireFormat::UdpLogin,
            Frame::UdpLogout => WireFormat::UdpLogout,
            Frame::InfoRequest => WireFormat::InfoRequest,
            Frame::InfoAnswer(_) => WireFormat::InfoAnswer,
            Frame::ConnectionAccepted => WireFormat::ConnectionAccepted,
        }
    }
}

/// Shared decode-side facilities: the packet registry, the lazily acquired
/// inflater and the optional decode worker. One context is shared by all
/// accumulators of a manager.
pub struct WireContext {
    pub registry: Arc<PacketRegistry>,
    pub buffer_initial: usize,
    pub decode_executor: Option<Arc<dyn Executor>>,
    inflater: Mutex<Option<Inflater>>,
    pub log: logging::Logger,
}

impl WireContext {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        registry: Arc<PacketRegistry>,
        buffer_initial: usize,
        decode_executor: Option<Arc<dyn Executor>>,
        log: L,
    ) -> WireContext {
        let context_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        WireContext {
            registry,
            buffer_initial,
            decode_executor,
            inflater: Mutex::new(None),
            log: context_log,
        }
    }

    /// Inflate a compressed body, acquiring the inflater on first use.
    pub fn inflate(&self, packed: &[u8]) -> NetResult<Vec<u8>> {
        let mut slot = self.inflater.lock().expect("Inflater lock poisoned");
        slot.get_or_insert_with(Inflater::new).decompress(packed)
    }

    /// Drop the inflater state. Called on manager shutdown.
    pub fn release(&self) {
        self.inflater.lock().expect("Inflater lock poisoned").take();
    }
}
