use crate::net::packet::{Packet, PacketRegistry};
use crate::net::stream::ByteWriter;
use crate::net::support::{ErrorType, NetError, NetResult};
use crate::net::wire::{Frame, WireFormat, COMPRESSED_FLAG};
use crate::net::zip::Deflater;
use keel::logging;
use std::sync::Arc;

/// The dual of the accumulator: takes a typed frame, produces the complete
/// wire bytes. Packet bodies are written through a fixed or growable
/// `ByteWriter` per the packet's declared size, deflated when the format is
/// compression-eligible and the body reaches the configured threshold, and
/// prefixed with the inner tag, length and outer format tag.
pub struct Encoder {
    registry: Arc<PacketRegistry>,
    buffer_initial: usize,
    compression_size: i32,
    deflater: Option<Deflater>,
    log: logging::Logger,
}

impl Encoder {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        registry: Arc<PacketRegistry>,
        buffer_initial: usize,
        compression_size: i32,
        log: L,
    ) -> Encoder {
        let encoder_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        Encoder {
            registry,
            buffer_initial,
            compression_size,
            deflater: None,
            log: encoder_log,
        }
    }

    /// Encode a frame into its complete wire representation, outer tag
    /// included.
    pub fn encode(&mut self, frame: &Frame) -> NetResult<Vec<u8>> {
        match frame {
            Frame::Packet(packet) => self.encode_packet(WireFormat::Packet, packet.as_ref()),
            Frame::InfoAnswer(packet) => self.encode_packet(WireFormat::InfoAnswer, packet.as_ref()),
            Frame::Check(id) => Ok(Self::encode_fixed_int(WireFormat::Check, *id)),
            Frame::CheckReply(id) => Ok(Self::encode_fixed_int(WireFormat::CheckReply, *id)),
            Frame::UdpLogin => Ok(WireFormat::UdpLogin.tag_bytes().to_vec()),
            Frame::UdpLogout => Ok(WireFormat::UdpLogout.tag_bytes().to_vec()),
            Frame::InfoRequest => Ok(WireFormat::InfoRequest.tag_bytes().to_vec()),
            Frame::ConnectionAccepted => Ok(WireFormat::ConnectionAccepted.tag_bytes().to_vec()),
        }
    }

    /// Encode a packet-bearing frame.
    pub fn encode_packet(&mut self, format: WireFormat, packet: &dyn Packet) -> NetResult<Vec<u8>> {
        let tag = match self.registry.tag_of(packet) {
            Some(tag) => tag,
            None => {
                logging::error!(self.log, "packet type not registered, cannot encode";
                                "context" => "encode");
                return Err(NetError::Fatal(ErrorType::UnknownPacket));
            }
        };

        let declared = packet.declared_size();

        let mut writer = if declared >= 0 {
            ByteWriter::fixed(declared as usize)
        } else {
            ByteWriter::growable(self.buffer_initial)
        };

        packet.write_to(&mut writer)?;
        let body = writer.finish();

        let compress = format.supports_compression()
            && self.compression_size >= 0
            && body.len() >= self.compression_size as usize;

        let (body, length_field) = if compress {
            let packed = self
                .deflater
                .get_or_insert_with(Deflater::new)
                .compress(&body)?;

            logging::trace!(self.log, "compressed packet body";
                            "context" => "encode",
                            "packet_tag" => tag,
                            "plain_size" => body.len(),
                            "packed_size" => packed.len());

            let length = packed.len() as u32 | COMPRESSED_FLAG;
            (packed, length)
        } else {
            let length = body.len() as u32;
            (body, length)
        };

        let mut out = Vec::with_capacity(12 + body.len());
        out.extend_from_slice(&format.tag_bytes());
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&length_field.to_le_bytes());
        out.extend_from_slice(&body);

        Ok(out)
    }

    #[inline]
    fn encode_fixed_int(format: WireFormat, value: i32) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&format.tag_bytes());
        out.extend_from_slice(&value.to_le_bytes());
        out
    }

    /// Drop the compressor state. Called on shutdown.
    #[inline]
    pub fn release(&mut self) {
        self.deflater.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::accumulator::testkit::{Received, RecordingAdapter};
    use crate::net::accumulator::{Accumulator, AdapterRef};
    use crate::net::packet::testkit::{Probe, Pulse};
    use crate::net::stream::ByteReader;
    use crate::net::wire::WireContext;
    use std::any::Any;

    /// Packet with wire body `de ad be`, matching the framing scenario in
    /// the protocol notes.
    #[derive(Default)]
    struct Tri;

    impl Packet for Tri {
        fn write_to(&self, writer: &mut ByteWriter) -> NetResult<()> {
            writer.write_bytes(&[0xde, 0xad, 0xbe])
        }

        fn read_from(&mut self, reader: &mut ByteReader) -> NetResult<()> {
            reader.read_bytes(3)?;
            Ok(())
        }

        fn declared_size(&self) -> i32 {
            3
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn registry() -> Arc<PacketRegistry> {
        let registry = Arc::new(PacketRegistry::new());
        registry.register::<Probe>(1).unwrap();
        registry.register::<Pulse>(2).unwrap();
        registry.register::<Tri>(7).unwrap();
        registry
    }

    #[test]
    fn test_empty_frame_bytes() {
        let mut encoder = Encoder::new(registry(), 64, -1, None);

        assert_eq!(encoder.encode(&Frame::UdpLogin).unwrap(), b"HELO");
        assert_eq!(encoder.encode(&Frame::UdpLogout).unwrap(), b"BYEX");
        assert_eq!(encoder.encode(&Frame::InfoRequest).unwrap(), b"SIRQ");
        assert_eq!(encoder.encode(&Frame::ConnectionAccepted).unwrap(), b"CACC");
    }

    #[test]
    fn test_check_frame_bytes() {
        let mut encoder = Encoder::new(registry(), 64, -1, None);

        let bytes = encoder.encode(&Frame::Check(0x1122_3344)).unwrap();

        assert_eq!(&bytes[..4], b"CHCK");
        assert_eq!(&bytes[4..], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn test_packet_frame_literal_layout() {
        let mut encoder = Encoder::new(registry(), 64, -1, None);

        let bytes = encoder
            .encode_packet(WireFormat::Packet, &Tri::default())
            .unwrap();

        let mut expected = b"PACK".to_vec();
        expected.extend(&[7, 0, 0, 0]);
        expected.extend(&[3, 0, 0, 0]);
        expected.extend(&[0xde, 0xad, 0xbe]);

        assert_eq!(bytes, expected);
        assert_eq!(bytes.len(), 4 + 4 + 4 + 3);
    }

    #[test]
    fn test_declared_size_frame_length() {
        let mut encoder = Encoder::new(registry(), 64, -1, None);

        let pulse = Pulse { tick: 99 };
        let bytes = encoder.encode_packet(WireFormat::Packet, &pulse).unwrap();

        assert_eq!(bytes.len(), 4 + 4 + 4 + pulse.declared_size() as usize);
    }

    #[test]
    fn test_unregistered_packet_rejected() {
        let registry = Arc::new(PacketRegistry::new());
        let mut encoder = Encoder::new(registry, 64, -1, None);

        let result = encoder.encode_packet(WireFormat::Packet, &Tri::default());

        assert_eq!(result.unwrap_err(), NetError::Fatal(ErrorType::UnknownPacket));
    }

    #[test]
    fn test_compressed_roundtrip_through_accumulator() {
        let registry = registry();
        let mut encoder = Encoder::new(registry.clone(), 64, 0, None);

        let probe = Probe {
            value: 1234,
            label: "z".repeat(500),
        };

        let bytes = encoder
            .encode_packet(WireFormat::Packet, &probe)
            .unwrap();

        // The length field carries the compression marker.
        let raw_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        assert_ne!(raw_len & COMPRESSED_FLAG, 0);
        assert!(bytes.len() < 12 + 500);

        let ctx = Arc::new(WireContext::new(registry, 64, None, None));
        let adapter = RecordingAdapter::new();
        let adapter_ref: AdapterRef = adapter.clone();
        let mut accumulator = Accumulator::new(64, None);

        accumulator.push(&bytes, &adapter_ref, &ctx);

        assert_eq!(
            adapter.snapshot(),
            vec![Received::Packet(1234, "z".repeat(500))]
        );
    }

    #[test]
    fn test_below_threshold_stays_plain() {
        let mut encoder = Encoder::new(registry(), 64, 1000, None);

        let probe = Probe {
            value: 5,
            label: "short".to_string(),
        };

        let bytes = encoder.encode_packet(WireFormat::Packet, &probe).unwrap();
        let raw_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);

        assert_eq!(raw_len & COMPRESSED_FLAG, 0);
    }

    #[test]
    fn test_disabled_compression_stays_plain() {
        let mut encoder = Encoder::new(registry(), 64, -1, None);

        let probe = Probe {
            value: 5,
            label: "y".repeat(500),
        };

        let bytes = encoder.encode_packet(WireFormat::Packet, &probe).unwrap();
        let raw_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);

        assert_eq!(raw_len & COMPRESSED_FLAG, 0);
    }

    #[test]
    fn test_non_eligible_format_never_compressed() {
        let mut encoder = Encoder::new(registry(), 64, 0, None);

        // Check frames are fixed-size and never compressed, regardless of
        // the threshold.
        let bytes = encoder.encode(&Frame::Check(1)).unwrap();
        assert_eq!(bytes.len(), 8);
    }
}
