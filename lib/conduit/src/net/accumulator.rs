use crate::net::buffer::Buffer;
use crate::net::packet::Packet;
use crate::net::support::CheckId;
use crate::net::wire::{Frame, WireContext, WireFormat};
use keel::logging;
use std::sync::Arc;

/// Invoked by the accumulator once a frame is complete, one method per
/// format. Implementations route packets to the handler chain and control
/// frames to the connection state machine.
pub trait FrameAdapter: Send + Sync {
    fn receive_packet(&self, packet: Box<dyn Packet>);
    fn receive_check(&self, id: CheckId);
    fn receive_check_reply(&self, id: CheckId);
    fn receive_udp_login(&self);
    fn receive_udp_logout(&self);
    fn receive_info_request(&self);
    fn receive_info_answer(&self, packet: Box<dyn Packet>);
    fn receive_connection_accepted(&self);
}

pub type AdapterRef = Arc<dyn FrameAdapter>;

const TAG_SIZE: i32 = 4;

/// Stateful per-peer decoder driving the framing loop: accumulates bytes,
/// resolves the current format by its 4-byte tag, asks the format how many
/// more bytes it needs and decodes once satisfied. Exactly one adapter
/// invocation is made per complete frame and no bytes are lost across
/// incomplete ingests.
pub struct Accumulator {
    buffer: Buffer,
    required: i32,
    format: Option<WireFormat>,
    log: logging::Logger,
}

impl Accumulator {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(initial_size: usize, log: L) -> Accumulator {
        let accumulator_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        Accumulator {
            buffer: Buffer::new(initial_size),
            required: TAG_SIZE,
            format: None,
            log: accumulator_log,
        }
    }

    /// True when the accumulator sits at its initial state: no format
    /// selected, nothing buffered, waiting for the next 4-byte tag.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.format.is_none() && self.required == TAG_SIZE && self.buffer.is_empty()
    }

    /// Drop all in-progress state and return to the initial state.
    #[inline]
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.format = None;
        self.required = TAG_SIZE;
    }

    /// Ingest an arbitrary-size byte run. Input is consumed in
    /// `required`-sized bites so every format decision happens at an exact
    /// frame boundary.
    pub fn push(&mut self, input: &[u8], adapter: &AdapterRef, context: &Arc<WireContext>) {
        let mut input = input;

        while !input.is_empty() {
            let take = (self.required as usize).min(input.len());
            self.buffer.extend(&input[..take]);
            input = &input[take..];
            self.required -= take as i32;

            while self.required == 0 {
                match self.format {
                    None => self.select_format(),
                    Some(format) => self.advance(format, adapter, context),
                }
            }
        }
    }

    /// Interpret the first four buffered bytes as a format tag. An unknown
    /// tag sheds exactly one byte for a byte-wise resync.
    fn select_format(&mut self) {
        let slice = self.buffer.read_slice();
        let tag = u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]);

        match WireFormat::from_tag(tag) {
            Some(format) => {
                logging::trace!(self.log, "format selected";
                                "context" => "select",
                                "format" => format.name());

                self.format = Some(format);
                self.buffer.clear();
            }
            None => {
                logging::debug!(self.log, "unknown format tag, resyncing by one byte";
                                "context" => "select",
                                "tag" => tag);

                self.buffer.move_head(1);
                self.required = 1;
            }
        }
    }

    /// Ask the selected format how to proceed with the buffered payload.
    fn advance(&mut self, format: WireFormat, adapter: &AdapterRef, context: &Arc<WireContext>) {
        let more = format.receive_more(self.buffer.read_slice());

        if more > 0 {
            self.required = more;
        } else if more < 0 {
            logging::debug!(self.log, "invalid frame, dropping";
                            "context" => "advance",
                            "format" => format.name(),
                            "buffered" => self.buffer.len());

            self.reset();
        } else {
            self.dispatch(format, adapter, context);
            self.reset();
        }
    }

    /// Decode the satisfied payload and hand the frame to the adapter,
    /// either on the ingest thread or on the configured decode worker.
    fn dispatch(&mut self, format: WireFormat, adapter: &AdapterRef, context: &Arc<WireContext>) {
        match context.decode_executor {
            Some(ref executor) => {
                let payload = self.buffer.read_slice().to_vec();
                let adapter = adapter.clone();
                let context = context.clone();

                executor.execute(Box::new(move || {
                    Self::decode_and_publish(format, &payload, &adapter, &context);
                }));
            }
            None => Self::decode_and_publish(format, self.buffer.read_slice(), adapter, context),
        }
    }

    fn decode_and_publish(
        format: WireFormat,
        payload: &[u8],
        adapter: &AdapterRef,
        context: &WireContext,
    ) {
        // Decode failures were already logged by the format; the frame is
        // consumed either way.
        let frame = match format.decode(context, payload) {
            Some(frame) => frame,
            None => return,
        };

        match frame {
            Frame::Packet(packet) => adapter.receive_packet(packet),
            Frame::Check(id) => adapter.receive_check(id),
            Frame::CheckReply(id) => adapter.receive_check_reply(id),
            Frame::UdpLogin => adapter.receive_udp_login(),
            Frame::UdpLogout => adapter.receive_udp_logout(),
            Frame::InfoRequest => adapter.receive_info_request(),
            Frame::InfoAnswer(packet) => adapter.receive_info_answer(packet),
            Frame::ConnectionAccepted => adapter.receive_connection_accepted(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use std::sync::Mutex;

    /// Records every adapter invocation for assertions.
    #[derive(Debug, Eq, PartialEq, Clone)]
    pub enum Received {
        Packet(i32, String),
        Check(CheckId),
        CheckReply(CheckId),
        UdpLogin,
        UdpLogout,
        InfoRequest,
        InfoAnswer(i32, String),
        ConnectionAccepted,
    }

    pub struct RecordingAdapter {
        pub received: Mutex<Vec<Received>>,
    }

    impl RecordingAdapter {
        pub fn new() -> Arc<RecordingAdapter> {
            Arc::new(RecordingAdapter {
                received: Mutex::new(Vec::new()),
            })
        }

        pub fn snapshot(&self) -> Vec<Received> {
            self.received.lock().unwrap().clone()
        }

        fn probe_fields(packet: Box<dyn Packet>) -> (i32, String) {
            let probe = packet
                .as_any()
                .downcast_ref::<crate::net::packet::testkit::Probe>()
                .expect("Expected a probe packet");
            (probe.value, probe.label.clone())
        }
    }

    impl FrameAdapter for RecordingAdapter {
        fn receive_packet(&self, packet: Box<dyn Packet>) {
            let (value, label) = Self::probe_fields(packet);
            self.received.lock().unwrap().push(Received::Packet(value, label));
        }

        fn receive_check(&self, id: CheckId) {
            self.received.lock().unwrap().push(Received::Check(id));
        }

        fn receive_check_reply(&self, id: CheckId) {
            self.received.lock().unwrap().push(Received::CheckReply(id));
        }

        fn receive_udp_login(&self) {
            self.received.lock().unwrap().push(Received::UdpLogin);
        }

        fn receive_udp_logout(&self) {
            self.received.lock().unwrap().push(Received::UdpLogout);
        }

        fn receive_info_request(&self) {
            self.received.lock().unwrap().push(Received::InfoRequest);
        }

        fn receive_info_answer(&self, packet: Box<dyn Packet>) {
            let (value, label) = Self::probe_fields(packet);
            self.received
                .lock()
                .unwrap()
                .push(Received::InfoAnswer(value, label));
        }

        fn receive_connection_accepted(&self) {
            self.received.lock().unwrap().push(Received::ConnectionAccepted);
        }
    }
}
