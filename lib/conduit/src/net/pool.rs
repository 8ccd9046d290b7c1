use crate::net::accumulator::{Accumulator, AdapterRef};
use crate::net::wire::WireContext;
use keel::logging;
use hashbrown::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

/// A pooled accumulator bound to a rebindable remote address slot with an
/// atomic reference counter. The entry lives in the used map while its
/// counter is positive or it holds a partial frame.
pub struct PoolEntry {
    address: Mutex<SocketAddr>,
    refs: AtomicI32,
    decoder: Mutex<Accumulator>,
}

impl PoolEntry {
    #[inline]
    fn new(address: SocketAddr, initial_size: usize, log: &logging::Logger) -> Arc<PoolEntry> {
        Arc::new(PoolEntry {
            address: Mutex::new(address),
            refs: AtomicI32::new(0),
            decoder: Mutex::new(Accumulator::new(initial_size, log)),
        })
    }

    #[inline]
    fn rebind(&self, address: SocketAddr) {
        *self.address.lock().expect("Entry lock poisoned") = address;
    }

    #[inline]
    fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the reference counter, returning the remaining count. A
    /// release that would take the counter below zero is a programming
    /// error.
    #[inline]
    fn release(&self) -> i32 {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);

        if previous <= 0 {
            panic!("Decoder pool entry released below zero");
        }

        previous - 1
    }
}

/// Owns the per-peer accumulators for connectionless transports where one
/// receive socket multiplexes many peers. Accumulators are acquired by
/// source address on each inbound datagram and returned to a free list once
/// quiescent. One global mutex serializes all pool traffic.
pub struct DecoderPool {
    inner: Mutex<PoolInner>,
    context: Arc<WireContext>,
    log: logging::Logger,
}

struct PoolInner {
    used: HashMap<SocketAddr, Arc<PoolEntry>>,
    free: Vec<Arc<PoolEntry>>,
}

impl DecoderPool {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        context: Arc<WireContext>,
        log: L,
    ) -> DecoderPool {
        let pool_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        DecoderPool {
            inner: Mutex::new(PoolInner {
                used: HashMap::new(),
                free: Vec::new(),
            }),
            context,
            log: pool_log,
        }
    }

    /// Ingest one datagram from the supplied source address, acquiring the
    /// address-bound accumulator (or binding a free or fresh one) and
    /// releasing it afterwards. Quiescent accumulators move to the free
    /// list; mid-frame accumulators stay bound so the next datagram from
    /// the same peer resumes decoding.
    pub fn decode(&self, address: SocketAddr, bytes: &[u8], adapter: &AdapterRef) {
        let mut inner = self.inner.lock().expect("Pool lock poisoned");

        let entry = match inner.used.get(&address) {
            Some(entry) => entry.clone(),
            None => {
                let entry = match inner.free.pop() {
                    Some(entry) => {
                        entry.rebind(address);
                        entry
                    }
                    None => {
                        logging::trace!(self.log, "creating decoder for new peer";
                                        "context" => "decode",
                                        "address" => %address);

                        PoolEntry::new(address, self.context.buffer_initial, &self.log)
                    }
                };

                inner.used.insert(address, entry.clone());
                entry
            }
        };

        entry.acquire();
        entry
            .decoder
            .lock()
            .expect("Decoder lock poisoned")
            .push(bytes, adapter, &self.context);
        let remaining = entry.release();

        if remaining == 0 && entry.decoder.lock().expect("Decoder lock poisoned").is_done() {
            inner.used.remove(&address);
            entry.decoder.lock().expect("Decoder lock poisoned").reset();
            inner.free.push(entry);
        }
    }

    /// The number of address-bound accumulators.
    #[inline]
    pub fn used_count(&self) -> usize {
        self.inner.lock().expect("Pool lock poisoned").used.len()
    }

    /// The number of quiescent accumulators awaiting reuse.
    #[inline]
    pub fn free_count(&self) -> usize {
        self.inner.lock().expect("Pool lock poisoned").free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::accumulator::testkit::{Received, RecordingAdapter};
    use crate::net::packet::testkit::Probe;
    use crate::net::packet::PacketRegistry;
    use crate::net::stream::ByteWriter;

    fn context() -> Arc<WireContext> {
        let registry = Arc::new(PacketRegistry::new());
        registry.register::<Probe>(7).unwrap();
        Arc::new(WireContext::new(registry, 64, None, None))
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn probe_frame(value: i32, label: &str) -> Vec<u8> {
        let mut body = ByteWriter::growable(16);
        body.write_int(value).unwrap();
        body.write_string_with_length(label).unwrap();
        let body = body.finish();

        let mut frame = ByteWriter::growable(32);
        frame.write_bytes(b"PACK").unwrap();
        frame.write_int(7).unwrap();
        frame.write_int(body.len() as i32).unwrap();
        frame.write_bytes(&body).unwrap();
        frame.finish()
    }

    #[test]
    fn test_complete_datagram_frees_entry() {
        let pool = DecoderPool::new(context(), None);
        let adapter = RecordingAdapter::new();
        let adapter_ref: AdapterRef = adapter.clone();

        pool.decode(addr(9000), b"HELO", &adapter_ref);

        assert_eq!(adapter.snapshot(), vec![Received::UdpLogin]);
        assert_eq!(pool.used_count(), 0);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_partial_frame_stays_bound() {
        let pool = DecoderPool::new(context(), None);
        let adapter = RecordingAdapter::new();
        let adapter_ref: AdapterRef = adapter.clone();

        let frame = probe_frame(11, "late");

        pool.decode(addr(9000), &frame[..7], &adapter_ref);

        assert!(adapter.snapshot().is_empty());
        assert_eq!(pool.used_count(), 1);
        assert_eq!(pool.free_count(), 0);

        // The next datagram from the same peer resumes decoding.
        pool.decode(addr(9000), &frame[7..], &adapter_ref);

        assert_eq!(adapter.snapshot(), vec![Received::Packet(11, "late".to_string())]);
        assert_eq!(pool.used_count(), 0);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_free_entry_rebinds_to_new_peer() {
        let pool = DecoderPool::new(context(), None);
        let adapter = RecordingAdapter::new();
        let adapter_ref: AdapterRef = adapter.clone();

        pool.decode(addr(9000), b"HELO", &adapter_ref);
        assert_eq!(pool.free_count(), 1);

        pool.decode(addr(9001), b"HELO", &adapter_ref);

        // The freed accumulator was reused rather than a new one created.
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.used_count(), 0);
        assert_eq!(adapter.snapshot(), vec![Received::UdpLogin, Received::UdpLogin]);
    }

    #[test]
    fn test_distinct_peers_do_not_interleave() {
        let pool = DecoderPool::new(context(), None);
        let adapter = RecordingAdapter::new();
        let adapter_ref: AdapterRef = adapter.clone();

        let first = probe_frame(1, "one");
        let second = probe_frame(2, "two");

        // Interleave partial datagrams from two peers.
        pool.decode(addr(9000), &first[..9], &adapter_ref);
        pool.decode(addr(9001), &second[..5], &adapter_ref);

        assert_eq!(pool.used_count(), 2);

        pool.decode(addr(9000), &first[9..], &adapter_ref);
        pool.decode(addr(9001), &second[5..], &adapter_ref);

        assert_eq!(
            adapter.snapshot(),
            vec![
                Received::Packet(1, "one".to_string()),
                Received::Packet(2, "two".to_string())
            ]
        );
        assert_eq!(pool.used_count(), 0);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    #[should_panic(expected = "Decoder pool entry released below zero")]
    fn test_release_below_zero_panics() {
        let log = logging::discard();
        let entry = PoolEntry::new(addr(9000), 64, &log);

        entry.release();
    }
}
