//! Transport endpoints feeding the codec core: mio driven TCP and UDP
//! services plus the in-process internal switch.

pub mod internal;
pub mod tcp;
pub mod udp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Handle to a transport service thread. Dropping does not stop the
/// service; `halt` flags the loop and joins.
pub struct Service {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Service {
    #[inline]
    pub fn new(name: String, stop: Arc<AtomicBool>, handle: thread::JoinHandle<()>) -> Service {
        Service {
            name,
            stop,
            handle: Some(handle),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the loop to stop and wait for it to end.
    pub fn halt(&mut self) {
        self.stop.store(true, Ordering::Release);

        if let Some(handle) = self.handle.take() {
            drop(handle.join());
        }
    }
}
