//! Live subscriber registry.

use std::collections::BTreeMap;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::bridge::Envelope;

/// Upper bound on how long one slow subscriber may stall a broadcast.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// A live subscriber connection the bridge writes envelope lines to.
pub trait SubscriberConn: Send {
    /// Deliver one encoded envelope line. An error marks the subscriber dead.
    fn send(&mut self, line: &[u8]) -> std::io::Result<()>;

    /// Where the subscriber connected from, for logs.
    fn peer(&self) -> &str;
}

/// TCP subscriber with a bounded write timeout.
pub struct TcpSubscriber {
    stream: TcpStream,
    peer: String,
}

impl TcpSubscriber {
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Ok(Self { stream, peer })
    }
}

impl SubscriberConn for TcpSubscriber {
    fn send(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(line)?;
        self.stream.flush()
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

/// Registry of live subscribers keyed by a stable registration id.
///
/// All mutation and iteration happens under one lock, so a registration or
/// removal never interleaves with a partially delivered broadcast and a
/// failing subscriber is removed without disturbing the others.
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: Mutex<BTreeMap<u64, Box<dyn SubscriberConn>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            subscribers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Add a live subscriber and return its registry id.
    pub fn register(&self, conn: Box<dyn SubscriberConn>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!("subscriber #{} registered ({})", id, conn.peer());
        self.lock_subscribers().insert(id, conn);
        id
    }

    /// Remove one subscriber. Safe to call for ids already removed.
    pub fn unregister(&self, id: u64) -> bool {
        let removed = self.lock_subscribers().remove(&id).is_some();
        if removed {
            log::info!("subscriber #{} unregistered", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock_subscribers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver one envelope to every live subscriber.
    ///
    /// A failed send drops only the failing subscriber; the rest still
    /// receive the message. Returns the number of successful deliveries.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        let line = match envelope.to_line() {
            Ok(line) => line,
            Err(err) => {
                log::warn!("dropping undeliverable envelope: {err:#}");
                return 0;
            }
        };

        let mut subscribers = self.lock_subscribers();
        let mut dead = Vec::new();
        let mut delivered = 0;
        for (id, conn) in subscribers.iter_mut() {
            match conn.send(&line) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    log::warn!("subscriber #{} send failed: {}; dropping it", id, err);
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            subscribers.remove(&id);
            log::info!("subscriber #{} unregistered", id);
        }
        delivered
    }

    // A poisoned lock only means a subscriber panicked mid-send; the map
    // itself stays usable and later broadcasts must still go out.
    fn lock_subscribers(&self) -> MutexGuard<'_, BTreeMap<u64, Box<dyn SubscriberConn>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingConn {
        lines: Arc<Mutex<Vec<Vec<u8>>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl RecordingConn {
        fn received(&self) -> Vec<Vec<u8>> {
            self.lines.lock().expect("lines").clone()
        }

        fn set_failing(&self) {
            *self.fail.lock().expect("fail") = true;
        }
    }

    impl SubscriberConn for RecordingConn {
        fn send(&mut self, line: &[u8]) -> std::io::Result<()> {
            if *self.fail.lock().expect("fail") {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "scripted failure",
                ));
            }
            self.lines.lock().expect("lines").push(line.to_vec());
            Ok(())
        }

        fn peer(&self) -> &str {
            "test"
        }
    }

    #[test]
    fn broadcast_reaches_every_subscriber() {
        let registry = SubscriberRegistry::new();
        let first = RecordingConn::default();
        let second = RecordingConn::default();
        registry.register(Box::new(first.clone()));
        registry.register(Box::new(second.clone()));

        let delivered = registry.broadcast(&Envelope::frame(b"abc"));
        assert_eq!(delivered, 2);
        assert_eq!(first.received(), second.received());
        assert_eq!(first.received().len(), 1);
    }

    #[test]
    fn failing_subscriber_is_dropped_others_delivered() {
        let registry = SubscriberRegistry::new();
        let healthy = RecordingConn::default();
        let broken = RecordingConn::default();
        broken.set_failing();
        registry.register(Box::new(broken));
        registry.register(Box::new(healthy.clone()));

        let delivered = registry.broadcast(&Envelope::frame(b"abc"));
        assert_eq!(delivered, 1);
        assert_eq!(registry.len(), 1);

        // The survivor keeps receiving on later broadcasts.
        let delivered = registry.broadcast(&Envelope::frame(b"def"));
        assert_eq!(delivered, 1);
        assert_eq!(healthy.received().len(), 2);
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = SubscriberRegistry::new();
        let id = registry.register(Box::new(RecordingConn::default()));
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn unregistered_subscriber_stops_receiving() {
        let registry = SubscriberRegistry::new();
        let first = RecordingConn::default();
        let second = RecordingConn::default();
        let first_id = registry.register(Box::new(first.clone()));
        registry.register(Box::new(second.clone()));

        registry.broadcast(&Envelope::frame(b"one"));
        registry.unregister(first_id);
        registry.broadcast(&Envelope::frame(b"two"));

        assert_eq!(first.received().len(), 1);
        assert_eq!(second.received().len(), 2);
    }
}
