// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic publish to rendezvous peers (`announcer`, C10, §4.3).

use homeostas_digest::Key512;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default announce interval.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// Something that can deliver a best-effort, unauthenticated announcement
/// datagram to a rendezvous peer. Transport is out of scope of the core
/// specification; tests supply an in-memory fake.
pub trait AnnounceSink {
    fn send(&self, to: SocketAddr, public_key: &Key512, addrs: &[SocketAddr]);
}

/// Drives announcements to a fixed set of rendezvous peers on a timer, and
/// immediately on address-set change (§4.3: "On any change... wake
/// immediately").
pub struct Announcer<S: AnnounceSink> {
    sink: S,
    peers: Vec<SocketAddr>,
    public_key: Key512,
    addrs: Mutex<Vec<SocketAddr>>,
    dirty: AtomicBool,
    last_sent: Mutex<Option<Instant>>,
}

impl<S: AnnounceSink> Announcer<S> {
    pub fn new(sink: S, peers: Vec<SocketAddr>, public_key: Key512) -> Self {
        Announcer {
            sink,
            peers,
            public_key,
            addrs: Mutex::new(Vec::new()),
            dirty: AtomicBool::new(true),
            last_sent: Mutex::new(None),
        }
    }

    /// Replace the currently announced address set; triggers an immediate
    /// announce on the next `tick`.
    pub fn set_addresses(&self, addrs: Vec<SocketAddr>) {
        *self.addrs.lock().unwrap() = addrs;
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Called on the supervisor's poll loop; announces if the interval has
    /// elapsed or the address set changed since the last announce.
    pub fn tick(&self, now: Instant) {
        let due = {
            let last = self.last_sent.lock().unwrap();
            match *last {
                Some(t) => now.duration_since(t) >= ANNOUNCE_INTERVAL,
                None => true,
            }
        };

        if !due && !self.dirty.swap(false, Ordering::Relaxed) {
            return;
        }

        let addrs = self.addrs.lock().unwrap().clone();
        for peer in &self.peers {
            self.sink.send(*peer, &self.public_key, &addrs);
        }
        *self.last_sent.lock().unwrap() = Some(now);
        self.dirty.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink(AtomicUsize);

    impl AnnounceSink for CountingSink {
        fn send(&self, _to: SocketAddr, _public_key: &Key512, _addrs: &[SocketAddr]) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn first_tick_always_announces() {
        let announcer = Announcer::new(
            CountingSink(AtomicUsize::new(0)),
            vec!["203.0.113.1:9000".parse().unwrap()],
            Key512::zero(),
        );
        announcer.tick(Instant::now());
        assert_eq!(announcer.sink.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn address_change_forces_immediate_announce() {
        let announcer = Announcer::new(
            CountingSink(AtomicUsize::new(0)),
            vec!["203.0.113.1:9000".parse().unwrap()],
            Key512::zero(),
        );
        let t0 = Instant::now();
        announcer.tick(t0);
        announcer.set_addresses(vec!["198.51.100.2:9000".parse().unwrap()]);
        announcer.tick(t0 + Duration::from_millis(1));
        assert_eq!(announcer.sink.0.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn no_interval_elapsed_and_not_dirty_skips() {
        let announcer = Announcer::new(
            CountingSink(AtomicUsize::new(0)),
            vec!["203.0.113.1:9000".parse().unwrap()],
            Key512::zero(),
        );
        let t0 = Instant::now();
        announcer.tick(t0);
        announcer.tick(t0 + Duration::from_millis(1));
        assert_eq!(announcer.sink.0.load(Ordering::Relaxed), 1);
    }
}
