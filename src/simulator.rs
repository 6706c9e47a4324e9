//! In-process network simulator.
//!
//! A [`Network`] connects a set of [`Host`]s addressed by IPv4 address.
//! Each host owns one inbound FIFO; a dedicated task drains it and
//! hands every frame to the protocol registered for the frame's
//! protocol number. Frames for a given destination are delivered in
//! transmit order and at most once, so the only faults the link
//! injects are the configured ones:
//!
//!   * loss: a frame is dropped outright with probability `loss_rate`
//!   * corruption: one bit of the frame is flipped with probability
//!     `corrupt_rate`
//!
//! Both draws come from a single seeded RNG, so a run with a fixed
//! seed replays the same fault pattern.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

/// A protocol module that can be attached to a [`Host`].
///
/// `input` is called from the host's delivery task, one frame at a
/// time, and must not block.
pub trait Transport: Send + Sync {
    /// Protocol number this transport claims on the host.
    fn proto_id(&self) -> u8;

    /// Handles one inbound frame from `src`.
    fn input(&self, frame: &[u8], src: Ipv4Addr);
}

/// Fault model and seed for a [`Network`].
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that a frame is dropped, in `0.0..=1.0`.
    pub loss_rate: f64,
    /// Probability that a frame is corrupted, in `0.0..=1.0`.
    pub corrupt_rate: f64,
    /// Seed for the fault RNG.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    /// A transparent link: nothing lost, nothing corrupted.
    fn default() -> SimulatorConfig {
        SimulatorConfig {
            loss_rate: 0.0,
            corrupt_rate: 0.0,
            seed: 0,
        }
    }
}

/// Counters for everything the link has done so far.
#[derive(Debug, Default)]
pub struct SimStats {
    transmitted: AtomicU64,
    corrupted: AtomicU64,
    lost: AtomicU64,
    delivered: AtomicU64,
}

impl SimStats {
    /// Frames handed to the link for delivery.
    pub fn transmitted(&self) -> u64 {
        self.transmitted.load(Ordering::Relaxed)
    }

    /// Frames that had a bit flipped in transit.
    pub fn corrupted(&self) -> u64 {
        self.corrupted.load(Ordering::Relaxed)
    }

    /// Frames dropped by the link.
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Frames that reached a host's inbound queue.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

/// One frame in flight.
struct Datagram {
    proto: u8,
    src: Ipv4Addr,
    frame: Vec<u8>,
}

struct NetworkInner {
    config: SimulatorConfig,
    rng: Mutex<StdRng>,
    inboxes: Mutex<HashMap<Ipv4Addr, mpsc::UnboundedSender<Datagram>>>,
    stats: SimStats,
}

impl NetworkInner {
    /// Runs the fault model over one frame and, if it survives, queues
    /// it on the destination host.
    fn deliver(&self, mut dgram: Datagram, dst: Ipv4Addr) {
        self.stats.transmitted.fetch_add(1, Ordering::Relaxed);
        {
            let mut rng = self.rng.lock().unwrap();
            if rng.random_bool(self.config.loss_rate) {
                self.stats.lost.fetch_add(1, Ordering::Relaxed);
                log::debug!("[sim] {} → {}: frame lost", dgram.src, dst);
                return;
            }
            if !dgram.frame.is_empty() && rng.random_bool(self.config.corrupt_rate) {
                let byte = rng.random_range(0..dgram.frame.len());
                let bit = rng.random_range(0..8);
                dgram.frame[byte] ^= 1 << bit;
                self.stats.corrupted.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "[sim] {} → {}: flipped bit {} of byte {} in transit",
                    dgram.src,
                    dst,
                    bit,
                    byte
                );
            }
        }
        let inboxes = self.inboxes.lock().unwrap();
        match inboxes.get(&dst) {
            Some(tx) => {
                // A send only fails once the host task is gone; the
                // frame just vanishes, like any other unroutable one.
                if tx.send(dgram).is_ok() {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => log::debug!("[sim] no host at {}, dropping frame", dst),
        }
    }
}

/// A simulated network segment.
#[derive(Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

impl Network {
    pub fn new(config: SimulatorConfig) -> Network {
        assert!(
            (0.0..=1.0).contains(&config.loss_rate),
            "loss_rate must be within 0.0..=1.0"
        );
        assert!(
            (0.0..=1.0).contains(&config.corrupt_rate),
            "corrupt_rate must be within 0.0..=1.0"
        );
        let rng = StdRng::seed_from_u64(config.seed);
        Network {
            inner: Arc::new(NetworkInner {
                config,
                rng: Mutex::new(rng),
                inboxes: Mutex::new(HashMap::new()),
                stats: SimStats::default(),
            }),
        }
    }

    /// Attaches a host and starts its delivery task. Must be called
    /// from within a tokio runtime. Panics if the address is taken.
    pub fn add_host(&self, addr: Ipv4Addr) -> Host {
        let (tx, mut rx) = mpsc::unbounded_channel::<Datagram>();
        {
            let mut inboxes = self.inner.inboxes.lock().unwrap();
            assert!(
                !inboxes.contains_key(&addr),
                "host address {addr} already in use"
            );
            inboxes.insert(addr, tx);
        }
        let protocols: Arc<Mutex<HashMap<u8, Arc<dyn Transport>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let task_protocols = protocols.clone();
        tokio::spawn(async move {
            while let Some(dgram) = rx.recv().await {
                let handler = task_protocols.lock().unwrap().get(&dgram.proto).cloned();
                match handler {
                    Some(proto) => proto.input(&dgram.frame, dgram.src),
                    None => log::debug!(
                        "[sim] {}: no transport bound to protocol {:#04x}",
                        addr,
                        dgram.proto
                    ),
                }
            }
        });
        Host {
            addr,
            net: self.inner.clone(),
            protocols,
        }
    }

    /// Link counters, shared by every host on this network.
    pub fn stats(&self) -> &SimStats {
        &self.inner.stats
    }
}

/// One endpoint on the simulated network.
pub struct Host {
    addr: Ipv4Addr,
    net: Arc<NetworkInner>,
    protocols: Arc<Mutex<HashMap<u8, Arc<dyn Transport>>>>,
}

impl Host {
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// Binds a transport to its protocol number on this host,
    /// replacing any previous one.
    pub fn register_protocol(&self, proto: Arc<dyn Transport>) {
        self.protocols.lock().unwrap().insert(proto.proto_id(), proto);
    }

    /// A cheap handle for transmitting from this host. The handle
    /// keeps the network alive, so the `Host` itself may be dropped.
    pub(crate) fn handle(&self) -> HostHandle {
        HostHandle {
            addr: self.addr,
            net: self.net.clone(),
        }
    }
}

/// Transmit-side view of a host, held by protocol modules.
pub(crate) struct HostHandle {
    addr: Ipv4Addr,
    net: Arc<NetworkInner>,
}

impl HostHandle {
    pub(crate) fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// Sends one frame toward `dst`. Fire and forget: the fault model
    /// decides what arrives.
    pub(crate) fn transmit(&self, proto: u8, frame: &[u8], dst: Ipv4Addr) {
        self.net.deliver(
            Datagram {
                proto,
                src: self.addr,
                frame: frame.to_vec(),
            },
            dst,
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    /// Records every frame it is handed.
    struct Tap {
        id: u8,
        seen: Mutex<Vec<(Vec<u8>, Ipv4Addr)>>,
    }

    impl Tap {
        fn new(id: u8) -> Arc<Tap> {
            Arc::new(Tap {
                id,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<(Vec<u8>, Ipv4Addr)> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Transport for Tap {
        fn proto_id(&self) -> u8 {
            self.id
        }

        fn input(&self, frame: &[u8], src: Ipv4Addr) {
            self.seen.lock().unwrap().push((frame.to_vec(), src));
        }
    }

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn clean_link_delivers_in_order() {
        let net = Network::new(SimulatorConfig::default());
        let a = net.add_host(addr("10.0.0.1"));
        let b = net.add_host(addr("10.0.0.2"));
        let tap = Tap::new(0x42);
        b.register_protocol(tap.clone());

        let handle = a.handle();
        for frame in [b"one".as_slice(), b"two".as_slice(), b"three".as_slice()] {
            handle.transmit(0x42, frame, b.addr());
        }
        settle().await;

        let seen = tap.seen();
        assert_eq!(
            seen,
            vec![
                (b"one".to_vec(), a.addr()),
                (b"two".to_vec(), a.addr()),
                (b"three".to_vec(), a.addr()),
            ]
        );
        assert_eq!(net.stats().transmitted(), 3);
        assert_eq!(net.stats().delivered(), 3);
        assert_eq!(net.stats().lost(), 0);
        assert_eq!(net.stats().corrupted(), 0);
    }

    #[tokio::test]
    async fn full_loss_drops_everything() {
        let net = Network::new(SimulatorConfig {
            loss_rate: 1.0,
            ..SimulatorConfig::default()
        });
        let a = net.add_host(addr("10.0.0.1"));
        let b = net.add_host(addr("10.0.0.2"));
        let tap = Tap::new(0x42);
        b.register_protocol(tap.clone());

        a.handle().transmit(0x42, b"doomed", b.addr());
        settle().await;

        assert!(tap.seen().is_empty());
        assert_eq!(net.stats().lost(), 1);
        assert_eq!(net.stats().delivered(), 0);
    }

    #[tokio::test]
    async fn forced_corruption_flips_a_bit_but_keeps_length() {
        let net = Network::new(SimulatorConfig {
            corrupt_rate: 1.0,
            seed: 3,
            ..SimulatorConfig::default()
        });
        let a = net.add_host(addr("10.0.0.1"));
        let b = net.add_host(addr("10.0.0.2"));
        let tap = Tap::new(0x42);
        b.register_protocol(tap.clone());

        let original = b"payload under test".to_vec();
        a.handle().transmit(0x42, &original, b.addr());
        settle().await;

        let seen = tap.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.len(), original.len());
        assert_ne!(seen[0].0, original);
        assert_eq!(net.stats().corrupted(), 1);
    }

    #[tokio::test]
    async fn frames_to_unknown_hosts_vanish() {
        let net = Network::new(SimulatorConfig::default());
        let a = net.add_host(addr("10.0.0.1"));
        a.handle().transmit(0x42, b"nowhere", addr("10.0.0.99"));
        settle().await;
        assert_eq!(net.stats().transmitted(), 1);
        assert_eq!(net.stats().delivered(), 0);
    }

    #[tokio::test]
    async fn frames_route_by_protocol_number() {
        let net = Network::new(SimulatorConfig::default());
        let a = net.add_host(addr("10.0.0.1"));
        let b = net.add_host(addr("10.0.0.2"));
        let tap = Tap::new(0x42);
        b.register_protocol(tap.clone());

        a.handle().transmit(0x41, b"wrong proto", b.addr());
        a.handle().transmit(0x42, b"right proto", b.addr());
        settle().await;

        let seen = tap.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, b"right proto");
    }
}
