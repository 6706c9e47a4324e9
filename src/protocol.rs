//! Per-host protocol engine: demultiplexing tables and inbound
//! dispatch.
//!
//! One [`RdtProtocol`] instance runs per simulated host. Three tables
//! route traffic:
//!
//! ```text
//! bound:      local port                     → socket     (bind)
//! listening:  local port                                  (listen)
//! conns:      (local port, peer, peer port)  → socket+bit (handshake)
//! ```
//!
//! All inbound frames arrive through [`Transport::input`] on the
//! host's delivery task. Dispatch by flag:
//!
//!   * `DATA` for a known connection is delivered if it carries the
//!     expected bit, otherwise it is a duplicate; both cases are
//!     acknowledged with the bit that arrived.
//!   * `SYN` either queues a connection request on a listener or, if
//!     the connection already exists, answers with a fresh SYN-ACK
//!     (the previous one was evidently lost).
//!   * `SYN-ACK` installs the connection record on the client side and
//!     wakes the pending `connect`.
//!   * `ACK` carrying the current bit wakes the pending `send`; any
//!     other bit is stale and ignored.
//!
//! The tables sit behind one mutex that is never held across an await
//! point.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::segment::{Flag, Segment};
use crate::simulator::{Host, HostHandle, Transport};
use crate::socket::{RdtError, RdtSocket, SocketShared, SocketState};

/// Protocol number claimed on a host, from the range reserved for
/// experimentation (RFC 3692).
pub const IPPROTO_RDT: u8 = 0xfe;

/// IANA dynamic port range, drawn from when `connect` runs on an
/// unbound socket.
const EPHEMERAL_PORTS: RangeInclusive<u16> = 49152..=65535;

/// Identifies one connection from this host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnKey {
    /// Port on this host.
    pub(crate) local_port: u16,
    /// Port on the peer.
    pub(crate) remote_port: u16,
    /// Peer address.
    pub(crate) peer: Ipv4Addr,
}

struct ConnRecord {
    socket: Arc<SocketShared>,
    /// Current sequence bit of the connection. One bit serves both
    /// directions: the receive path toggles it when an in-order data
    /// segment is delivered and the send path toggles it when a sent
    /// segment is acknowledged, so both ends stay in lockstep.
    seq_bit: u32,
}

#[derive(Default)]
struct Tables {
    conns: HashMap<ConnKey, ConnRecord>,
    bound: HashMap<u16, Arc<SocketShared>>,
    listening: HashSet<u16>,
    /// Requests queued on a listener but not yet accepted. Keeps a
    /// retransmitted SYN from enqueueing the same peer twice.
    pending: HashSet<ConnKey>,
}

/// The RDT engine attached to one host.
pub struct RdtProtocol {
    host: HostHandle,
    tables: Mutex<Tables>,
}

impl RdtProtocol {
    /// Creates the engine for `host` and registers it for inbound
    /// frames.
    pub fn register(host: &Host) -> Arc<RdtProtocol> {
        let proto = Arc::new(RdtProtocol {
            host: host.handle(),
            tables: Mutex::new(Tables::default()),
        });
        host.register_protocol(proto.clone());
        proto
    }

    /// A fresh unbound socket on this host.
    pub fn socket(self: &Arc<Self>) -> RdtSocket {
        RdtSocket {
            shared: Arc::new(SocketShared::new_unbound()),
            proto: self.clone(),
        }
    }

    pub fn host_addr(&self) -> Ipv4Addr {
        self.host.addr()
    }

    // -----------------------------------------------------------------
    // Table operations for the socket layer
    // -----------------------------------------------------------------

    pub(crate) fn bind_port(
        &self,
        port: u16,
        shared: &Arc<SocketShared>,
    ) -> Result<(), RdtError> {
        let mut tables = self.tables.lock().unwrap();
        if tables.bound.contains_key(&port) {
            return Err(RdtError::AddressInUse(port));
        }
        tables.bound.insert(port, shared.clone());
        Ok(())
    }

    /// Picks a free port from the dynamic range and binds `shared` to
    /// it. The check and the insert happen under one lock hold.
    pub(crate) fn allocate_ephemeral_port(&self, shared: &Arc<SocketShared>) -> u16 {
        let mut tables = self.tables.lock().unwrap();
        let mut rng = rand::rng();
        let port = loop {
            let candidate = rng.random_range(EPHEMERAL_PORTS);
            if !tables.bound.contains_key(&candidate) {
                break candidate;
            }
        };
        tables.bound.insert(port, shared.clone());
        log::debug!("[rdt] {} allocated ephemeral port {}", self.host.addr(), port);
        port
    }

    pub(crate) fn set_listening(&self, port: u16) {
        self.tables.lock().unwrap().listening.insert(port);
    }

    pub(crate) fn seq_bit(&self, key: &ConnKey) -> Option<u32> {
        self.tables
            .lock()
            .unwrap()
            .conns
            .get(key)
            .map(|rec| rec.seq_bit)
    }

    pub(crate) fn toggle_seq_bit(&self, key: &ConnKey) {
        if let Some(rec) = self.tables.lock().unwrap().conns.get_mut(key) {
            rec.seq_bit ^= 1;
        }
    }

    /// Builds the connected child for an accepted request and installs
    /// its connection record.
    pub(crate) fn make_child_socket(
        self: &Arc<Self>,
        local_port: u16,
        peer: (Ipv4Addr, u16),
    ) -> RdtSocket {
        let shared = Arc::new(SocketShared::new_connected(local_port, peer));
        let key = ConnKey {
            local_port,
            remote_port: peer.1,
            peer: peer.0,
        };
        let mut tables = self.tables.lock().unwrap();
        tables.pending.remove(&key);
        // The first data segment on a new connection carries bit 1.
        tables.conns.insert(
            key,
            ConnRecord {
                socket: shared.clone(),
                seq_bit: 1,
            },
        );
        drop(tables);
        RdtSocket {
            shared,
            proto: self.clone(),
        }
    }

    /// Sends a zero-payload control segment from `shared`'s endpoints.
    /// Control segments are never retransmitted from here; loss is
    /// healed by the peer's retransmission of whatever prompted them.
    pub(crate) fn send_control(&self, shared: &SocketShared, flag: Flag, seq: u32) {
        let Some((local_port, (peer_addr, peer_port))) = shared.endpoints() else {
            return;
        };
        let seg = Segment::new(local_port, peer_port, seq, flag, Vec::new());
        log::debug!(
            "[rdt] {} → {}:{} {} seq={}",
            self.host.addr(),
            peer_addr,
            peer_port,
            flag,
            seq
        );
        self.transmit(&seg.to_bytes(), peer_addr);
    }

    pub(crate) fn transmit(&self, frame: &[u8], dst: Ipv4Addr) {
        self.host.transmit(IPPROTO_RDT, frame, dst);
    }

    // -----------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------

    fn on_data(&self, key: ConnKey, seg: Segment) {
        let mut tables = self.tables.lock().unwrap();
        let Some(rec) = tables.conns.get_mut(&key) else {
            log::debug!(
                "[rdt] {} ← DATA from {}:{} for unknown connection on port {}, dropping",
                self.host.addr(),
                key.peer,
                key.remote_port,
                key.local_port
            );
            return;
        };
        let seq = seg.header.seq;
        let in_order = seq == rec.seq_bit;
        if in_order {
            rec.seq_bit ^= 1;
        }
        let sock = rec.socket.clone();
        drop(tables);
        if in_order {
            log::debug!(
                "[rdt] {} ← DATA seq={} len={} from {}:{}, delivering",
                self.host.addr(),
                seq,
                seg.payload.len(),
                key.peer,
                key.remote_port
            );
            sock.deliver(seg.payload);
        } else {
            log::debug!(
                "[rdt] {} ← duplicate DATA seq={} from {}:{}, re-acknowledging",
                self.host.addr(),
                seq,
                key.peer,
                key.remote_port
            );
        }
        // Either way the acknowledgment echoes the bit that arrived.
        self.send_control(&sock, Flag::Ack, seq);
    }

    fn on_syn(&self, key: ConnKey) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(rec) = tables.conns.get(&key) {
            // The connection already exists, so our SYN-ACK was lost.
            let sock = rec.socket.clone();
            drop(tables);
            log::debug!(
                "[rdt] {} ← duplicate SYN from {}:{}, resending SYN-ACK",
                self.host.addr(),
                key.peer,
                key.remote_port
            );
            self.send_control(&sock, Flag::SynAck, 0);
            return;
        }
        if tables.pending.contains(&key) {
            log::debug!(
                "[rdt] {} ← SYN from {}:{} already queued, ignoring",
                self.host.addr(),
                key.peer,
                key.remote_port
            );
            return;
        }
        if !tables.listening.contains(&key.local_port) {
            log::debug!(
                "[rdt] {} ← SYN for non-listening port {}, dropping",
                self.host.addr(),
                key.local_port
            );
            return;
        }
        let Some(listener) = tables.bound.get(&key.local_port).cloned() else {
            return;
        };
        tables.pending.insert(key);
        listener.requests.push((key.peer, key.remote_port));
        drop(tables);
        log::debug!(
            "[rdt] {} ← SYN from {}:{} for port {}, request queued",
            self.host.addr(),
            key.peer,
            key.remote_port,
            key.local_port
        );
    }

    fn on_syn_ack(&self, key: ConnKey) {
        let mut tables = self.tables.lock().unwrap();
        let Some(sock) = tables.bound.get(&key.local_port).cloned() else {
            log::debug!(
                "[rdt] {} ← SYN-ACK for unbound port {}, dropping",
                self.host.addr(),
                key.local_port
            );
            return;
        };
        if sock.remote() != Some((key.peer, key.remote_port)) {
            log::debug!(
                "[rdt] {} ← SYN-ACK from unexpected peer {}:{}, dropping",
                self.host.addr(),
                key.peer,
                key.remote_port
            );
            return;
        }
        // A duplicate SYN-ACK must not reset the bit of a connection
        // that is already exchanging data.
        tables.conns.entry(key).or_insert_with(|| ConnRecord {
            socket: sock.clone(),
            seq_bit: 1,
        });
        drop(tables);
        // Wake the connect only while it is actually pending. Once the
        // socket is connected its armed slot belongs to a data send,
        // and a late duplicate SYN-ACK must not complete that.
        if sock.state() == SocketState::HalfOpen {
            log::debug!(
                "[rdt] {} ← SYN-ACK from {}:{}, connection established",
                self.host.addr(),
                key.peer,
                key.remote_port
            );
            sock.ack.signal();
        } else {
            log::debug!(
                "[rdt] {} ← duplicate SYN-ACK from {}:{}, ignoring",
                self.host.addr(),
                key.peer,
                key.remote_port
            );
        }
    }

    fn on_ack(&self, key: ConnKey, seq: u32) {
        let tables = self.tables.lock().unwrap();
        let Some(rec) = tables.conns.get(&key) else {
            log::debug!(
                "[rdt] {} ← ACK for unknown connection from {}:{}, dropping",
                self.host.addr(),
                key.peer,
                key.remote_port
            );
            return;
        };
        if seq != rec.seq_bit {
            log::debug!(
                "[rdt] {} ← stale ACK seq={} from {}:{} (expected {}), ignoring",
                self.host.addr(),
                seq,
                key.peer,
                key.remote_port,
                rec.seq_bit
            );
            return;
        }
        let sock = rec.socket.clone();
        drop(tables);
        log::debug!(
            "[rdt] {} ← ACK seq={} from {}:{}",
            self.host.addr(),
            seq,
            key.peer,
            key.remote_port
        );
        sock.ack.signal();
    }
}

impl Transport for RdtProtocol {
    fn proto_id(&self) -> u8 {
        IPPROTO_RDT
    }

    fn input(&self, frame: &[u8], src: Ipv4Addr) {
        let seg = match Segment::decode(frame) {
            Ok(seg) => seg,
            Err(err) => {
                log::debug!(
                    "[rdt] {} ← undecodable frame from {}: {}",
                    self.host.addr(),
                    src,
                    err
                );
                return;
            }
        };
        if !seg.checksum_valid() {
            log::debug!(
                "[rdt] {} ← {} from {}:{} failed checksum, dropping",
                self.host.addr(),
                seg.header.flag,
                src,
                seg.header.src_port
            );
            return;
        }
        let key = ConnKey {
            local_port: seg.header.dst_port,
            remote_port: seg.header.src_port,
            peer: src,
        };
        match seg.header.flag {
            Flag::Data => self.on_data(key, seg),
            Flag::Syn => self.on_syn(key),
            Flag::SynAck => self.on_syn_ack(key),
            Flag::Ack => self.on_ack(key, seg.header.seq),
        }
    }
}
