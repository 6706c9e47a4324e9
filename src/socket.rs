//! Socket handles and the stop-and-wait send path.
//!
//! A socket moves through its states like this:
//!
//! ```text
//! Unbound ──bind──▶ Bound ──listen──▶ Listening
//!    │                │
//!    └────connect─────┴────connect──▶ HalfOpen ──SYN-ACK──▶ Connected
//! ```
//!
//! `accept` never changes the listener's state; every queued request
//! yields a fresh child socket that is born `Connected`.
//!
//! Reliability is stop-and-wait with a single-bit sequence number: a
//! segment that needs acknowledging is retransmitted on a flat timer
//! until the dispatcher completes the socket's acknowledgment slot or
//! the attempt budget runs out.

use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::time::timeout;

use crate::buffer::RecvBuffer;
use crate::protocol::{ConnKey, RdtProtocol};
use crate::segment::{Flag, Segment};

/// Flat retransmission timeout. No backoff: the simulated link has no
/// queueing delay, so a lost frame is the only reason to wait.
pub const RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(10);

/// Total transmissions of one segment before the sender gives up.
pub const MAX_RETRIES: u32 = 25;

/// Errors surfaced to applications by socket operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RdtError {
    #[error("port {0} is already bound on this host")]
    AddressInUse(u16),
    #[error("socket is already bound to port {0}")]
    AlreadyBound(u16),
    #[error("socket is not bound to a port")]
    NotBound,
    #[error("socket is not listening")]
    NotListening,
    #[error("socket is listening and cannot connect")]
    AlreadyListening,
    #[error("socket is already connected")]
    AlreadyConnected,
    #[error("socket is not connected")]
    NotConnected,
    #[error("gave up after {MAX_RETRIES} transmissions without an acknowledgment")]
    MaxRetriesExceeded,
}

/// Lifecycle of a socket handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Unbound,
    Bound,
    Listening,
    HalfOpen,
    Connected,
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

struct Endpoint {
    state: SocketState,
    local_port: Option<u16>,
    remote: Option<(Ipv4Addr, u16)>,
}

/// Single-slot rendezvous between a sender waiting for an
/// acknowledgment and the dispatcher that observes it.
pub(crate) struct AckSlot {
    slot: Mutex<Option<oneshot::Sender<()>>>,
}

impl AckSlot {
    fn new() -> AckSlot {
        AckSlot {
            slot: Mutex::new(None),
        }
    }

    /// Installs a fresh slot and returns its receiving half. Must be
    /// called before the first transmission so an immediate reply
    /// cannot slip past the sender.
    fn arm(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.slot.lock().unwrap() = Some(tx);
        rx
    }

    fn disarm(&self) {
        self.slot.lock().unwrap().take();
    }

    /// Completes the armed slot, waking the sender. A signal with no
    /// armed slot is a stale or duplicate acknowledgment and is
    /// ignored.
    pub(crate) fn signal(&self) {
        if let Some(tx) = self.slot.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

/// FIFO of pending connection requests on a listening socket.
pub(crate) struct RequestQueue {
    queue: Mutex<VecDeque<(Ipv4Addr, u16)>>,
    ready: Notify,
}

impl RequestQueue {
    fn new() -> RequestQueue {
        RequestQueue {
            queue: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
        }
    }

    pub(crate) fn push(&self, peer: (Ipv4Addr, u16)) {
        self.queue.lock().unwrap().push_back(peer);
        self.ready.notify_one();
    }

    pub(crate) async fn pop(&self) -> (Ipv4Addr, u16) {
        loop {
            let ready = self.ready.notified();
            if let Some(peer) = self.queue.lock().unwrap().pop_front() {
                return peer;
            }
            ready.await;
        }
    }
}

/// State shared between a socket handle and the protocol dispatcher.
pub(crate) struct SocketShared {
    endpoint: Mutex<Endpoint>,
    rx: RecvBuffer,
    pub(crate) ack: AckSlot,
    pub(crate) requests: RequestQueue,
}

impl SocketShared {
    pub(crate) fn new_unbound() -> SocketShared {
        SocketShared {
            endpoint: Mutex::new(Endpoint {
                state: SocketState::Unbound,
                local_port: None,
                remote: None,
            }),
            rx: RecvBuffer::new(),
            ack: AckSlot::new(),
            requests: RequestQueue::new(),
        }
    }

    /// Shared state for an accepted child, born connected.
    pub(crate) fn new_connected(local_port: u16, remote: (Ipv4Addr, u16)) -> SocketShared {
        SocketShared {
            endpoint: Mutex::new(Endpoint {
                state: SocketState::Connected,
                local_port: Some(local_port),
                remote: Some(remote),
            }),
            rx: RecvBuffer::new(),
            ack: AckSlot::new(),
            requests: RequestQueue::new(),
        }
    }

    pub(crate) fn state(&self) -> SocketState {
        self.endpoint.lock().unwrap().state
    }

    fn set_state(&self, state: SocketState) {
        self.endpoint.lock().unwrap().state = state;
    }

    pub(crate) fn local_port(&self) -> Option<u16> {
        self.endpoint.lock().unwrap().local_port
    }

    fn set_local_port(&self, port: u16) {
        self.endpoint.lock().unwrap().local_port = Some(port);
    }

    pub(crate) fn remote(&self) -> Option<(Ipv4Addr, u16)> {
        self.endpoint.lock().unwrap().remote
    }

    fn set_remote(&self, remote: Option<(Ipv4Addr, u16)>) {
        self.endpoint.lock().unwrap().remote = remote;
    }

    /// Both endpoints at once, `None` unless fully addressed.
    pub(crate) fn endpoints(&self) -> Option<(u16, (Ipv4Addr, u16))> {
        let ep = self.endpoint.lock().unwrap();
        Some((ep.local_port?, ep.remote?))
    }

    /// Hands one in-order payload to the receive buffer. Dispatcher
    /// only.
    pub(crate) fn deliver(&self, payload: Vec<u8>) {
        self.rx.deliver(payload);
    }

    async fn recv(&self, max: usize) -> Vec<u8> {
        self.rx.recv(max).await
    }
}

/// Application-facing socket handle.
///
/// A handle owns no I/O itself; it shares a [`SocketShared`] with the
/// host's protocol dispatcher and drives the send side inline on the
/// calling task.
pub struct RdtSocket {
    pub(crate) shared: Arc<SocketShared>,
    pub(crate) proto: Arc<RdtProtocol>,
}

impl RdtSocket {
    /// Claims `port` for this socket. Rebinding to the same port is a
    /// no-op; a port already claimed by another socket on this host is
    /// refused.
    pub fn bind(&mut self, port: u16) -> Result<(), RdtError> {
        match self.shared.state() {
            SocketState::HalfOpen | SocketState::Connected => {
                return Err(RdtError::AlreadyConnected)
            }
            _ => {}
        }
        match self.shared.local_port() {
            Some(current) if current == port => return Ok(()),
            Some(current) => return Err(RdtError::AlreadyBound(current)),
            None => {}
        }
        self.proto.bind_port(port, &self.shared)?;
        self.shared.set_local_port(port);
        self.shared.set_state(SocketState::Bound);
        log::debug!("[rdt] {}:{} bound", self.proto.host_addr(), port);
        Ok(())
    }

    /// Marks the socket's port as accepting connection requests.
    pub fn listen(&mut self) -> Result<(), RdtError> {
        match self.shared.state() {
            SocketState::HalfOpen | SocketState::Connected => {
                return Err(RdtError::AlreadyConnected)
            }
            _ => {}
        }
        let port = self.shared.local_port().ok_or(RdtError::NotBound)?;
        self.proto.set_listening(port);
        self.shared.set_state(SocketState::Listening);
        log::debug!("[rdt] {}:{} listening", self.proto.host_addr(), port);
        Ok(())
    }

    /// Waits for a connection request and completes the handshake.
    /// Returns the connected child socket and the peer's address.
    pub async fn accept(&mut self) -> Result<(RdtSocket, (Ipv4Addr, u16)), RdtError> {
        if self.shared.state() != SocketState::Listening {
            return Err(RdtError::NotListening);
        }
        let port = self.shared.local_port().ok_or(RdtError::NotBound)?;
        let peer = self.shared.requests.pop().await;
        let child = self.proto.make_child_socket(port, peer);
        // Fire and forget: if this SYN-ACK is lost, the peer's SYN
        // retransmission triggers another one.
        self.proto.send_control(&child.shared, Flag::SynAck, 0);
        log::debug!(
            "[rdt] {}:{} accepted connection from {}:{}",
            self.proto.host_addr(),
            port,
            peer.0,
            peer.1
        );
        Ok((child, peer))
    }

    /// Performs the client side of the handshake: transmits a SYN
    /// until the peer's SYN-ACK arrives. An unbound socket picks an
    /// ephemeral port first. On failure the socket falls back to
    /// `Bound` so the application may retry.
    pub async fn connect(&mut self, peer: (Ipv4Addr, u16)) -> Result<(), RdtError> {
        match self.shared.state() {
            SocketState::HalfOpen | SocketState::Connected => {
                return Err(RdtError::AlreadyConnected)
            }
            SocketState::Listening => return Err(RdtError::AlreadyListening),
            SocketState::Unbound | SocketState::Bound => {}
        }
        let local_port = match self.shared.local_port() {
            Some(port) => port,
            None => {
                let port = self.proto.allocate_ephemeral_port(&self.shared);
                self.shared.set_local_port(port);
                port
            }
        };
        // The peer must be recorded before the first SYN leaves, the
        // dispatcher matches the SYN-ACK against it.
        self.shared.set_remote(Some(peer));
        self.shared.set_state(SocketState::HalfOpen);
        let syn = Segment::new(local_port, peer.1, 0, Flag::Syn, Vec::new());
        match self.send_reliable(syn, peer.0).await {
            Ok(()) => {
                self.shared.set_state(SocketState::Connected);
                log::debug!(
                    "[rdt] {}:{} connected to {}:{}",
                    self.proto.host_addr(),
                    local_port,
                    peer.0,
                    peer.1
                );
                Ok(())
            }
            Err(err) => {
                self.shared.set_state(SocketState::Bound);
                self.shared.set_remote(None);
                Err(err)
            }
        }
    }

    /// Sends one payload as a single data segment and waits for its
    /// acknowledgment. Payloads may be empty; an empty segment is a
    /// distinct message on the wire.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), RdtError> {
        if self.shared.state() != SocketState::Connected {
            return Err(RdtError::NotConnected);
        }
        let (local_port, (peer_addr, peer_port)) =
            self.shared.endpoints().ok_or(RdtError::NotConnected)?;
        let key = ConnKey {
            local_port,
            remote_port: peer_port,
            peer: peer_addr,
        };
        let seq = self.proto.seq_bit(&key).ok_or(RdtError::NotConnected)?;
        let seg = Segment::new(local_port, peer_port, seq, Flag::Data, payload.to_vec());
        self.send_reliable(seg, peer_addr).await?;
        // Acknowledged: the next data segment uses the other bit.
        self.proto.toggle_seq_bit(&key);
        Ok(())
    }

    /// Takes up to `max` bytes of the next message, waiting if none is
    /// buffered. Message boundaries are preserved: a read never spans
    /// two messages, and an empty message reads back as zero bytes.
    pub async fn recv(&mut self, max: usize) -> Vec<u8> {
        self.shared.recv(max).await
    }

    pub fn local_port(&self) -> Option<u16> {
        self.shared.local_port()
    }

    pub fn peer(&self) -> Option<(Ipv4Addr, u16)> {
        self.shared.remote()
    }

    pub fn state(&self) -> SocketState {
        self.shared.state()
    }

    /// Stop-and-wait core: transmit, wait for the acknowledgment slot,
    /// retransmit the identical frame on timeout.
    async fn send_reliable(&self, seg: Segment, dst: Ipv4Addr) -> Result<(), RdtError> {
        let mut ack_rx = self.shared.ack.arm();
        let frame = seg.to_bytes();
        let h = &seg.header;
        for attempt in 1..=MAX_RETRIES {
            log::debug!(
                "[rdt] {} → {}:{} {} seq={} len={} (attempt {}/{})",
                self.proto.host_addr(),
                dst,
                h.dst_port,
                h.flag,
                h.seq,
                seg.payload.len(),
                attempt,
                MAX_RETRIES
            );
            self.proto.transmit(&frame, dst);
            // Only the dispatcher completes the slot; a timeout means
            // the segment or its reply was lost, so send it again.
            if timeout(RETRANSMIT_TIMEOUT, &mut ack_rx).await.is_ok() {
                return Ok(());
            }
        }
        self.shared.ack.disarm();
        log::warn!(
            "[rdt] {} → {}:{} {} seq={} unacknowledged after {} attempts, giving up",
            self.proto.host_addr(),
            dst,
            h.dst_port,
            h.flag,
            h.seq,
            MAX_RETRIES
        );
        Err(RdtError::MaxRetriesExceeded)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::oneshot::error::TryRecvError;
    use tokio::time::{sleep, timeout};

    use super::*;

    #[tokio::test]
    async fn ack_signal_wakes_the_armed_receiver() {
        let slot = AckSlot::new();
        let rx = slot.arm();
        slot.signal();
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn ack_signal_without_an_armed_slot_is_dropped() {
        let slot = AckSlot::new();
        // Nothing is armed, so this acknowledgment has no waiter.
        slot.signal();
        let mut rx = slot.arm();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn ack_disarm_cancels_the_receiver() {
        let slot = AckSlot::new();
        let rx = slot.arm();
        slot.disarm();
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn request_queue_pops_in_arrival_order() {
        let queue = RequestQueue::new();
        let first = (Ipv4Addr::new(10, 0, 0, 1), 6000);
        let second = (Ipv4Addr::new(10, 0, 0, 2), 6001);
        queue.push(first);
        queue.push(second);
        assert_eq!(queue.pop().await, first);
        assert_eq!(queue.pop().await, second);
    }

    #[tokio::test]
    async fn request_queue_pop_waits_for_a_push() {
        let queue = Arc::new(RequestQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        sleep(Duration::from_millis(20)).await;
        let peer = (Ipv4Addr::new(10, 0, 0, 3), 7000);
        queue.push(peer);
        let got = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("pop did not wake")
            .unwrap();
        assert_eq!(got, peer);
    }
}
