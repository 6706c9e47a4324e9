//! Reliable data transfer over an unreliable, in-process link.
//!
//! The crate provides a small connection-oriented transport with
//! TCP-shaped socket calls (`bind`, `listen`, `accept`, `connect`,
//! `send`, `recv`) running over a simulated network that corrupts and
//! drops frames but never reorders or duplicates them. Reliability
//! comes from an additive checksum, a single-bit alternating sequence
//! number, and bounded stop-and-wait retransmission.
//!
//! ```text
//!   application A                        application B
//!        │ bind/listen/accept                 │ connect/send/recv
//!   ┌────▼─────┐                         ┌────▼─────┐
//!   │RdtSocket │                         │RdtSocket │
//!   └────┬─────┘                         └────┬─────┘
//!        │ shared state                       │
//!   ┌────▼────────┐      segments       ┌────▼────────┐
//!   │ RdtProtocol │◀───────────────────▶│ RdtProtocol │
//!   └────┬────────┘                     └────┬────────┘
//!        │ transmit/input                    │
//!   ┌────▼────────────────────────────────▼────┐
//!   │        Network (loss and corruption)      │
//!   └───────────────────────────────────────────┘
//! ```
//!
//! Module responsibilities:
//!
//!   * [`segment`]: wire format, flags and checksum
//!   * [`socket`]: socket handles, states and the stop-and-wait sender
//!   * [`protocol`]: per-host demultiplexing and inbound dispatch
//!   * [`simulator`]: hosts, the faulty link and its statistics

mod buffer;
pub mod protocol;
pub mod segment;
pub mod simulator;
pub mod socket;

pub use protocol::{RdtProtocol, IPPROTO_RDT};
pub use segment::{Flag, Segment, SegmentError, HEADER_LEN};
pub use simulator::{Host, Network, SimStats, SimulatorConfig, Transport};
pub use socket::{RdtError, RdtSocket, SocketState, MAX_RETRIES, RETRANSMIT_TIMEOUT};
