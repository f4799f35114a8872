//! Agricultural CAN/ISOBUS (ISO 11783 / SAE J1939) protocol engine core.
//!
//! Exposes the wire codec, address claiming, transport protocol,
//! diagnostics, outbound queueing, congestion/bandwidth management, and
//! routing as individually usable modules, composed by [`manager`] into
//! one running engine an embedding application drives with frames read
//! from (and written to) its own CAN transceiver.

/// Runtime configuration (queue, batch, congestion, bandwidth, transport,
/// dedup settings) with documented defaults.
pub mod config;
/// Crate-level error composition over each subsystem's own error enum.
pub mod error;

pub mod address;
pub mod bandwidth;
/// Wire-level codec: identifiers, frames, the static PGN/SPN catalog, and
/// decode/encode operations.
pub mod codec;
pub mod congestion;
pub mod diagnostics;
pub mod manager;
/// Process-wide failure counters, snapshot for status reporting.
pub mod metrics;
pub mod queue;
pub mod router;
pub mod transport;

pub use config::Config;
pub use error::ProtocolError;
pub use manager::{
    BatchSink, DecodedMessage, DecodedSink, ManagerEvent, NetworkStatus, ProtocolManager,
    RawFrameSink,
};
pub use metrics::{Metrics, MetricsSnapshot};
