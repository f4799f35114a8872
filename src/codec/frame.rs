//! In-memory representation of a received/transmitted CAN frame.
//!
//! Ported from the teacher's `protocol/transport/can_frame::CanFrame`,
//! extended per spec.md §3 with the extended-ID flag, error/remote flags,
//! a reception timestamp, and the originating interface tag used at the
//! frame source/sink boundary (spec.md §6).
use std::sync::Arc;
use std::time::Instant;

use super::identifier::Identifier;

/// Maximum classic-CAN payload length.
pub const MAX_CLASSIC_LEN: usize = 8;
/// Maximum CAN FD payload length (spec.md §3, optional).
pub const MAX_FD_LEN: usize = 64;

#[derive(Clone, Debug)]
pub struct Frame {
    /// Raw 29-bit identifier (or 11-bit, when `extended` is false).
    pub id: u32,
    pub extended: bool,
    pub data: Vec<u8>,
    pub error_flag: bool,
    pub remote_flag: bool,
    pub timestamp: Instant,
    /// Opaque tag identifying the physical interface this frame arrived
    /// on or should be sent to (spec.md §6: "interfaces are opaque strings").
    pub interface: Arc<str>,
}

impl Frame {
    pub fn new(id: u32, extended: bool, data: Vec<u8>, interface: impl Into<Arc<str>>) -> Self {
        Self {
            id,
            extended,
            data,
            error_flag: false,
            remote_flag: false,
            timestamp: Instant::now(),
            interface: interface.into(),
        }
    }

    /// Decompose the raw identifier, when this is an extended (29-bit) frame.
    pub fn identifier(&self) -> Option<Identifier> {
        if self.extended {
            Some(Identifier::from_raw(self.id))
        } else {
            None
        }
    }
}
