//! Per-peer Transport Protocol reassembly session (spec.md §4.2).
//!
//! Generalizes the teacher's `FastPacketSession`/`SessionState` pair
//! (`protocol/transport/fast_packet/assembler/mod.rs`) from a fixed
//! 6-sessions-of-223-bytes NMEA 2000 Fast Packet pool to J1939's
//! destination-addressed RTS/CTS and broadcast BAM sessions: a growable
//! `Vec<u8>` buffer (messages run up to 1785 bytes, spec.md §4.2) keyed in
//! a map rather than a fixed array, and a timestamp for idle-session
//! expiry instead of the teacher's purely frame-driven reset.
use std::time::Instant;

/// Identifies one reassembly session. BAM sessions use `destination = 255`
/// (the broadcast address); RTS/CTS sessions use the real peer address.
/// `pgn` is part of the key (spec.md §3) so two concurrent sessions between
/// the same source/destination pair for different PGNs never collide; a
/// `TP.DT` data frame carries no PGN of its own, so matching one back to its
/// session still has to search by `(source, destination)` alone (see
/// `TransportEngine`'s `find_key`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub source: u8,
    pub destination: u8,
    pub pgn: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Broadcast Announce Message: no flow control, frames arrive back to
    /// back at the sender's own pace.
    Bam,
    /// RTS/CTS: flow-controlled, destination-specific.
    RtsCts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// RTS sent/received, awaiting the peer's CTS (RTS/CTS sessions only).
    AwaitingClearToSend,
    /// Actively receiving or sending `TP.DT` data frames.
    AwaitingData,
    Complete,
    Aborted,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Too many out-of-order or duplicated data frames.
    SessionReorder,
    /// No activity within the session timeout.
    Timeout,
    /// The peer sent an explicit `TP.CM Abort` control frame.
    PeerAborted,
    /// Resources to run the session were unavailable (e.g. session pool
    /// exhausted, or a conflicting session is already open for this peer).
    ResourcesUnavailable,
    /// A data frame would have written past the session's declared
    /// `total_size` (spec.md §4.2 "session buffer overflow").
    BufferOverflow,
}

impl AbortReason {
    /// J1939-21 Connection Abort reason code.
    pub fn code(self) -> u8 {
        match self {
            Self::SessionReorder => 251,
            Self::Timeout => 3,
            Self::PeerAborted => 255,
            Self::ResourcesUnavailable => 2,
            Self::BufferOverflow => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    Continuing,
    Complete,
    Overflow,
}

/// One in-flight reassembly or transmission.
#[derive(Debug, Clone)]
pub struct Session {
    pub key: SessionKey,
    pub mode: SessionMode,
    pub state: SessionState,
    pub pgn: u32,
    pub total_size: usize,
    pub total_packets: u8,
    /// Sequence number (1-based) of the next `TP.DT` frame expected.
    pub next_sequence: u8,
    pub buffer: Vec<u8>,
    /// Consecutive out-of-order/duplicate data frames seen since the last
    /// good frame (spec.md §4.2: a single reordered/duplicated frame is
    /// tolerated; this counts how many have piled up without progress).
    pub reorder_errors: u8,
    pub last_activity: Instant,
}

impl Session {
    pub fn new_rts(key: SessionKey, pgn: u32, total_size: usize, total_packets: u8, now: Instant) -> Self {
        Self {
            key,
            mode: SessionMode::RtsCts,
            state: SessionState::AwaitingClearToSend,
            pgn,
            total_size,
            total_packets,
            next_sequence: 1,
            buffer: Vec::with_capacity(total_size),
            reorder_errors: 0,
            last_activity: now,
        }
    }

    pub fn new_bam(key: SessionKey, pgn: u32, total_size: usize, total_packets: u8, now: Instant) -> Self {
        Self {
            key,
            mode: SessionMode::Bam,
            state: SessionState::AwaitingData,
            pgn,
            total_size,
            total_packets,
            next_sequence: 1,
            buffer: Vec::with_capacity(total_size),
            reorder_errors: 0,
            last_activity: now,
        }
    }

    /// Append one `TP.DT` frame's payload bytes (already stripped of the
    /// leading sequence-number byte) if `sequence` is the one expected.
    ///
    /// Every frame but the last carries a full 7 bytes regardless of how
    /// much of `total_size` remains (the last is trimmed to fit); a
    /// non-final frame that still doesn't fit means the sender's declared
    /// `total_size` was too small, which aborts the session instead of
    /// silently truncating it.
    pub fn accept_data(&mut self, sequence: u8, data: &[u8], now: Instant) -> DataOutcome {
        self.last_activity = now;
        let remaining = self.total_size.saturating_sub(self.buffer.len());
        let is_final_frame = sequence >= self.total_packets;
        if data.len() > remaining && !is_final_frame {
            self.state = SessionState::Aborted;
            return DataOutcome::Overflow;
        }

        let take = remaining.min(data.len());
        self.buffer.extend_from_slice(&data[..take]);
        self.next_sequence = sequence.wrapping_add(1);
        self.reorder_errors = 0;
        if self.buffer.len() >= self.total_size {
            self.state = SessionState::Complete;
            DataOutcome::Complete
        } else {
            DataOutcome::Continuing
        }
    }

    pub fn is_expired(&self, now: Instant, timeout: std::time::Duration) -> bool {
        now.duration_since(self.last_activity) >= timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bam_session_completes_once_buffer_is_full() {
        let now = Instant::now();
        let mut session = Session::new_bam(
            SessionKey { source: 0x20, destination: 255, pgn: 0xFEF3 },
            0xFEF3,
            9,
            2,
            now,
        );
        assert_eq!(session.accept_data(1, &[1, 2, 3, 4, 5, 6, 7], now), DataOutcome::Continuing);
        assert_eq!(session.accept_data(2, &[8, 9], now), DataOutcome::Complete);
        assert_eq!(session.buffer, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(session.state, SessionState::Complete);
    }

    #[test]
    fn non_final_frame_overflowing_total_size_aborts() {
        let now = Instant::now();
        let mut session = Session::new_bam(
            SessionKey { source: 0x20, destination: 255, pgn: 0xFEF3 },
            0xFEF3,
            9,
            3,
            now,
        );
        // Declares 3 packets but the first frame alone already exceeds the
        // 9-byte total_size and isn't the final (3rd) frame.
        assert_eq!(session.accept_data(1, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], now), DataOutcome::Overflow);
        assert_eq!(session.state, SessionState::Aborted);
    }

    #[test]
    fn expiry_is_relative_to_last_activity() {
        let now = Instant::now();
        let session = Session::new_bam(SessionKey { source: 1, destination: 255, pgn: 0xFEF3 }, 0xFEF3, 9, 2, now);
        assert!(!session.is_expired(now, std::time::Duration::from_millis(30_000)));
    }
}
