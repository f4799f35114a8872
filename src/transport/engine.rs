//! RTS/CTS and BAM dispatch (spec.md §4.2), generalizing the teacher's
//! `FastPacketAssembler::process_frame` dispatch from a single fixed-size
//! session array to a `HashMap`-keyed pool behind a `tokio::sync::Mutex`,
//! since J1939 Transport Protocol sessions are destination-addressed (or
//! broadcast) and can run far longer than a Fast Packet burst.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::session::{AbortReason, DataOutcome, Session, SessionKey, SessionMode, SessionState};

const RTS: u8 = 16;
const CTS: u8 = 17;
const EOM_ACK: u8 = 19;
const BAM: u8 = 32;
const ABORT: u8 = 255;

pub const PGN_TRANSPORT_CM: u32 = crate::codec::catalog::PGN_TRANSPORT_CM;
pub const PGN_TRANSPORT_DT: u32 = crate::codec::catalog::PGN_TRANSPORT_DT;

const BROADCAST: u8 = 255;

#[derive(Debug, Error, PartialEq)]
pub enum TransportError {
    #[error("payload of {0} bytes fits in a single frame, no transport session needed")]
    PayloadFitsInSingleFrame(usize),
    #[error("payload of {0} bytes exceeds the 1785-byte transport protocol limit")]
    PayloadTooLarge(usize),
    #[error("a transport session between {source:#04X} and {destination:#04X} is already active")]
    SessionAlreadyActive { source: u8, destination: u8 },
    #[error("too many concurrent transport sessions")]
    SessionPoolExhausted,
}

/// One outbound frame an engine call wants the caller to transmit. Left as
/// raw `(pgn, destination, data)` rather than a `Frame`, since building the
/// 29-bit identifier (source address, priority) is the manager's job.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub pgn: u32,
    /// `None` for a BAM broadcast.
    pub destination: Option<u8>,
    pub data: [u8; 8],
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    FragmentConsumed,
    MessageComplete {
        pgn: u32,
        source: u8,
        destination: u8,
        payload: Vec<u8>,
    },
    /// An RTS/CTS session we were sending finished (peer sent `EOM_ACK`).
    SendAcknowledged { pgn: u32, source: u8, destination: u8 },
    Aborted {
        source: u8,
        destination: u8,
        reason: AbortReason,
    },
    /// A frame that needed no action and isn't otherwise worth counting
    /// (e.g. a CTS/EOM_ACK/ABORT referencing a session that no longer
    /// exists, or a single tolerated reordered/duplicate data frame).
    Ignored,
    /// `TP.CM` control byte wasn't RTS/CTS/EOM_ACK/BAM/ABORT.
    IgnoredUnknownControl,
    /// `TP.DT` data frame matched no open session.
    IgnoredOrphanData,
}

#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub session_timeout: Duration,
    /// Consecutive out-of-order/duplicate data frames tolerated before a
    /// session is aborted (spec.md §9 Open Question; DESIGN.md default 3).
    pub reorder_abort_threshold: u8,
    /// Packets requested per `CTS` round (J1939-21 byte 4 of `RTS`).
    pub max_packets_per_cts: u8,
    pub max_concurrent_sessions: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_millis(30_000),
            reorder_abort_threshold: 3,
            max_packets_per_cts: 16,
            max_concurrent_sessions: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionRole {
    Sender,
    Receiver,
}

struct TrackedSession {
    session: Session,
    role: SessionRole,
    packets_in_batch: u8,
    received_in_batch: u8,
}

pub struct TransportEngine {
    sessions: Mutex<HashMap<SessionKey, TrackedSession>>,
    config: TransportConfig,
}

impl TransportEngine {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Begin sending `payload` as `pgn` from `source`. `destination = None`
    /// sends a BAM broadcast (all data frames returned immediately, no
    /// flow control); `Some(da)` opens an RTS/CTS session and returns only
    /// the initial `RTS` frame.
    pub async fn begin_send(
        &self,
        pgn: u32,
        source: u8,
        destination: Option<u8>,
        payload: &[u8],
    ) -> Result<Vec<OutboundFrame>, TransportError> {
        if payload.len() <= 8 {
            return Err(TransportError::PayloadFitsInSingleFrame(payload.len()));
        }
        if payload.len() > 1785 {
            return Err(TransportError::PayloadTooLarge(payload.len()));
        }
        let total_packets = payload.len().div_ceil(7) as u8;

        match destination {
            None => {
                let mut frames = vec![OutboundFrame {
                    pgn: PGN_TRANSPORT_CM,
                    destination: None,
                    data: bam_announcement(payload.len(), total_packets, pgn),
                }];
                frames.extend(data_frames(payload, total_packets).map(|data| OutboundFrame {
                    pgn: PGN_TRANSPORT_DT,
                    destination: None,
                    data,
                }));
                Ok(frames)
            }
            Some(da) => {
                let key = SessionKey { source, destination: da, pgn };
                let mut sessions = self.sessions.lock().await;
                if sessions.contains_key(&key) {
                    return Err(TransportError::SessionAlreadyActive { source, destination: da });
                }
                if sessions.len() >= self.config.max_concurrent_sessions {
                    return Err(TransportError::SessionPoolExhausted);
                }
                let mut session = Session::new_rts(key, pgn, payload.len(), total_packets, Instant::now());
                session.buffer = payload.to_vec();
                sessions.insert(
                    key,
                    TrackedSession {
                        session,
                        role: SessionRole::Sender,
                        packets_in_batch: 0,
                        received_in_batch: 0,
                    },
                );
                Ok(vec![OutboundFrame {
                    pgn: PGN_TRANSPORT_CM,
                    destination: Some(da),
                    data: rts_announcement(payload.len(), total_packets, self.config.max_packets_per_cts, pgn),
                }])
            }
        }
    }

    /// Handle a `TP.CM` control frame (RTS, CTS, EOM_ACK, BAM or ABORT).
    pub async fn handle_control(
        &self,
        source: u8,
        destination: u8,
        data: [u8; 8],
    ) -> (Vec<TransportEvent>, Vec<OutboundFrame>) {
        match data[0] {
            RTS => self.handle_rts(source, destination, data).await,
            BAM => {
                let (event, outbound) = self.handle_bam(source, data).await;
                (vec![event], outbound)
            }
            CTS => {
                let (event, outbound) = self.handle_cts(source, destination, data).await;
                (vec![event], outbound)
            }
            EOM_ACK => {
                let (event, outbound) = self.handle_eom(source, destination).await;
                (vec![event], outbound)
            }
            ABORT => {
                let (event, outbound) = self.handle_abort(source, destination, data).await;
                (vec![event], outbound)
            }
            _ => (vec![TransportEvent::IgnoredUnknownControl], Vec::new()),
        }
    }

    /// Handle a `TP.DT` data frame. The frame carries no PGN of its own, so
    /// the owning session is located by `(source, destination)` alone.
    pub async fn handle_data(&self, source: u8, destination: u8, data: [u8; 8]) -> (Vec<TransportEvent>, Vec<OutboundFrame>) {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let Some(key) = find_key(&sessions, source, destination) else {
            return (vec![TransportEvent::IgnoredOrphanData], Vec::new());
        };
        let tracked = sessions.get_mut(&key).expect("key just found in this map");

        let sequence = data[0];
        if sequence != tracked.session.next_sequence {
            tracked.session.reorder_errors += 1;
            if tracked.session.reorder_errors >= self.config.reorder_abort_threshold {
                let reason = AbortReason::SessionReorder;
                let is_rts = tracked.session.mode == SessionMode::RtsCts;
                let pgn = tracked.session.pgn;
                warn!(source, destination, pgn, "aborting transport session after reorder threshold exceeded");
                sessions.remove(&key);
                let mut outbound = Vec::new();
                if is_rts {
                    outbound.push(OutboundFrame {
                        pgn: PGN_TRANSPORT_CM,
                        destination: Some(source),
                        data: abort_frame(reason, pgn),
                    });
                }
                return (
                    vec![TransportEvent::Aborted { source, destination, reason }],
                    outbound,
                );
            }
            return (vec![TransportEvent::Ignored], Vec::new());
        }

        match tracked.session.accept_data(sequence, &data[1..8], now) {
            DataOutcome::Overflow => {
                let reason = AbortReason::BufferOverflow;
                let is_rts = tracked.session.mode == SessionMode::RtsCts;
                let pgn = tracked.session.pgn;
                warn!(source, destination, pgn, "aborting transport session: buffer overflow");
                sessions.remove(&key);
                let mut outbound = Vec::new();
                if is_rts {
                    outbound.push(OutboundFrame {
                        pgn: PGN_TRANSPORT_CM,
                        destination: Some(source),
                        data: abort_frame(reason, pgn),
                    });
                }
                (vec![TransportEvent::Aborted { source, destination, reason }], outbound)
            }
            DataOutcome::Complete => {
                let pgn = tracked.session.pgn;
                let payload = std::mem::take(&mut tracked.session.buffer);
                let is_receiver_rts = tracked.role == SessionRole::Receiver && tracked.session.mode == SessionMode::RtsCts;
                sessions.remove(&key);
                let mut outbound = Vec::new();
                if is_receiver_rts {
                    outbound.push(OutboundFrame {
                        pgn: PGN_TRANSPORT_CM,
                        destination: Some(source),
                        data: eom_ack(payload.len(), pgn),
                    });
                }
                (
                    vec![TransportEvent::MessageComplete { pgn, source, destination, payload }],
                    outbound,
                )
            }
            DataOutcome::Continuing => {
                tracked.received_in_batch += 1;
                if tracked.session.mode == SessionMode::RtsCts
                    && tracked.role == SessionRole::Receiver
                    && tracked.received_in_batch >= tracked.packets_in_batch
                {
                    let remaining_packets = tracked.session.total_packets - (tracked.session.next_sequence - 1);
                    let batch = remaining_packets.min(self.config.max_packets_per_cts);
                    tracked.packets_in_batch = batch;
                    tracked.received_in_batch = 0;
                    let frame = cts_frame(batch, tracked.session.next_sequence, tracked.session.pgn);
                    return (
                        vec![TransportEvent::FragmentConsumed],
                        vec![OutboundFrame { pgn: PGN_TRANSPORT_CM, destination: Some(source), data: frame }],
                    );
                }
                (vec![TransportEvent::FragmentConsumed], Vec::new())
            }
        }
    }

    /// Remove and report sessions that have been idle past the configured
    /// timeout; call periodically from the manager's cleanup task.
    pub async fn expire_stale_sessions(&self) -> Vec<(SessionKey, u32)> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<SessionKey> = sessions
            .iter()
            .filter(|(_, tracked)| tracked.session.is_expired(now, self.config.session_timeout))
            .map(|(key, _)| *key)
            .collect();
        let mut out = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(tracked) = sessions.remove(&key) {
                debug!(source = key.source, destination = key.destination, pgn = tracked.session.pgn, "expiring idle transport session");
                out.push((key, tracked.session.pgn));
            }
        }
        out
    }

    /// Unconditionally remove every session regardless of its age, for
    /// shutdown: an in-flight session that hasn't timed out yet still
    /// has to be reported to callers as aborted, not silently dropped.
    pub async fn abort_all_sessions(&self) -> Vec<(SessionKey, u32)> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .drain()
            .map(|(key, tracked)| {
                debug!(source = key.source, destination = key.destination, pgn = tracked.session.pgn, "aborting transport session on shutdown");
                (key, tracked.session.pgn)
            })
            .collect()
    }

    pub async fn active_session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn handle_rts(&self, source: u8, destination: u8, data: [u8; 8]) -> (Vec<TransportEvent>, Vec<OutboundFrame>) {
        let total_size = u16::from_le_bytes([data[1], data[2]]) as usize;
        let total_packets = data[3];
        let requested_max = data[4];
        let pgn = pgn_from_bytes(&data[5..8]);
        let key = SessionKey { source, destination, pgn };

        let mut sessions = self.sessions.lock().await;
        let mut events = Vec::new();
        let mut outbound = Vec::new();

        // A session already open under this exact (source, destination,
        // pgn) key is replaced, not rejected (spec.md §4.2): the prior
        // session is aborted first, then the new RTS proceeds normally.
        if let Some(prior) = sessions.remove(&key) {
            warn!(source, destination, pgn, "replacing active transport session with a new RTS");
            events.push(TransportEvent::Aborted { source, destination, reason: AbortReason::ResourcesUnavailable });
            if prior.session.mode == SessionMode::RtsCts {
                outbound.push(OutboundFrame {
                    pgn: PGN_TRANSPORT_CM,
                    destination: Some(source),
                    data: abort_frame(AbortReason::ResourcesUnavailable, prior.session.pgn),
                });
            }
        } else if sessions.len() >= self.config.max_concurrent_sessions {
            events.push(TransportEvent::Aborted { source, destination, reason: AbortReason::ResourcesUnavailable });
            outbound.push(OutboundFrame {
                pgn: PGN_TRANSPORT_CM,
                destination: Some(source),
                data: abort_frame(AbortReason::ResourcesUnavailable, pgn),
            });
            return (events, outbound);
        }

        let mut session = Session::new_rts(key, pgn, total_size, total_packets, Instant::now());
        session.state = SessionState::AwaitingData;
        let batch = total_packets.min(requested_max.min(self.config.max_packets_per_cts));
        sessions.insert(
            key,
            TrackedSession {
                session,
                role: SessionRole::Receiver,
                packets_in_batch: batch,
                received_in_batch: 0,
            },
        );
        let frame = cts_frame(batch, 1, pgn);
        events.push(TransportEvent::FragmentConsumed);
        outbound.push(OutboundFrame { pgn: PGN_TRANSPORT_CM, destination: Some(source), data: frame });
        (events, outbound)
    }

    async fn handle_bam(&self, source: u8, data: [u8; 8]) -> (TransportEvent, Vec<OutboundFrame>) {
        let total_size = u16::from_le_bytes([data[1], data[2]]) as usize;
        let total_packets = data[3];
        let pgn = pgn_from_bytes(&data[5..8]);
        let key = SessionKey { source, destination: BROADCAST, pgn };

        let mut sessions = self.sessions.lock().await;
        if sessions.len() >= self.config.max_concurrent_sessions && !sessions.contains_key(&key) {
            return (
                TransportEvent::Aborted { source, destination: BROADCAST, reason: AbortReason::ResourcesUnavailable },
                Vec::new(),
            );
        }
        let session = Session::new_bam(key, pgn, total_size, total_packets, Instant::now());
        sessions.insert(
            key,
            TrackedSession { session, role: SessionRole::Receiver, packets_in_batch: total_packets, received_in_batch: 0 },
        );
        (TransportEvent::FragmentConsumed, Vec::new())
    }

    async fn handle_cts(&self, source: u8, destination: u8, data: [u8; 8]) -> (TransportEvent, Vec<OutboundFrame>) {
        // Reverse direction: the CTS sender is the original message's
        // destination. A data frame carries no PGN, and neither does CTS,
        // so the session is found by endpoints alone.
        let num_packets = data[1];
        let next_packet = data[2];

        let mut sessions = self.sessions.lock().await;
        let Some(key) = find_key(&sessions, destination, source) else {
            return (TransportEvent::Ignored, Vec::new());
        };
        let tracked = sessions.get_mut(&key).expect("key just found in this map");
        if tracked.role != SessionRole::Sender {
            return (TransportEvent::Ignored, Vec::new());
        }
        tracked.session.last_activity = Instant::now();
        if num_packets == 0 {
            // Peer is holding off; nothing to send yet.
            return (TransportEvent::FragmentConsumed, Vec::new());
        }

        let start = (next_packet - 1) as usize * 7;
        let frames: Vec<OutboundFrame> = data_frames(&tracked.session.buffer[start..], num_packets)
            .enumerate()
            .map(|(i, bytes)| {
                let mut frame = bytes;
                frame[0] = next_packet + i as u8;
                OutboundFrame { pgn: PGN_TRANSPORT_DT, destination: Some(destination), data: frame }
            })
            .collect();
        tracked.session.state = SessionState::AwaitingData;
        (TransportEvent::FragmentConsumed, frames)
    }

    async fn handle_eom(&self, source: u8, destination: u8) -> (TransportEvent, Vec<OutboundFrame>) {
        let mut sessions = self.sessions.lock().await;
        let Some(key) = find_key(&sessions, destination, source) else {
            return (TransportEvent::Ignored, Vec::new());
        };
        let tracked = sessions.remove(&key).expect("key just found in this map");
        (
            TransportEvent::SendAcknowledged { pgn: tracked.session.pgn, source: destination, destination: source },
            Vec::new(),
        )
    }

    async fn handle_abort(&self, source: u8, destination: u8, data: [u8; 8]) -> (TransportEvent, Vec<OutboundFrame>) {
        let mut sessions = self.sessions.lock().await;
        let key = find_key(&sessions, source, destination).or_else(|| find_key(&sessions, destination, source));
        let Some(key) = key else {
            return (TransportEvent::Ignored, Vec::new());
        };
        sessions.remove(&key);
        let reason = abort_reason_from_code(data[1]);
        (TransportEvent::Aborted { source: key.source, destination: key.destination, reason }, Vec::new())
    }
}

/// Find the session key matching `(source, destination)` regardless of
/// `pgn`, since `TP.DT`/CTS/EOM_ACK/ABORT frames don't carry the original
/// message's PGN. At most one session is expected per direction; if more
/// than one somehow exists, the first match is used.
fn find_key(sessions: &HashMap<SessionKey, TrackedSession>, source: u8, destination: u8) -> Option<SessionKey> {
    sessions.keys().find(|k| k.source == source && k.destination == destination).copied()
}

fn pgn_from_bytes(bytes: &[u8]) -> u32 {
    (bytes[0] as u32) | ((bytes[1] as u32) << 8) | ((bytes[2] as u32) << 16)
}

fn pgn_to_bytes(pgn: u32) -> [u8; 3] {
    [(pgn & 0xFF) as u8, ((pgn >> 8) & 0xFF) as u8, ((pgn >> 16) & 0xFF) as u8]
}

fn rts_announcement(total_size: usize, total_packets: u8, max_packets_per_cts: u8, pgn: u32) -> [u8; 8] {
    let size = (total_size as u16).to_le_bytes();
    let pgn_bytes = pgn_to_bytes(pgn);
    [RTS, size[0], size[1], total_packets, max_packets_per_cts, pgn_bytes[0], pgn_bytes[1], pgn_bytes[2]]
}

fn bam_announcement(total_size: usize, total_packets: u8, pgn: u32) -> [u8; 8] {
    let size = (total_size as u16).to_le_bytes();
    let pgn_bytes = pgn_to_bytes(pgn);
    [BAM, size[0], size[1], total_packets, 0xFF, pgn_bytes[0], pgn_bytes[1], pgn_bytes[2]]
}

fn cts_frame(num_packets: u8, next_packet: u8, pgn: u32) -> [u8; 8] {
    let pgn_bytes = pgn_to_bytes(pgn);
    [CTS, num_packets, next_packet, 0xFF, 0xFF, pgn_bytes[0], pgn_bytes[1], pgn_bytes[2]]
}

fn eom_ack(total_size: usize, pgn: u32) -> [u8; 8] {
    let size = (total_size as u16).to_le_bytes();
    let pgn_bytes = pgn_to_bytes(pgn);
    [EOM_ACK, size[0], size[1], 0xFF, 0xFF, pgn_bytes[0], pgn_bytes[1], pgn_bytes[2]]
}

fn abort_frame(reason: AbortReason, pgn: u32) -> [u8; 8] {
    let pgn_bytes = pgn_to_bytes(pgn);
    [ABORT, reason.code(), 0xFF, 0xFF, 0xFF, pgn_bytes[0], pgn_bytes[1], pgn_bytes[2]]
}

fn abort_reason_from_code(code: u8) -> AbortReason {
    match code {
        3 => AbortReason::Timeout,
        2 => AbortReason::ResourcesUnavailable,
        6 => AbortReason::BufferOverflow,
        251 => AbortReason::SessionReorder,
        _ => AbortReason::PeerAborted,
    }
}

/// Split `payload` into `count` seven-byte `TP.DT` frames (sequence number
/// in byte 0, starting at 1), padding the final frame with `0xFF`.
fn data_frames(payload: &[u8], count: u8) -> impl Iterator<Item = [u8; 8]> + '_ {
    (0..count).map(move |i| {
        let start = i as usize * 7;
        let end = (start + 7).min(payload.len());
        let mut frame = [0xFFu8; 8];
        frame[0] = i + 1;
        if start < payload.len() {
            frame[1..1 + (end - start)].copy_from_slice(&payload[start..end]);
        }
        frame
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TransportConfig {
        TransportConfig { max_packets_per_cts: 2, ..Default::default() }
    }

    #[tokio::test]
    async fn bam_send_emits_announcement_and_all_data_frames() {
        let engine = TransportEngine::new(config());
        let payload = vec![0xAAu8; 15];
        let frames = engine.begin_send(0xFEF3, 0x20, None, &payload).await.unwrap();
        assert_eq!(frames[0].pgn, PGN_TRANSPORT_CM);
        assert_eq!(frames[0].data[0], BAM);
        assert_eq!(frames.len(), 1 + 3); // ceil(15/7) = 3 data frames
    }

    #[tokio::test]
    async fn bam_receive_reassembles_across_frames() {
        let engine = TransportEngine::new(config());
        let announce = bam_announcement(9, 2, 0xFEF3);
        let (events, _) = engine.handle_control(0x20, BROADCAST, announce).await;
        assert_eq!(events, vec![TransportEvent::FragmentConsumed]);

        let mut f1 = [0xFFu8; 8];
        f1[0] = 1;
        f1[1..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7]);
        let (events, _) = engine.handle_data(0x20, BROADCAST, f1).await;
        assert_eq!(events, vec![TransportEvent::FragmentConsumed]);

        let mut f2 = [0xFFu8; 8];
        f2[0] = 2;
        f2[1] = 8;
        f2[2] = 9;
        let (events, _) = engine.handle_data(0x20, BROADCAST, f2).await;
        match &events[..] {
            [TransportEvent::MessageComplete { payload, pgn, .. }] => {
                assert_eq!(*pgn, 0xFEF3);
                assert_eq!(payload, &vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
            }
            other => panic!("expected MessageComplete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rts_cts_round_trip_sends_requested_batch_then_next_cts() {
        let engine = TransportEngine::new(config()); // max_packets_per_cts = 2
        let rts = rts_announcement(15, 3, 0xFF, 0xFEF3);
        let (_, outbound) = engine.handle_control(0x30, 0x10, rts).await;
        assert_eq!(outbound[0].data[0], CTS);
        assert_eq!(outbound[0].data[1], 2); // batch capped to config max

        let mut f1 = [0xFFu8; 8];
        f1[0] = 1;
        f1[1..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7]);
        let (_, outbound) = engine.handle_data(0x30, 0x10, f1).await;
        assert!(outbound.is_empty());

        let mut f2 = [0xFFu8; 8];
        f2[0] = 2;
        f2[1..8].copy_from_slice(&[8, 9, 10, 11, 12, 13, 14]);
        let (events, outbound) = engine.handle_data(0x30, 0x10, f2).await;
        assert_eq!(events, vec![TransportEvent::FragmentConsumed]);
        assert_eq!(outbound[0].data[0], CTS);
        assert_eq!(outbound[0].data[2], 3); // next packet to request

        let mut f3 = [0xFFu8; 8];
        f3[0] = 3;
        f3[1] = 15;
        let (events, _) = engine.handle_data(0x30, 0x10, f3).await;
        match &events[..] {
            [TransportEvent::MessageComplete { payload, .. }] => assert_eq!(payload.len(), 15),
            other => panic!("expected MessageComplete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn out_of_order_frames_abort_after_threshold() {
        let engine = TransportEngine::new(TransportConfig { reorder_abort_threshold: 2, ..config() });
        let announce = bam_announcement(9, 2, 0xFEF3);
        engine.handle_control(0x20, BROADCAST, announce).await;

        let mut bad = [0xFFu8; 8];
        bad[0] = 5; // wrong sequence twice in a row
        engine.handle_data(0x20, BROADCAST, bad).await;
        let (events, _) = engine.handle_data(0x20, BROADCAST, bad).await;
        assert_eq!(
            events,
            vec![TransportEvent::Aborted { source: 0x20, destination: BROADCAST, reason: AbortReason::SessionReorder }]
        );
    }

    #[tokio::test]
    async fn single_reordered_frame_is_tolerated() {
        let engine = TransportEngine::new(config());
        let announce = bam_announcement(9, 2, 0xFEF3);
        engine.handle_control(0x20, BROADCAST, announce).await;

        let mut bad = [0xFFu8; 8];
        bad[0] = 9;
        let (events, _) = engine.handle_data(0x20, BROADCAST, bad).await;
        assert_eq!(events, vec![TransportEvent::Ignored]);
        assert_eq!(engine.active_session_count().await, 1);
    }

    #[tokio::test]
    async fn unknown_control_byte_is_ignored_and_distinguishable() {
        let engine = TransportEngine::new(config());
        let mut data = [0xFFu8; 8];
        data[0] = 200; // not RTS/CTS/EOM_ACK/BAM/ABORT
        let (events, outbound) = engine.handle_control(0x20, 0x10, data).await;
        assert_eq!(events, vec![TransportEvent::IgnoredUnknownControl]);
        assert!(outbound.is_empty());
    }

    #[tokio::test]
    async fn data_frame_with_no_matching_session_is_an_orphan() {
        let engine = TransportEngine::new(config());
        let mut data = [0xFFu8; 8];
        data[0] = 1;
        let (events, _) = engine.handle_data(0x20, 0x10, data).await;
        assert_eq!(events, vec![TransportEvent::IgnoredOrphanData]);
    }

    #[tokio::test]
    async fn concurrent_sessions_for_different_pgns_do_not_collide() {
        let engine = TransportEngine::new(config());
        engine.handle_control(0x20, BROADCAST, bam_announcement(9, 2, 0xFEF3)).await;
        engine.handle_control(0x20, BROADCAST, bam_announcement(9, 2, 0xFEE9)).await;
        assert_eq!(engine.active_session_count().await, 2);
    }

    #[tokio::test]
    async fn rts_with_same_key_as_active_session_replaces_it() {
        let engine = TransportEngine::new(config());
        let rts = rts_announcement(15, 3, 0xFF, 0xFEF3);
        engine.handle_control(0x30, 0x10, rts).await;
        assert_eq!(engine.active_session_count().await, 1);

        let (events, outbound) = engine.handle_control(0x30, 0x10, rts).await;
        assert_eq!(
            events,
            vec![
                TransportEvent::Aborted { source: 0x30, destination: 0x10, reason: AbortReason::ResourcesUnavailable },
                TransportEvent::FragmentConsumed,
            ]
        );
        // Prior session's abort frame, then the new session's CTS.
        assert_eq!(outbound[0].data[0], ABORT);
        assert_eq!(outbound[1].data[0], CTS);
        assert_eq!(engine.active_session_count().await, 1);
    }

    #[tokio::test]
    async fn non_final_frame_exceeding_total_size_aborts_session() {
        let engine = TransportEngine::new(config());
        // total_size=5 declared over 3 packets: the first (non-final) frame
        // already delivers 7 bytes, more than the declared total.
        let rts = rts_announcement(5, 3, 0xFF, 0xFEF3);
        engine.handle_control(0x30, 0x10, rts).await;

        let mut f1 = [0xFFu8; 8];
        f1[0] = 1;
        f1[1..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7]);
        let (events, outbound) = engine.handle_data(0x30, 0x10, f1).await;
        assert_eq!(
            events,
            vec![TransportEvent::Aborted { source: 0x30, destination: 0x10, reason: AbortReason::BufferOverflow }]
        );
        assert_eq!(outbound[0].data[0], ABORT);
        assert_eq!(engine.active_session_count().await, 0);
    }

    #[tokio::test]
    async fn payload_fitting_in_one_frame_is_rejected() {
        let engine = TransportEngine::new(config());
        let result = engine.begin_send(0xFEF3, 0x20, None, &[1, 2, 3]).await;
        assert_eq!(result, Err(TransportError::PayloadFitsInSingleFrame(3)));
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let engine = TransportEngine::new(config());
        let payload = vec![0u8; 1786];
        let result = engine.begin_send(0xFEF3, 0x20, Some(0x10), &payload).await;
        assert_eq!(result, Err(TransportError::PayloadTooLarge(1786)));
    }
}
