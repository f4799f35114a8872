//! Network-wide address claim registry (spec.md §4.3): tracks which NAME
//! currently owns each source address, arbitrates conflicting claims, and
//! ages out addresses that have gone quiet.
//!
//! Arbitration is grounded on the teacher's `AddressManager::handle_frame`
//! ("In J1939/NMEA2000 the lowest NAME wins") and
//! `address_claiming::is_conflicting_claim`, generalized from "defend my
//! own address" to "record who currently holds every observed address" —
//! this crate tracks a fleet's worth of peers rather than claiming an
//! address for itself. Liveness sweep and conflict bookkeeping follow
//! `original_source/afs_fastapi/protocols/isobus_handlers.py`'s
//! `AddressClaimHandler` (`claimed_addresses`, `address_conflicts`).
use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::name::IsoName;

pub const PGN_ADDRESS_CLAIM: u32 = crate::codec::catalog::PGN_ADDRESS_CLAIM;
pub const PGN_ISO_REQUEST: u32 = crate::codec::catalog::PGN_ISO_REQUEST;

/// How competing claims for the same address are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbitrationPolicy {
    /// The first NAME seen on an address keeps it; later claims for the
    /// same address are rejected as conflicts (spec.md §4.3 default).
    FirstWriterWins,
    /// The numerically lowest NAME keeps the address, per the standard
    /// J1939 arbitration rule; a higher-NAME incumbent is evicted.
    LowestNameWins,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    pub address: u8,
    pub name: IsoName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// No prior claim existed for this address; it is now held by `name`.
    Claimed,
    /// A claim for an address already held by the same NAME (re-announce
    /// or defense); no state change.
    Reaffirmed,
    /// A competing claim arrived and the existing holder kept the address.
    ConflictRetained,
    /// A competing claim arrived and won arbitration, replacing the holder.
    ConflictReplaced,
}

#[derive(Debug, Clone, Copy)]
pub struct ConflictEvent {
    pub address: u8,
    pub existing_name: IsoName,
    pub incoming_name: IsoName,
    pub outcome: ClaimOutcome,
    pub at: Instant,
}

pub struct Registry {
    devices: Mutex<HashMap<u8, Device>>,
    conflicts: Mutex<Vec<ConflictEvent>>,
    last_seen: Mutex<HashMap<u8, Instant>>,
    policy: ArbitrationPolicy,
    liveness_timeout: Duration,
}

impl Registry {
    pub fn new(policy: ArbitrationPolicy, liveness_timeout: Duration) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            conflicts: Mutex::new(Vec::new()),
            last_seen: Mutex::new(HashMap::new()),
            policy,
            liveness_timeout,
        }
    }

    /// Record an incoming address claim (PGN 60928, 8-byte NAME payload).
    pub async fn on_address_claim(&self, address: u8, name: IsoName, now: Instant) -> ClaimOutcome {
        self.last_seen.lock().await.insert(address, now);

        let mut devices = self.devices.lock().await;
        let outcome = match devices.get(&address) {
            None => {
                devices.insert(address, Device { address, name });
                ClaimOutcome::Claimed
            }
            Some(existing) if existing.name == name => ClaimOutcome::Reaffirmed,
            Some(existing) => {
                let existing_name = existing.name;
                let replace = match self.policy {
                    ArbitrationPolicy::FirstWriterWins => false,
                    ArbitrationPolicy::LowestNameWins => name < existing_name,
                };
                if replace {
                    devices.insert(address, Device { address, name });
                    ClaimOutcome::ConflictReplaced
                } else {
                    ClaimOutcome::ConflictRetained
                }
            }
        };

        match outcome {
            ClaimOutcome::Claimed => debug!(address, ?name, "address claimed"),
            ClaimOutcome::ConflictRetained | ClaimOutcome::ConflictReplaced => {
                let existing_name = devices[&address].name;
                warn!(address, ?outcome, incoming = ?name, existing = ?existing_name, "address claim conflict");
                self.conflicts.lock().await.push(ConflictEvent {
                    address,
                    existing_name,
                    incoming_name: name,
                    outcome,
                    at: now,
                });
            }
            ClaimOutcome::Reaffirmed => {}
        }
        outcome
    }

    pub async fn lookup(&self, address: u8) -> Option<Device> {
        self.devices.lock().await.get(&address).copied()
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.devices.lock().await.values().copied().collect()
    }

    pub async fn conflicts(&self) -> Vec<ConflictEvent> {
        self.conflicts.lock().await.clone()
    }

    /// Remove addresses with no observed activity within the liveness
    /// window, returning the addresses that went offline.
    pub async fn sweep_offline(&self, now: Instant) -> Vec<u8> {
        let mut last_seen = self.last_seen.lock().await;
        let stale: Vec<u8> = last_seen
            .iter()
            .filter(|(_, &seen)| now.duration_since(seen) >= self.liveness_timeout)
            .map(|(&addr, _)| addr)
            .collect();

        let mut devices = self.devices.lock().await;
        for addr in &stale {
            devices.remove(addr);
            last_seen.remove(addr);
        }
        if !stale.is_empty() {
            info!(count = stale.len(), ?stale, "swept offline addresses");
        }
        stale
    }

    /// Note that `address` was heard from on an unrelated message, keeping
    /// it alive in the liveness sweep without touching its claimed NAME.
    pub async fn note_activity(&self, address: u8, now: Instant) {
        self.last_seen.lock().await.insert(address, now);
    }
}

/// Encode a NAME as the 8-byte little-endian PGN 60928 payload.
pub fn encode_claim(name: IsoName) -> [u8; 8] {
    name.raw().to_le_bytes()
}

/// Decode a PGN 60928 payload into its NAME.
pub fn decode_claim(data: &[u8; 8]) -> IsoName {
    IsoName::from_raw(u64::from_le_bytes(*data))
}

/// Build the 3-byte PGN payload for an ISO Request (PGN 59904) asking
/// peers to re-announce PGN 60928, used to probe for devices that have
/// gone quiet without sending a fresh claim.
pub fn address_claim_request_payload() -> [u8; 3] {
    let pgn = PGN_ADDRESS_CLAIM;
    [(pgn & 0xFF) as u8, ((pgn >> 8) & 0xFF) as u8, ((pgn >> 16) & 0xFF) as u8]
}
