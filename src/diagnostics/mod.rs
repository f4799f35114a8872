//! J1939 diagnostic messages: DM1 (active) and DM2 (previously active)
//! trouble codes (spec.md §4.4).
//!
//! Decode logic is grounded on
//! `original_source/afs_fastapi/protocols/isobus_handlers.py`'s
//! `DiagnosticHandler._parse_lamp_status`/`_parse_dtc`, adjusted to the
//! standard J1939-73 5-bit FMI field (spec.md §4.4) rather than the
//! Python reference's narrower 3-bit read; per-source-address tracking
//! with change-detection follows the same module's `active_dtcs`/
//! `inactive_dtcs` dictionaries, ported to a `tokio::sync::Mutex`-guarded
//! map per this crate's concurrency model.
use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiagnosticsError {
    #[error("DM1/DM2 payload must be at least 6 bytes (lamp status + one DTC), got {0}")]
    PayloadTooShort(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LampState {
    Off,
    On,
    Reserved,
    NotAvailable,
}

impl LampState {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::Off,
            1 => Self::On,
            2 => Self::Reserved,
            _ => Self::NotAvailable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LampStatus {
    pub malfunction_indicator: LampState,
    pub red_stop: LampState,
    pub amber_warning: LampState,
    pub protect: LampState,
}

impl LampStatus {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            malfunction_indicator: LampState::from_bits(byte >> 6),
            red_stop: LampState::from_bits(byte >> 4),
            amber_warning: LampState::from_bits(byte >> 2),
            protect: LampState::from_bits(byte),
        }
    }
}

/// One J1939 Diagnostic Trouble Code (4-byte wire record).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dtc {
    pub spn: u32,
    pub fmi: u8,
    /// SPN conversion method bit: selects between the two DTC byte
    /// layouts defined by J1939-73; this crate only implements layout 0.
    pub conversion_method: bool,
    pub occurrence_count: u8,
}

fn parse_dtc(bytes: &[u8]) -> Option<Dtc> {
    let spn = bytes[0] as u32 | ((bytes[1] as u32) << 8) | (((bytes[2] & 0x03) as u32) << 16);
    let conversion_method = (bytes[2] & 0x04) != 0;
    let fmi = (bytes[2] >> 3) & 0x1F;
    let occurrence_count = bytes[3] & 0x7F;

    if spn == 0 && fmi == 0 {
        return None;
    }
    Some(Dtc { spn, fmi, conversion_method, occurrence_count })
}

fn parse_dtcs(dtc_bytes: &[u8]) -> Vec<Dtc> {
    dtc_bytes.chunks_exact(4).filter_map(parse_dtc).collect()
}

/// Decode a DM1/DM2 payload into its lamp status and DTC list. Both
/// messages share the same wire layout; only their PGN and which bucket
/// (active vs. previously active) the caller files them under differ.
pub fn decode(payload: &[u8]) -> Result<(LampStatus, Vec<Dtc>), DiagnosticsError> {
    if payload.len() < 6 {
        return Err(DiagnosticsError::PayloadTooShort(payload.len()));
    }
    let lamp_status = LampStatus::from_byte(payload[0]);
    let dtcs = parse_dtcs(&payload[2..]);
    Ok((lamp_status, dtcs))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDiagnostics {
    pub lamp_status: LampStatus,
    pub active: Vec<Dtc>,
    pub previously_active: Vec<Dtc>,
}

/// Tracks the latest DM1/DM2 state per source address and reports which
/// addresses changed on each update, so callers can drive
/// "new fault"/"fault cleared" notifications without diffing themselves.
pub struct DiagnosticsTracker {
    devices: Mutex<HashMap<u8, DeviceDiagnostics>>,
}

impl Default for DiagnosticsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsTracker {
    pub fn new() -> Self {
        Self { devices: Mutex::new(HashMap::new()) }
    }

    /// Apply a DM1 payload from `source`, returning `true` if the active
    /// DTC set changed.
    pub async fn apply_dm1(&self, source: u8, payload: &[u8]) -> Result<bool, DiagnosticsError> {
        let (lamp_status, active) = decode(payload)?;
        let mut devices = self.devices.lock().await;
        let entry = devices.entry(source).or_insert_with(|| DeviceDiagnostics {
            lamp_status,
            active: Vec::new(),
            previously_active: Vec::new(),
        });
        let changed = entry.active != active || entry.lamp_status != lamp_status;
        entry.lamp_status = lamp_status;
        entry.active = active;
        Ok(changed)
    }

    /// Apply a DM2 payload from `source`, returning `true` if the
    /// previously-active DTC set changed.
    pub async fn apply_dm2(&self, source: u8, payload: &[u8]) -> Result<bool, DiagnosticsError> {
        let (_, previously_active) = decode(payload)?;
        let mut devices = self.devices.lock().await;
        let entry = devices.entry(source).or_insert_with(|| DeviceDiagnostics {
            lamp_status: LampStatus::from_byte(0),
            active: Vec::new(),
            previously_active: Vec::new(),
        });
        let changed = entry.previously_active != previously_active;
        entry.previously_active = previously_active;
        Ok(changed)
    }

    pub async fn snapshot(&self, source: u8) -> Option<DeviceDiagnostics> {
        self.devices.lock().await.get(&source).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s6_dm1_decodes_spn_fmi_and_count() {
        // SPN 110 (0x6E), FMI 3, occurrence count 5.
        let spn_low = (110u32 & 0xFF) as u8;
        let spn_mid = ((110u32 >> 8) & 0xFF) as u8;
        let byte2 = ((110u32 >> 16) & 0x03) as u8 | (3 << 3);
        let payload = [0x00, 0xFF, spn_low, spn_mid, byte2, 5, 0xFF, 0xFF];
        let (lamp, dtcs) = decode(&payload).unwrap();
        assert_eq!(lamp.malfunction_indicator, LampState::Off);
        assert_eq!(dtcs.len(), 1);
        assert_eq!(dtcs[0].spn, 110);
        assert_eq!(dtcs[0].fmi, 3);
        assert_eq!(dtcs[0].occurrence_count, 5);
    }

    #[test]
    fn lamp_status_decodes_all_four_lamps() {
        // MIL=On(01), RSL=On(01), AWL=On(01), PL=On(01) => 0b01_01_01_01 = 0x55
        let lamp = LampStatus::from_byte(0b0101_0101);
        assert_eq!(lamp.malfunction_indicator, LampState::On);
        assert_eq!(lamp.red_stop, LampState::On);
        assert_eq!(lamp.amber_warning, LampState::On);
        assert_eq!(lamp.protect, LampState::On);
    }

    #[test]
    fn empty_dtc_slot_is_skipped() {
        let payload = [0xFF, 0xFF, 0, 0, 0, 0, 0xFF, 0xFF];
        let (_, dtcs) = decode(&payload).unwrap();
        assert!(dtcs.is_empty());
    }

    #[test]
    fn short_payload_is_rejected() {
        assert_eq!(decode(&[0, 0]), Err(DiagnosticsError::PayloadTooShort(2)));
    }

    #[tokio::test]
    async fn tracker_reports_change_only_when_dtc_set_differs() {
        let tracker = DiagnosticsTracker::new();
        let payload = [0x00, 0xFF, 110, 0, 3 << 3, 5, 0xFF, 0xFF];
        assert!(tracker.apply_dm1(0x20, &payload).await.unwrap());
        assert!(!tracker.apply_dm1(0x20, &payload).await.unwrap());
    }
}
