//! SPN extraction from a raw payload (spec.md §4.1 "decode").
//!
//! Grounded on `examples/EvanL1-voltage-j1939/src/decoder.rs`'s
//! scale/offset application over a static field table, driven through the
//! teacher's `BitReader` engine (`codec::bits`).
use std::collections::HashMap;

use thiserror::Error;

use super::bits::BitReader;
use super::catalog;

/// Result of decoding a single SPN.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpnValue {
    /// Physical value after applying scale and offset.
    Value(f64),
    /// The transmitter marked this parameter as not available.
    NotAvailable,
    /// The transmitter marked this parameter as errored.
    Error,
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("no catalog entry for PGN {0:#06X}")]
    UnknownPgn(u32),
}

/// Decode every cataloged SPN out of `payload` for the given `pgn`.
///
/// SPNs are extracted independently: a payload too short for one SPN's bit
/// range omits only that SPN from the result, the rest still decode
/// (spec.md §4.1 edge cases, §7 `SPNExtractionFailure`). Only an unrecognized
/// `pgn` fails the whole call.
pub fn decode(pgn: u32, payload: &[u8]) -> Result<HashMap<u32, SpnValue>, DecodeError> {
    let def = catalog::lookup(pgn).ok_or(DecodeError::UnknownPgn(pgn))?;

    let payload_bits = payload.len() * 8;
    let reader = BitReader::new(payload);
    let mut out = HashMap::with_capacity(def.spns.len());
    for spn in def.spns {
        let end_bit = spn.start_bit as usize + spn.bit_length as usize;
        if end_bit > payload_bits {
            continue;
        }
        let raw = reader
            .read_u64_at(spn.start_bit as usize, spn.bit_length)
            .expect("bit range checked above");

        let value = if raw == spn.not_available_raw() {
            SpnValue::NotAvailable
        } else if raw == spn.error_raw() {
            SpnValue::Error
        } else if spn.data_type.is_signed() {
            let signed = super::bits::sign_extend(raw, spn.bit_length);
            SpnValue::Value(signed as f64 * spn.scale + spn.offset)
        } else {
            SpnValue::Value(raw as f64 * spn.scale + spn.offset)
        };
        out.insert(spn.spn, value);
    }
    Ok(out)
}

/// Number of SPNs cataloged for `pgn` that a prior [`decode`] call omitted
/// because the payload was too short for them, used to count
/// `SPNExtractionFailure` without re-running the bit-range check per SPN.
pub fn count_omitted(pgn: u32, decoded: &HashMap<u32, SpnValue>) -> usize {
    catalog::lookup(pgn).map_or(0, |def| def.spns.len().saturating_sub(decoded.len()))
}

/// Convenience accessor for a single SPN out of a decoded payload.
pub fn decode_one(pgn: u32, payload: &[u8], spn: u32) -> Result<Option<SpnValue>, DecodeError> {
    Ok(decode(pgn, payload)?.remove(&spn))
}
