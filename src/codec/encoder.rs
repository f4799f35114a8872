//! SPN injection into a raw payload (spec.md §4.1 "encode") — the inverse
//! of `codec::decoder`. Grounded the same way, through the teacher's
//! `BitWriter`.
use std::collections::HashMap;

use thiserror::Error;

use super::bits::BitWriter;
use super::catalog::{self, SpnDef};

#[derive(Debug, Error, PartialEq)]
pub enum EncodeError {
    #[error("no catalog entry for PGN {0:#06X}")]
    UnknownPgn(u32),
    #[error("PGN {pgn:#06X} has no SPN {spn}")]
    UnknownSpn { pgn: u32, spn: u32 },
    #[error("value {value} for SPN {spn} is outside its representable range")]
    ValueOutOfRange { spn: u32, value: f64 },
}

/// Encode `values` (SPN -> physical value) into a fresh payload for `pgn`.
/// SPNs present in the catalog but absent from `values` are written as
/// "not available"; bytes not covered by any SPN default to `0xFF`, the
/// conventional J1939 padding for reserved/unused payload space.
pub fn encode(pgn: u32, values: &HashMap<u32, f64>) -> Result<Vec<u8>, EncodeError> {
    let def = catalog::lookup(pgn).ok_or(EncodeError::UnknownPgn(pgn))?;

    for spn in values.keys() {
        if !def.spns.iter().any(|s| s.spn == *spn) {
            return Err(EncodeError::UnknownSpn { pgn, spn: *spn });
        }
    }

    let mut payload = vec![0xFFu8; def.length as usize];
    let mut writer = BitWriter::new(&mut payload);

    for spn in def.spns {
        let raw = match values.get(&spn.spn) {
            Some(value) => raw_for_value(spn, *value)?,
            None => spn.not_available_raw(),
        };
        writer
            .write_u64_at(spn.start_bit as usize, raw, spn.bit_length)
            .expect("payload sized to the catalog's max bit extent");
    }

    Ok(payload)
}

fn raw_for_value(spn: &SpnDef, value: f64) -> Result<u64, EncodeError> {
    let scaled = (value - spn.offset) / spn.scale;
    let rounded = scaled.round();

    if spn.data_type.is_signed() {
        let half_range = 1i64 << (spn.bit_length - 1);
        let min = -(half_range);
        let max = half_range - 1;
        if rounded < min as f64 || rounded > max as f64 {
            return Err(EncodeError::ValueOutOfRange { spn: spn.spn, value });
        }
        let signed = rounded as i64;
        let mask = if spn.bit_length >= 64 {
            u64::MAX
        } else {
            (1u64 << spn.bit_length) - 1
        };
        Ok((signed as u64) & mask)
    } else {
        // The top two raw values are reserved for not-available/error.
        let max_usable = spn.max_unsigned() - 2;
        if rounded < 0.0 || rounded > max_usable as f64 {
            return Err(EncodeError::ValueOutOfRange { spn: spn.spn, value });
        }
        Ok(rounded as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decoder::{decode, SpnValue};

    #[test]
    fn s1_eec1_encode_matches_decode_roundtrip() {
        let mut values = HashMap::new();
        values.insert(61, 75.0);
        values.insert(102, 200.0);
        values.insert(190, 1800.0);

        let payload = encode(0xF004, &values).unwrap();
        let decoded = decode(0xF004, &payload).unwrap();
        assert_eq!(decoded[&61], SpnValue::Value(75.0));
        assert_eq!(decoded[&102], SpnValue::Value(200.0));
        assert_eq!(decoded[&190], SpnValue::Value(1800.0));
    }

    #[test]
    fn missing_spns_default_to_not_available() {
        let values = HashMap::new();
        let payload = encode(0xFEF1, &values).unwrap();
        let decoded = decode(0xFEF1, &payload).unwrap();
        assert_eq!(decoded[&84], SpnValue::NotAvailable);
    }

    #[test]
    fn signed_spn_roundtrips_negative_value() {
        let mut values = HashMap::new();
        values.insert(584, 40.7128);
        values.insert(585, -74.0060);
        let payload = encode(0xFEF3, &values).unwrap();
        let decoded = decode(0xFEF3, &payload).unwrap();
        match decoded[&585] {
            SpnValue::Value(v) => assert!((v - (-74.0060)).abs() < 1e-4),
            other => panic!("expected value, got {other:?}"),
        }
    }

    #[test]
    fn unknown_spn_is_rejected() {
        let mut values = HashMap::new();
        values.insert(9999, 1.0);
        assert_eq!(
            encode(0xF004, &values),
            Err(EncodeError::UnknownSpn { pgn: 0xF004, spn: 9999 })
        );
    }

    #[test]
    fn out_of_range_value_is_rejected() {
        let mut values = HashMap::new();
        values.insert(190, 100_000.0);
        assert!(matches!(
            encode(0xF004, &values),
            Err(EncodeError::ValueOutOfRange { .. })
        ));
    }
}
