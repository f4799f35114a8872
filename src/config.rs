//! Runtime configuration for [`crate::manager::ProtocolManager`]
//! (spec.md §6).
//!
//! A plain `serde`-deserializable struct, mirroring the teacher's own
//! preference for typed config over ad-hoc env/CLI parsing; this crate's
//! core has no CLI or persisted state (spec.md §6 Non-goals), so
//! `Config` is constructed by the embedding application and passed in.
use std::time::Duration;

use serde::Deserialize;

use crate::queue::ProcessingMode;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub capacity: usize,
    pub mode: ProcessingMode,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { capacity: 512, mode: ProcessingMode::RealTime }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub max_size: usize,
    pub min_size: usize,
    pub max_age_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self { max_size: 16, min_size: 4, max_age_ms: 200 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CongestionSettings {
    pub interval_ms: u64,
    pub history_size: usize,
}

impl Default for CongestionSettings {
    fn default() -> Self {
        Self { interval_ms: 1_000, history_size: 20 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BandwidthSettings {
    pub total_kbps: f64,
}

impl Default for BandwidthSettings {
    fn default() -> Self {
        Self { total_kbps: 250.0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub session_timeout_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self { session_timeout_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    pub enabled: bool,
    pub window_ms: u64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self { enabled: true, window_ms: 250 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queue: QueueSettings,
    pub batch: BatchSettings,
    pub congestion: CongestionSettings,
    pub bandwidth: BandwidthSettings,
    pub transport: TransportSettings,
    pub dedup: DedupSettings,
}

impl Config {
    pub fn queue_config(&self) -> crate::queue::QueueConfig {
        crate::queue::QueueConfig {
            capacity: self.queue.capacity,
            mode: self.queue.mode,
            max_batch: self.batch.max_size,
            min_batch: self.batch.min_size,
            max_batch_age: Duration::from_millis(self.batch.max_age_ms),
        }
    }

    pub fn transport_config(&self) -> crate::transport::TransportConfig {
        crate::transport::TransportConfig {
            session_timeout: Duration::from_millis(self.transport.session_timeout_ms),
            ..Default::default()
        }
    }

    pub fn congestion_interval(&self) -> Duration {
        Duration::from_millis(self.congestion.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_defaults() {
        let config = Config::default();
        assert_eq!(config.queue.capacity, 512);
        assert_eq!(config.transport.session_timeout_ms, 30_000);
        assert!(config.dedup.enabled);
    }

    #[test]
    fn deserializes_partial_json_with_defaults_filled_in() {
        let json = r#"{"queue": {"capacity": 1024}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.queue.capacity, 1024);
        assert_eq!(config.batch.max_size, 16);
    }
}
