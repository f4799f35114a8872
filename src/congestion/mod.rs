//! Rolling-window congestion scoring and adaptive traffic throttling
//! (spec.md §4.6).
//!
//! Weights, normalizers, and the level/throttle thresholds are ported
//! unchanged from
//! `original_source/afs_fastapi/equipment/congestion_detection.py`'s
//! `CongestionMetrics.calculate_congestion_score`/`_classify_congestion_level`/
//! `TrafficThrottler`; the `numpy.polyfit` trend slope is replaced with a
//! manual least-squares fit (no numpy in this crate's dependency stack),
//! and the rolling window is a `VecDeque` behind one `tokio::sync::Mutex`
//! in the style of `transport::TransportEngine`/`address::Registry`.
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::queue::{OperationContext, PriorityClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionLevel {
    /// < 40% of the weighted score.
    Normal,
    /// 40-60%.
    Moderate,
    /// 60-80%.
    High,
    /// > 80%.
    Critical,
}

fn classify_level(score: f64) -> CongestionLevel {
    if score < 0.4 {
        CongestionLevel::Normal
    } else if score < 0.6 {
        CongestionLevel::Moderate
    } else if score < 0.8 {
        CongestionLevel::High
    } else {
        CongestionLevel::Critical
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleAction {
    None,
    ReduceLowPriority,
    ReduceNormalPriority,
    ReduceHighPriority,
    EmergencyThrottle,
    RestoreNormal,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CongestionMetrics {
    pub bus_load_percentage: f64,
    pub message_rate_per_second: f64,
    pub error_rate_percentage: f64,
    pub queue_depth: usize,
    pub average_latency_ms: f64,
    pub peak_latency_ms: f64,
}

impl Default for CongestionMetrics {
    fn default() -> Self {
        Self {
            bus_load_percentage: 0.0,
            message_rate_per_second: 0.0,
            error_rate_percentage: 0.0,
            queue_depth: 0,
            average_latency_ms: 0.0,
            peak_latency_ms: 0.0,
        }
    }
}

impl CongestionMetrics {
    /// Weighted congestion score in [0.0, 1.0]; weights and normalizers
    /// are the teacher's reference values, tuned for agricultural CAN
    /// bus loads rather than a generic automotive network.
    pub fn congestion_score(&self) -> f64 {
        const WEIGHT_BUS_LOAD: f64 = 0.35;
        const WEIGHT_MESSAGE_RATE: f64 = 0.15;
        const WEIGHT_ERROR_RATE: f64 = 0.25;
        const WEIGHT_QUEUE_DEPTH: f64 = 0.15;
        const WEIGHT_LATENCY: f64 = 0.10;

        let bus_load_score = (self.bus_load_percentage / 90.0).min(1.0);
        let message_rate_score = (self.message_rate_per_second / 800.0).min(1.0);
        let error_rate_score = (self.error_rate_percentage / 5.0).min(1.0);
        let queue_depth_score = (self.queue_depth as f64 / 150.0).min(1.0);
        let latency_score = (self.average_latency_ms / 80.0).min(1.0);

        let score = WEIGHT_BUS_LOAD * bus_load_score
            + WEIGHT_MESSAGE_RATE * message_rate_score
            + WEIGHT_ERROR_RATE * error_rate_score
            + WEIGHT_QUEUE_DEPTH * queue_depth_score
            + WEIGHT_LATENCY * latency_score;

        score.min(1.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleDecision {
    pub action: ThrottleAction,
    /// 0.0 (full throttle) to 1.0 (no throttle).
    pub severity_factor: f64,
    pub affected_priorities: Vec<PriorityClass>,
    pub estimated_relief_time_ms: f64,
    pub emergency_mode: bool,
    pub recovery_mode: bool,
    pub preserve_safety_messages: bool,
    pub operation_context: Option<OperationContext>,
    pub confidence: f64,
}

impl ThrottleDecision {
    fn none(operation_context: Option<OperationContext>) -> Self {
        Self {
            action: ThrottleAction::None,
            severity_factor: 1.0,
            affected_priorities: Vec::new(),
            estimated_relief_time_ms: 0.0,
            emergency_mode: false,
            recovery_mode: false,
            preserve_safety_messages: true,
            operation_context,
            confidence: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

/// Least-squares slope of `y` against `0..y.len()`. Empty/constant
/// sequences return a slope of 0.0.
fn linear_slope(y: &[f64]) -> f64 {
    let n = y.len() as f64;
    if n < 2.0 {
        return 0.0;
    }
    let x_mean = (y.len() - 1) as f64 / 2.0;
    let y_mean = y.iter().sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, value) in y.iter().enumerate() {
        let dx = i as f64 - x_mean;
        numerator += dx * (value - y_mean);
        denominator += dx * dx;
    }
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

pub struct CongestionDetector {
    history: Mutex<VecDeque<CongestionMetrics>>,
    window_size: usize,
}

impl CongestionDetector {
    pub fn new(window_size: usize) -> Self {
        Self { history: Mutex::new(VecDeque::with_capacity(window_size)), window_size }
    }

    pub async fn record(&self, metrics: CongestionMetrics) -> CongestionLevel {
        let mut history = self.history.lock().await;
        if history.len() == self.window_size {
            history.pop_front();
        }
        history.push_back(metrics);
        classify_level(metrics.congestion_score())
    }

    /// Direction of the last 5 recorded scores; `Stable` until at least 3
    /// samples are available.
    pub async fn trend(&self) -> Trend {
        let history = self.history.lock().await;
        if history.len() < 3 {
            return Trend::Stable;
        }
        let recent: Vec<f64> = history.iter().rev().take(5).rev().map(CongestionMetrics::congestion_score).collect();
        let slope = linear_slope(&recent);
        if slope > 0.02 {
            Trend::Increasing
        } else if slope < -0.02 {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }

    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }
}

pub struct TrafficThrottler {
    enable_adaptive_throttling: bool,
    active_throttles: Mutex<Vec<PriorityClass>>,
    history: Mutex<VecDeque<ThrottleDecision>>,
    history_capacity: usize,
}

impl Default for TrafficThrottler {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TrafficThrottler {
    pub fn new(enable_adaptive_throttling: bool) -> Self {
        Self {
            enable_adaptive_throttling,
            active_throttles: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(50)),
            history_capacity: 50,
        }
    }

    /// Decide how to throttle traffic for `level`, scaling severity by
    /// `operation_context` (field operations get a lighter touch at
    /// moderate/high congestion, but a heavier one once congestion is
    /// critical, per the teacher reference).
    pub async fn make_decision(
        &self,
        level: CongestionLevel,
        operation_context: Option<OperationContext>,
    ) -> ThrottleDecision {
        if !self.enable_adaptive_throttling {
            return ThrottleDecision::none(operation_context);
        }

        let currently_throttled = !self.active_throttles.lock().await.is_empty();
        if currently_throttled && level == CongestionLevel::Normal {
            return ThrottleDecision {
                action: ThrottleAction::RestoreNormal,
                severity_factor: 1.0,
                affected_priorities: Vec::new(),
                estimated_relief_time_ms: 0.0,
                emergency_mode: false,
                recovery_mode: true,
                preserve_safety_messages: true,
                operation_context,
                confidence: 1.0,
            };
        }

        let field_operation = operation_context == Some(OperationContext::FieldWork);
        match level {
            CongestionLevel::Normal => ThrottleDecision::none(operation_context),
            CongestionLevel::Moderate => {
                let severity_factor = if field_operation { 0.8 * 1.1 } else { 0.8 };
                ThrottleDecision {
                    action: ThrottleAction::ReduceLowPriority,
                    severity_factor,
                    affected_priorities: vec![PriorityClass::Low],
                    estimated_relief_time_ms: 5000.0,
                    emergency_mode: false,
                    recovery_mode: false,
                    preserve_safety_messages: true,
                    operation_context,
                    confidence: 1.0,
                }
            }
            CongestionLevel::High => {
                let severity_factor = if field_operation { 0.6 * 1.1 } else { 0.6 };
                ThrottleDecision {
                    action: ThrottleAction::ReduceNormalPriority,
                    severity_factor,
                    affected_priorities: vec![PriorityClass::Normal],
                    estimated_relief_time_ms: 10000.0,
                    emergency_mode: false,
                    recovery_mode: false,
                    preserve_safety_messages: true,
                    operation_context,
                    confidence: 1.0,
                }
            }
            CongestionLevel::Critical => {
                let severity_factor = if field_operation { 0.3 * 0.8 } else { 0.3 };
                ThrottleDecision {
                    action: ThrottleAction::EmergencyThrottle,
                    severity_factor,
                    affected_priorities: vec![PriorityClass::High],
                    estimated_relief_time_ms: 20000.0,
                    emergency_mode: true,
                    recovery_mode: false,
                    preserve_safety_messages: true,
                    operation_context,
                    confidence: 0.9,
                }
            }
        }
    }

    /// Commit `decision` as the throttler's active state and append it to
    /// the decision history.
    pub async fn apply(&self, decision: ThrottleDecision) {
        let mut active = self.active_throttles.lock().await;
        if decision.recovery_mode {
            active.clear();
            info!("restored normal traffic flow, congestion resolved");
        } else if decision.action != ThrottleAction::None {
            *active = decision.affected_priorities.clone();
            warn!(
                action = ?decision.action,
                severity = decision.severity_factor,
                affected = ?decision.affected_priorities,
                "applying traffic throttle"
            );
        }
        drop(active);

        let mut history = self.history.lock().await;
        if history.len() == self.history_capacity {
            history.pop_front();
        }
        history.push_back(decision);
    }

    pub async fn active_throttles(&self) -> Vec<PriorityClass> {
        self.active_throttles.lock().await.clone()
    }
}

pub fn expires_at(now: Instant, relief: Duration) -> Instant {
    now + relief
}
